use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{check_availability, AvailabilityReport};
use super::{validate_window, Engine, EngineError};

/// Name the constraint that actually bound in a failed check.
fn unavailable_reason(report: &AvailabilityReport) -> String {
    if report.details.remaining_concurrent.is_some_and(|rc| rc < 1) {
        "concurrency cap exceeded".into()
    } else {
        "insufficient remaining quantity".into()
    }
}

impl Engine {
    // ── Resource catalog ─────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        kind: ResourceKind,
        total_quantity: u32,
        organization_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if let ResourceKind::Shareable { max_concurrent } = kind
            && max_concurrent == 0
        {
            return Err(EngineError::validation("max_concurrent_usage must be positive"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let change = Change::ResourceCreated {
            id,
            name: name.clone(),
            kind,
            total_quantity,
            organization_id,
        };
        self.wal_append(&change).await?;
        let rs = ResourceState::new(id, name, kind, total_quantity, organization_id);
        self.state
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(rs)));
        Ok(())
    }

    /// Partial catalog edit. The resource kind itself is immutable; only the
    /// shareable concurrency cap may be retuned.
    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        total_quantity: Option<u32>,
        max_concurrent: Option<u32>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        let mut guard = self.lock_resource(id).await?;

        let kind = match (guard.kind, max_concurrent) {
            (kind, None) => kind,
            (ResourceKind::Shareable { .. }, Some(0)) => {
                return Err(EngineError::validation("max_concurrent_usage must be positive"));
            }
            (ResourceKind::Shareable { .. }, Some(mc)) => {
                ResourceKind::Shareable { max_concurrent: mc }
            }
            (_, Some(_)) => {
                return Err(EngineError::validation(
                    "concurrency cap only applies to shareable resources",
                ));
            }
        };
        let name = name.or_else(|| guard.name.clone());
        let total_quantity = total_quantity.unwrap_or(guard.total_quantity);

        let change = Change::ResourceUpdated {
            id,
            name: name.clone(),
            kind,
            total_quantity,
        };
        self.wal_append(&change).await?;
        guard.name = name;
        guard.kind = kind;
        guard.total_quantity = total_quantity;
        Ok(())
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_resource(id).await?;
        if !guard.allocations.is_empty() {
            return Err(EngineError::validation(
                "resource has allocations; unbook them first",
            ));
        }
        self.wal_append(&Change::ResourceDeleted { id }).await?;
        self.state.remove(&id);
        Ok(())
    }

    // ── Event registry ───────────────────────────────────────

    pub async fn upsert_event(&self, event: EventRecord) -> Result<(), EngineError> {
        validate_window(event.span.start, event.span.end)?;
        if let Some(ref t) = event.title
            && t.len() > MAX_TITLE_LEN
        {
            return Err(EngineError::LimitExceeded("event title too long"));
        }
        if event.parent_event_id == Some(event.id) {
            return Err(EngineError::validation("event cannot be its own parent"));
        }

        let previous = self.events.get(&event.id).map(|e| e.value().clone());
        let Some(previous) = previous else {
            if self.events.len() >= MAX_EVENTS_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many events"));
            }
            let change = Change::EventUpserted { event: event.clone() };
            self.wal_append(&change).await?;
            self.events.insert(event.id, event);
            return Ok(());
        };

        let allocation_ids = self.allocations_of_event(&event.id);
        if previous.span != event.span && !allocation_ids.is_empty() {
            return Err(EngineError::validation(
                "event window is immutable while allocations exist",
            ));
        }

        // A status flip cascades onto the event's allocations, so every
        // affected resource is locked (sorted by id) before committing.
        let cascade = previous.status != event.status && !allocation_ids.is_empty();
        let mut guards = Vec::new();
        if cascade {
            let mut resource_ids: Vec<Ulid> = allocation_ids
                .iter()
                .filter_map(|a| self.resource_for_allocation(a))
                .collect();
            resource_ids.sort();
            resource_ids.dedup();
            for rid in &resource_ids {
                guards.push(self.lock_resource(*rid).await?);
            }

            // Reactivating a cancelled event re-commits its quantities, so it
            // must pass the same check a fresh booking would.
            if event.status == EventStatus::Scheduled {
                for guard in &guards {
                    let quantity: u32 = guard
                        .allocations
                        .iter()
                        .filter(|a| a.event_id == event.id)
                        .map(|a| a.quantity)
                        .sum();
                    let report =
                        check_availability(guard, &event.span, quantity, Some(event.id));
                    if !report.available {
                        return Err(EngineError::ValidationFailed {
                            reason: unavailable_reason(&report),
                            details: Some(report.details),
                        });
                    }
                }
            }
        }

        let change = Change::EventUpserted { event: event.clone() };
        self.wal_append(&change).await?;
        let active = event.status != EventStatus::Cancelled;
        for guard in guards.iter_mut() {
            for a in guard.allocations.iter_mut() {
                if a.event_id == event.id {
                    a.active = active;
                }
            }
        }
        self.events.insert(event.id, event);
        Ok(())
    }

    /// Delete an event and cascade onto its allocations and attendances.
    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.events.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let allocation_ids = self.allocations_of_event(&id);
        let mut resource_ids: Vec<Ulid> = allocation_ids
            .iter()
            .filter_map(|a| self.resource_for_allocation(a))
            .collect();
        resource_ids.sort();
        resource_ids.dedup();
        let mut guards = Vec::new();
        for rid in &resource_ids {
            guards.push(self.lock_resource(*rid).await?);
        }

        self.wal_append(&Change::EventDeleted { id }).await?;
        self.events.remove(&id);
        for guard in guards.iter_mut() {
            guard.allocations.retain(|a| {
                if a.event_id == id {
                    self.allocation_to_resource.remove(&a.id);
                    false
                } else {
                    true
                }
            });
        }
        self.event_allocations.remove(&id);
        self.attendances.retain(|_, att| att.event_id != id);
        Ok(())
    }

    // ── Allocation ledger ────────────────────────────────────

    pub async fn create_allocation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        event_id: Ulid,
        quantity: u32,
    ) -> Result<(), EngineError> {
        if quantity == 0 {
            return Err(EngineError::validation("quantity must be positive"));
        }
        if self.allocation_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = self
            .events
            .get(&event_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(event_id))?;
        if event.status == EventStatus::Cancelled {
            return Err(EngineError::validation("event is cancelled"));
        }

        let mut guard = self.lock_resource(resource_id).await?;
        if guard.allocations.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many allocations on resource"));
        }

        // Same arithmetic the read path uses, re-run under the write lock so
        // two concurrent bookings can't both observe stale capacity.
        let report = check_availability(&guard, &event.span, quantity, None);
        if !report.available {
            return Err(EngineError::ValidationFailed {
                reason: unavailable_reason(&report),
                details: Some(report.details),
            });
        }

        let change = Change::AllocationCreated {
            id,
            resource_id,
            event_id,
            quantity,
            span: event.span,
        };
        self.wal_append(&change).await?;
        guard.insert_allocation(Allocation {
            id,
            event_id,
            quantity,
            span: event.span,
            active: true,
        });
        self.allocation_to_resource.insert(id, resource_id);
        self.event_allocations.entry(event_id).or_default().push(id);
        Ok(())
    }

    /// Change an allocation's quantity and/or resource. Validated — and
    /// committed to the WAL — as delete + recreate, with the owning event
    /// excluded so its prior reservation doesn't count against the new one.
    pub async fn update_allocation(
        &self,
        id: Ulid,
        new_quantity: Option<u32>,
        new_resource: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if new_quantity == Some(0) {
            return Err(EngineError::validation("quantity must be positive"));
        }
        let current_rid = self
            .resource_for_allocation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let target_rid = new_resource.unwrap_or(current_rid);

        if target_rid == current_rid {
            let mut guard = self.lock_resource(current_rid).await?;
            let alloc = guard
                .allocation(id)
                .cloned()
                .ok_or(EngineError::NotFound(id))?;
            if !alloc.active {
                return Err(EngineError::validation("event is cancelled"));
            }
            let quantity = new_quantity.unwrap_or(alloc.quantity);

            let report = check_availability(&guard, &alloc.span, quantity, Some(alloc.event_id));
            if !report.available {
                return Err(EngineError::ValidationFailed {
                    reason: unavailable_reason(&report),
                    details: Some(report.details),
                });
            }

            self.wal_append(&Change::AllocationDeleted {
                id,
                resource_id: current_rid,
            })
            .await?;
            guard.remove_allocation(id);
            self.wal_append(&Change::AllocationCreated {
                id,
                resource_id: current_rid,
                event_id: alloc.event_id,
                quantity,
                span: alloc.span,
            })
            .await?;
            guard.insert_allocation(Allocation {
                id,
                event_id: alloc.event_id,
                quantity,
                span: alloc.span,
                active: true,
            });
            return Ok(());
        }

        // Moving between resources: lock both in id order to avoid deadlock.
        let source_rs = self
            .get_resource(&current_rid)
            .ok_or(EngineError::NotFound(current_rid))?;
        let target_rs = self
            .get_resource(&target_rid)
            .ok_or(EngineError::NotFound(target_rid))?;
        let (mut source, mut target);
        if current_rid < target_rid {
            source = self.acquire_write(current_rid, &source_rs).await?;
            target = self.acquire_write(target_rid, &target_rs).await?;
        } else {
            target = self.acquire_write(target_rid, &target_rs).await?;
            source = self.acquire_write(current_rid, &source_rs).await?;
        }

        let alloc = source
            .allocation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !alloc.active {
            return Err(EngineError::validation("event is cancelled"));
        }
        if target.allocations.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many allocations on resource"));
        }
        let quantity = new_quantity.unwrap_or(alloc.quantity);

        let report = check_availability(&target, &alloc.span, quantity, Some(alloc.event_id));
        if !report.available {
            return Err(EngineError::ValidationFailed {
                reason: unavailable_reason(&report),
                details: Some(report.details),
            });
        }

        self.wal_append(&Change::AllocationDeleted {
            id,
            resource_id: current_rid,
        })
        .await?;
        source.remove_allocation(id);
        self.wal_append(&Change::AllocationCreated {
            id,
            resource_id: target_rid,
            event_id: alloc.event_id,
            quantity,
            span: alloc.span,
        })
        .await?;
        target.insert_allocation(Allocation {
            id,
            event_id: alloc.event_id,
            quantity,
            span: alloc.span,
            active: true,
        });
        self.allocation_to_resource.insert(id, target_rid);
        Ok(())
    }

    pub async fn delete_allocation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (resource_id, mut guard) = self.lock_allocation_resource(&id).await?;
        self.wal_append(&Change::AllocationDeleted { id, resource_id })
            .await?;
        if let Some(a) = guard.remove_allocation(id)
            && let Some(mut ids) = self.event_allocations.get_mut(&a.event_id)
        {
            ids.retain(|x| x != &id);
        }
        self.allocation_to_resource.remove(&id);
        Ok(resource_id)
    }

    /// Create an event and its allocations together. All-or-nothing from the
    /// caller's view: if any allocation is rejected, the just-created event
    /// (and any allocations already committed for it) is deleted again and
    /// the original error is surfaced. A failed cleanup is logged, not
    /// escalated — raising it would mask the more actionable original error.
    pub async fn book_event(
        &self,
        event: EventRecord,
        requests: Vec<(Ulid, u32)>,
    ) -> Result<Vec<Ulid>, EngineError> {
        if requests.len() > MAX_BOOKINGS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many allocations in one booking"));
        }
        if self.events.contains_key(&event.id) {
            return Err(EngineError::AlreadyExists(event.id));
        }
        let event_id = event.id;
        self.upsert_event(event).await?;

        let mut created = Vec::with_capacity(requests.len());
        for (resource_id, quantity) in requests {
            let allocation_id = Ulid::new();
            match self
                .create_allocation(allocation_id, resource_id, event_id, quantity)
                .await
            {
                Ok(()) => created.push(allocation_id),
                Err(e) => {
                    if let Err(cleanup) = self.delete_event(event_id).await {
                        tracing::warn!(
                            "compensation failed, event {event_id} may be orphaned: {cleanup}"
                        );
                    }
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    // ── Attendance ───────────────────────────────────────────

    pub async fn record_attendance(
        &self,
        id: Ulid,
        event_id: Ulid,
        user_id: Option<Ulid>,
        checked_in_at: Option<Ms>,
    ) -> Result<(), EngineError> {
        if self.attendances.len() >= MAX_ATTENDANCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many attendances"));
        }
        if self.attendances.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.events.contains_key(&event_id) {
            return Err(EngineError::NotFound(event_id));
        }
        if let Some(t) = checked_in_at
            && !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t)
        {
            return Err(EngineError::validation("timestamp out of range"));
        }

        let attendance = Attendance {
            id,
            event_id,
            user_id,
            checked_in_at,
        };
        self.wal_append(&Change::AttendanceRecorded {
            attendance: attendance.clone(),
        })
        .await?;
        self.attendances.insert(id, attendance);
        Ok(())
    }

    pub async fn remove_attendance(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.attendances.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.wal_append(&Change::AttendanceRemoved { id }).await?;
        self.attendances.remove(&id);
        Ok(())
    }

    // ── Stock ledger ─────────────────────────────────────────

    /// Append a restock (positive) or write-off (negative) entry to a
    /// consumable's ledger. Going below the committed allocations is allowed;
    /// the violated-constraints report surfaces the excess.
    pub async fn adjust_stock(
        &self,
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        delta: i64,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        if delta == 0 {
            return Err(EngineError::validation("stock delta must be non-zero"));
        }
        if let Some(ref n) = note
            && n.len() > MAX_NOTE_LEN
        {
            return Err(EngineError::LimitExceeded("stock note too long"));
        }
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
            return Err(EngineError::validation("timestamp out of range"));
        }

        let mut guard = self.lock_resource(resource_id).await?;
        if !matches!(guard.kind, ResourceKind::Consumable) {
            return Err(EngineError::validation(
                "stock ledger applies to consumable resources",
            ));
        }
        if guard.stock_entries.len() >= MAX_STOCK_ENTRIES_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many stock entries"));
        }

        self.wal_append(&Change::StockAdjusted {
            id,
            resource_id,
            at,
            delta,
            note: note.clone(),
        })
        .await?;
        guard.stock_entries.push(StockEntry { id, at, delta, note });
        Ok(())
    }
}

use ulid::Ulid;

use crate::model::*;

use super::availability::{self, AvailabilityDetails};
use super::{validate_window, Engine, EngineError};

/// A conflict enriched with the event title for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub event_id: Ulid,
    pub event_title: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityOutcome {
    pub available: bool,
    pub available_quantity: i64,
    pub conflicts: Vec<ConflictInfo>,
    pub details: AvailabilityDetails,
}

impl Engine {
    /// Read-only capacity verdict for a candidate window. Takes the read
    /// lock only; mutations re-run the same arithmetic under the write lock.
    pub async fn check_availability(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        requested_quantity: u32,
        exclude_event: Option<Ulid>,
    ) -> Result<AvailabilityOutcome, EngineError> {
        let window = validate_window(start, end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let report =
            availability::check_availability(&guard, &window, requested_quantity, exclude_event);
        drop(guard);

        let conflicts = report
            .conflicts
            .into_iter()
            .map(|c| ConflictInfo {
                event_id: c.event_id,
                event_title: self.events.get(&c.event_id).and_then(|e| e.title.clone()),
                start: c.span.start,
                end: c.span.end,
                quantity: c.quantity,
            })
            .collect();

        Ok(AvailabilityOutcome {
            available: report.available,
            available_quantity: report.available_quantity,
            conflicts,
            details: report.details,
        })
    }

    pub fn get_event(&self, id: &Ulid) -> Option<EventRecord> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn list_events(&self) -> Vec<EventRecord> {
        let mut events: Vec<EventRecord> =
            self.events.iter().map(|e| e.value().clone()).collect();
        events.sort_by_key(|e| (e.span.start, e.id));
        events
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(rs) = self.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                kind: guard.kind,
                total_quantity: guard.total_quantity,
                organization_id: guard.organization_id,
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_allocation(&self, id: &Ulid) -> Result<AllocationInfo, EngineError> {
        let resource_id = self
            .resource_for_allocation(id)
            .ok_or(EngineError::NotFound(*id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let a = guard.allocation(*id).ok_or(EngineError::NotFound(*id))?;
        Ok(AllocationInfo {
            id: a.id,
            resource_id,
            event_id: a.event_id,
            quantity: a.quantity,
            start: a.span.start,
            end: a.span.end,
            active: a.active,
        })
    }

    /// List allocations, optionally filtered by resource and/or event.
    pub async fn list_allocations(
        &self,
        resource_id: Option<Ulid>,
        event_id: Option<Ulid>,
    ) -> Result<Vec<AllocationInfo>, EngineError> {
        let resource_ids: Vec<Ulid> = match (resource_id, event_id) {
            (Some(rid), _) => {
                if !self.state.contains_key(&rid) {
                    return Err(EngineError::NotFound(rid));
                }
                vec![rid]
            }
            (None, Some(eid)) => {
                let mut rids: Vec<Ulid> = self
                    .allocations_of_event(&eid)
                    .iter()
                    .filter_map(|a| self.resource_for_allocation(a))
                    .collect();
                rids.sort();
                rids.dedup();
                rids
            }
            (None, None) => self.state.iter().map(|e| *e.key()).collect(),
        };

        let mut out = Vec::new();
        for rid in resource_ids {
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            for a in &guard.allocations {
                if let Some(eid) = event_id
                    && a.event_id != eid
                {
                    continue;
                }
                out.push(AllocationInfo {
                    id: a.id,
                    resource_id: rid,
                    event_id: a.event_id,
                    quantity: a.quantity,
                    start: a.span.start,
                    end: a.span.end,
                    active: a.active,
                });
            }
        }
        out.sort_by_key(|a| (a.start, a.id));
        Ok(out)
    }

    /// List attendances, optionally narrowed to one event.
    pub fn list_attendances(&self, event_id: Option<Ulid>) -> Vec<Attendance> {
        let mut out: Vec<Attendance> = self
            .attendances
            .iter()
            .map(|a| a.value().clone())
            .filter(|a| event_id.is_none_or(|eid| a.event_id == eid))
            .collect();
        out.sort_by_key(|a| (a.event_id, a.id));
        out
    }

    pub async fn list_stock_entries(
        &self,
        resource_id: Ulid,
    ) -> Result<Vec<StockEntryInfo>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let mut out: Vec<StockEntryInfo> = guard
            .stock_entries
            .iter()
            .map(|e| StockEntryInfo {
                id: e.id,
                resource_id,
                at: e.at,
                delta: e.delta,
                note: e.note.clone(),
            })
            .collect();
        out.sort_by_key(|e| (e.at, e.id));
        Ok(out)
    }
}

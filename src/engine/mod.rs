mod availability;
mod error;
mod mutations;
mod queries;
mod reports;

pub use availability::{
    check_availability, peak_allocated_quantity, peak_concurrent_usage, AvailabilityDetails,
    AvailabilityReport, Conflict,
};
pub use error::EngineError;
pub use queries::{AvailabilityOutcome, ConflictInfo};
pub use reports::{
    ConstraintViolationKind, ConstraintViolationRow, DoubleBookedRow, ExternalAttendeeRow,
    HierarchyViolationKind, HierarchyViolationRow, UtilizationRow,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { change: Change, response: Ack },
    Compact { changes: Vec<Change>, response: Ack },
    RecordsSinceCompact { response: oneshot::Sender<u64> },
}

/// Background task owning the WAL. Appends are batched: after the first one
/// arrives, every append already sitting in the channel joins its batch, the
/// whole batch gets one fsync, and every sender is acked with the shared
/// outcome. Control commands (compaction, the record counter) run between
/// batches.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(first) = rx.recv().await {
        let mut batch = match first {
            WalCommand::Append { change, response } => vec![(change, response)],
            control => {
                handle_control(&mut wal, control);
                continue;
            }
        };

        let mut deferred = None;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                WalCommand::Append { change, response } => batch.push((change, response)),
                control => {
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Change, Ack)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut staged = Ok(());
    for (change, _) in &batch {
        staged = wal.stage(change);
        if staged.is_err() {
            break;
        }
    }
    // Commit even after a staging error so half-written frames never carry
    // over into a later, otherwise-healthy batch.
    let committed = wal.commit();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    let outcome = staged.and(committed);
    for (_, ack) in batch {
        let _ = ack.send(match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let result =
                Wal::write_rewrite(wal.path(), &changes).and_then(|()| wal.install_rewrite());
            let _ = response.send(result);
        }
        WalCommand::RecordsSinceCompact { response } => {
            let _ = response.send(wal.records_since_rewrite());
        }
        WalCommand::Append { .. } => unreachable!("appends are drained into batches"),
    }
}

/// One tenant's allocation engine: the resource catalog, the event and
/// attendance registries, and the WAL that makes all of it durable.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) events: DashMap<Ulid, EventRecord>,
    pub(super) attendances: DashMap<Ulid, Attendance>,
    /// Reverse lookup: allocation id → resource id.
    pub(super) allocation_to_resource: DashMap<Ulid, Ulid>,
    /// Event → allocation ids, for cascades and event-scoped listings.
    pub(super) event_allocations: DashMap<Ulid, Vec<Ulid>>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> std::io::Result<Self> {
        let changes = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            events: DashMap::new(),
            attendances: DashMap::new(),
            allocation_to_resource: DashMap::new(),
            event_allocations: DashMap::new(),
        };

        // Replay — we're the sole owner of the Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may
        // run inside an async context (e.g. lazy tenant creation).
        for change in &changes {
            engine.apply_replayed(change);
        }

        Ok(engine)
    }

    fn apply_replayed(&self, change: &Change) {
        match change {
            Change::ResourceCreated {
                id,
                name,
                kind,
                total_quantity,
                organization_id,
            } => {
                let rs = ResourceState::new(
                    *id,
                    name.clone(),
                    *kind,
                    *total_quantity,
                    *organization_id,
                );
                self.state.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Change::ResourceUpdated {
                id,
                name,
                kind,
                total_quantity,
            } => {
                if let Some(rs) = self.get_resource(id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.name = name.clone();
                    guard.kind = *kind;
                    guard.total_quantity = *total_quantity;
                }
            }
            Change::ResourceDeleted { id } => {
                if let Some((_, rs)) = self.state.remove(id) {
                    let guard = rs.try_read().expect("replay: uncontended read");
                    for a in &guard.allocations {
                        self.allocation_to_resource.remove(&a.id);
                        if let Some(mut ids) = self.event_allocations.get_mut(&a.event_id) {
                            ids.retain(|x| x != &a.id);
                        }
                    }
                }
            }
            Change::EventUpserted { event } => {
                self.events.insert(event.id, event.clone());
                let active = event.status != EventStatus::Cancelled;
                for aid in self.allocations_of_event(&event.id) {
                    let Some(rid) = self.resource_for_allocation(&aid) else {
                        continue;
                    };
                    if let Some(rs) = self.get_resource(&rid) {
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        if let Some(a) = guard.allocations.iter_mut().find(|a| a.id == aid) {
                            a.active = active;
                        }
                    }
                }
            }
            Change::EventDeleted { id } => {
                for aid in self.allocations_of_event(id) {
                    if let Some((_, rid)) = self.allocation_to_resource.remove(&aid)
                        && let Some(rs) = self.get_resource(&rid)
                    {
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        guard.remove_allocation(aid);
                    }
                }
                self.event_allocations.remove(id);
                self.events.remove(id);
                self.attendances.retain(|_, att| att.event_id != *id);
            }
            Change::AllocationCreated {
                id,
                resource_id,
                event_id,
                quantity,
                span,
            } => {
                if let Some(rs) = self.get_resource(resource_id) {
                    let active = self
                        .events
                        .get(event_id)
                        .map(|e| e.status != EventStatus::Cancelled)
                        .unwrap_or(true);
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.insert_allocation(Allocation {
                        id: *id,
                        event_id: *event_id,
                        quantity: *quantity,
                        span: *span,
                        active,
                    });
                    self.allocation_to_resource.insert(*id, *resource_id);
                    self.event_allocations.entry(*event_id).or_default().push(*id);
                }
            }
            Change::AllocationDeleted { id, resource_id } => {
                if let Some(rs) = self.get_resource(resource_id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    if let Some(a) = guard.remove_allocation(*id)
                        && let Some(mut ids) = self.event_allocations.get_mut(&a.event_id)
                    {
                        ids.retain(|x| x != id);
                    }
                }
                self.allocation_to_resource.remove(id);
            }
            Change::AttendanceRecorded { attendance } => {
                self.attendances.insert(attendance.id, attendance.clone());
            }
            Change::AttendanceRemoved { id } => {
                self.attendances.remove(id);
            }
            Change::StockAdjusted {
                id,
                resource_id,
                at,
                delta,
                note,
            } => {
                if let Some(rs) = self.get_resource(resource_id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.stock_entries.push(StockEntry {
                        id: *id,
                        at: *at,
                        delta: *delta,
                        note: note.clone(),
                    });
                }
            }
        }
    }

    /// Write a change to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            change: change.clone(),
            response: tx,
        };
        if self.wal_tx.send(cmd).await.is_err() {
            return Err(EngineError::WalError("WAL writer shut down".into()));
        }
        match rx.await {
            Ok(outcome) => outcome.map_err(|e| EngineError::WalError(e.to_string())),
            Err(_) => Err(EngineError::WalError("WAL writer dropped response".into())),
        }
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_allocation(&self, allocation_id: &Ulid) -> Option<Ulid> {
        self.allocation_to_resource
            .get(allocation_id)
            .map(|e| *e.value())
    }

    pub(super) fn allocations_of_event(&self, event_id: &Ulid) -> Vec<Ulid> {
        self.event_allocations
            .get(event_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Acquire a resource's write lock within a bounded budget. A mutation
    /// that cannot get the lock fails with a retryable error instead of
    /// blocking indefinitely.
    pub(super) async fn acquire_write(
        &self,
        resource_id: Ulid,
        rs: &SharedResourceState,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        for _ in 0..LOCK_ACQUIRE_RETRIES {
            let attempt = tokio::time::timeout(
                Duration::from_millis(LOCK_ACQUIRE_TIMEOUT_MS),
                rs.clone().write_owned(),
            )
            .await;
            if let Ok(guard) = attempt {
                return Ok(guard);
            }
        }
        metrics::counter!(crate::observability::LOCK_CONTENTION_TOTAL).increment(1);
        Err(EngineError::Contended(resource_id))
    }

    /// Lookup resource + acquire its write lock in one call.
    pub(super) async fn lock_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        self.acquire_write(resource_id, &rs).await
    }

    /// Lookup allocation → resource, then lock the resource.
    pub(super) async fn lock_allocation_resource(
        &self,
        allocation_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .resource_for_allocation(allocation_id)
            .ok_or(EngineError::NotFound(*allocation_id))?;
        let guard = self.lock_resource(resource_id).await?;
        Ok((resource_id, guard))
    }

    /// Compact the WAL by rewriting it with only the changes needed to
    /// recreate the current state. Resources and events come first so replay
    /// can resolve allocation references.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut catalog = Vec::new();
        let mut allocations = Vec::new();

        let resource_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in resource_ids {
            let Some(rs) = self.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            catalog.push(Change::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                kind: guard.kind,
                total_quantity: guard.total_quantity,
                organization_id: guard.organization_id,
            });
            for e in &guard.stock_entries {
                catalog.push(Change::StockAdjusted {
                    id: e.id,
                    resource_id: guard.id,
                    at: e.at,
                    delta: e.delta,
                    note: e.note.clone(),
                });
            }
            for a in &guard.allocations {
                allocations.push(Change::AllocationCreated {
                    id: a.id,
                    resource_id: guard.id,
                    event_id: a.event_id,
                    quantity: a.quantity,
                    span: a.span,
                });
            }
        }

        let mut changes = catalog;
        for e in self.events.iter() {
            changes.push(Change::EventUpserted {
                event: e.value().clone(),
            });
        }
        changes.append(&mut allocations);
        for a in self.attendances.iter() {
            changes.push(Change::AttendanceRecorded {
                attendance: a.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Compact {
            changes,
            response: tx,
        };
        if self.wal_tx.send(cmd).await.is_err() {
            return Err(EngineError::WalError("WAL writer shut down".into()));
        }
        match rx.await {
            Ok(outcome) => outcome.map_err(|e| EngineError::WalError(e.to_string())),
            Err(_) => Err(EngineError::WalError("WAL writer dropped response".into())),
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::RecordsSinceCompact { response: tx };
        if self.wal_tx.send(cmd).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Validate a half-open window against the hard timestamp limits.
pub(super) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::validation("window start must precede end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::validation("timestamp out of range"));
    }
    if end - start > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::validation("window too wide"));
    }
    Ok(Span::new(start, end))
}

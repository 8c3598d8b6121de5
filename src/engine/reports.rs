use std::collections::{BTreeMap, BTreeSet, HashMap};

use ulid::Ulid;

use crate::model::*;

use super::availability::{peak_allocated_quantity, peak_concurrent_usage};
use super::Engine;

// ── Report row shapes ─────────────────────────────────────────────
//
// Reports are advisory: they read without the mutation lock, skip rows they
// cannot evaluate (e.g. a missing event), and never fail the whole batch.
// Output is deterministically ordered so diffs between runs are meaningful.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoubleBookedRow {
    pub user_id: Ulid,
    pub first_event_id: Ulid,
    pub first_event_title: Option<String>,
    pub first_start: Ms,
    pub second_event_id: Ulid,
    pub second_event_title: Option<String>,
    pub second_start: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConstraintViolationKind {
    ExclusiveDoubleBooking,
    ShareableOverAllocation,
    ConsumableExcess,
}

impl ConstraintViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintViolationKind::ExclusiveDoubleBooking => "exclusive_double_booking",
            ConstraintViolationKind::ShareableOverAllocation => "shareable_over_allocation",
            ConstraintViolationKind::ConsumableExcess => "consumable_excess",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintViolationRow {
    pub resource_id: Ulid,
    pub resource_name: Option<String>,
    pub kind: ConstraintViolationKind,
    /// The peak that was observed (summed quantity, concurrent events, or
    /// total consumption, per kind).
    pub observed: i64,
    /// What the catalog allows.
    pub allowed: i64,
    pub event_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HierarchyViolationKind {
    StartsBeforeParent,
    EndsAfterParent,
}

impl HierarchyViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HierarchyViolationKind::StartsBeforeParent => "starts_before_parent",
            HierarchyViolationKind::EndsAfterParent => "ends_after_parent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyViolationRow {
    pub event_id: Ulid,
    pub event_title: Option<String>,
    pub parent_event_id: Ulid,
    pub kind: HierarchyViolationKind,
    pub event_start: Ms,
    pub event_end: Ms,
    pub parent_start: Ms,
    pub parent_end: Ms,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationRow {
    pub organization_id: Option<Ulid>,
    pub resource_id: Ulid,
    pub resource_name: Option<String>,
    pub booked_ms: i64,
    pub peak_concurrent: u32,
    pub underutilized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAttendeeRow {
    pub event_id: Ulid,
    pub event_title: Option<String>,
    pub external_count: u64,
}

impl Engine {
    /// One row per overlapping pair of a user's scheduled events. Attendances
    /// are bucketed by user first, so the pairwise scan is quadratic only in
    /// each user's own event count.
    pub fn report_double_booked_users(&self) -> Vec<DoubleBookedRow> {
        let mut by_user: HashMap<Ulid, BTreeSet<Ulid>> = HashMap::new();
        for att in self.attendances.iter() {
            if let Some(user_id) = att.user_id {
                by_user.entry(user_id).or_default().insert(att.event_id);
            }
        }

        let mut rows = Vec::new();
        for (user_id, event_ids) in &by_user {
            let mut events: Vec<EventRecord> = event_ids
                .iter()
                .filter_map(|id| self.get_event(id))
                .filter(|e| e.status == EventStatus::Scheduled)
                .collect();
            events.sort_by_key(|e| (e.span.start, e.id));

            for i in 0..events.len() {
                for j in (i + 1)..events.len() {
                    if events[i].span.overlaps(&events[j].span) {
                        rows.push(DoubleBookedRow {
                            user_id: *user_id,
                            first_event_id: events[i].id,
                            first_event_title: events[i].title.clone(),
                            first_start: events[i].span.start,
                            second_event_id: events[j].id,
                            second_event_title: events[j].title.clone(),
                            second_start: events[j].span.start,
                        });
                    }
                }
            }
        }
        rows.sort_by_key(|r| (r.user_id, r.first_start, r.first_event_id, r.second_event_id));
        rows
    }

    /// Scan every resource's allocation set and flag groups that break the
    /// kind-specific constraint, via the same sweep-line the availability
    /// path reasons with.
    pub async fn report_violated_constraints(&self) -> Vec<ConstraintViolationRow> {
        let resource_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut rows = Vec::new();

        for rid in resource_ids {
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            let active: Vec<&Allocation> =
                guard.allocations.iter().filter(|a| a.active).collect();
            if active.is_empty() {
                continue;
            }

            match guard.kind {
                ResourceKind::Exclusive => {
                    let weighted: Vec<(Span, u32)> =
                        active.iter().map(|a| (a.span, a.quantity)).collect();
                    let (peak, at) = peak_allocated_quantity(&weighted);
                    if peak > guard.total_quantity as i64 {
                        rows.push(ConstraintViolationRow {
                            resource_id: rid,
                            resource_name: guard.name.clone(),
                            kind: ConstraintViolationKind::ExclusiveDoubleBooking,
                            observed: peak,
                            allowed: guard.total_quantity as i64,
                            event_ids: events_at_instant(&active, at),
                        });
                    }
                }
                ResourceKind::Shareable { max_concurrent } => {
                    // Concurrency: one span per distinct event.
                    let mut per_event: BTreeMap<Ulid, Span> = BTreeMap::new();
                    for a in &active {
                        per_event.entry(a.event_id).or_insert(a.span);
                    }
                    let spans: Vec<Span> = per_event.values().copied().collect();
                    let (peak_events, at) = peak_concurrent_usage(&spans);
                    if peak_events > max_concurrent {
                        rows.push(ConstraintViolationRow {
                            resource_id: rid,
                            resource_name: guard.name.clone(),
                            kind: ConstraintViolationKind::ShareableOverAllocation,
                            observed: peak_events as i64,
                            allowed: max_concurrent as i64,
                            event_ids: events_at_instant(&active, at),
                        });
                    }
                    // Aggregate quantity, same rule as exclusive.
                    let weighted: Vec<(Span, u32)> =
                        active.iter().map(|a| (a.span, a.quantity)).collect();
                    let (peak, at) = peak_allocated_quantity(&weighted);
                    if peak > guard.total_quantity as i64 {
                        rows.push(ConstraintViolationRow {
                            resource_id: rid,
                            resource_name: guard.name.clone(),
                            kind: ConstraintViolationKind::ShareableOverAllocation,
                            observed: peak,
                            allowed: guard.total_quantity as i64,
                            event_ids: events_at_instant(&active, at),
                        });
                    }
                }
                ResourceKind::Consumable => {
                    let consumed: i64 = active.iter().map(|a| a.quantity as i64).sum();
                    let stock = guard.standing_stock();
                    if consumed > stock {
                        let mut event_ids: Vec<Ulid> =
                            active.iter().map(|a| a.event_id).collect();
                        event_ids.sort();
                        event_ids.dedup();
                        rows.push(ConstraintViolationRow {
                            resource_id: rid,
                            resource_name: guard.name.clone(),
                            kind: ConstraintViolationKind::ConsumableExcess,
                            observed: consumed,
                            allowed: stock,
                            event_ids,
                        });
                    }
                }
            }
        }
        rows.sort_by_key(|r| (r.resource_id, r.kind, r.observed));
        rows
    }

    /// Flag every child event whose window escapes its parent's. An event
    /// both starting early and ending late yields two rows. Events with a
    /// missing parent are skipped, not errors.
    pub fn report_hierarchy_violations(&self) -> Vec<HierarchyViolationRow> {
        let mut rows = Vec::new();
        for entry in self.events.iter() {
            let child = entry.value();
            let Some(parent_id) = child.parent_event_id else {
                continue;
            };
            let Some(parent) = self.get_event(&parent_id) else {
                continue;
            };
            if parent.span.contains_span(&child.span) {
                continue;
            }

            let mut push = |kind| {
                rows.push(HierarchyViolationRow {
                    event_id: child.id,
                    event_title: child.title.clone(),
                    parent_event_id: parent_id,
                    kind,
                    event_start: child.span.start,
                    event_end: child.span.end,
                    parent_start: parent.span.start,
                    parent_end: parent.span.end,
                });
            };
            if child.span.start < parent.span.start {
                push(HierarchyViolationKind::StartsBeforeParent);
            }
            if child.span.end > parent.span.end {
                push(HierarchyViolationKind::EndsAfterParent);
            }
        }
        rows.sort_by_key(|r| (r.event_id, r.kind));
        rows
    }

    /// Per (organization, resource): total booked hours, sweep-line peak
    /// concurrency, and the underutilization flag against the caller's
    /// threshold. Bookings are grouped by the owning *event's* organization;
    /// a resource with no active bookings reports one row under its own
    /// scope so idle inventory still shows up.
    pub async fn report_resource_utilization(
        &self,
        organization_id: Option<Ulid>,
        threshold_hours: f64,
    ) -> Vec<UtilizationRow> {
        let resource_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut rows = Vec::new();

        for rid in resource_ids {
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;

            // organization → (booked ms, one span per distinct event)
            let mut groups: BTreeMap<Option<Ulid>, (i64, BTreeMap<Ulid, Span>)> = BTreeMap::new();
            for a in guard.allocations.iter().filter(|a| a.active) {
                let Some(event) = self.get_event(&a.event_id) else {
                    continue;
                };
                let group = groups.entry(event.organization_id).or_default();
                group.0 += a.span.duration_ms();
                group.1.entry(a.event_id).or_insert(a.span);
            }

            if groups.is_empty() {
                groups.insert(guard.organization_id, (0, BTreeMap::new()));
            }

            for (org, (booked_ms, per_event)) in groups {
                if organization_id.is_some() && org != organization_id {
                    continue;
                }
                let spans: Vec<Span> = per_event.values().copied().collect();
                let (peak_concurrent, _) = peak_concurrent_usage(&spans);
                let booked_hours = booked_ms as f64 / 3_600_000.0;
                rows.push(UtilizationRow {
                    organization_id: org,
                    resource_id: rid,
                    resource_name: guard.name.clone(),
                    booked_ms,
                    peak_concurrent,
                    underutilized: booked_hours < threshold_hours,
                });
            }
        }
        rows.sort_by_key(|r| (r.resource_id, r.organization_id));
        rows
    }

    /// Events whose count of attendances without a user (external guests)
    /// meets or exceeds the caller-supplied threshold.
    pub fn report_external_attendees(&self, threshold: u64) -> Vec<ExternalAttendeeRow> {
        let mut counts: HashMap<Ulid, u64> = HashMap::new();
        for att in self.attendances.iter() {
            if att.user_id.is_none() {
                *counts.entry(att.event_id).or_default() += 1;
            }
        }

        let mut rows = Vec::new();
        for (event_id, external_count) in counts {
            if external_count < threshold {
                continue;
            }
            let Some(event) = self.get_event(&event_id) else {
                continue;
            };
            rows.push(ExternalAttendeeRow {
                event_id,
                event_title: event.title,
                external_count,
            });
        }
        rows.sort_by_key(|r| r.event_id);
        rows
    }
}

/// Distinct events holding an allocation at the sweep peak's instant.
fn events_at_instant(allocations: &[&Allocation], at: Option<Ms>) -> Vec<Ulid> {
    let Some(at) = at else {
        return Vec::new();
    };
    let mut ids: Vec<Ulid> = allocations
        .iter()
        .filter(|a| a.span.start <= at && at < a.span.end)
        .map(|a| a.event_id)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

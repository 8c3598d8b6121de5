use std::collections::BTreeMap;

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// An existing booking whose window overlaps the candidate window, collapsed
/// per event (several allocations of one event sum their quantities).
/// Informational only: the verdict comes from the remaining-quantity
/// arithmetic, never from conflict presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub event_id: Ulid,
    pub span: Span,
    pub quantity: u32,
}

/// The capacity arithmetic behind a verdict. Attached to rejections so the
/// caller can explain which constraint binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AvailabilityDetails {
    /// For consumables this is the standing stock, not the nominal quantity.
    pub total_quantity: i64,
    pub allocated_quantity: i64,
    /// May be negative when a resource is already over-committed.
    pub remaining_quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    /// Distinct overlapping events in the candidate window.
    pub current_concurrent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_concurrent: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub available: bool,
    /// `remaining_quantity` clamped at zero.
    pub available_quantity: i64,
    pub conflicts: Vec<Conflict>,
    pub details: AvailabilityDetails,
}

/// Check whether `requested` units of a resource are free over `window`,
/// dispatching to the kind-specific rule. `exclude_event` removes that
/// event's allocations from the arithmetic — used when re-validating an
/// allocation being edited, so the event's own booking doesn't count
/// against itself.
pub fn check_availability(
    rs: &ResourceState,
    window: &Span,
    requested: u32,
    exclude_event: Option<Ulid>,
) -> AvailabilityReport {
    match rs.kind {
        ResourceKind::Exclusive => exclusive_check(rs, window, requested, exclude_event),
        ResourceKind::Shareable { max_concurrent } => {
            shareable_check(rs, window, requested, exclude_event, max_concurrent)
        }
        ResourceKind::Consumable => consumable_check(rs, window, requested, exclude_event),
    }
}

/// Collapse overlapping active allocations into one entry per event,
/// quantities summed, ordered by (window start, event id).
fn overlapping_by_event(
    rs: &ResourceState,
    window: &Span,
    exclude_event: Option<Ulid>,
) -> Vec<Conflict> {
    let mut by_event: BTreeMap<Ulid, Conflict> = BTreeMap::new();
    for a in rs.overlapping(window) {
        if !a.active || Some(a.event_id) == exclude_event {
            continue;
        }
        by_event
            .entry(a.event_id)
            .and_modify(|c| c.quantity += a.quantity)
            .or_insert(Conflict {
                event_id: a.event_id,
                span: a.span,
                quantity: a.quantity,
            });
    }
    let mut conflicts: Vec<Conflict> = by_event.into_values().collect();
    conflicts.sort_by_key(|c| (c.span.start, c.event_id));
    conflicts
}

fn quantity_details(total: i64, conflicts: &[Conflict]) -> AvailabilityDetails {
    let allocated: i64 = conflicts.iter().map(|c| c.quantity as i64).sum();
    AvailabilityDetails {
        total_quantity: total,
        allocated_quantity: allocated,
        remaining_quantity: total - allocated,
        max_concurrent: None,
        current_concurrent: conflicts.len() as u32,
        remaining_concurrent: None,
    }
}

/// Exclusive: Σ quantity over overlapping allocations may not exceed the
/// pool. With total_quantity = 1 this degenerates to single-holder.
fn exclusive_check(
    rs: &ResourceState,
    window: &Span,
    requested: u32,
    exclude_event: Option<Ulid>,
) -> AvailabilityReport {
    let conflicts = overlapping_by_event(rs, window, exclude_event);
    let details = quantity_details(rs.total_quantity as i64, &conflicts);
    AvailabilityReport {
        available: details.remaining_quantity >= requested as i64,
        available_quantity: details.remaining_quantity.max(0),
        conflicts,
        details,
    }
}

/// Shareable: the exclusive quantity rule AND a cap on how many distinct
/// events may overlap at once. Both counts are reported so the caller can
/// tell which constraint binds.
fn shareable_check(
    rs: &ResourceState,
    window: &Span,
    requested: u32,
    exclude_event: Option<Ulid>,
    max_concurrent: u32,
) -> AvailabilityReport {
    let conflicts = overlapping_by_event(rs, window, exclude_event);
    let mut details = quantity_details(rs.total_quantity as i64, &conflicts);
    details.max_concurrent = Some(max_concurrent);
    details.remaining_concurrent =
        Some(max_concurrent as i64 - details.current_concurrent as i64);

    let quantity_ok = details.remaining_quantity >= requested as i64;
    let concurrency_ok = details.remaining_concurrent.unwrap_or(0) >= 1;
    AvailabilityReport {
        available: quantity_ok && concurrency_ok,
        available_quantity: details.remaining_quantity.max(0),
        conflicts,
        details,
    }
}

/// Consumable: a depletion ledger, not a time-shared pool. Every active
/// allocation draws down the standing stock whether or not its window
/// overlaps the candidate one; overlapping allocations are still surfaced
/// as informational conflicts.
fn consumable_check(
    rs: &ResourceState,
    window: &Span,
    requested: u32,
    exclude_event: Option<Ulid>,
) -> AvailabilityReport {
    let allocated: i64 = rs
        .allocations
        .iter()
        .filter(|a| a.active && Some(a.event_id) != exclude_event)
        .map(|a| a.quantity as i64)
        .sum();
    let stock = rs.standing_stock();
    let remaining = stock - allocated;

    let conflicts = overlapping_by_event(rs, window, exclude_event);
    let current_concurrent = conflicts.len() as u32;
    let details = AvailabilityDetails {
        total_quantity: stock,
        allocated_quantity: allocated,
        remaining_quantity: remaining,
        max_concurrent: None,
        current_concurrent,
        remaining_concurrent: None,
    };
    AvailabilityReport {
        available: remaining >= requested as i64,
        available_quantity: remaining.max(0),
        conflicts,
        details,
    }
}

// ── Sweep-line peaks (used by the integrity reports) ──────────────

/// Maximum number of simultaneously overlapping spans, with an instant at
/// which the peak holds. Ends sort before starts at equal times, so
/// back-to-back spans never count as concurrent.
pub fn peak_concurrent_usage(spans: &[Span]) -> (u32, Option<Ms>) {
    let weighted: Vec<(Span, u32)> = spans.iter().map(|s| (*s, 1)).collect();
    let (peak, at) = peak_allocated_quantity(&weighted);
    (peak as u32, at)
}

/// Maximum summed quantity over overlapping weighted spans, with an instant
/// at which the peak holds. Returns (0, None) for empty input.
pub fn peak_allocated_quantity(allocs: &[(Span, u32)]) -> (i64, Option<Ms>) {
    if allocs.is_empty() {
        return (0, None);
    }

    // Sweep-line events: +quantity at start, -quantity at end. Sorting by
    // (time, delta) puts the negative deltas first at equal times, which is
    // exactly the half-open adjacency rule.
    let mut events: Vec<(Ms, i64)> = Vec::with_capacity(allocs.len() * 2);
    for (span, quantity) in allocs {
        events.push((span.start, *quantity as i64));
        events.push((span.end, -(*quantity as i64)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut running: i64 = 0;
    let mut peak: i64 = 0;
    let mut peak_at: Option<Ms> = None;
    for (time, delta) in &events {
        running += delta;
        if running > peak {
            peak = running;
            peak_at = Some(*time);
        }
    }
    (peak, peak_at)
}

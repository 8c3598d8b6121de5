use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type. Always a UTC instant; wall-clock
/// formatting is a presentation concern and never reaches the engine.
pub type Ms = i64;

/// Half-open window `[start, end)`. Back-to-back windows share an endpoint
/// without overlapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "half-open span requires start < end");
        Self { start, end }
    }

    /// `[a,b)` and `[c,d)` overlap iff `a < d && c < b`.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when `other` lies entirely within `self`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }
}

/// Capacity semantics of a resource. The shareable concurrency cap lives
/// inside the variant, so "cap is present iff shareable" cannot be violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    /// At most `total_quantity` units held by overlapping bookings.
    Exclusive,
    /// Quantity-bounded like exclusive, plus a cap on simultaneous bookings.
    Shareable { max_concurrent: u32 },
    /// Depletable stock; draw-down is not time-scoped.
    Consumable,
}

impl ResourceKind {
    pub fn max_concurrent(&self) -> Option<u32> {
        match self {
            ResourceKind::Shareable { max_concurrent } => Some(*max_concurrent),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Exclusive => "exclusive",
            ResourceKind::Shareable { .. } => "shareable",
            ResourceKind::Consumable => "consumable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    Cancelled,
}

impl EventStatus {
    pub fn label(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Cancelled => "cancelled",
        }
    }
}

/// A committed booking of `quantity` units of one resource for one event.
/// The span is a copy of the owning event's window; event windows are
/// immutable while allocations exist, so the copy never goes stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub event_id: Ulid,
    pub quantity: u32,
    pub span: Span,
    /// False while the owning event is cancelled; inactive allocations do
    /// not count toward capacity.
    pub active: bool,
}

/// One entry in a consumable resource's restock/consumption ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEntry {
    pub id: Ulid,
    pub at: Ms,
    pub delta: i64,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub kind: ResourceKind,
    pub total_quantity: u32,
    /// None = global scope, visible to every organization.
    pub organization_id: Option<Ulid>,
    /// All allocations, sorted by `span.start`.
    pub allocations: Vec<Allocation>,
    /// Append-only; meaningful for consumable resources only.
    pub stock_entries: Vec<StockEntry>,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        name: Option<String>,
        kind: ResourceKind,
        total_quantity: u32,
        organization_id: Option<Ulid>,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            total_quantity,
            organization_id,
            allocations: Vec::new(),
            stock_entries: Vec::new(),
        }
    }

    /// Insert an allocation maintaining sort order by span.start.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&allocation.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    /// Remove an allocation by id.
    pub fn remove_allocation(&mut self, id: Ulid) -> Option<Allocation> {
        if let Some(pos) = self.allocations.iter().position(|a| a.id == id) {
            Some(self.allocations.remove(pos))
        } else {
            None
        }
    }

    pub fn allocation(&self, id: Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    /// Return only allocations whose span overlaps the query window.
    /// Uses binary search to skip allocations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Allocation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .allocations
            .partition_point(|a| a.span.start < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Current stock level of a consumable: the standing quantity plus every
    /// ledger adjustment. Exclusive/shareable resources carry no entries, so
    /// this degenerates to `total_quantity`.
    pub fn standing_stock(&self) -> i64 {
        self.total_quantity as i64 + self.stock_entries.iter().map(|e| e.delta).sum::<i64>()
    }
}

/// A calendar event as the engine needs to see it: a window, a status, and
/// the organization/hierarchy attributes the reports inspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Ulid,
    pub title: Option<String>,
    pub span: Span,
    pub status: EventStatus,
    pub organization_id: Option<Ulid>,
    pub parent_event_id: Option<Ulid>,
}

/// Attendance of one (possibly external) person at one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendance {
    pub id: Ulid,
    pub event_id: Ulid,
    /// None = external guest without an account.
    pub user_id: Option<Ulid>,
    pub checked_in_at: Option<Ms>,
}

/// The change types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        kind: ResourceKind,
        total_quantity: u32,
        organization_id: Option<Ulid>,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        kind: ResourceKind,
        total_quantity: u32,
    },
    ResourceDeleted {
        id: Ulid,
    },
    EventUpserted {
        event: EventRecord,
    },
    /// Deleting an event cascades onto its allocations during apply.
    EventDeleted {
        id: Ulid,
    },
    AllocationCreated {
        id: Ulid,
        resource_id: Ulid,
        event_id: Ulid,
        quantity: u32,
        span: Span,
    },
    AllocationDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
    AttendanceRecorded {
        attendance: Attendance,
    },
    AttendanceRemoved {
        id: Ulid,
    },
    StockAdjusted {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        delta: i64,
        note: Option<String>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub kind: ResourceKind,
    pub total_quantity: u32,
    pub organization_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub event_id: Ulid,
    pub quantity: u32,
    pub start: Ms,
    pub end: Ms,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockEntryInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub at: Ms,
    pub delta: i64,
    pub note: Option<String>,
}

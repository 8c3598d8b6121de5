use crate::model::Ms;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_EVENTS_PER_TENANT: usize = 100_000;
pub const MAX_ATTENDANCES_PER_TENANT: usize = 1_000_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 50_000;
pub const MAX_STOCK_ENTRIES_PER_RESOURCE: usize = 100_000;

/// Allocation requests accepted in a single event booking.
pub const MAX_BOOKINGS_PER_REQUEST: usize = 100;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 512;
pub const MAX_NOTE_LEN: usize = 1024;

/// 1970-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest accepted window, for events and availability queries alike (one
/// year).
pub const MAX_WINDOW_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_TENANT_NAME_LEN: usize = 256;
pub const MAX_TENANTS: usize = 64;

/// One attempt at a per-resource write lock waits this long.
pub const LOCK_ACQUIRE_TIMEOUT_MS: u64 = 250;
/// Attempts before a mutation gives up with a retryable contention error.
pub const LOCK_ACQUIRE_RETRIES: u32 = 3;

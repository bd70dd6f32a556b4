use crate::model::Ms;

pub const MAX_SPOTS_PER_TENANT: usize = 100_000;
pub const MAX_CLAIMS_PER_SPOT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 512;

/// 1970-01-01. Spans before the epoch are rejected.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01. Anything later is almost certainly a unit mixup (seconds vs ms).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking or block may cover at most 90 days.
pub const MAX_SPAN_DURATION_MS: Ms = 90 * 24 * 3_600_000;
/// Availability queries may cover at most one year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// PIN space is 0000-9999.
pub const PIN_SPACE: u32 = 10_000;
/// Give up regenerating a colliding PIN after this many draws.
pub const MAX_PIN_ATTEMPTS: usize = 64;

/// Terminal (completed/cancelled) bookings older than this are dropped
/// from the WAL at compaction time.
pub const TERMINAL_RETENTION_MS: Ms = 90 * 24 * 3_600_000;

/// Pending bookings must see payment verification within this window
/// unless the operator overrides it.
pub const DEFAULT_PAYMENT_TIMEOUT_MS: Ms = 15 * 60_000;

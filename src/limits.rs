use crate::model::{DAY_MS, Ms};

/// Column width of the reason field in the marketplace schema.
pub const MAX_REASON_LEN: usize = 255;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Longest single block (two years).
pub const MAX_SPAN_DURATION_MS: Ms = 731 * DAY_MS;

/// Most blocks a resource may hold. Only inserts are refused at the cap.
pub const MAX_INTERVALS_PER_RESOURCE: usize = 10_000;

/// Hard cap in the local store. One above the calendar's cap: a merged
/// block is created before its superseded blocks are deleted.
pub const MAX_STORED_INTERVALS_PER_RESOURCE: usize = MAX_INTERVALS_PER_RESOURCE + 1;

/// Widest calendar range a single query may cover.
pub const MAX_QUERY_DAYS: i64 = 62;

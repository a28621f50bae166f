use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_RESOURCES_PER_TENANT: usize = 1_000;
pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 200_000;
pub const MAX_BLOCKS_PER_RESOURCE: usize = 10_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_NOTES_LEN: usize = 1_000;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_RECURRENCE_RULE_LEN: usize = 500;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single reservation may not exceed one week.
pub const MAX_RESERVATION_DURATION_MS: Ms = 7 * DAY_MS;
/// Blocks may close a resource for up to two years at once.
pub const MAX_BLOCK_DURATION_MS: Ms = 731 * DAY_MS;
/// Widest calendar / conflict query.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

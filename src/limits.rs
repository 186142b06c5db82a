use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1024;
pub const MAX_COUNTER_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_LINES_PER_BOOKING: usize = 256;
pub const MAX_ROSTER_SIZE: usize = 10_000;
pub const MAX_PARTICIPANTS: usize = 100_000;

/// 1970-01-01. Nothing is booked before the epoch.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// Ten years.
pub const MAX_SPAN_DURATION_MS: Ms = 10 * 366 * 86_400_000;
/// Previews are capped at roughly two years.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 86_400_000;

pub const MAX_TENANT_NAME_LEN: usize = 200;
pub const MAX_TENANTS: usize = 1024;

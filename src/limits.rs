pub const MAX_SERVICES_PER_TENANT: usize = 10_000;
pub const MAX_RULES_PER_DAY: usize = 1_000;
pub const MAX_BOOKINGS_PER_DAY: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;

/// A service can't be longer than the day it's booked on.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

/// How far ahead availability may be queried or booked.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 366 * 2;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Highest `$n` placeholder accepted in an extended-protocol statement.
pub const MAX_QUERY_PARAMS: usize = 1_024;

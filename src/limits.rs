use crate::model::Ms;

pub const MIN_PLAYERS_PER_BOOKING: u32 = 1;
pub const MAX_PLAYERS_PER_BOOKING: u32 = 8;

pub const MIN_CAMPAIGN_PLAYERS: u32 = 1;
pub const MAX_CAMPAIGN_PLAYERS: u32 = 8;

pub const MIN_CAMPAIGN_LEVEL: u8 = 1;
pub const MAX_CAMPAIGN_LEVEL: u8 = 20;

/// Sessions longer than a day cannot fit inside a daily working-hours window.
pub const MAX_SESSION_HOURS: f64 = 24.0;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

pub const MAX_CAMPAIGNS: usize = 10_000;
pub const MAX_ROOMS: usize = 10_000;
pub const MAX_FACILITATORS: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_ROOMS_PER_CAMPAIGN: usize = 64;
pub const MAX_SLOTS_PER_CAMPAIGN: usize = 100_000;

/// Upper bound on how many schedules a single transaction may lock.
pub const MAX_CONTENTION_SET: usize = 1024;

/// 1970-01-01 .. 9999-12-31, the range chrono and the wire format agree on.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

//! Hard limits. Anything past these is rejected with `LimitExceeded`.

pub const MAX_ROOM_CAPACITY: u32 = 64;
pub const MAX_ROOM_NUMBER_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 256;

pub const MAX_ROOMS_PER_HOSTEL: usize = 10_000;
pub const MAX_STUDENTS_PER_HOSTEL: usize = 100_000;

pub const MAX_HOSTELS: usize = 1_000;
pub const MAX_HOSTEL_NAME_LEN: usize = 128;

/// Compare-and-set attempts on a room's cached occupancy before giving up
/// with a retryable conflict.
pub const MAX_RECOMPUTE_ATTEMPTS: usize = 8;

/// Rooms reconciled in parallel during a full pass.
pub const RECONCILE_CONCURRENCY: usize = 8;

/// Per-subscriber buffer for change notifications. A slower subscriber
/// lags and is told how many events it missed.
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

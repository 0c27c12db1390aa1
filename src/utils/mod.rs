//! Shared utilities: timestamps and retry helpers.

pub mod retry;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
///
/// All registry timestamps (heartbeats, deadlines, access times) use this
/// resolution so short test deadlines remain representable.
pub fn unix_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current Unix time in seconds.
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

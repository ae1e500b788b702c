//! The expire-time conversion helper shared by the client's storage
//! commands and the server's touch handling.

use std::time::{SystemTime, UNIX_EPOCH};

/// Above this many seconds, an expire value is interpreted as an
/// absolute Unix timestamp rather than a relative offset.
pub const EXPIRE_REALTIME_THRESHOLD: i64 = 60 * 60 * 24 * 30;

/// Converts a caller-supplied expire value into the wire value memcached
/// expects: values at or below the threshold pass through unchanged as a
/// relative second count; values above it are absolute and get `base`
/// added. A non-positive `base` means "use the current time", mirroring
/// the original's `if (base <= 0) base = current_unix_timestamp();`.
pub fn calc_expire_time(seconds: i64, base: i64) -> i64 {
    if seconds <= EXPIRE_REALTIME_THRESHOLD {
        seconds
    } else {
        let base = if base <= 0 { current_unix_timestamp() } else { base };
        base + seconds
    }
}

fn current_unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

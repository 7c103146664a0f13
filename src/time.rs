//! Current-time source and interval flooring — the Rust equivalent of the
//! reference implementation's `wsp_time()` / `wsp_time_floor()`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time, truncated to whole seconds, as the same `u32`
/// representation used for every on-disk timestamp.
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as u32
}

/// Floor `timestamp` to the nearest multiple of `interval` at or below it.
/// `interval == 0` returns `timestamp` unchanged rather than dividing by
/// zero — archive geometry is validated elsewhere to guarantee `spp >= 1`,
/// but this keeps the function total.
pub fn floor(timestamp: u32, interval: u32) -> u32 {
    if interval == 0 {
        return timestamp;
    }
    timestamp - (timestamp % interval)
}

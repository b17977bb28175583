use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use std::time::Instant;

fn native_duration_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::ZERO)
}

/// Returns the duration since the Unix epoch for the current instant.
pub fn duration_since_epoch() -> Duration {
    native_duration_since_epoch()
}

/// Milliseconds since the Unix epoch.
pub fn unix_timestamp_ms() -> u128 {
    duration_since_epoch().as_millis()
}

/// Nanoseconds since the Unix epoch.
pub fn unix_timestamp_ns() -> u128 {
    duration_since_epoch().as_nanos()
}

/// Nanoseconds elapsed since an arbitrary but fixed process-local origin.
///
/// The profiler only ever looks at differences between two calls, so the
/// origin does not matter as long as the reading is monotonic.
pub fn monotonic_ns() -> i64 {
    use std::sync::OnceLock;
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn epoch_is_sane() {
        // Anything after 2020 and the clock is plausible.
        assert!(unix_timestamp_ms() > 1_577_836_800_000);
    }
}

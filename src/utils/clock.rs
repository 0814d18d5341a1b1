//! Process-wide clock helpers: monotonically increasing nanosecond
//! timestamps for lease horizons, and a cycle counter for cheap round-trip
//! latency sampling.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock base paired with the `Instant` it was captured at. Advancing
/// the base by `Instant::elapsed` keeps `now_ns()` monotonic even if the
/// system clock steps backwards.
fn clock_base() -> &'static (i64, Instant) {
    static BASE: OnceLock<(i64, Instant)> = OnceLock::new();
    BASE.get_or_init(|| {
        let wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_nanos() as i64;
        (wall_ns, Instant::now())
    })
}

/// Returns the current timestamp in nanoseconds, epoch-scaled and strictly
/// non-decreasing across calls within this process.
pub fn now_ns() -> i64 {
    let &(wall_ns, base) = clock_base();
    wall_ns + base.elapsed().as_nanos() as i64
}

/// Returns a cycle-counter reading for latency sampling. Only ever diffed
/// against another reading taken on the same machine (beacon echoes), so
/// the monotonic clock serves as the counter.
pub fn cycles() -> u64 {
    now_ns() as u64
}

#[cfg(test)]
mod clock_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn now_ns_monotonic() {
        let t1 = now_ns();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = now_ns();
        assert!(t2 > t1);
        assert!(t2 - t1 >= 5_000_000);
    }

    #[test]
    fn now_ns_epoch_scaled() {
        // any reasonable wall clock is far past 2001-09-09 (1e18 ns)
        assert!(now_ns() > 1_000_000_000_000_000_000);
    }

    #[test]
    fn cycles_advances() {
        let c1 = cycles();
        std::thread::sleep(Duration::from_millis(1));
        let c2 = cycles();
        assert!(c2 > c1);
    }
}

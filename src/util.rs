//! Useful helpers that don't really belong anywhere else.

use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic microseconds since boot.
///
/// The reference point is taken on the first call, which is close enough to
/// process start for a timestamp whose only contract is monotonicity. Page
/// headers store this value at seal time.
pub fn now_boot_us() -> u64 {
    static BOOT: OnceLock<Instant> = OnceLock::new();
    let boot = BOOT.get_or_init(Instant::now);
    boot.elapsed().as_micros() as u64
}

#[test]
fn test_now_boot_us_monotonic() {
    let a = now_boot_us();
    let b = now_boot_us();
    assert!(b >= a);
}

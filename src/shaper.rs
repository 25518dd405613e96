//! Constant-packet-rate pacing.

use std::time::Duration;

/// Inter-datagram period such that one full-MTU datagram every cycle equals
/// `rate` KiB/s. A zero rate disables shaping (zero period).
///
/// Rates too low to fill one MTU datagram per second are clamped to one
/// datagram per second rather than dividing by zero.
pub fn cpr_cycle(rate: usize, mtu: usize) -> Duration {
    if rate == 0 {
        return Duration::ZERO;
    }
    let per_second = (rate * 1024 / mtu).max(1);
    Duration::from_secs(1) / per_second as u32
}

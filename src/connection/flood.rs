//! Leaky-bucket flood protection for inbound connection requests,
//! keyed by the remote IP (spec.md §4.5: a flooding connection hasn't
//! completed a handshake yet, so no CID is available), with a raised
//! limit for addresses already known to be MCN (multi-connection)
//! peers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
    warned_minor: bool,
    warned_severe: bool,
}

impl Bucket {
    fn fresh(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            warned_minor: false,
            warned_severe: false,
        }
    }
}

/// Rate-limits inbound connection attempts per source IP within a
/// rolling window. Two thresholds apply: crossing `minor_threshold`
/// only logs, crossing `severe_threshold` rejects the attempt. An IP
/// already known to support MCN is judged against `mcn_limit` instead
/// of `severe_threshold` (spec.md §4.5, §8.3 scenario 6).
pub struct FloodGuard {
    minor_threshold: u32,
    severe_threshold: u32,
    mcn_limit: u32,
    period: Duration,
    buckets: HashMap<IpAddr, Bucket>,
}

impl FloodGuard {
    pub fn new(minor_threshold: u32, severe_threshold: u32, mcn_limit: u32, period: Duration) -> Self {
        Self {
            minor_threshold,
            severe_threshold,
            mcn_limit,
            period,
            buckets: HashMap::new(),
        }
    }

    /// Records a connection attempt from `addr` and returns whether it
    /// should be allowed through. `is_mcn_peer` raises the applicable
    /// limit to `mcn_limit` instead of `severe_threshold`.
    pub fn allow(&mut self, addr: IpAddr, is_mcn_peer: bool, now: Instant) -> bool {
        let period = self.period;
        let bucket = self.buckets.entry(addr).or_insert_with(|| Bucket::fresh(now));

        if now.duration_since(bucket.window_start) > period {
            *bucket = Bucket::fresh(now);
        }

        bucket.count += 1;

        let limit = if is_mcn_peer { self.mcn_limit } else { self.severe_threshold };

        if bucket.count > limit {
            if !bucket.warned_severe {
                log::warn!("incoming connect flood from {}: rejecting after {} attempts in {:?}", addr, bucket.count, period);
                bucket.warned_severe = true;
            }
            return false;
        }

        if !is_mcn_peer && bucket.count > self.minor_threshold && !bucket.warned_minor {
            log::debug!("connect rate from {} crossed minor flood threshold ({})", addr, self.minor_threshold);
            bucket.warned_minor = true;
        }

        true
    }

    /// Periodic cleanup: drops buckets whose window has long expired so
    /// the map doesn't grow without bound.
    pub fn sweep(&mut self, now: Instant) {
        let period = self.period;
        self.buckets.retain(|_, b| now.duration_since(b.window_start) <= period * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, n])
    }

    #[test]
    fn test_allows_up_to_severe_threshold() {
        let mut guard = FloodGuard::new(1, 2, 100, Duration::from_secs(30));
        let a = addr(1);
        let now = Instant::now();
        assert!(guard.allow(a, false, now));
        assert!(guard.allow(a, false, now));
        assert!(!guard.allow(a, false, now));
    }

    #[test]
    fn test_scenario_46_connections_rejects_at_severe_threshold() {
        let mut guard = FloodGuard::new(30, 45, 100, Duration::from_secs(30));
        let a = addr(2);
        let now = Instant::now();
        let mut last = true;
        for _ in 0..46 {
            last = guard.allow(a, false, now);
        }
        assert!(!last);
    }

    #[test]
    fn test_mcn_peer_gets_raised_limit() {
        let mut guard = FloodGuard::new(30, 45, 100, Duration::from_secs(30));
        let a = addr(3);
        let now = Instant::now();
        let mut allowed_46th = false;
        for i in 0..46 {
            let allowed = guard.allow(a, true, now);
            if i == 45 {
                allowed_46th = allowed;
            }
        }
        assert!(allowed_46th);
    }

    #[test]
    fn test_window_resets_after_period() {
        let mut guard = FloodGuard::new(1, 1, 100, Duration::from_secs(10));
        let a = addr(4);
        let now = Instant::now();
        assert!(guard.allow(a, false, now));
        assert!(!guard.allow(a, false, now));
        let later = now + Duration::from_secs(11);
        assert!(guard.allow(a, false, later));
    }
}

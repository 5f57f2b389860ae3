//! Connections-per-minute limiter (design component C4).
//!
//! Per `(service, remote-address)`, a ring of 6 buckets at 10-second
//! granularity with cool-down on over-limit, stored in a combined map +
//! LRU list so stale entries are recycled instead of leaking. Grounded on
//! `libinetd/inetd.cpp`'s `se_cpmmax`/`se_cpmwait` handling and the CPM
//! constants documented in the design (`CNT_INTVL`, bucket granularity).

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub const BUCKET_SECS: u64 = 10;
pub const NUM_BUCKETS: usize = 6;
pub const WINDOW_SECS: u64 = (BUCKET_SECS as usize * NUM_BUCKETS) as u64;
const STALE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpmVerdict {
    Allowed,
    OverLimit,
    TemporarilyDisabled,
}

#[derive(Debug, Clone)]
struct Bucket {
    tick: u64,
    count: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    buckets: [Bucket; NUM_BUCKETS],
    last_touched: Instant,
    deny_until: Option<Instant>,
}

impl Entry {
    fn fresh(now: Instant) -> Self {
        Entry {
            buckets: std::array::from_fn(|_| Bucket { tick: u64::MAX, count: 0 }),
            last_touched: now,
            deny_until: None,
        }
    }
}

/// Per-service CPM limiter keyed by remote address. A single mutex guards
/// the container (contention is expected to be low relative to per-event
/// work); callers hold it only across the arrival check.
pub struct CpmLimiter {
    cpm_max: u32,
    cooldown: Duration,
    start: Instant,
    entries: HashMap<IpAddr, Entry>,
}

impl CpmLimiter {
    /// `cpm_max == 0` disables the limiter entirely (spec boundary case).
    pub fn new(cpm_max: u32, cooldown_secs: u32) -> Self {
        CpmLimiter {
            cpm_max,
            cooldown: Duration::from_secs(cooldown_secs as u64),
            start: Instant::now(),
            entries: HashMap::new(),
        }
    }

    fn tick_at(&self, now: Instant) -> u64 {
        now.duration_since(self.start).as_secs() / BUCKET_SECS
    }

    /// Record an arrival from `addr` at `now` and return the admission
    /// verdict. Evicts one recyclable stale entry per call when the table
    /// is growing and the addressed entry is new, bounding unbounded
    /// growth from single-shot source addresses.
    pub fn arrival(&mut self, addr: IpAddr, now: Instant) -> CpmVerdict {
        if self.cpm_max == 0 {
            return CpmVerdict::Allowed;
        }

        self.evict_one_stale(now);

        let tick = self.tick_at(now);
        let entry = self.entries.entry(addr).or_insert_with(|| Entry::fresh(now));
        entry.last_touched = now;

        if let Some(deny_until) = entry.deny_until {
            if now < deny_until {
                return CpmVerdict::TemporarilyDisabled;
            }
            entry.deny_until = None;
        }

        let slot = (tick % NUM_BUCKETS as u64) as usize;
        if entry.buckets[slot].tick != tick {
            entry.buckets[slot] = Bucket { tick, count: 0 };
        }
        entry.buckets[slot].count += 1;

        let sum: u32 = entry
            .buckets
            .iter()
            .filter(|b| tick.saturating_sub(b.tick) <= (NUM_BUCKETS as u64 - 1))
            .map(|b| b.count)
            .sum();

        let rate_per_min = sum as u64 * 60 / WINDOW_SECS;
        if rate_per_min > self.cpm_max as u64 {
            // Entering cool-down quarantines the source: the ring is reset
            // so that once `deny_until` passes the source starts measuring
            // a fresh window rather than immediately re-tripping on the
            // burst that caused the cool-down.
            entry.buckets = std::array::from_fn(|_| Bucket { tick: u64::MAX, count: 0 });
            if !self.cooldown.is_zero() {
                entry.deny_until = Some(now + self.cooldown);
            }
            return CpmVerdict::OverLimit;
        }
        CpmVerdict::Allowed
    }

    fn evict_one_stale(&mut self, now: Instant) {
        if self.entries.len() < 4096 {
            return;
        }
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| {
                now.duration_since(e.last_touched) >= Duration::from_secs(STALE_SECS)
                    && e.deny_until.is_none_or(|d| now >= d)
            })
            .min_by_key(|(_, e)| e.last_touched)
            .map(|(addr, _)| *addr);
        if let Some(addr) = victim {
            self.entries.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn src() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn disabled_when_cpm_max_zero() {
        let mut lim = CpmLimiter::new(0, 0);
        for _ in 0..100 {
            assert_eq!(lim.arrival(src(), Instant::now()), CpmVerdict::Allowed);
        }
    }

    #[test]
    fn sixth_connection_in_ten_seconds_denied() {
        // cpm = 5 30: allow 5/min, 30s cooldown.
        let mut lim = CpmLimiter::new(5, 30);
        let t0 = Instant::now();
        for i in 0..5 {
            let v = lim.arrival(src(), t0 + Duration::from_millis(i * 100));
            assert_eq!(v, CpmVerdict::Allowed);
        }
        let sixth = lim.arrival(src(), t0 + Duration::from_secs(1));
        assert_eq!(sixth, CpmVerdict::OverLimit);
    }

    #[test]
    fn cooldown_denies_for_window_even_after_buckets_age_out() {
        let mut lim = CpmLimiter::new(5, 30);
        let t0 = Instant::now();
        for i in 0..6 {
            lim.arrival(src(), t0 + Duration::from_millis(i * 100));
        }
        // Within the 30s cooldown, still denied even though old buckets
        // would otherwise have aged out of the 60s window.
        let still_denied = lim.arrival(src(), t0 + Duration::from_secs(25));
        assert_eq!(still_denied, CpmVerdict::TemporarilyDisabled);
    }

    #[test]
    fn allowed_again_after_cooldown_elapses() {
        let mut lim = CpmLimiter::new(5, 30);
        let t0 = Instant::now();
        for i in 0..6 {
            lim.arrival(src(), t0 + Duration::from_millis(i * 100));
        }
        let after = lim.arrival(src(), t0 + Duration::from_secs(31));
        assert_eq!(after, CpmVerdict::Allowed);
    }
}

use super::{DecisionSource, RateLimitConfig, RateLimitDecision};
use parking_lot::Mutex;
use std::time::{Duration, SystemTime};

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Instance-local fixed-window counters used while the shared store is down
///
/// Each instance only sees its own traffic, so the configured limit is divided
/// by the fleet size (never below one request per window). The table is never
/// reconciled with other instances.
///
/// The table holds at most `max_entries` windows. When it is full, windows that
/// have elapsed under their own length are swept first; if that frees nothing,
/// the windows closest to resetting are evicted.
pub struct LocalFallback {
    instances: u32,
    max_entries: usize,
    windows: Mutex<HashMap<String, FallbackWindow>>,
}

#[derive(Debug, Clone, Copy)]
struct FallbackWindow {
    count: u32,
    window_start: SystemTime,
    window: Duration,
}

impl FallbackWindow {
    fn fresh(now: SystemTime, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
        }
    }

    fn reset_at(&self) -> SystemTime {
        self.window_start + self.window
    }

    fn elapsed(&self, now: SystemTime) -> bool {
        match now.duration_since(self.window_start) {
            Ok(age) => age >= self.window,
            // Clock stepped backwards: start over
            Err(_) => true,
        }
    }
}

impl LocalFallback {
    /// `instances` is the number of service replicas sharing the distributed limit
    pub fn new(instances: u32) -> Self {
        Self::with_max_entries(instances, DEFAULT_MAX_ENTRIES)
    }

    /// Like [`new`](Self::new), holding at most `max_entries` windows
    pub fn with_max_entries(instances: u32, max_entries: usize) -> Self {
        Self {
            instances: instances.max(1),
            max_entries: max_entries.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn instances(&self) -> u32 {
        self.instances
    }

    /// Per-instance share of `max_requests`
    pub fn effective_limit(&self, max_requests: u32) -> u32 {
        (max_requests / self.instances).max(1)
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn check(&self, key: &str, config: &RateLimitConfig, now: SystemTime) -> RateLimitDecision {
        let limit = self.effective_limit(config.max_requests);
        let mut windows = self.windows.lock();

        if windows.len() >= self.max_entries && !windows.contains_key(key) {
            self.make_room(&mut windows, now);
        }

        let entry = windows
            .entry(key.to_string())
            .or_insert_with(|| FallbackWindow::fresh(now, config.window));
        if entry.elapsed(now) || entry.window != config.window {
            *entry = FallbackWindow::fresh(now, config.window);
        }

        let reset_at = entry.reset_at();
        if entry.count >= limit {
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after: reset_at.duration_since(now).unwrap_or(config.window),
                source: DecisionSource::LocalFallback,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - entry.count,
            reset_at,
            retry_after: Duration::ZERO,
            source: DecisionSource::LocalFallback,
        }
    }

    fn make_room(&self, windows: &mut HashMap<String, FallbackWindow>, now: SystemTime) {
        let before = windows.len();
        windows.retain(|_, w| !w.elapsed(now));

        if windows.len() >= self.max_entries {
            let excess = windows.len() + 1 - self.max_entries;
            let batch = excess.max(self.max_entries / 16).min(windows.len());
            let mut by_reset: Vec<(SystemTime, String)> = windows
                .iter()
                .map(|(key, w)| (w.reset_at(), key.clone()))
                .collect();
            by_reset.select_nth_unstable_by_key(batch - 1, |(reset_at, _)| *reset_at);
            for (_, key) in by_reset.into_iter().take(batch) {
                windows.remove(&key);
            }
            tracing::warn!(
                evicted = batch,
                max_entries = self.max_entries,
                "fallback rate-limit table full, evicted live windows"
            );
        }

        tracing::debug!(
            evicted = before - windows.len(),
            "swept fallback rate-limit table"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::Criticality;

    fn config(max_requests: u32) -> RateLimitConfig {
        RateLimitConfig::new("api", max_requests, Duration::from_secs(60), Criticality::Standard)
    }

    #[test]
    fn test_effective_limit_divides_by_instances() {
        assert_eq!(LocalFallback::new(1).effective_limit(100), 100);
        assert_eq!(LocalFallback::new(4).effective_limit(100), 25);
        assert_eq!(LocalFallback::new(3).effective_limit(10), 3);
        // Never below one request per window
        assert_eq!(LocalFallback::new(50).effective_limit(10), 1);
        // Zero instances is treated as one
        assert_eq!(LocalFallback::new(0).effective_limit(10), 10);
    }

    #[test]
    fn test_counts_then_denies_then_resets() {
        let fallback = LocalFallback::new(2);
        let cfg = config(6);
        let now = SystemTime::now();

        for expected_remaining in [2, 1, 0] {
            let d = fallback.check("k", &cfg, now);
            assert!(d.allowed);
            assert_eq!(d.limit, 3);
            assert_eq!(d.remaining, expected_remaining);
        }

        let denied = fallback.check("k", &cfg, now + Duration::from_secs(10));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(50));

        let later = now + Duration::from_secs(60);
        let d = fallback.check("k", &cfg, later);
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[test]
    fn test_sweeps_elapsed_windows_when_full() {
        let fallback = LocalFallback::with_max_entries(1, 2);
        let cfg = config(5);
        let now = SystemTime::now();

        fallback.check("a", &cfg, now);
        fallback.check("b", &cfg, now);
        assert_eq!(fallback.len(), 2);

        fallback.check("c", &cfg, now + Duration::from_secs(120));
        assert_eq!(fallback.len(), 1);
    }

    #[test]
    fn test_sweep_uses_each_windows_own_length() {
        let fallback = LocalFallback::with_max_entries(1, 2);
        let daily = RateLimitConfig::new(
            "global",
            1,
            Duration::from_secs(86_400),
            Criticality::Standard,
        );
        let now = SystemTime::now();

        assert!(fallback.check("global:ip:a", &daily, now).allowed);
        assert!(!fallback.check("global:ip:a", &daily, now).allowed);

        fallback.check("ip:a", &config(5), now);
        // full: the elapsed minute window goes, the daily quota stays
        fallback.check("ip:b", &config(5), now + Duration::from_secs(120));
        assert_eq!(fallback.len(), 2);

        let later = now + Duration::from_secs(180);
        let d = fallback.check("global:ip:a", &daily, later);
        assert!(!d.allowed);
        assert_eq!(d.retry_after, Duration::from_secs(86_400 - 180));
    }

    #[test]
    fn test_table_never_exceeds_capacity() {
        let fallback = LocalFallback::with_max_entries(1, 4);
        let cfg = config(5);
        let now = SystemTime::now();

        for i in 0..20u64 {
            // no window elapses, so nothing can be swept
            fallback.check(&format!("k{i}"), &cfg, now + Duration::from_millis(i));
            assert!(fallback.len() <= 4);
        }

        // the newest window survived eviction
        let d = fallback.check("k19", &cfg, now + Duration::from_millis(20));
        assert_eq!(d.remaining, 3);
    }
}

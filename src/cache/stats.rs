//! Hit/miss, cost and latency accounting.

use super::entry::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub requests: u64,
    pub hits: u64,
    pub cost_saved: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Percentage in `0..=100`.
    pub hit_rate: f64,
    pub total_cost_saved: f64,
    /// Running mean of `wrap` wall-clock time, in milliseconds.
    pub average_response_time: f64,
    /// Epoch milliseconds.
    pub last_reset_time: u64,
    pub by_provider: HashMap<String, ProviderStats>,
}

impl CacheStats {
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            cache_hits: 0,
            cache_misses: 0,
            hit_rate: 0.0,
            total_cost_saved: 0.0,
            average_response_time: 0.0,
            last_reset_time: now_millis(),
            by_provider: HashMap::new(),
        }
    }

    fn recompute_hit_rate(&mut self) {
        self.hit_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_requests as f64 * 100.0
        };
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialised accumulator over [`CacheStats`]. Disabled trackers ignore every event.
pub struct StatsTracker {
    enabled: bool,
    inner: Mutex<CacheStats>,
}

impl StatsTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inner: Mutex::new(CacheStats::new()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut CacheStats)) {
        if !self.enabled {
            return;
        }
        let mut stats = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut stats);
    }

    pub fn record_request(&self, provider: &str) {
        self.update(|s| {
            s.total_requests += 1;
            s.by_provider.entry(provider.to_string()).or_default();
            s.recompute_hit_rate();
        });
    }

    pub fn record_hit(&self, provider: &str, cost: f64) {
        self.update(|s| {
            s.cache_hits += 1;
            s.total_cost_saved += cost;
            let bucket = s.by_provider.entry(provider.to_string()).or_default();
            bucket.hits += 1;
            bucket.cost_saved += cost;
            s.recompute_hit_rate();
        });
    }

    pub fn record_miss(&self, provider: &str) {
        self.update(|s| {
            s.cache_misses += 1;
            s.by_provider.entry(provider.to_string()).or_default().requests += 1;
            s.recompute_hit_rate();
        });
    }

    /// Fold one `wrap` duration into the running mean, with `n = total_requests`.
    pub fn record_response_time(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.update(|s| {
            let n = s.total_requests.max(1) as f64;
            s.average_response_time = if n <= 1.0 {
                ms
            } else {
                (s.average_response_time * (n - 1.0) + ms) / n
            };
        });
    }

    pub fn snapshot(&self) -> CacheStats {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reset(&self) {
        let mut stats = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *stats = CacheStats::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_and_cost() {
        let t = StatsTracker::new(true);
        t.record_request("openai");
        t.record_miss("openai");
        t.record_request("openai");
        t.record_hit("openai", 0.05);

        let s = t.snapshot();
        assert_eq!(s.total_requests, 2);
        assert_eq!(s.cache_hits, 1);
        assert_eq!(s.cache_misses, 1);
        assert_eq!(s.hit_rate, 50.0);
        assert!((s.total_cost_saved - 0.05).abs() < 1e-12);
        let p = &s.by_provider["openai"];
        assert_eq!(p.requests, 1);
        assert_eq!(p.hits, 1);
        assert!((p.cost_saved - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_empty_hit_rate_is_zero() {
        let t = StatsTracker::new(true);
        assert_eq!(t.snapshot().hit_rate, 0.0);
        t.record_request("anthropic");
        assert_eq!(t.snapshot().hit_rate, 0.0);
        assert!(t.snapshot().by_provider.contains_key("anthropic"));
    }

    #[test]
    fn test_running_mean() {
        let t = StatsTracker::new(true);
        t.record_request("p");
        t.record_response_time(Duration::from_millis(10));
        assert!((t.snapshot().average_response_time - 10.0).abs() < 1e-9);

        t.record_request("p");
        t.record_response_time(Duration::from_millis(30));
        assert!((t.snapshot().average_response_time - 20.0).abs() < 1e-9);

        t.record_request("p");
        t.record_response_time(Duration::from_millis(50));
        assert!((t.snapshot().average_response_time - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_tracker_ignores_events() {
        let t = StatsTracker::new(false);
        t.record_request("p");
        t.record_hit("p", 1.0);
        t.record_response_time(Duration::from_millis(5));
        let s = t.snapshot();
        assert_eq!(s.total_requests, 0);
        assert!(s.by_provider.is_empty());
    }

    #[test]
    fn test_reset_clears_counters() {
        let t = StatsTracker::new(true);
        t.record_request("p");
        t.record_miss("p");
        let before = t.snapshot().last_reset_time;
        t.reset();
        let s = t.snapshot();
        assert_eq!(s.total_requests, 0);
        assert_eq!(s.cache_misses, 0);
        assert!(s.by_provider.is_empty());
        assert!(s.last_reset_time >= before);
    }
}

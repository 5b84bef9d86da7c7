//! Cache entry: the unit of storage.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    /// Creation instant in epoch milliseconds. Drives both expiry and eviction order.
    pub timestamp: u64,
    /// Lifetime in seconds after `timestamp`.
    pub ttl: u64,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub cost: f64,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        ttl: u64,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: now_millis(),
            ttl,
            provider: provider.into(),
            model: model.into(),
            token_count: 0,
            cost: 0.0,
        }
    }

    pub fn with_usage(mut self, token_count: u64, cost: f64) -> Self {
        self.token_count = token_count;
        self.cost = cost.max(0.0);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn expires_at(&self) -> u64 {
        self.timestamp.saturating_add(self.ttl.saturating_mul(1000))
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

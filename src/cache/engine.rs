//! Cache engine: cache-or-invoke around an expensive async call.

use super::backend::StorageBackend;
use super::config::{CacheConfig, StorageKind, MAX_TTL_SECS};
use super::entry::CacheEntry;
use super::key::CacheKeyGenerator;
use super::memory::MemoryStore;
use super::networked::NetworkedStore;
use super::pattern::KeyPattern;
use super::stats::{CacheStats, StatsTracker};
use crate::resilience::retry::RetryPolicy;
use crate::{Error, ErrorContext, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a wrapped call reports back: the value plus optional usage metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput<T> {
    pub value: T,
    pub token_count: Option<u64>,
    pub cost: Option<f64>,
}

impl<T> CallOutput<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            token_count: None,
            cost: None,
        }
    }

    pub fn with_usage(mut self, token_count: u64, cost: f64) -> Self {
        self.token_count = Some(token_count);
        self.cost = Some(cost);
        self
    }
}

/// Describes one cacheable call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallDescriptor {
    pub provider: String,
    pub model: String,
    /// Explicit key; skips derivation when set.
    pub cache_key: Option<String>,
    /// Per-call TTL override in seconds.
    pub ttl: Option<u64>,
    pub prompt: Option<Value>,
    pub params: Option<Value>,
}

impl CallDescriptor {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<Value>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_params(mut self, params: impl Into<Value>) -> Self {
        self.params = Some(params.into());
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(Error::validation_with_context(
                "provider must be a non-empty string",
                ErrorContext::new()
                    .with_field_path("descriptor.provider")
                    .with_source("cache_engine"),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(Error::validation_with_context(
                "model must be a non-empty string",
                ErrorContext::new()
                    .with_field_path("descriptor.model")
                    .with_source("cache_engine"),
            ));
        }
        if matches!(self.ttl, Some(t) if t == 0 || t > MAX_TTL_SECS) {
            return Err(Error::validation_with_context(
                format!("ttl override must be between 1 and {} seconds", MAX_TTL_SECS),
                ErrorContext::new()
                    .with_field_path("descriptor.ttl")
                    .with_source("cache_engine"),
            ));
        }
        if matches!(&self.cache_key, Some(k) if k.is_empty()) {
            return Err(Error::validation_with_context(
                "explicit cache key must not be empty",
                ErrorContext::new()
                    .with_field_path("descriptor.cache_key")
                    .with_source("cache_engine"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Hit,
    Miss,
    Failed,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Hit => "hit",
            Outcome::Miss => "miss",
            Outcome::Failed => "failed",
        }
    }
}

/// Orchestrates key derivation, lookup, retried invocation, storage and stats.
///
/// Storage failures never reach callers of [`wrap`](Self::wrap): a failed
/// lookup is a miss and a failed write is logged and dropped. Concurrent
/// misses on one key are not coalesced; both calls run and the last write wins.
/// Dropping the future returned by `wrap` cancels the in-flight call.
pub struct CacheEngine {
    config: CacheConfig,
    backend: Arc<dyn StorageBackend>,
    keys: CacheKeyGenerator,
    stats: StatsTracker,
    retry: RetryPolicy,
}

impl CacheEngine {
    /// Validate `config` and build the configured backend.
    ///
    /// A networked backend without usable connection options degrades to the
    /// memory backend instead of failing.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let backend = Self::build_backend(&config);
        Ok(Self::assemble(config, backend))
    }

    /// Use a caller-supplied backend; `config.storage` is ignored.
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, backend))
    }

    fn assemble(config: CacheConfig, backend: Arc<dyn StorageBackend>) -> Self {
        debug!(
            backend = backend.name(),
            ttl = config.ttl,
            max_size = config.max_size,
            "cache engine ready"
        );
        Self {
            keys: CacheKeyGenerator::new(config.key_prefix.clone()),
            stats: StatsTracker::new(config.enable_stats),
            retry: RetryPolicy::new(config.retry_config()),
            backend,
            config,
        }
    }

    fn build_backend(config: &CacheConfig) -> Arc<dyn StorageBackend> {
        let memory = || -> Arc<dyn StorageBackend> { Arc::new(MemoryStore::new(config.max_size)) };
        match config.storage {
            StorageKind::Memory => memory(),
            StorageKind::Networked => match config.networked.as_ref() {
                Some(opts) if opts.is_usable() => match NetworkedStore::redis(opts) {
                    Ok(store) => Arc::new(store) as Arc<dyn StorageBackend>,
                    Err(e) => {
                        error!(error = %e, "networked backend unavailable; falling back to memory");
                        memory()
                    }
                },
                _ => {
                    error!("networked storage selected without connection options; falling back to memory");
                    memory()
                }
            },
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Return the cached value for `descriptor`, or run `call` and cache its result.
    ///
    /// `call` runs at most `retry.max_attempts` times (3 by default) with
    /// exponential backoff; the last failure is returned as-is and nothing is
    /// stored. Validation errors are returned before `call` runs or storage is
    /// touched.
    pub async fn wrap<T, F, Fut>(&self, call: F, descriptor: CallDescriptor) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CallOutput<T>>>,
    {
        descriptor.validate()?;
        let started = Instant::now();
        let key = self.resolve_key(&descriptor);
        self.stats.record_request(&descriptor.provider);

        let (result, outcome) = self.cache_or_invoke(call, &descriptor, &key).await;

        let elapsed = started.elapsed();
        self.stats.record_response_time(elapsed);
        self.log_outcome(outcome, &key, &descriptor, elapsed);
        result
    }

    async fn cache_or_invoke<T, F, Fut>(
        &self,
        call: F,
        descriptor: &CallDescriptor,
        key: &str,
    ) -> (Result<T>, Outcome)
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CallOutput<T>>>,
    {
        if let Some((value, cost)) = self.lookup::<T>(key).await {
            self.stats.record_hit(&descriptor.provider, cost);
            return (Ok(value), Outcome::Hit);
        }
        self.stats.record_miss(&descriptor.provider);

        let output = match self.retry.run(call).await {
            Ok(output) => output,
            Err(e) => return (Err(e), Outcome::Failed),
        };

        let ttl = descriptor.ttl.unwrap_or(self.config.ttl);
        self.store(key, &output, descriptor, ttl).await;
        (Ok(output.value), Outcome::Miss)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<(T, f64)> {
        let entry = match self.backend.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "cache lookup failed; treating as miss");
                return None;
            }
        };
        let cost = entry.cost;
        match serde_json::from_value(entry.value) {
            Ok(value) => Some((value, cost)),
            Err(e) => {
                warn!(key, error = %e, "cached value has an unexpected shape; treating as miss");
                None
            }
        }
    }

    async fn store<T: Serialize>(
        &self,
        key: &str,
        output: &CallOutput<T>,
        descriptor: &CallDescriptor,
        ttl: u64,
    ) {
        let value = match serde_json::to_value(&output.value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "value is not serializable; not caching");
                return;
            }
        };
        let entry = CacheEntry::new(key, value, ttl, &descriptor.provider, &descriptor.model)
            .with_usage(output.token_count.unwrap_or(0), output.cost.unwrap_or(0.0));
        if let Err(e) = self.backend.set(key, entry).await {
            warn!(key, error = %e, "cache write failed; returning uncached value");
        }
    }

    fn log_outcome(&self, outcome: Outcome, key: &str, d: &CallDescriptor, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if self.config.debug {
            info!(outcome = outcome.as_str(), key, provider = %d.provider, model = %d.model, elapsed_ms, "cache");
        } else {
            debug!(outcome = outcome.as_str(), key, elapsed_ms, "cache");
        }
    }

    fn resolve_key(&self, descriptor: &CallDescriptor) -> String {
        match &descriptor.cache_key {
            Some(key) => key.clone(),
            None => self.generate_key(
                &descriptor.provider,
                &descriptor.model,
                descriptor.prompt.as_ref(),
                descriptor.params.as_ref(),
            ),
        }
    }

    /// Derive the key `wrap` would use for these inputs.
    pub fn generate_key(
        &self,
        provider: &str,
        model: &str,
        prompt: Option<&Value>,
        params: Option<&Value>,
    ) -> String {
        self.keys.generate(provider, model, prompt, params)
    }

    /// Remove every entry in the backend's namespace. Failures propagate.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.backend.delete(key).await.unwrap_or_else(|e| {
            warn!(key, error = %e, "cache delete failed");
            false
        })
    }

    pub async fn has(&self, key: &str) -> bool {
        self.backend.has(key).await.unwrap_or_else(|e| {
            warn!(key, error = %e, "cache existence check failed");
            false
        })
    }

    pub async fn get_cache_size(&self) -> usize {
        self.backend.size().await.unwrap_or_else(|e| {
            warn!(error = %e, "cache size query failed");
            0
        })
    }

    /// Delete every key matching `glob` (`*` is the only wildcard) and return the count.
    ///
    /// Linear scan over the namespace.
    pub async fn delete_by_pattern(&self, glob: &str) -> Result<usize> {
        let pattern = KeyPattern::new(glob)?;
        let keys = self.backend.keys().await.unwrap_or_else(|e| {
            warn!(pattern = glob, error = %e, "key listing failed");
            Vec::new()
        });
        let mut deleted = 0;
        for key in keys.iter().filter(|k| pattern.matches(k)) {
            if self.delete(key).await {
                deleted += 1;
            }
        }
        debug!(pattern = glob, deleted, "pattern invalidation");
        Ok(deleted)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Release backend network resources. Failures are logged, not returned.
    pub async fn disconnect(&self) {
        if let Err(e) = self.backend.disconnect().await {
            warn!(error = %e, "backend disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::NetworkedOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> CacheEngine {
        CacheEngine::new(CacheConfig::new().with_debug(true)).unwrap()
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(CallDescriptor::new("openai", "gpt-4").validate().is_ok());
        assert!(CallDescriptor::new("", "gpt-4").validate().is_err());
        assert!(CallDescriptor::new("openai", "  ").validate().is_err());
        assert!(CallDescriptor::new("openai", "gpt-4")
            .with_ttl(0)
            .validate()
            .is_err());
        assert!(CallDescriptor::new("openai", "gpt-4")
            .with_ttl(MAX_TTL_SECS)
            .validate()
            .is_ok());
        assert!(CallDescriptor::new("openai", "gpt-4")
            .with_ttl(u64::MAX / 500)
            .validate()
            .is_err());
        assert!(CallDescriptor::new("openai", "gpt-4")
            .with_cache_key("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_networked_without_options_falls_back_to_memory() {
        let cfg = CacheConfig::new().with_storage(StorageKind::Networked);
        let engine = CacheEngine::new(cfg.clone()).unwrap();
        assert_eq!(engine.backend_name(), "memory");

        let engine = CacheEngine::new(cfg.with_networked(NetworkedOptions::new(""))).unwrap();
        assert_eq!(engine.backend_name(), "memory");
    }

    #[test]
    fn test_networked_with_url_selects_networked_store() {
        let cfg = CacheConfig::new()
            .with_storage(StorageKind::Networked)
            .with_networked(NetworkedOptions::new("redis://127.0.0.1:6379"));
        assert_eq!(CacheEngine::new(cfg).unwrap().backend_name(), "networked");
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        assert!(matches!(
            CacheEngine::new(CacheConfig::new().with_ttl(0)),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            CacheEngine::new(CacheConfig::new().with_max_size(0)),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_generate_key_matches_wrap_key() {
        let e = engine();
        let d = CallDescriptor::new("openai", "gpt-4")
            .with_prompt("hi")
            .with_params(json!({"temperature": 0}));
        assert_eq!(
            e.resolve_key(&d),
            e.generate_key("openai", "gpt-4", Some(&json!("hi")), Some(&json!({"temperature": 0})))
        );
        assert_eq!(e.resolve_key(&d.with_cache_key("fixed")), "fixed");
    }

    #[tokio::test]
    async fn test_usage_metrics_are_persisted_with_entry() {
        let e = engine();
        let d = CallDescriptor::new("openai", "gpt-4").with_prompt("q");
        let key = e.resolve_key(&d);
        let v: String = e
            .wrap(
                || async { Ok(CallOutput::new("a".to_string()).with_usage(42, 0.02)) },
                d,
            )
            .await
            .unwrap();
        assert_eq!(v, "a");
        let entry = e.backend.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.token_count, 42);
        assert_eq!(entry.cost, 0.02);
        assert_eq!(entry.ttl, 3600);
        assert_eq!(entry.provider, "openai");
        assert_eq!(entry.model, "gpt-4");
    }

    #[tokio::test]
    async fn test_ttl_override_is_stored() {
        let e = engine();
        let d = CallDescriptor::new("p", "m").with_cache_key("k").with_ttl(7);
        let _: u32 = e.wrap(|| async { Ok(CallOutput::new(1u32)) }, d).await.unwrap();
        assert_eq!(e.backend.get("k").await.unwrap().unwrap().ttl, 7);
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_a_miss() {
        let e = engine();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let d = CallDescriptor::new("p", "m").with_cache_key("k");
        let _: String = e
            .wrap(|| async { Ok(CallOutput::new("text".to_string())) }, d.clone())
            .await
            .unwrap();
        let n: u32 = e
            .wrap(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(CallOutput::new(5u32))
                },
                d,
            )
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validation_error_skips_call_and_stats() {
        let e = engine();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = e
            .wrap(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(CallOutput::new(1u32))
                },
                CallDescriptor::new("", "m"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(e.stats().total_requests, 0);
        assert_eq!(e.get_cache_size().await, 0);
    }

    #[tokio::test]
    async fn test_regex_syntax_in_glob_is_literal() {
        let e = engine();
        assert_eq!(e.delete_by_pattern("(unbalanced*").await.unwrap(), 0);
    }
}

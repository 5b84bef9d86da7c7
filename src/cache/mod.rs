//! 响应缓存模块：为昂贵的模型调用提供可插拔后端的缓存引擎。
//!
//! # Response Caching Module
//!
//! Caches the results of expensive, non-idempotent remote calls (typically
//! LLM completions) behind a pluggable storage backend.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheEngine`] | Cache-or-invoke orchestration, retry, stats, invalidation |
//! | [`CacheConfig`] | Validated engine configuration |
//! | [`StorageBackend`] | Trait implemented by every backend |
//! | [`MemoryStore`] | Bounded in-process store, oldest-write eviction, lazy TTL |
//! | [`NetworkedStore`] | Key-value service store (Redis) with server-side TTL |
//! | [`CacheKeyGenerator`] | Canonical payload hashing and key layout |
//! | [`CacheStats`] | Hit/miss counts, cost saved, response time |
//!
//! ## Example
//!
//! ```rust,no_run
//! use ai_response_cache::cache::{CacheConfig, CacheEngine, CallDescriptor, CallOutput};
//!
//! # async fn run() -> ai_response_cache::Result<()> {
//! let engine = CacheEngine::new(CacheConfig::new().with_ttl(600))?;
//! let descriptor = CallDescriptor::new("openai", "gpt-4o")
//!     .with_prompt("Summarise the Rust book in one line")
//!     .with_params(serde_json::json!({"temperature": 0}));
//!
//! let answer: String = engine
//!     .wrap(
//!         || async { Ok(CallOutput::new("Ownership, everywhere.".to_string()).with_usage(12, 0.0004)) },
//!         descriptor,
//!     )
//!     .await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```
//!
//! ## Cache Keys
//!
//! Keys have the layout `{prefix}{provider}:{model}:{hash(prompt)}:{hash(params)}`,
//! so `delete_by_pattern("llm-cache:openai:*")` drops one provider's entries.

mod backend;
mod config;
mod engine;
mod entry;
mod key;
mod memory;
mod networked;
mod pattern;
mod stats;

pub use backend::StorageBackend;
pub use config::{
    CacheConfig, NetworkedOptions, StorageKind, DEFAULT_KEY_PREFIX, DEFAULT_NAMESPACE,
    MAX_TTL_SECS,
};
pub use engine::{CacheEngine, CallDescriptor, CallOutput};
pub use entry::{now_millis, CacheEntry};
pub use key::{canonical_json, canonicalize, hash_payload, CacheKeyGenerator};
pub use memory::MemoryStore;
pub use networked::{InMemoryKeyValueClient, KeyValueClient, NetworkedStore, RedisKeyValueClient};
pub use pattern::KeyPattern;
pub use stats::{CacheStats, ProviderStats, StatsTracker};

//! # ai-response-cache
//!
//! 面向大模型 API 调用的响应缓存引擎，支持内存与 Redis 后端。
//!
//! Response caching engine for expensive, non-idempotent remote calls such as
//! LLM completions.
//!
//! ## Overview
//!
//! Given a description of a call (provider, model, prompt, params) the engine
//! derives a deterministic cache key, consults a pluggable storage backend and,
//! on a miss, invokes the call with bounded retry, stores the result with a
//! time-to-live and keeps running cost/latency statistics.
//!
//! ## Key Features
//!
//! - **Deterministic keys**: payloads are canonicalised (sorted object keys) before hashing
//! - **Pluggable storage**: bounded in-memory store or Redis, behind [`cache::StorageBackend`]
//! - **Degrade, don't fail**: storage errors turn into misses or skipped writes
//! - **Retry**: three attempts with exponential backoff via [`resilience`]
//! - **Stats**: hit rate, cost saved per provider, average response time
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Engine, backends, keys, config and statistics |
//! | [`resilience`] | Retry policy for the wrapped call |
//! | [`telemetry`] | Optional tracing subscriber setup |

pub mod cache;
pub mod resilience;
pub mod telemetry;

pub use cache::{
    CacheConfig, CacheEngine, CacheEntry, CacheStats, CallDescriptor, CallOutput, StorageBackend,
    StorageKind,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{BoxError, Error, ErrorContext};

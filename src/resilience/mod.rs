//! 弹性模式模块：为被缓存的上游调用提供有界重试。
//!
//! # Resilience Primitives Module
//!
//! Bounded retry with exponential backoff, applied by the cache engine to
//! the wrapped call on every miss.
//!
//! ```rust
//! use ai_response_cache::resilience::retry::{RetryConfig, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(
//!     RetryConfig::new()
//!         .with_max_attempts(3)
//!         .with_base_delay(Duration::from_millis(200)),
//! );
//! assert_eq!(policy.backoff(1), Duration::from_millis(400));
//! ```

pub mod retry;

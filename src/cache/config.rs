//! Cache configuration.

use crate::resilience::retry::RetryConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_KEY_PREFIX: &str = "llm-cache:";
pub const DEFAULT_NAMESPACE: &str = "ai-cache:";
/// Longest accepted entry lifetime: ten years, in seconds.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    #[serde(alias = "redis")]
    Networked,
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageKind::Memory),
            "networked" | "redis" => Ok(StorageKind::Networked),
            other => Err(Error::configuration_with_context(
                format!("unrecognized storage backend '{}'", other),
                ErrorContext::new()
                    .with_field_path("storage")
                    .with_details("expected one of: memory, networked, redis")
                    .with_source("cache_config"),
            )),
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Memory => write!(f, "memory"),
            StorageKind::Networked => write!(f, "networked"),
        }
    }
}

/// Connection options for the networked backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkedOptions {
    /// Service URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Storage-level prefix prepended to every logical key.
    pub namespace: String,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub operation_timeout: Duration,
}

impl Default for NetworkedOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
        }
    }
}

impl NetworkedOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Missing or empty URL means the options are unusable.
    pub fn is_usable(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default entry lifetime in seconds.
    pub ttl: u64,
    /// Maximum entries held by the memory backend.
    pub max_size: usize,
    pub storage: StorageKind,
    pub key_prefix: String,
    pub enable_stats: bool,
    /// Verbose hit/miss logging and short retry backoff.
    pub debug: bool,
    pub networked: Option<NetworkedOptions>,
    /// Explicit retry settings; when absent, derived from `debug`.
    pub retry: Option<RetryConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: 3600,
            max_size: 1000,
            storage: StorageKind::Memory,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            enable_stats: true,
            debug: false,
            networked: None,
            retry: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = ttl_secs;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.enable_stats = enabled;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_networked(mut self, options: NetworkedOptions) -> Self {
        self.networked = Some(options);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Retry settings in effect: explicit ones, else fast under `debug`.
    pub fn retry_config(&self) -> RetryConfig {
        match &self.retry {
            Some(r) => r.clone(),
            None if self.debug => RetryConfig::fast(),
            None => RetryConfig::default(),
        }
    }

    /// Check the invariants every engine relies on.
    ///
    /// Networked connection options are not checked here: missing ones make
    /// the engine fall back to the memory backend instead of failing.
    pub fn validate(&self) -> Result<()> {
        if self.ttl == 0 {
            return Err(Error::configuration_with_context(
                "ttl must be greater than zero",
                ErrorContext::new()
                    .with_field_path("ttl")
                    .with_source("cache_config"),
            ));
        }
        if self.ttl > MAX_TTL_SECS {
            return Err(Error::configuration_with_context(
                format!("ttl must be at most {} seconds", MAX_TTL_SECS),
                ErrorContext::new()
                    .with_field_path("ttl")
                    .with_source("cache_config"),
            ));
        }
        if self.max_size == 0 {
            return Err(Error::configuration_with_context(
                "max_size must be greater than zero",
                ErrorContext::new()
                    .with_field_path("max_size")
                    .with_source("cache_config"),
            ));
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(Error::configuration_with_context(
                    "retry.max_attempts must be at least 1",
                    ErrorContext::new()
                        .with_field_path("retry.max_attempts")
                        .with_source("cache_config"),
                ));
            }
        }
        if let Some(net) = &self.networked {
            if net.is_usable() {
                url::Url::parse(&net.url).map_err(|e| {
                    Error::configuration_with_context(
                        format!("invalid networked url: {}", e),
                        ErrorContext::new()
                            .with_field_path("networked.url")
                            .with_source("cache_config"),
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Load from a YAML document. Omitted fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: CacheConfig = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build from `AI_CACHE_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("AI_CACHE_TTL_SECS") {
            cfg.ttl = parse_var("AI_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("AI_CACHE_MAX_SIZE") {
            cfg.max_size = parse_var("AI_CACHE_MAX_SIZE", &v)?;
        }
        if let Some(v) = lookup("AI_CACHE_STORAGE") {
            cfg.storage = v.parse()?;
        }
        if let Some(v) = lookup("AI_CACHE_KEY_PREFIX") {
            cfg.key_prefix = v;
        }
        if let Some(v) = lookup("AI_CACHE_ENABLE_STATS") {
            cfg.enable_stats = parse_flag("AI_CACHE_ENABLE_STATS", &v)?;
        }
        if let Some(v) = lookup("AI_CACHE_DEBUG") {
            cfg.debug = parse_flag("AI_CACHE_DEBUG", &v)?;
        }
        if let Some(url) = lookup("AI_CACHE_REDIS_URL") {
            let mut net = NetworkedOptions::new(url);
            if let Some(ns) = lookup("AI_CACHE_REDIS_NAMESPACE") {
                net = net.with_namespace(ns);
            }
            cfg.networked = Some(net);
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::configuration_with_context(
            format!("cannot parse {}", name),
            ErrorContext::new()
                .with_field_path(name)
                .with_details(format!("got '{}'", raw))
                .with_source("env"),
        )
    })
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::configuration_with_context(
            format!("cannot parse {} as a flag", name),
            ErrorContext::new()
                .with_field_path(name)
                .with_details(format!("got '{}'", raw))
                .with_source("env"),
        )),
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

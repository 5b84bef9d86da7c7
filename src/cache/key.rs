//! Cache key generation.
//!
//! Payloads are canonicalised before hashing: mapping keys are sorted,
//! sequence order is kept. Two payloads that differ only in the insertion
//! order of their object keys therefore hash identically.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively rebuild `value` with every object's keys in lexicographic order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        scalar => scalar.clone(),
    }
}

/// Serialize the canonical form of `value` to a deterministic string.
///
/// Keys are emitted in sorted order explicitly, so the output does not depend
/// on whether `serde_json` was built with `preserve_order`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&canonicalize(value), &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hash an arbitrary structured payload to a fixed-length hex digest.
pub fn hash_payload(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Composes full cache keys: `{prefix}{provider}:{model}:{hash(prompt)}:{hash(params)}`.
#[derive(Debug, Clone)]
pub struct CacheKeyGenerator {
    prefix: String,
}

impl CacheKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// A missing prompt or params payload hashes as JSON `null`.
    pub fn generate(
        &self,
        provider: &str,
        model: &str,
        prompt: Option<&Value>,
        params: Option<&Value>,
    ) -> String {
        let prompt_hash = hash_payload(prompt.unwrap_or(&Value::Null));
        let params_hash = hash_payload(params.unwrap_or(&Value::Null));
        format!(
            "{}{}:{}:{}:{}",
            self.prefix, provider, model, prompt_hash, params_hash
        )
    }
}

//! Storage backend contract.

use super::entry::CacheEntry;
use crate::Result;
use async_trait::async_trait;

/// Uniform contract for entry storage.
///
/// Every operation may fail independently; a failed `set` must leave state
/// visible to a later `get` untouched. `get` and `has` apply lazy expiry: an
/// expired entry is deleted as a side effect and reported as absent.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store or overwrite. TTL-aware backends derive physical expiry from `entry.ttl`.
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    /// Returns true iff an entry existed and was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every entry in this backend's namespace, and nothing else.
    async fn clear(&self) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Entry count in the namespace. May include expired entries not yet read.
    async fn size(&self) -> Result<usize>;

    /// Logical keys in the namespace, storage-level prefix stripped.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Release network resources. No-op by default.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

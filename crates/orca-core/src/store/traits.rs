//! Backing-service contract for the session store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Namespace, StoreEntry, StoreResult};

/// Keyed persistence with per-entry TTL metadata.
///
/// Implementations store entries verbatim and report expiry metadata back;
/// hiding expired entries is the job of [`super::SessionStore`], so a
/// backend is free to evict lazily or never. Writes to the same
/// `(namespace, key)` resolve last-write-wins.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Insert or replace an entry.
    async fn put_entry(&self, entry: StoreEntry) -> StoreResult<()>;

    /// Fetch an entry regardless of its expiry.
    async fn get_entry(&self, namespace: Namespace, key: &str) -> StoreResult<Option<StoreEntry>>;

    /// Remove an entry. Removing a missing entry succeeds.
    async fn delete_entry(&self, namespace: Namespace, key: &str) -> StoreResult<()>;

    /// Physically evict entries expired at `now`. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Check connectivity.
    async fn ping(&self) -> StoreResult<()>;

    /// Release the connection. Later calls fail with `StoreError::Closed`.
    async fn close(&self) -> StoreResult<()>;
}

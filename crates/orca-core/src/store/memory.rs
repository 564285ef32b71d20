//! In-process backing service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Namespace, StoreBackend, StoreEntry, StoreResult};
use crate::error::StoreError;

/// Map-backed store.
///
/// The availability switch simulates a connectivity loss so callers can
/// exercise their recoverable-error paths.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<(Namespace, String), StoreEntry>>,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated connectivity.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of physically present entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory backend offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn put_entry(&self, entry: StoreEntry) -> StoreResult<()> {
        self.check()?;
        let key = (entry.namespace, entry.key.clone());
        self.entries.write().insert(key, entry);
        Ok(())
    }

    async fn get_entry(&self, namespace: Namespace, key: &str) -> StoreResult<Option<StoreEntry>> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .get(&(namespace, key.to_string()))
            .cloned())
    }

    async fn delete_entry(&self, namespace: Namespace, key: &str) -> StoreResult<()> {
        self.check()?;
        self.entries.write().remove(&(namespace, key.to_string()));
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.check()?;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.write().clear();
        Ok(())
    }
}

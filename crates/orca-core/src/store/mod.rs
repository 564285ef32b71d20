//! Namespaced, TTL-aware session store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SessionStore                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │  session    │  │  profile    │  │       pattern           │ │
//! │  │ TTL: 7 days │  │ TTL: 0      │  │ store-generated keys    │ │
//! │  │             │  │ (no expiry) │  │ TTL: 24h                │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! │         │                │                    │                │
//! │         └────────────────┴────────────────────┘                │
//! │                          │   lazy expiry via Clock             │
//! │                    StoreBackend                                │
//! │            (MemoryBackend | SqliteBackend)                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## TTL convention
//!
//! A TTL of zero seconds means "never expires" everywhere in this crate.
//! Use [`Ttl::Immediate`] to write an entry that is already expired.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;

#[cfg(feature = "sqlite")]
pub mod migrations;

pub use memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use traits::StoreBackend;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::{ConsentRecord, SessionRecord, SubjectSnapshot};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-space partitions of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Session records.
    Session,
    /// Long-lived subject snapshots and consent.
    Profile,
    /// Derived, ephemeral data under store-generated keys.
    Pattern,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Session, Namespace::Profile, Namespace::Pattern];

    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Session => "session",
            Namespace::Profile => "profile",
            Namespace::Pattern => "pattern",
        }
    }

}

impl FromStr for Namespace {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Namespace::Session),
            "profile" => Ok(Namespace::Profile),
            "pattern" => Ok(Namespace::Pattern),
            other => Err(StoreError::Backend(format!("unknown namespace '{}'", other))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-to-live of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ttl {
    /// Never expires. Wire value 0.
    Never,
    /// Expires the given number of seconds after the write.
    Seconds(u64),
    /// Expired as soon as it is written.
    Immediate,
}

impl Ttl {
    /// Interpret a seconds value, where 0 means no expiry.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 { Ttl::Never } else { Ttl::Seconds(secs) }
    }

    /// Persisted form: 0 = never, -1 = immediate, otherwise seconds.
    pub fn to_wire(self) -> i64 {
        match self {
            Ttl::Never => 0,
            Ttl::Seconds(secs) => i64::try_from(secs).unwrap_or(i64::MAX),
            Ttl::Immediate => -1,
        }
    }

    pub fn from_wire(value: i64) -> Self {
        match value {
            0 => Ttl::Never,
            v if v < 0 => Ttl::Immediate,
            v => Ttl::Seconds(v as u64),
        }
    }

    /// Absolute expiry for an entry written at `written_at`.
    pub fn expires_at(self, written_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Ttl::Never => None,
            Ttl::Seconds(secs) => {
                let secs = i64::try_from(secs).unwrap_or(i64::MAX);
                Some(
                    Duration::try_seconds(secs)
                        .and_then(|d| written_at.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                )
            }
            Ttl::Immediate => Some(written_at),
        }
    }

    /// TTL that lands on `expires_at` when written at `now`.
    pub fn until(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match expires_at {
            None => Ttl::Never,
            Some(at) => {
                let remaining = (at - now).num_seconds();
                if remaining <= 0 {
                    Ttl::Immediate
                } else {
                    Ttl::Seconds(remaining as u64)
                }
            }
        }
    }
}

/// A stored value with its expiry metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub namespace: Namespace,
    pub key: String,
    pub value: Value,
    pub ttl: Ttl,
    pub written_at: DateTime<Utc>,
}

impl StoreEntry {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl.expires_at(self.written_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

/// Explicitly constructed store handle shared by the coordinator and the
/// drain controller.
pub struct SessionStore {
    backend: Arc<dyn StoreBackend>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl SessionStore {
    /// Create a store over `backend` using the system clock.
    pub fn new(backend: Arc<dyn StoreBackend>, config: StoreConfig) -> Self {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        backend: Arc<dyn StoreBackend>,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            clock,
            config,
        }
    }

    /// In-process store for tests and single-node runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Configured TTL for a namespace.
    pub fn default_ttl(&self, namespace: Namespace) -> Ttl {
        match namespace {
            Namespace::Session => Ttl::from_secs(self.config.session_ttl_secs),
            Namespace::Profile => Ttl::from_secs(self.config.profile_ttl_secs),
            Namespace::Pattern => Ttl::from_secs(self.config.pattern_ttl_secs),
        }
    }

    /// Write `value` under a caller-supplied key.
    ///
    /// The pattern namespace only accepts keys generated by
    /// [`SessionStore::record_pattern`].
    pub async fn put(&self, namespace: Namespace, key: &str, value: Value, ttl: Ttl) -> StoreResult<()> {
        if namespace == Namespace::Pattern {
            return Err(StoreError::CallerKeyInPatternNamespace(key.to_string()));
        }
        self.write(namespace, key.to_string(), value, ttl).await
    }

    /// Read a value. Expired entries read as absent whether or not they have
    /// been evicted.
    pub async fn get(&self, namespace: Namespace, key: &str) -> StoreResult<Option<Value>> {
        let Some(entry) = self.backend.get_entry(namespace, key).await? else {
            return Ok(None);
        };

        // Expired entries are left in place: deleting here could race a newer write.
        if entry.is_expired(self.clock.now()) {
            debug!(namespace = %namespace, key = %key, "Expired entry read as absent");
            return Ok(None);
        }

        Ok(Some(entry.value))
    }

    pub async fn delete(&self, namespace: Namespace, key: &str) -> StoreResult<()> {
        self.backend.delete_entry(namespace, key).await
    }

    /// Store derived data under a fresh key and return that key.
    pub async fn record_pattern(&self, value: Value, ttl: Option<Ttl>) -> StoreResult<String> {
        let key = uuid::Uuid::new_v4().to_string();
        let ttl = ttl.unwrap_or_else(|| self.default_ttl(Namespace::Pattern));
        self.write(Namespace::Pattern, key.clone(), value, ttl).await?;
        Ok(key)
    }

    /// Serialize and write a typed value.
    pub async fn put_json<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Ttl,
    ) -> StoreResult<()> {
        self.put(namespace, key, serde_json::to_value(value)?, ttl).await
    }

    /// Read and deserialize a typed value.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.get(namespace, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Typed helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a session record so that it expires at `record.expires_at`.
    pub async fn save_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let ttl = Ttl::until(record.expires_at, self.clock.now());
        self.put_json(Namespace::Session, &record.session_id, record, ttl)
            .await
    }

    pub async fn load_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        self.get_json(Namespace::Session, session_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        self.delete(Namespace::Session, session_id).await
    }

    pub async fn save_profile(&self, snapshot: &SubjectSnapshot) -> StoreResult<()> {
        let ttl = self.default_ttl(Namespace::Profile);
        self.put_json(Namespace::Profile, &snapshot_key(&snapshot.subject_id), snapshot, ttl)
            .await
    }

    pub async fn load_profile(&self, subject_id: &str) -> StoreResult<Option<SubjectSnapshot>> {
        self.get_json(Namespace::Profile, &snapshot_key(subject_id))
            .await
    }

    pub async fn save_consent(&self, consent: &ConsentRecord) -> StoreResult<()> {
        let ttl = self.default_ttl(Namespace::Profile);
        self.put_json(Namespace::Profile, &consent_key(&consent.subject_id), consent, ttl)
            .await
    }

    pub async fn load_consent(&self, subject_id: &str) -> StoreResult<Option<ConsentRecord>> {
        self.get_json(Namespace::Profile, &consent_key(subject_id))
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Physically evict expired entries. Never required for correctness.
    pub async fn purge_expired(&self) -> StoreResult<usize> {
        let purged = self.backend.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            debug!(purged, "Purged expired store entries");
        }
        Ok(purged)
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.backend.ping().await
    }

    /// Release the backing connection.
    pub async fn close(&self) -> StoreResult<()> {
        self.backend.close().await
    }

    async fn write(&self, namespace: Namespace, key: String, value: Value, ttl: Ttl) -> StoreResult<()> {
        self.backend
            .put_entry(StoreEntry {
                namespace,
                key,
                value,
                ttl,
                written_at: self.clock.now(),
            })
            .await
    }
}

fn snapshot_key(subject_id: &str) -> String {
    format!("snapshot/{}", subject_id)
}

fn consent_key(subject_id: &str) -> String {
    format!("consent/{}", subject_id)
}

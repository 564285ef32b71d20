//! SQLite backing service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

use super::{Namespace, StoreBackend, StoreEntry, StoreResult, Ttl, migrations};
use crate::error::StoreError;

/// Database-backed store.
///
/// One long-lived connection. Statements run on the blocking pool so a
/// busy database never stalls a runtime worker. `close` takes the
/// connection out; every later call reports `StoreError::Closed`.
pub struct SqliteBackend {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteBackend {
    /// Open (or create) a database file and run migrations.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for concurrent readers across processes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<T> {
            let guard = conn.lock();
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            Ok(f(conn)?)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {}", e)))?
    }

    fn map_entry(
        namespace: Namespace,
        key: &str,
        value_json: String,
        ttl_seconds: i64,
        written_at: i64,
    ) -> StoreResult<StoreEntry> {
        let value = serde_json::from_str(&value_json)?;
        let written_at = DateTime::<Utc>::from_timestamp_millis(written_at).ok_or_else(|| {
            StoreError::Backend(format!("invalid written_at for {}/{}", namespace, key))
        })?;

        Ok(StoreEntry {
            namespace,
            key: key.to_string(),
            value,
            ttl: Ttl::from_wire(ttl_seconds),
            written_at,
        })
    }
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    async fn put_entry(&self, entry: StoreEntry) -> StoreResult<()> {
        let value_json = serde_json::to_string(&entry.value)?;
        let expires_at = entry.expires_at().map(|at| at.timestamp_millis());

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO store_entries (namespace, key, value_json, ttl_seconds, written_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(namespace, key) DO UPDATE SET
                    value_json = excluded.value_json,
                    ttl_seconds = excluded.ttl_seconds,
                    written_at = excluded.written_at,
                    expires_at = excluded.expires_at",
                params![
                    entry.namespace.as_str(),
                    &entry.key,
                    value_json,
                    entry.ttl.to_wire(),
                    entry.written_at.timestamp_millis(),
                    expires_at,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_entry(&self, namespace: Namespace, key: &str) -> StoreResult<Option<StoreEntry>> {
        let owned_key = key.to_string();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT value_json, ttl_seconds, written_at
                     FROM store_entries WHERE namespace = ?1 AND key = ?2",
                    params![namespace.as_str(), owned_key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        row.map(|(value_json, ttl_seconds, written_at)| {
            Self::map_entry(namespace, key, value_json, ttl_seconds, written_at)
        })
        .transpose()
    }

    async fn delete_entry(&self, namespace: Namespace, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM store_entries WHERE namespace = ?1 AND key = ?2",
                params![namespace.as_str(), key],
            )
            .map(|_| ())
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM store_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now.timestamp_millis()],
            )
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.with_conn(|conn| conn.execute_batch("SELECT 1")).await
    }

    async fn close(&self) -> StoreResult<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let taken = conn.lock().take();
            match taken {
                Some(conn) => conn.close().map_err(|(_, e)| StoreError::from(e)),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {}", e)))?
    }
}

//! Session store database migrations
//!
//! SQL migrations are embedded as strings and executed when the SQLite
//! backing service is opened.

use rusqlite::Connection;

use crate::store::StoreResult;

/// Store entry table SQL (001)
pub const STORE_ENTRIES_SQL: &str = include_str!("001_store_entries.sql");

/// Run all store migrations
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(STORE_ENTRIES_SQL)?;
    Ok(())
}

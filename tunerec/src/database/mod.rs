//! Database module for recording state storage.
//!
//! This module provides SQLite-based persistent storage for:
//! - Recorded programs and their output files
//! - Recording rules (search predicate + output options)
//! - The EPG snapshot backing the program store contract

mod epg_store;
mod models;
mod programs;
mod recorded;
mod rules;
mod schema;

pub use epg_store::DatabaseEpgStore;
pub use models::*;

use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;
use thiserror::Error;

/// Database error types.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Recorded program not found: id={0}")]
    RecordedNotFound(i64),

    #[error("Rule not found: id={0}")]
    RuleNotFound(i64),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Main database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable foreign keys
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self { conn };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self { conn };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Initialize the database schema.
    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA_SQL)?;
        self.apply_migrations()?;
        Ok(())
    }

    /// Add a column to a table if it doesn't exist.
    fn add_column_if_not_exists(
        &self,
        table: &str,
        column: &str,
        column_type: &str,
    ) -> Result<()> {
        // Check if column exists using PRAGMA table_info
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let column_exists = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .any(|name| name == column);

        if !column_exists {
            let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type);
            self.conn.execute(&sql, [])?;
            log::info!("Migration: Added column {} to table {}", column, table);
        }

        Ok(())
    }

    /// Apply pending migrations.
    fn apply_migrations(&self) -> Result<()> {
        // Migration 001: rule_id on recorded was added after the initial
        // release. SQLite has no IF NOT EXISTS for ALTER TABLE, so check
        // and add individually.
        self.add_column_if_not_exists("recorded", "rule_id", "INTEGER")?;

        // Migration 002: free-to-air flag on the EPG snapshot.
        self.add_column_if_not_exists("programs", "is_free", "INTEGER NOT NULL DEFAULT 1")?;

        Ok(())
    }

    /// Get the underlying connection (for advanced queries).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin a transaction.
    pub fn transaction(&mut self) -> SqliteResult<rusqlite::Transaction<'_>> {
        self.conn.transaction()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

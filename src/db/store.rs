//! SQLite store: connection, schema and shared helpers.

use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("{0} not found")]
    NotFound(String),
}

/// Persistent state for ports, nodes, users, history and traffic.
pub struct Store {
    pub(super) pool: Pool<Sqlite>,
}

impl Store {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(sqlx::Error::Configuration(
                    format!("Failed to create database directory {}: {}", parent.display(), e).into(),
                ))
            })?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!(path = %db_path.display(), "Database ready");

        Ok(store)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS port_allocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                port INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                purpose TEXT NOT NULL,
                status TEXT NOT NULL,
                allocated_at TEXT NOT NULL,
                released_at TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_port_allocations_active
                ON port_allocations(port) WHERE status = 'allocated';
            CREATE INDEX IF NOT EXISTS idx_port_allocations_node ON port_allocations(node_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                protocol TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                params TEXT NOT NULL,
                rate REAL NOT NULL DEFAULT 1,
                group_ids TEXT NOT NULL DEFAULT '[]',
                agent_url TEXT,
                agent_token TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT UNIQUE NOT NULL,
                token_hash TEXT UNIQUE NOT NULL,
                group_id INTEGER,
                transfer_enable INTEGER NOT NULL DEFAULT 0,
                u INTEGER NOT NULL DEFAULT 0,
                d INTEGER NOT NULL DEFAULT 0,
                banned BOOLEAN NOT NULL DEFAULT FALSE,
                expired_at TEXT,
                speed_limit INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_users_group ON users(group_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                old_config TEXT,
                new_config TEXT,
                success BOOLEAN NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_config_history_node ON config_history(node_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traffic_staging (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                record_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stat_user (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                server_rate REAL NOT NULL,
                record_at TEXT NOT NULL,
                u INTEGER NOT NULL DEFAULT 0,
                d INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, server_rate, record_at)
            );

            CREATE TABLE IF NOT EXISTS stat_server (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                record_at TEXT NOT NULL,
                u INTEGER NOT NULL DEFAULT 0,
                d INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE(node_id, record_at)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                node_id INTEGER,
                port INTEGER,
                details TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Audit logging

    pub(super) async fn audit(
        &self,
        action: &str,
        node_id: Option<i64>,
        port: Option<u16>,
        details: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log (timestamp, action, node_id, port, details) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(timestamp(Utc::now()))
        .bind(action)
        .bind(node_id)
        .bind(port.map(i64::from))
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// Helper functions

/// Fixed-width RFC 3339 so stored timestamps compare lexically.
pub(super) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(super) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(super) fn parse_optional_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

pub(super) fn parse_day(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("bad record date '{}': {}", value, e)))
}

pub(super) fn port_from_row(value: i64) -> Result<u16, StoreError> {
    u16::try_from(value).map_err(|_| StoreError::Corrupt(format!("port {} out of range", value)))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Store;
    use tempfile::TempDir;

    /// Fresh store in a temporary directory. Keep the `TempDir` alive.
    pub async fn temp_store() -> (Store, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(&dir.path().join("nodeplane.db")).await.unwrap();
        (store, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let text = timestamp(now);
        assert!(text.ends_with('Z'));
        let parsed = parse_timestamp(&text);
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc);
        assert!(timestamp(earlier) < timestamp(later));
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.sqlite");
        let first = Store::new(&path).await.unwrap();
        first.audit("open", None, None, "{}").await.unwrap();
        drop(first);
        let second = Store::new(&path).await.unwrap();
        second.audit("reopen", Some(1), Some(10000), "{}").await.unwrap();
    }
}

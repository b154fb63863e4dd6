//! Port allocation rows.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::info;

use super::models::{PortAllocation, PortPurpose, PortStatus, PortUsageStats};
use super::store::{parse_optional_timestamp, parse_timestamp, port_from_row, timestamp, Store, StoreError};

impl Store {
    /// Insert an active allocation. Fails if the port already has one.
    pub async fn insert_port_allocation(&self, allocation: &PortAllocation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO port_allocations (port, node_id, purpose, status, allocated_at)
            VALUES (?, ?, ?, 'allocated', ?)
            "#,
        )
        .bind(i64::from(allocation.port))
        .bind(allocation.node_id)
        .bind(allocation.purpose.as_str())
        .bind(timestamp(allocation.allocated_at))
        .execute(&self.pool)
        .await?;

        let details = serde_json::json!({ "purpose": allocation.purpose }).to_string();
        self.audit("port_allocate", Some(allocation.node_id), Some(allocation.port), &details)
            .await?;

        Ok(())
    }

    /// Mark the active allocation for `port` released. Returns whether a row changed.
    pub async fn release_port_allocation(&self, port: u16, released_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE port_allocations SET status = 'released', released_at = ? WHERE port = ? AND status = 'allocated'",
        )
        .bind(timestamp(released_at))
        .bind(i64::from(port))
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() > 0;
        if released {
            self.audit("port_release", None, Some(port), "{}").await?;
        }
        Ok(released)
    }

    /// Move an active allocation to another node.
    pub async fn reassign_port_allocation(&self, port: u16, node_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE port_allocations SET node_id = ? WHERE port = ? AND status = 'allocated'",
        )
        .bind(node_id)
        .bind(i64::from(port))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn active_port_allocations(&self) -> Result<Vec<PortAllocation>, StoreError> {
        let rows = sqlx::query("SELECT * FROM port_allocations WHERE status = 'allocated' ORDER BY port")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_allocation).collect()
    }

    /// Most recent records for a port, newest first.
    pub async fn port_history(&self, port: u16, limit: i64) -> Result<Vec<PortAllocation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM port_allocations WHERE port = ? ORDER BY allocated_at DESC, id DESC LIMIT ?",
        )
        .bind(i64::from(port))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_allocation).collect()
    }

    pub async fn node_port_history(&self, node_id: i64, limit: i64) -> Result<Vec<PortAllocation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM port_allocations WHERE node_id = ? ORDER BY allocated_at DESC, id DESC LIMIT ?",
        )
        .bind(node_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_allocation).collect()
    }

    /// Delete released rows older than `before`. Returns the number removed.
    pub async fn cleanup_released_ports(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM port_allocations WHERE status = 'released' AND released_at < ?",
        )
        .bind(timestamp(before))
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "Cleaned up released port records");
        }
        Ok(removed)
    }

    pub async fn port_usage_stats(&self) -> Result<PortUsageStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM port_allocations GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = PortUsageStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match status.parse::<PortStatus>() {
                Ok(PortStatus::Allocated) => stats.allocated = count,
                Ok(PortStatus::Released) => stats.released = count,
                Err(_) => {}
            }
        }

        let nodes: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT node_id) FROM port_allocations WHERE status = 'allocated' AND node_id > 0",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.nodes = nodes;

        Ok(stats)
    }
}

fn row_to_allocation(row: &sqlx::sqlite::SqliteRow) -> Result<PortAllocation, StoreError> {
    let purpose: String = row.get("purpose");
    let status: String = row.get("status");
    let allocated_at: String = row.get("allocated_at");

    Ok(PortAllocation {
        port: port_from_row(row.get("port"))?,
        node_id: row.get("node_id"),
        purpose: purpose.parse::<PortPurpose>().map_err(StoreError::Corrupt)?,
        status: status.parse::<PortStatus>().map_err(StoreError::Corrupt)?,
        allocated_at: parse_timestamp(&allocated_at),
        released_at: parse_optional_timestamp(row.get("released_at")),
    })
}

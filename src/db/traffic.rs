//! Traffic staging and daily aggregates.
//!
//! Drained counters are first written to `traffic_staging`; a single
//! transaction then applies them to users and daily stats and deletes the
//! staged row. A crash in between leaves the batch to be replayed.

use chrono::{NaiveDate, Utc};
use sqlx::Row;
use tracing::{debug, info};

use super::models::{CommitSummary, TrafficBatch, TrafficPayload, UserDailyStat};
use super::store::{parse_day, parse_timestamp, timestamp, Store, StoreError};

impl Store {
    /// Persist a drained batch before it is applied. Returns the staging id.
    pub async fn stage_traffic(
        &self,
        node_id: i64,
        record_at: NaiveDate,
        payload: &TrafficPayload,
    ) -> Result<i64, StoreError> {
        let body = serde_json::to_string(payload)?;
        let result = sqlx::query(
            "INSERT INTO traffic_staging (node_id, record_at, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(node_id)
        .bind(record_at.format("%Y-%m-%d").to_string())
        .bind(body.as_str())
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Staged batches for a node, oldest first.
    pub async fn staged_traffic(&self, node_id: i64) -> Result<Vec<TrafficBatch>, StoreError> {
        let rows = sqlx::query("SELECT * FROM traffic_staging WHERE node_id = ? ORDER BY id")
            .bind(node_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let record_at: String = row.get("record_at");
                let payload: String = row.get("payload");
                let created_at: String = row.get("created_at");
                Ok(TrafficBatch {
                    id: row.get("id"),
                    node_id: row.get("node_id"),
                    record_at: parse_day(&record_at)?,
                    payload: serde_json::from_str(&payload)?,
                    created_at: parse_timestamp(&created_at),
                })
            })
            .collect()
    }

    /// Apply a staged batch atomically and remove it from staging.
    ///
    /// Users that no longer exist are skipped. A batch that is no longer staged
    /// (already committed) is a no-op.
    pub async fn commit_traffic(&self, batch: &TrafficBatch) -> Result<CommitSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = CommitSummary::default();
        let day = batch.record_at.format("%Y-%m-%d").to_string();
        let now = timestamp(Utc::now());

        let staged = sqlx::query("DELETE FROM traffic_staging WHERE id = ?")
            .bind(batch.id)
            .execute(&mut *tx)
            .await?;
        if staged.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(batch_id = batch.id, "Traffic batch already committed");
            return Ok(summary);
        }

        for entry in &batch.payload.users {
            if entry.upload == 0 && entry.download == 0 {
                continue;
            }
            let user_id: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE uuid = ?")
                .bind(entry.uuid.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            let Some(user_id) = user_id else {
                summary.users_skipped += 1;
                continue;
            };

            sqlx::query("UPDATE users SET u = u + ?, d = d + ? WHERE id = ?")
                .bind(entry.upload)
                .bind(entry.download)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO stat_user (user_id, server_rate, record_at, u, d, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id, server_rate, record_at)
                DO UPDATE SET u = u + excluded.u, d = d + excluded.d, updated_at = excluded.updated_at
                "#,
            )
            .bind(user_id)
            .bind(batch.payload.rate)
            .bind(day.as_str())
            .bind(entry.upload)
            .bind(entry.download)
            .bind(now.as_str())
            .execute(&mut *tx)
            .await?;

            summary.users_updated += 1;
        }

        if batch.payload.upload > 0 || batch.payload.download > 0 {
            sqlx::query(
                r#"
                INSERT INTO stat_server (node_id, protocol, record_at, u, d, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(node_id, record_at)
                DO UPDATE SET u = u + excluded.u, d = d + excluded.d, updated_at = excluded.updated_at
                "#,
            )
            .bind(batch.node_id)
            .bind(batch.payload.protocol.as_str())
            .bind(day.as_str())
            .bind(batch.payload.upload)
            .bind(batch.payload.download)
            .bind(now.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        summary.upload = batch.payload.upload;
        summary.download = batch.payload.download;

        info!(
            node_id = batch.node_id,
            users = summary.users_updated,
            skipped = summary.users_skipped,
            upload = summary.upload,
            download = summary.download,
            "Committed traffic batch"
        );
        Ok(summary)
    }

    pub async fn user_daily_stats(&self, user_id: i64) -> Result<Vec<UserDailyStat>, StoreError> {
        let rows = sqlx::query("SELECT * FROM stat_user WHERE user_id = ? ORDER BY record_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let record_at: String = row.get("record_at");
                Ok(UserDailyStat {
                    user_id: row.get("user_id"),
                    server_rate: row.get("server_rate"),
                    record_at: parse_day(&record_at)?,
                    u: row.get("u"),
                    d: row.get("d"),
                })
            })
            .collect()
    }

    /// Upload and download totals recorded for a node on `day`.
    pub async fn server_daily_total(&self, node_id: i64, day: NaiveDate) -> Result<(i64, i64), StoreError> {
        let row = sqlx::query("SELECT u, d FROM stat_server WHERE node_id = ? AND record_at = ?")
            .bind(node_id)
            .bind(day.format("%Y-%m-%d").to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| (r.get("u"), r.get("d"))).unwrap_or((0, 0)))
    }
}

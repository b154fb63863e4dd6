//! Node rows and configuration history.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::Row;

use super::models::{normalize_rate, ConfigHistory, HistoryAction, NewNode, Node};
use super::store::{parse_timestamp, port_from_row, timestamp, Store, StoreError};
use crate::protocol::ProtocolParams;

impl Store {
    pub async fn insert_node(&self, node: &NewNode) -> Result<Node, StoreError> {
        let now = Utc::now();
        let params = serde_json::to_string(&node.params.to_canonical()?)?;
        let group_ids = serde_json::to_string(&node.group_ids)?;
        let rate = normalize_rate(node.rate);

        let result = sqlx::query(
            r#"
            INSERT INTO nodes (name, protocol, host, port, params, rate, group_ids, agent_url, agent_token, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(node.name.as_str())
        .bind(node.params.protocol())
        .bind(node.host.as_str())
        .bind(i64::from(node.port))
        .bind(params.as_str())
        .bind(rate)
        .bind(group_ids.as_str())
        .bind(node.agent_url.as_deref())
        .bind(node.agent_token.as_deref())
        .bind(timestamp(now))
        .bind(timestamp(now))
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        let details = serde_json::json!({ "name": node.name, "protocol": node.params.protocol() }).to_string();
        self.audit("node_create", Some(id), None, &details).await?;

        Ok(Node {
            id,
            name: node.name.clone(),
            protocol: node.params.protocol().to_string(),
            host: node.host.clone(),
            port: node.port,
            params: node.params.clone(),
            rate,
            group_ids: node.group_ids.clone(),
            agent_url: node.agent_url.clone(),
            agent_token: node.agent_token.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Persist every mutable field of `node`.
    pub async fn update_node(&self, node: &Node) -> Result<(), StoreError> {
        let params = serde_json::to_string(&node.params.to_canonical()?)?;
        let group_ids = serde_json::to_string(&node.group_ids)?;

        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET name = ?, protocol = ?, host = ?, port = ?, params = ?, rate = ?, group_ids = ?,
                agent_url = ?, agent_token = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(node.name.as_str())
        .bind(node.params.protocol())
        .bind(node.host.as_str())
        .bind(i64::from(node.port))
        .bind(params.as_str())
        .bind(normalize_rate(node.rate))
        .bind(group_ids.as_str())
        .bind(node.agent_url.as_deref())
        .bind(node.agent_token.as_deref())
        .bind(timestamp(node.updated_at))
        .bind(node.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("node {}", node.id)));
        }
        self.audit("node_update", Some(node.id), None, "{}").await?;
        Ok(())
    }

    pub async fn delete_node(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.audit("node_delete", Some(id), None, "{}").await?;
        }
        Ok(deleted)
    }

    pub async fn get_node(&self, id: i64) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_node).transpose()
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_node).collect()
    }

    // Configuration history

    pub async fn append_history(
        &self,
        node_id: i64,
        action: HistoryAction,
        old_config: Option<&str>,
        new_config: Option<&str>,
        error: Option<&str>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO config_history (node_id, action, old_config, new_config, success, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(node_id)
        .bind(action.as_str())
        .bind(old_config)
        .bind(new_config)
        .bind(error.is_none())
        .bind(error)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Newest entries first.
    pub async fn config_history(&self, node_id: i64, limit: i64) -> Result<Vec<ConfigHistory>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM config_history WHERE node_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(node_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let action: String = row.get("action");
                let created_at: String = row.get("created_at");
                Ok(ConfigHistory {
                    id: row.get("id"),
                    node_id: row.get("node_id"),
                    action: action.parse().map_err(StoreError::Corrupt)?,
                    old_config: row.get("old_config"),
                    new_config: row.get("new_config"),
                    success: row.get("success"),
                    error: row.get("error"),
                    created_at: parse_timestamp(&created_at),
                })
            })
            .collect()
    }
}

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> Result<Node, StoreError> {
    let id: i64 = row.get("id");
    let protocol: String = row.get("protocol");
    let params: String = row.get("params");
    let group_ids: String = row.get("group_ids");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let params: Map<String, Value> = serde_json::from_str(&params)?;
    let params = ProtocolParams::from_canonical(&protocol, &params)
        .map_err(|e| StoreError::Corrupt(format!("node {}: {}", id, e)))?;

    Ok(Node {
        id,
        name: row.get("name"),
        protocol,
        host: row.get("host"),
        port: port_from_row(row.get("port"))?,
        params,
        rate: row.get("rate"),
        group_ids: serde_json::from_str(&group_ids)?,
        agent_url: row.get("agent_url"),
        agent_token: row.get("agent_token"),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

//! Subscriber rows and subscription tokens.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::info;

use super::models::{NewUser, User};
use super::store::{parse_optional_timestamp, parse_timestamp, timestamp, Store, StoreError};

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new random token.
pub fn generate_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl Store {
    /// Create a user. Returns the plaintext subscription token and the user.
    pub async fn create_user(&self, new: &NewUser) -> Result<(String, User), StoreError> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let uuid = new
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO users (uuid, token_hash, group_id, transfer_enable, expired_at, speed_limit, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid.as_str())
        .bind(token_hash.as_str())
        .bind(new.group_id)
        .bind(new.transfer_enable)
        .bind(new.expired_at.map(timestamp))
        .bind(new.speed_limit)
        .bind(timestamp(now))
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(user_id = id, uuid = %uuid, "Created user");

        let user = User {
            id,
            uuid,
            token_hash,
            group_id: new.group_id,
            transfer_enable: new.transfer_enable,
            u: 0,
            d: 0,
            banned: false,
            expired_at: new.expired_at,
            speed_limit: new.speed_limit,
            created_at: now,
        };
        Ok((token, user))
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_user))
    }

    /// Look up the owner of a plaintext subscription token.
    pub async fn get_user_by_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE token_hash = ?")
            .bind(hash_token(token))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_user))
    }

    pub async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_user).collect())
    }

    /// Users whose group is one of `group_ids`.
    pub async fn users_in_groups(&self, group_ids: &[i64]) -> Result<Vec<User>, StoreError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; group_ids.len()].join(", ");
        let sql = format!("SELECT * FROM users WHERE group_id IN ({}) ORDER BY id", placeholders);
        let mut query = sqlx::query(&sql);
        for id in group_ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows.iter().map(row_to_user).collect())
    }

    pub async fn set_user_banned(&self, id: i64, banned: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET banned = ? WHERE id = ?")
            .bind(banned)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> User {
    let created_at: String = row.get("created_at");

    User {
        id: row.get("id"),
        uuid: row.get("uuid"),
        token_hash: row.get("token_hash"),
        group_id: row.get("group_id"),
        transfer_enable: row.get("transfer_enable"),
        u: row.get("u"),
        d: row.get("d"),
        banned: row.get("banned"),
        expired_at: parse_optional_timestamp(row.get("expired_at")),
        speed_limit: row.get("speed_limit"),
        created_at: parse_timestamp(&created_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::testing::temp_store;

    #[test]
    fn test_hash_token() {
        let hash = hash_token("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("abc"));
        assert_ne!(generate_token(), generate_token());
    }

    #[tokio::test]
    async fn test_token_lookup() {
        let (store, _dir) = temp_store().await;
        let (token, user) = store
            .create_user(&NewUser {
                group_id: Some(1),
                transfer_enable: 1 << 30,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(crate::protocol::is_uuid(&user.uuid));

        let found = store.get_user_by_token(&token).await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(store.get_user_by_token("wrong").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_users_in_groups() {
        let (store, _dir) = temp_store().await;
        for group in [Some(1), Some(2), None, Some(1)] {
            store
                .create_user(&NewUser {
                    group_id: group,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        assert_eq!(store.users_in_groups(&[1]).await.unwrap().len(), 2);
        assert_eq!(store.users_in_groups(&[1, 2]).await.unwrap().len(), 3);
        assert!(store.users_in_groups(&[]).await.unwrap().is_empty());
        assert_eq!(store.list_users().await.unwrap().len(), 4);

        assert!(store.set_user_banned(1, true).await.unwrap());
        assert!(store.get_user(1).await.unwrap().unwrap().banned);
    }
}

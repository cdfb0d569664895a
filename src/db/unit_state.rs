use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{Pool, Sqlite};

/// Key/JSON rows holding the unit's local state
pub struct UnitStateRepo;

impl UnitStateRepo {
    pub async fn get<T: DeserializeOwned>(pool: &Pool<Sqlite>, key: &str) -> Result<Option<T>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM unit_state WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
        match row {
            Some((data,)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(pool: &Pool<Sqlite>, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO unit_state (key, data) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(&data)
        .execute(pool)
        .await?;
        Ok(())
    }
}

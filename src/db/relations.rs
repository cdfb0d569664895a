use anyhow::Result;
use sqlx::{Pool, Row, Sqlite};

use crate::relation::{PeerStore, Relation, Relations};

/// Relation database operations
pub struct RelationRepo;

impl RelationRepo {
    /// Load every registered relation with the data of all its units
    pub async fn load(pool: &Pool<Sqlite>, relations: &mut Relations) -> Result<()> {
        let local_unit = relations.peer.local_unit().to_string();

        let rows = sqlx::query("SELECT id, endpoint, remote_app FROM relations ORDER BY id")
            .fetch_all(pool)
            .await?;

        for row in rows {
            let id: i64 = row.get("id");
            let mut relation = Relation::new(id, row.get::<String, _>("endpoint"), local_unit.as_str());
            relation.remote_app = row.get("remote_app");

            let units: Vec<(String,)> =
                sqlx::query_as("SELECT unit FROM relation_units WHERE relation_id = ? ORDER BY unit")
                    .bind(id)
                    .fetch_all(pool)
                    .await?;
            for (unit,) in units {
                relation.add_unit(unit);
            }

            let data: Vec<(String, String, String)> =
                sqlx::query_as("SELECT unit, key, value FROM relation_data WHERE relation_id = ?")
                    .bind(id)
                    .fetch_all(pool)
                    .await?;
            for (unit, key, value) in data {
                relation.set_unit_data(&unit, &key, &value);
            }

            relations.insert(relation);
        }
        Ok(())
    }

    /// Write back the local unit's databags; remote data is never touched.
    /// Relations without an agent-assigned id are skipped.
    pub async fn save_local(pool: &Pool<Sqlite>, relations: &Relations) -> Result<()> {
        let mut tx = pool.begin().await?;
        for relation in relations.iter() {
            let Some(id) = relation.id else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO relations (id, endpoint, remote_app) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET endpoint = excluded.endpoint
                "#,
            )
            .bind(id)
            .bind(&relation.endpoint)
            .bind(&relation.remote_app)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM relation_data WHERE relation_id = ? AND unit = ?")
                .bind(id)
                .bind(relation.local_unit())
                .execute(&mut *tx)
                .await?;

            for (key, value) in relation.local_data() {
                sqlx::query("INSERT INTO relation_data (relation_id, unit, key, value) VALUES (?, ?, ?, ?)")
                    .bind(id)
                    .bind(relation.local_unit())
                    .bind(&key)
                    .bind(&value)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Register a relation reported by the agent, and the remote unit when known
    pub async fn register(pool: &Pool<Sqlite>, relation_id: i64, endpoint: &str, unit: Option<&str>) -> Result<()> {
        sqlx::query("INSERT INTO relations (id, endpoint) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(relation_id)
            .bind(endpoint)
            .execute(pool)
            .await?;
        if let Some(unit) = unit {
            sqlx::query("INSERT INTO relation_units (relation_id, unit) VALUES (?, ?) ON CONFLICT DO NOTHING")
                .bind(relation_id)
                .bind(unit)
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    /// Replace a remote unit's databag with what the agent delivered
    pub async fn replace_unit_data(
        pool: &Pool<Sqlite>,
        relation_id: i64,
        unit: &str,
        data: &[(&str, &str)],
    ) -> Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM relation_data WHERE relation_id = ? AND unit = ?")
            .bind(relation_id)
            .bind(unit)
            .execute(&mut *tx)
            .await?;
        for (key, value) in data.iter().filter(|(_, value)| !value.is_empty()) {
            sqlx::query("INSERT INTO relation_data (relation_id, unit, key, value) VALUES (?, ?, ?, ?)")
                .bind(relation_id)
                .bind(unit)
                .bind(*key)
                .bind(*value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop a departed unit and everything it published
    pub async fn forget_unit(pool: &Pool<Sqlite>, relation_id: i64, unit: &str) -> Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM relation_data WHERE relation_id = ? AND unit = ?")
            .bind(relation_id)
            .bind(unit)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM relation_units WHERE relation_id = ? AND unit = ?")
            .bind(relation_id)
            .bind(unit)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop a broken relation with all of its units and data
    pub async fn forget(pool: &Pool<Sqlite>, relation_id: i64) -> Result<()> {
        let mut tx = pool.begin().await?;
        for table in ["relation_data", "relation_units"] {
            sqlx::query(&format!("DELETE FROM {} WHERE relation_id = ?", table))
                .bind(relation_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM relations WHERE id = ?")
            .bind(relation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

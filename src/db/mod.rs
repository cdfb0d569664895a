mod relations;
mod unit_state;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use crate::models::StoredState;
use crate::relation::{PeerStore, Relations};
use crate::status::UnitStatus;

pub use relations::RelationRepo;
pub use unit_state::UnitStateRepo;

const STORED_STATE_KEY: &str = "stored";
const STATUS_KEY: &str = "status";
const PENDING_PEER_DATA_KEY: &str = "pending-peer-data";

/// Store persists unit state and relation databags between events
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Create a new database store with a specific pool size
    pub async fn with_pool_size(db_path: &str, max_connections: u32) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&db_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub async fn load_state(&self) -> Result<StoredState> {
        Ok(UnitStateRepo::get(&self.pool, STORED_STATE_KEY)
            .await
            .context("Failed to load stored state")?
            .unwrap_or_default())
    }

    pub async fn save_state(&self, state: &StoredState) -> Result<()> {
        UnitStateRepo::put(&self.pool, STORED_STATE_KEY, state).await
    }

    /// Last status set on the unit
    pub async fn load_status(&self) -> Result<UnitStatus> {
        Ok(UnitStateRepo::get(&self.pool, STATUS_KEY).await?.unwrap_or_default())
    }

    pub async fn save_status(&self, status: &UnitStatus) -> Result<()> {
        UnitStateRepo::put(&self.pool, STATUS_KEY, status).await
    }

    /// Relations as last recorded, seeded with the local peer data kept
    /// while the peer relation was still unregistered
    pub async fn load_relations(&self, local_unit: &str) -> Result<Relations> {
        let pending: BTreeMap<String, String> = UnitStateRepo::get(&self.pool, PENDING_PEER_DATA_KEY)
            .await
            .context("Failed to load pending peer data")?
            .unwrap_or_default();

        let mut relations = Relations::new(local_unit);
        for (key, value) in &pending {
            relations.peer.write(key, value);
        }
        RelationRepo::load(&self.pool, &mut relations)
            .await
            .context("Failed to load relations")?;
        Ok(relations)
    }

    pub async fn save_relations(&self, relations: &Relations) -> Result<()> {
        let pending = match relations.peer.id {
            Some(_) => BTreeMap::new(),
            None => relations.peer.local_data(),
        };
        UnitStateRepo::put(&self.pool, PENDING_PEER_DATA_KEY, &pending).await?;
        RelationRepo::save_local(&self.pool, relations)
            .await
            .context("Failed to save relation data")
    }

    /// Register a relation the agent reported, without any unit data
    pub async fn record_relation(&self, relation_id: i64, endpoint: &str, unit: Option<&str>) -> Result<()> {
        RelationRepo::register(&self.pool, relation_id, endpoint, unit).await
    }

    /// Register a remote unit and replace its databag with `data`
    pub async fn record_remote(
        &self,
        relation_id: i64,
        endpoint: &str,
        unit: &str,
        data: &[(&str, &str)],
    ) -> Result<()> {
        RelationRepo::register(&self.pool, relation_id, endpoint, Some(unit)).await?;
        RelationRepo::replace_unit_data(&self.pool, relation_id, unit, data).await
    }

    pub async fn forget_unit(&self, relation_id: i64, unit: &str) -> Result<()> {
        RelationRepo::forget_unit(&self.pool, relation_id, unit)
            .await
            .context("Failed to remove departed unit")
    }

    pub async fn forget_relation(&self, relation_id: i64) -> Result<()> {
        RelationRepo::forget(&self.pool, relation_id)
            .await
            .context("Failed to remove broken relation")
    }
}

mod charm;
mod config;
mod db;
mod early_network;
mod error;
mod kubectl;
mod models;
mod peer;
mod relation;
mod status;
mod templates;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use charm::{Charm, Event};
use config::{CharmConfig, Config};
use db::Store;
use early_network::LocalHost;
use kubectl::KubectlCli;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calico_enterprise_charm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::load();

    let Some(event) = Event::from_hook(cfg.hook_name(), cfg.relation_id, cfg.remote_unit.clone()) else {
        tracing::info!(hook = cfg.hook_name(), "No handler for hook");
        return Ok(());
    };

    tracing::info!(db_path = %cfg.db_path, unit = %cfg.unit_name, "Opening unit state");
    let store = Store::with_pool_size(&cfg.db_path, cfg.db_max_connections).await?;

    record_relation_event(&store, &event, cfg.remote_data.as_deref()).await?;

    let Some(charm_config) = load_charm_config(&store, &cfg.charm_config_path).await? else {
        return Ok(());
    };
    let relations = store.load_relations(&cfg.unit_name).await?;
    let state = store.load_state().await?;
    let status = store.load_status().await?;

    let kubectl = KubectlCli::new(cfg.kubeconfig_path.clone());
    let mut charm = Charm::new(cfg, charm_config, relations, kubectl, LocalHost)?.with_state(state, status);

    charm.dispatch(&event).await;

    let (relations, state, status) = charm.into_parts();
    store.save_relations(&relations).await?;
    store.save_state(&state).await?;
    store.save_status(&status).await?;

    tracing::info!(%status, event = event.name(), "Event handled");
    Ok(())
}

/// Mirror what the agent reported about the relation behind `event`
async fn record_relation_event(store: &Store, event: &Event, remote_data: Option<&str>) -> anyhow::Result<()> {
    let (endpoint, relation_id, remote_unit) = match event {
        Event::RelationDeparted { relation_id, unit, .. } => {
            tracing::info!(relation_id, %unit, "Unit departed");
            return store.forget_unit(*relation_id, unit).await;
        }
        Event::RelationBroken { relation_id, .. } => {
            tracing::info!(relation_id, "Relation broken");
            return store.forget_relation(*relation_id).await;
        }
        Event::PeerRelationChanged {
            relation_id,
            remote_unit,
        }
        | Event::CniRelationChanged {
            relation_id,
            remote_unit,
        } => (event.endpoint(), *relation_id, remote_unit.as_deref()),
        _ => return Ok(()),
    };
    let Some(endpoint) = endpoint else {
        return Ok(());
    };

    match (remote_unit, remote_data) {
        (Some(unit), Some(raw)) => {
            let data: BTreeMap<String, String> =
                serde_json::from_str(raw).context("Remote relation data must be a JSON object of strings")?;
            let pairs: Vec<(&str, &str)> = data.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            tracing::debug!(relation_id, %unit, keys = pairs.len(), "Recording remote relation data");
            store.record_remote(relation_id, endpoint, unit, &pairs).await
        }
        (unit, _) => store.record_relation(relation_id, endpoint, unit).await,
    }
}

/// Charm options, or `None` once their rejection is recorded as the unit status
async fn load_charm_config(store: &Store, path: &Path) -> anyhow::Result<Option<CharmConfig>> {
    match CharmConfig::load(path) {
        Ok(config) => Ok(Some(config)),
        Err(e) => {
            let status = e.status();
            tracing::error!(path = %path.display(), %status, "Rejecting charm config: {}", e);
            store.save_status(&status).await?;
            Ok(None)
        }
    }
}

mod charm;

pub use charm::{CharmConfig, NicAutodetection};

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Config holds the runtime settings handed over by the unit agent
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub db_max_connections: u32,
    pub charm_config_path: PathBuf,
    pub kubeconfig_path: PathBuf,
    pub early_service_path: PathBuf,
    pub early_network_config_path: PathBuf,
    pub operator_manifest_path: PathBuf,
    pub crd_manifest_path: PathBuf,
    pub unit_name: String,
    pub is_leader: bool,
    pub readiness_retry_delay: Duration,
    pub dispatch_path: String,
    pub relation_id: Option<i64>,
    pub remote_unit: Option<String>,
    /// JSON object of the remote unit's databag, when the agent hands it over
    pub remote_data: Option<String>,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        Self {
            db_path: get_env("DB_PATH", "/var/lib/calico-enterprise/charm.db"),
            db_max_connections: get_env("DB_MAX_CONNECTIONS", "1")
                .parse()
                .unwrap_or(1),
            charm_config_path: get_env("CHARM_CONFIG", "/var/lib/calico-enterprise/config.yaml").into(),
            kubeconfig_path: get_env("KUBECONFIG_PATH", "/root/.kube/config").into(),
            early_service_path: get_env("EARLY_SERVICE_PATH", "/etc/systemd/system/calico-early.service").into(),
            early_network_config_path: get_env("EARLY_NETWORK_CONFIG", "/calico-early/cfg.yaml").into(),
            operator_manifest_path: get_env(
                "OPERATOR_MANIFEST",
                "/var/lib/calico-enterprise/resources/calico-enterprise-manifest.yaml",
            )
            .into(),
            crd_manifest_path: get_env(
                "CRD_MANIFEST",
                "/var/lib/calico-enterprise/resources/calico-crd-manifest.yaml",
            )
            .into(),
            unit_name: get_env("JUJU_UNIT_NAME", "calico-enterprise/0"),
            is_leader: get_env("CHARM_IS_LEADER", "false").eq_ignore_ascii_case("true"),
            readiness_retry_delay: Duration::from_secs(
                get_env("READINESS_RETRY_DELAY_SECS", "24").parse().unwrap_or(24),
            ),
            dispatch_path: get_env("JUJU_DISPATCH_PATH", ""),
            relation_id: env::var("JUJU_RELATION_ID")
                .ok()
                .and_then(|id| parse_relation_id(&id)),
            remote_unit: env::var("JUJU_REMOTE_UNIT").ok().filter(|u| !u.is_empty()),
            remote_data: env::var("JUJU_REMOTE_DATA").ok().filter(|d| !d.trim().is_empty()),
        }
    }

    /// Hook name from the dispatch path, e.g. "hooks/config-changed" -> "config-changed"
    pub fn hook_name(&self) -> &str {
        self.dispatch_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.dispatch_path)
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Relation ids are either plain integers or "endpoint:id"
fn parse_relation_id(raw: &str) -> Option<i64> {
    raw.rsplit(':').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relation_id() {
        assert_eq!(parse_relation_id("cni:3"), Some(3));
        assert_eq!(parse_relation_id("7"), Some(7));
        assert_eq!(parse_relation_id("cni:"), None);
    }

    #[test]
    fn test_hook_name() {
        let mut cfg = Config::load();
        cfg.dispatch_path = "hooks/cni-relation-changed".to_string();
        assert_eq!(cfg.hook_name(), "cni-relation-changed");
        cfg.dispatch_path = "install".to_string();
        assert_eq!(cfg.hook_name(), "install");
    }
}

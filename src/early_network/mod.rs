//! Local BGP parameters from the host's early-network setup.
//!
//! The early-network systemd unit points at a YAML file describing every
//! node of the cluster. The node whose stable address is bound to this
//! host's loopback interface is the one that describes us.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::models::BgpParameters;

/// Directive in the service unit naming the early-network config file
const EARLY_NETWORKING_DIRECTIVE: &str = "CALICO_EARLY_NETWORKING=";

/// Interface that carries the stable address
const LOOPBACK_INTERFACE: &str = "lo";

/// Trait for reading host facts (allows mocking in tests)
#[cfg_attr(test, mockall::automock)]
pub trait HostIntrospection: Send + Sync {
    fn read_file(&self, path: &Path) -> Option<String>;

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()>;

    /// Non-loopback addresses bound to the loopback interface
    fn loopback_addresses(&self) -> Vec<IpAddr>;

    fn hostname(&self) -> Option<String>;
}

/// LocalHost reads facts from the machine the unit runs on
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHost;

impl HostIntrospection for LocalHost {
    fn read_file(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }

    fn loopback_addresses(&self) -> Vec<IpAddr> {
        match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter(|iface| iface.name == LOOPBACK_INTERFACE && !iface.is_loopback())
                .map(|iface| iface.ip())
                .collect(),
            Err(e) => {
                tracing::warn!("Couldn't fetch the addresses of {}: {}", LOOPBACK_INTERFACE, e);
                Vec::new()
            }
        }
    }

    fn hostname(&self) -> Option<String> {
        nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
    }
}

#[derive(Debug, Deserialize)]
struct EarlyNetworkFile {
    spec: EarlyNetworkSpec,
}

#[derive(Debug, Deserialize)]
struct EarlyNetworkSpec {
    nodes: Vec<serde_yaml::Value>,
}

/// EarlyNetwork resolves this unit's BGP parameters from host files
pub struct EarlyNetwork<H> {
    host: H,
    service_path: PathBuf,
}

impl<H: HostIntrospection> EarlyNetwork<H> {
    pub fn new(host: H, service_path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            service_path: service_path.into(),
        }
    }

    /// Local BGP parameters, or `None` while early networking is not ready.
    ///
    /// Every failure is logged and reported as `None`.
    pub fn resolve(&self) -> Option<BgpParameters> {
        let Some(service) = self.host.read_file(&self.service_path) else {
            tracing::warn!(path = %self.service_path.display(), "No calico-early service definition file");
            return None;
        };

        let Some(config_path) = config_location(&service) else {
            tracing::warn!(
                path = %self.service_path.display(),
                "calico-early service has no {} directive",
                EARLY_NETWORKING_DIRECTIVE
            );
            return None;
        };

        let content = self
            .host
            .read_file(&config_path)
            .filter(|c| !c.trim().is_empty());
        let Some(content) = content else {
            tracing::warn!("Couldn't find calico early config in {}", config_path.display());
            return None;
        };

        let Some(stable_address) = self.host.loopback_addresses().into_iter().last() else {
            tracing::warn!("No stable address bound to {}", LOOPBACK_INTERFACE);
            return None;
        };

        let file: EarlyNetworkFile = match serde_yaml::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Config file didn't contain spec.nodes in {}: {}", config_path.display(), e);
                return None;
            }
        };

        let Some(node) = file
            .spec
            .nodes
            .into_iter()
            .find(|node| stable_address_of(node) == Some(stable_address))
        else {
            tracing::warn!("No node in {} matches {}", config_path.display(), stable_address);
            return None;
        };

        let mut params: BgpParameters = match serde_yaml::from_value(node) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("Invalid node entry for {}: {}", stable_address, e);
                return None;
            }
        };

        let Some(hostname) = self.host.hostname() else {
            tracing::warn!("Couldn't determine the local hostname");
            return None;
        };
        params.hostname = Some(hostname);
        Some(params)
    }

    /// Write an EarlyNetworkConfiguration manifest for the host's early-network service
    pub fn write_host_config(&self, path: &Path, manifest: &str) -> std::io::Result<()> {
        tracing::info!(path = %path.display(), "Writing early network configuration");
        self.host.write_file(path, manifest)
    }
}

/// First whitespace-delimited token after the directive
fn config_location(service: &str) -> Option<PathBuf> {
    service
        .lines()
        .find_map(|line| line.split_once(EARLY_NETWORKING_DIRECTIVE))
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|token| PathBuf::from(token.trim_matches('"')))
}

fn stable_address_of(node: &serde_yaml::Value) -> Option<IpAddr> {
    node.get("stableAddress")?.get("address")?.as_str()?.parse().ok()
}

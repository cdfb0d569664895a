//! Peer consensus over the calico-enterprise peer relation.
//!
//! Every unit publishes its own BGP parameters and copies of the CNI facts it
//! received. The layout and the shared facts are recomputed from the relation
//! on every read.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::early_network::{EarlyNetwork, HostIntrospection};
use crate::error::Error;
use crate::models::{relation_key, BgpLayout, BgpParameters, EarlyNetworkNode};
use crate::relation::PeerStore;

const CALICO_API_VERSION: &str = "crd.projectcalico.org/v1";

/// Name of the ConfigMap carrying the early network layout
pub const BGP_LAYOUT_CONFIG_MAP: &str = "bgp-layout";

/// Notification emitted after a peer relation event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    BgpParametersChanged,
}

/// PeerConsensus derives cluster-wide facts from a peer store
pub struct PeerConsensus<S> {
    store: S,
    override_source: Option<String>,
}

impl<S: PeerStore> PeerConsensus<S> {
    /// `override_source` is the operator's `bgp_parameters` option, if set
    pub fn new(store: S, override_source: Option<String>) -> Self {
        Self { store, override_source }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// The value of `key` if every unit that set it agrees on it
    pub fn quorum(&self, key: &str) -> Option<String> {
        let values: BTreeSet<String> = self
            .store
            .units()
            .iter()
            .filter_map(|unit| self.store.read(unit, key))
            .filter(|value| !value.is_empty())
            .collect();
        if values.len() == 1 {
            values.into_iter().next()
        } else {
            None
        }
    }

    pub fn service_cidr(&self) -> Option<String> {
        self.quorum(relation_key::SERVICE_CIDR)
    }

    pub fn image_registry(&self) -> Option<String> {
        self.quorum(relation_key::IMAGE_REGISTRY)
    }

    /// Layout from the published `bgp-parameters` of the local unit, or of every unit
    pub fn merged_layout(&self, local_only: bool) -> BgpLayout {
        let units = if local_only {
            vec![self.store.local_unit().to_string()]
        } else {
            self.store.units()
        };

        let nodes = units
            .iter()
            .filter_map(|unit| {
                let raw = self
                    .store
                    .read(unit, relation_key::BGP_PARAMETERS)
                    .filter(|raw| !raw.is_empty())?;
                match serde_json::from_str::<BgpParameters>(&raw) {
                    Ok(params) => Some(params),
                    Err(e) => {
                        tracing::warn!(%unit, "Dropping invalid bgp-parameters: {}", e);
                        None
                    }
                }
            })
            .collect();
        BgpLayout { nodes }
    }

    /// Operator override layout, when one is set and parses
    pub fn override_layout(&self) -> Option<BgpLayout> {
        let raw = self.override_source.as_deref()?;
        match BgpLayout::from_yaml(raw) {
            Ok(layout) => {
                tracing::info!("bgp_parameters will override computed parameters");
                Some(layout)
            }
            Err(e) => {
                tracing::info!("bgp_parameters is invalid: {}, falling back to computed parameters", e);
                None
            }
        }
    }

    /// Layout used for rendering
    pub fn effective_layout(&self) -> BgpLayout {
        self.override_layout().unwrap_or_else(|| self.merged_layout(false))
    }

    /// Publish the local unit's parameters; returns whether anything was published
    pub fn publish_self<H: HostIntrospection>(&mut self, resolver: &EarlyNetwork<H>) -> bool {
        let Some(params) = resolver.resolve() else {
            return false;
        };
        match serde_json::to_string(&params) {
            Ok(raw) => {
                self.store.write(relation_key::BGP_PARAMETERS, &raw);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to encode local bgp parameters: {}", e);
                false
            }
        }
    }

    pub fn on_peer_event<H: HostIntrospection>(&mut self, resolver: &EarlyNetwork<H>) -> PeerEvent {
        if self.merged_layout(true).is_empty() {
            tracing::info!(unit = self.store.local_unit(), "Sharing bgp params");
            self.publish_self(resolver);
        }
        PeerEvent::BgpParametersChanged
    }

    /// Default BGPConfiguration announcing the agreed service CIDR
    pub fn bgp_configuration(&self) -> Result<String, Error> {
        let cidr = self
            .service_cidr()
            .ok_or_else(|| Error::not_ready("Waiting for CNI relation"))?;
        let configuration = BgpConfiguration {
            api_version: CALICO_API_VERSION,
            kind: "BGPConfiguration",
            metadata: Metadata { name: "default" },
            spec: BgpConfigurationSpec {
                log_severity_screen: "Info",
                node_to_node_mesh_enabled: false,
                service_cluster_ips: vec![ServiceClusterIp { cidr }],
                listen_port: 179,
            },
        };
        Ok(serde_yaml::to_string(&configuration)?)
    }
}

/// ConfigMap handing the early network layout to the operator
pub fn bgp_layout_config_map(layout: &BgpLayout) -> Result<String, Error> {
    let mut data = BTreeMap::new();
    data.insert("earlyNetworkConfiguration", early_network_manifest(layout)?);
    let config_map = ConfigMap {
        api_version: "v1",
        kind: "ConfigMap",
        metadata: Metadata {
            name: BGP_LAYOUT_CONFIG_MAP,
        },
        data,
    };
    Ok(serde_yaml::to_string(&config_map)?)
}

/// Render EarlyNetworkConfiguration YAML; hostnames never leave the charm
pub fn early_network_manifest(layout: &BgpLayout) -> Result<String, serde_yaml::Error> {
    let nodes: Vec<EarlyNetworkNode<'_>> = layout
        .renderable_nodes()
        .into_iter()
        .map(EarlyNetworkNode::from)
        .collect();
    if nodes.is_empty() {
        tracing::warn!("No node map is available yet");
    }
    serde_yaml::to_string(&EarlyNetworkConfiguration {
        api_version: CALICO_API_VERSION,
        kind: "EarlyNetworkConfiguration",
        spec: EarlyNetworkSpec { nodes },
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EarlyNetworkConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    spec: EarlyNetworkSpec<'a>,
}

#[derive(Debug, Serialize)]
struct EarlyNetworkSpec<'a> {
    nodes: Vec<EarlyNetworkNode<'a>>,
}

#[derive(Debug, Serialize)]
struct Metadata {
    name: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMap {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    data: BTreeMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BgpConfiguration {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: BgpConfigurationSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BgpConfigurationSpec {
    log_severity_screen: &'static str,
    node_to_node_mesh_enabled: bool,
    #[serde(rename = "serviceClusterIPs")]
    service_cluster_ips: Vec<ServiceClusterIp>,
    listen_port: u16,
}

#[derive(Debug, Serialize)]
struct ServiceClusterIp {
    cidr: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::early_network::MockHostIntrospection;
    use crate::models::endpoint;
    use crate::relation::Relation;

    const LOCAL: &str = "calico-enterprise/0";

    fn params_json(hostname: &str, asn: u32, stable: &str, rack: &str) -> String {
        serde_json::json!({
            "hostname": hostname,
            "asNumber": asn,
            "interfaceAddresses": ["192.168.1.1"],
            "labels": {"rack": rack},
            "peerings": [{"peerIP": "192.168.1.254", "peerASNumber": 21254}],
            "stableAddress": {"address": stable},
        })
        .to_string()
    }

    fn peers() -> Relation {
        Relation::new(1, endpoint::PEERS, LOCAL)
    }

    fn unresolvable() -> EarlyNetwork<MockHostIntrospection> {
        let mut host = MockHostIntrospection::new();
        host.expect_read_file().returning(|_| None);
        EarlyNetwork::new(host, "/etc/systemd/system/calico-early.service")
    }

    const OVERRIDE: &str = r#"
- hostname: test
  asNumber: 1
  interfaceAddresses: [20.20.20.20]
  peerings:
  - {peerIP: 30.30.30.30, peerASNumber: 20}
  labels: {rack: r}
  stableAddress: {address: 10.10.10.10}
"#;

    #[test]
    fn test_quorum_agreement() {
        let mut store = peers();
        store.set_unit_data("calico-enterprise/1", "service-cidr", "10.1.0.0/16");
        store.set_unit_data("calico-enterprise/2", "service-cidr", "");
        let consensus = PeerConsensus::new(store, None);
        assert_eq!(consensus.service_cidr().as_deref(), Some("10.1.0.0/16"));

        let mut store = consensus.into_store();
        store.set_unit_data("calico-enterprise/3", "service-cidr", "10.2.0.0/16");
        let consensus = PeerConsensus::new(store, None);
        assert_eq!(consensus.service_cidr(), None);
    }

    #[test]
    fn test_quorum_counts_self() {
        let mut store = peers();
        store.set_unit_data("calico-enterprise/1", "image-registry", "registry.local");
        store.write("image-registry", "registry.local");
        let mut consensus = PeerConsensus::new(store, None);
        assert_eq!(consensus.image_registry().as_deref(), Some("registry.local"));

        consensus.store_mut().write("image-registry", "quay.io");
        assert_eq!(consensus.image_registry(), None);
        assert_eq!(PeerConsensus::new(peers(), None).image_registry(), None);
    }

    #[test]
    fn test_merged_layout_excludes_bad_records() {
        let mut store = peers();
        store.set_unit_data("calico-enterprise/1", "bgp-parameters", &params_json("n1", 1, "10.10.10.1", "r1"));
        store.set_unit_data("calico-enterprise/2", "bgp-parameters", &params_json("n2", 2, "10.10.10.2", "r1"));
        store.set_unit_data("calico-enterprise/3", "bgp-parameters", r#"{"asNumber": "nope"}"#);
        let consensus = PeerConsensus::new(store, None);

        let layout = consensus.merged_layout(false);
        let hostnames: BTreeSet<_> = layout.nodes.iter().filter_map(|n| n.hostname()).collect();
        assert_eq!(hostnames, BTreeSet::from(["n1", "n2"]));
        assert!(consensus.merged_layout(true).is_empty());
    }

    #[test]
    fn test_override_wins_when_valid() {
        let mut store = peers();
        store.set_unit_data("calico-enterprise/1", "bgp-parameters", &params_json("n1", 1, "10.10.10.1", "r1"));

        let consensus = PeerConsensus::new(store.clone(), Some(OVERRIDE.to_string()));
        let layout = consensus.effective_layout();
        assert_eq!(layout.nodes.len(), 1);
        assert_eq!(layout.nodes[0].hostname(), Some("test"));

        let consensus = PeerConsensus::new(store, Some("invalid".to_string()));
        assert_eq!(consensus.effective_layout().nodes[0].hostname(), Some("n1"));
    }

    #[test]
    fn test_peer_event_publishes_once() {
        let mut host = MockHostIntrospection::new();
        host.expect_read_file().returning(|path| {
            if path.ends_with("calico-early.service") {
                Some("Environment=CALICO_EARLY_NETWORKING=/calico-early/cfg.yaml\n".to_string())
            } else {
                Some(
                    "spec:\n  nodes:\n  - asNumber: 1\n    interfaceAddresses: [20.20.20.20]\n    \
                     labels: {rack: r}\n    peerings: []\n    stableAddress: {address: 10.10.10.10}\n"
                        .to_string(),
                )
            }
        });
        host.expect_loopback_addresses()
            .times(1)
            .returning(|| vec!["10.10.10.10".parse().unwrap()]);
        host.expect_hostname().returning(|| Some("local-host".to_string()));
        let resolver = EarlyNetwork::new(host, "/etc/systemd/system/calico-early.service");

        let mut consensus = PeerConsensus::new(peers(), None);
        assert_eq!(consensus.on_peer_event(&resolver), PeerEvent::BgpParametersChanged);
        let local = consensus.merged_layout(true);
        assert_eq!(local.nodes[0].hostname(), Some("local-host"));

        // already published, so the resolver is not consulted again
        assert_eq!(consensus.on_peer_event(&resolver), PeerEvent::BgpParametersChanged);
    }

    #[test]
    fn test_peer_event_without_early_network() {
        let mut consensus = PeerConsensus::new(peers(), None);
        assert_eq!(consensus.on_peer_event(&unresolvable()), PeerEvent::BgpParametersChanged);
        assert!(consensus.store().local_data().is_empty());
    }

    #[test]
    fn test_early_network_config_omits_hostname() {
        let layout = PeerConsensus::new(peers(), Some(OVERRIDE.to_string())).effective_layout();
        let manifest: serde_yaml::Value = serde_yaml::from_str(&early_network_manifest(&layout).unwrap()).unwrap();
        assert_eq!(manifest["kind"], "EarlyNetworkConfiguration");
        let node = &manifest["spec"]["nodes"][0];
        assert_eq!(node["stableAddress"]["address"], "10.10.10.10");
        assert!(node.get("hostname").is_none());
    }

    #[test]
    fn test_bgp_layout_config_map() {
        let layout = PeerConsensus::new(peers(), Some(OVERRIDE.to_string())).effective_layout();
        let manifest: serde_yaml::Value = serde_yaml::from_str(&bgp_layout_config_map(&layout).unwrap()).unwrap();
        assert_eq!(manifest["metadata"]["name"], "bgp-layout");
        let embedded = manifest["data"]["earlyNetworkConfiguration"].as_str().unwrap();
        assert!(embedded.contains("asNumber: 1"));
    }

    #[test]
    fn test_bgp_configuration() {
        let mut store = peers();
        store.write("service-cidr", "10.152.183.0/24");
        let consensus = PeerConsensus::new(store, None);
        let manifest: serde_yaml::Value = serde_yaml::from_str(&consensus.bgp_configuration().unwrap()).unwrap();
        assert_eq!(manifest["metadata"]["name"], "default");
        assert_eq!(manifest["spec"]["nodeToNodeMeshEnabled"], false);
        assert_eq!(manifest["spec"]["serviceClusterIPs"][0]["cidr"], "10.152.183.0/24");
        assert_eq!(manifest["spec"]["listenPort"], 179);

        assert!(PeerConsensus::new(peers(), None).bgp_configuration().is_err());
    }

    #[test]
    fn test_bgp_peer_set() {
        let consensus = PeerConsensus::new(peers(), Some(OVERRIDE.to_string()));
        let peers = consensus.effective_layout().peer_bindings();
        assert_eq!(peers.len(), 1);
        let peer = peers.iter().next().unwrap();
        assert_eq!(peer.resource_name(), "r-30.30.30.30");
        assert_eq!(peer.asn, 20);
    }
}

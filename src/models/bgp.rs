use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// BgpPeer represents one top-of-rack peering of a host interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpPeer {
    #[serde(rename = "peerIP")]
    pub ip: IpAddr,
    #[serde(rename = "peerASNumber")]
    pub asn: u32,
}

/// BgpLabels holds the node labels derived from the layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpLabels {
    pub rack: String,
}

/// StableAddress is the loopback address a node keeps across uplinks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableAddress {
    pub address: IpAddr,
}

/// BgpParameters describes a single cluster node in the BGP layout.
///
/// The wire format is the camelCase layout used by EarlyNetworkConfiguration,
/// with an extra `hostname` that never reaches the rendered manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BgpParameters {
    pub as_number: u32,
    pub interface_addresses: Vec<IpAddr>,
    pub labels: BgpLabels,
    pub peerings: Vec<BgpPeer>,
    pub stable_address: StableAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl BgpParameters {
    /// Hostname, if one was provided and is non-empty
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref().filter(|h| !h.is_empty())
    }
}

/// BgpLayout is the cluster-wide set of node BGP parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpLayout {
    pub nodes: Vec<BgpParameters>,
}

impl BgpLayout {
    /// Parse an operator-supplied YAML list of nodes
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        let nodes: Vec<BgpParameters> = serde_yaml::from_str(raw)?;
        Ok(Self { nodes })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that can be rendered into manifests.
    ///
    /// Records without a hostname are skipped. When a hostname repeats, the
    /// last record wins but keeps the position of the first one.
    pub fn renderable_nodes(&self) -> Vec<&BgpParameters> {
        let mut nodes: Vec<&BgpParameters> = Vec::new();
        for node in &self.nodes {
            let Some(hostname) = node.hostname() else {
                continue;
            };
            match nodes.iter_mut().find(|n| n.hostname() == Some(hostname)) {
                Some(slot) => *slot = node,
                None => nodes.push(node),
            }
        }
        nodes
    }

    /// Flatten every (node, peering) pair into a deduplicated binding set
    pub fn peer_bindings(&self) -> BTreeSet<BgpPeerBinding> {
        self.renderable_nodes()
            .into_iter()
            .flat_map(|node| {
                node.peerings.iter().map(move |peer| BgpPeerBinding {
                    ip: peer.ip,
                    asn: peer.asn,
                    rack: node.labels.rack.clone(),
                })
            })
            .collect()
    }
}

/// BgpPeerBinding binds a top-of-rack peer to the rack it serves
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BgpPeerBinding {
    pub ip: IpAddr,
    pub asn: u32,
    pub rack: String,
}

impl BgpPeerBinding {
    /// Kubernetes object name for the BGPPeer, e.g. "rack-1-192.168.1.254"
    pub fn resource_name(&self) -> String {
        format!("{}-{}", self.rack, self.ip)
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
            .collect()
    }
}

/// Node entry of an EarlyNetworkConfiguration (no hostname)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EarlyNetworkNode<'a> {
    pub as_number: u32,
    pub interface_addresses: &'a [IpAddr],
    pub labels: &'a BgpLabels,
    pub peerings: &'a [BgpPeer],
    pub stable_address: &'a StableAddress,
}

impl<'a> From<&'a BgpParameters> for EarlyNetworkNode<'a> {
    fn from(node: &'a BgpParameters) -> Self {
        Self {
            as_number: node.as_number,
            interface_addresses: &node.interface_addresses,
            labels: &node.labels,
            peerings: &node.peerings,
            stable_address: &node.stable_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(hostname: Option<&str>, rack: &str, asn: u32, peer: &str) -> BgpParameters {
        BgpParameters {
            as_number: asn,
            interface_addresses: vec!["192.168.1.1".parse().unwrap()],
            labels: BgpLabels { rack: rack.to_string() },
            peerings: vec![BgpPeer { ip: peer.parse().unwrap(), asn: 65000 }],
            stable_address: StableAddress { address: "10.10.10.1".parse().unwrap() },
            hostname: hostname.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_wire_format() {
        let raw = r#"{
            "hostname": "k8s-node-2",
            "asNumber": 20002,
            "interfaceAddresses": ["192.168.1.2", "192.168.2.2"],
            "labels": {"rack": "rack-1"},
            "peerings": [
                {"peerASNumber": 21254, "peerIP": "192.168.1.254"},
                {"peerASNumber": 22254, "peerIP": "192.168.2.254"}
            ],
            "stableAddress": {"address": "10.10.10.2"}
        }"#;
        let params: BgpParameters = serde_json::from_str(raw).unwrap();
        assert_eq!(params.hostname(), Some("k8s-node-2"));
        assert_eq!(params.as_number, 20002);
        assert_eq!(params.peerings[1].asn, 22254);
        assert_eq!(params.stable_address.address.to_string(), "10.10.10.2");
    }

    #[test]
    fn test_invalid_ip_rejected() {
        let raw = r#"{
            "asNumber": 1,
            "interfaceAddresses": ["not-an-ip"],
            "labels": {"rack": "r"},
            "peerings": [],
            "stableAddress": {"address": "10.10.10.10"}
        }"#;
        assert!(serde_json::from_str::<BgpParameters>(raw).is_err());
    }

    #[test]
    fn test_from_yaml_override() {
        let raw = r#"
- hostname: test
  asNumber: 1
  interfaceAddresses:
  - 20.20.20.20
  peerings:
  - peerIP: 30.30.30.30
    peerASNumber: 20
  labels:
    rack: r
  stableAddress:
    address: 10.10.10.10
"#;
        let layout = BgpLayout::from_yaml(raw).unwrap();
        assert_eq!(layout.nodes.len(), 1);
        assert_eq!(layout.nodes[0].labels.rack, "r");
        assert!(BgpLayout::from_yaml("invalid").is_err());
    }

    #[test]
    fn test_renderable_nodes_dedupe_last_wins() {
        let layout = BgpLayout {
            nodes: vec![
                node(Some("n1"), "r1", 1, "1.1.1.1"),
                node(None, "r9", 9, "9.9.9.9"),
                node(Some("n2"), "r2", 2, "2.2.2.2"),
                node(Some("n1"), "r1", 3, "1.1.1.1"),
            ],
        };
        let nodes = layout.renderable_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].hostname(), Some("n1"));
        assert_eq!(nodes[0].as_number, 3);
        assert_eq!(nodes[1].hostname(), Some("n2"));
    }

    #[test]
    fn test_peer_bindings_collapse_duplicates() {
        let layout = BgpLayout {
            nodes: vec![
                node(Some("n1"), "rack-1", 1, "192.168.1.254"),
                node(Some("n2"), "rack-1", 2, "192.168.1.254"),
                node(Some("n3"), "rack-2", 3, "192.168.3.254"),
            ],
        };
        let bindings = layout.peer_bindings();
        assert_eq!(bindings.len(), 2);
        assert!(bindings.iter().any(|b| b.rack == "rack-2"));
    }

    #[test]
    fn test_resource_name() {
        let binding = BgpPeerBinding {
            ip: "fd00::1".parse().unwrap(),
            asn: 1,
            rack: "Rack_A".to_string(),
        };
        assert_eq!(binding.resource_name(), "rack-a-fd00--1");

        let binding = BgpPeerBinding {
            ip: "30.30.30.30".parse().unwrap(),
            asn: 20,
            rack: "r".to_string(),
        };
        assert_eq!(binding.resource_name(), "r-30.30.30.30");
    }

    #[test]
    fn test_early_network_node_drops_hostname() {
        let params = node(Some("secret-host"), "r", 1, "1.1.1.1");
        let yaml = serde_yaml::to_string(&EarlyNetworkNode::from(&params)).unwrap();
        assert!(yaml.contains("asNumber: 1"));
        assert!(!yaml.contains("hostname"));
        assert!(!yaml.contains("secret-host"));
    }
}

mod bgp;
mod state;

pub use bgp::*;
pub use state::*;

/// Canonical relation endpoint names
pub mod endpoint {
    pub const PEERS: &str = "calico-enterprise";
    pub const CNI: &str = "cni";
}

/// Canonical relation databag keys
pub mod relation_key {
    pub const BGP_PARAMETERS: &str = "bgp-parameters";
    pub const SERVICE_CIDR: &str = "service-cidr";
    pub const IMAGE_REGISTRY: &str = "image-registry";
    pub const KUBECONFIG_HASH: &str = "kubeconfig-hash";
    pub const CIDR: &str = "cidr";
    pub const CNI_CONF_FILE: &str = "cni-conf-file";

    /// Keys repeated from the CNI relation onto the peer relation
    pub const FORWARDED_FROM_CNI: &[&str] = &[SERVICE_CIDR, IMAGE_REGISTRY];
}

/// Canonical Kubernetes namespaces managed by the charm
pub mod namespace {
    pub const TIGERA_OPERATOR: &str = "tigera-operator";
    pub const CALICO_SYSTEM: &str = "calico-system";

    pub const ALL: &[&str] = &[TIGERA_OPERATOR, CALICO_SYSTEM];
}

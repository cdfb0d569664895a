use serde::{Deserialize, Serialize};

/// StoredState holds the flags that survive between events of a unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredState {
    #[serde(default)]
    pub tigera_configured: bool,
    #[serde(default)]
    pub tigera_cni_configured: bool,
    #[serde(default)]
    pub pod_restart_needed: bool,
    /// Calico Enterprise release deployed on the cluster, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let state: StoredState = serde_json::from_str("{}").unwrap();
        assert!(!state.tigera_configured);
        assert!(!state.tigera_cni_configured);
        assert!(!state.pod_restart_needed);
        assert_eq!(state, StoredState::default());
    }
}

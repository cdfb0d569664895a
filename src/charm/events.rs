use crate::models::endpoint;

/// Events the unit agent dispatches to the charm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Install,
    Start,
    ConfigChanged,
    UpgradeCharm,
    /// Joined or changed on the peer relation
    PeerRelationChanged {
        relation_id: i64,
        remote_unit: Option<String>,
    },
    /// Joined or changed on a cni relation
    CniRelationChanged {
        relation_id: i64,
        remote_unit: Option<String>,
    },
    /// A remote unit left a peer or cni relation
    RelationDeparted {
        endpoint: &'static str,
        relation_id: i64,
        unit: String,
    },
    /// A peer or cni relation is going away
    RelationBroken {
        endpoint: &'static str,
        relation_id: i64,
    },
    UpdateStatus,
    Remove,
}

impl Event {
    /// Map a hook name to an event; unknown hooks map to `None`
    pub fn from_hook(hook: &str, relation_id: Option<i64>, remote_unit: Option<String>) -> Option<Self> {
        let event = match hook {
            "install" => Self::Install,
            "start" => Self::Start,
            "config-changed" => Self::ConfigChanged,
            "upgrade-charm" => Self::UpgradeCharm,
            "update-status" => Self::UpdateStatus,
            "remove" => Self::Remove,
            _ => {
                let (relation, kind) = hook.rsplit_once("-relation-")?;
                let known = match relation {
                    endpoint::PEERS => endpoint::PEERS,
                    endpoint::CNI => endpoint::CNI,
                    _ => return None,
                };
                match kind {
                    "joined" | "changed" if known == endpoint::PEERS => Self::PeerRelationChanged {
                        relation_id: relation_id?,
                        remote_unit,
                    },
                    "joined" | "changed" => Self::CniRelationChanged {
                        relation_id: relation_id?,
                        remote_unit,
                    },
                    "departed" => Self::RelationDeparted {
                        endpoint: known,
                        relation_id: relation_id?,
                        unit: remote_unit?,
                    },
                    "broken" => Self::RelationBroken {
                        endpoint: known,
                        relation_id: relation_id?,
                    },
                    _ => return None,
                }
            }
        };
        Some(event)
    }

    /// Relation endpoint the event arrived on
    pub fn endpoint(&self) -> Option<&'static str> {
        match self {
            Self::PeerRelationChanged { .. } => Some(endpoint::PEERS),
            Self::CniRelationChanged { .. } => Some(endpoint::CNI),
            Self::RelationDeparted { endpoint: known, .. } | Self::RelationBroken { endpoint: known, .. } => {
                Some(*known)
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Start => "start",
            Self::ConfigChanged => "config-changed",
            Self::UpgradeCharm => "upgrade-charm",
            Self::PeerRelationChanged { .. } => "calico-enterprise-relation-changed",
            Self::CniRelationChanged { .. } => "cni-relation-changed",
            Self::RelationDeparted { endpoint: endpoint::PEERS, .. } => "calico-enterprise-relation-departed",
            Self::RelationDeparted { .. } => "cni-relation-departed",
            Self::RelationBroken { endpoint: endpoint::PEERS, .. } => "calico-enterprise-relation-broken",
            Self::RelationBroken { .. } => "cni-relation-broken",
            Self::UpdateStatus => "update-status",
            Self::Remove => "remove",
        }
    }
}

use std::collections::{BTreeMap, BTreeSet};

use crate::models::endpoint;

/// Per-unit key/value view of a relation.
///
/// Any unit in scope can be read, but writes always land in the local unit's
/// own databag.
pub trait PeerStore {
    fn local_unit(&self) -> &str;

    /// Every unit in scope: remote units followed by the local unit
    fn units(&self) -> Vec<String>;

    fn read(&self, unit: &str, key: &str) -> Option<String>;

    /// Write to the local databag; an empty value removes the key
    fn write(&mut self, key: &str, value: &str);
}

/// A single relation between this unit and a remote application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Agent-assigned id; `None` until the agent has reported the relation
    pub id: Option<i64>,
    pub endpoint: String,
    pub remote_app: Option<String>,
    local_unit: String,
    remote_units: BTreeSet<String>,
    data: BTreeMap<String, BTreeMap<String, String>>,
}

impl Relation {
    pub fn new(id: i64, endpoint: impl Into<String>, local_unit: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            ..Self::unregistered(endpoint, local_unit)
        }
    }

    /// A relation the agent has not reported yet
    pub fn unregistered(endpoint: impl Into<String>, local_unit: impl Into<String>) -> Self {
        Self {
            id: None,
            endpoint: endpoint.into(),
            remote_app: None,
            local_unit: local_unit.into(),
            remote_units: BTreeSet::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn add_unit(&mut self, unit: impl Into<String>) {
        let unit = unit.into();
        if unit != self.local_unit {
            self.remote_units.insert(unit);
        }
    }

    pub fn remote_units(&self) -> impl Iterator<Item = &str> {
        self.remote_units.iter().map(String::as_str)
    }

    /// Record data published by a unit, usually while loading from the store
    pub fn set_unit_data(&mut self, unit: &str, key: &str, value: &str) {
        if unit != self.local_unit {
            self.remote_units.insert(unit.to_string());
        }
        self.data
            .entry(unit.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, unit: &str, key: &str) -> Option<&str> {
        self.data.get(unit)?.get(key).map(String::as_str)
    }

    pub fn local_data(&self) -> BTreeMap<String, String> {
        self.data.get(&self.local_unit).cloned().unwrap_or_default()
    }
}

impl PeerStore for Relation {
    fn local_unit(&self) -> &str {
        &self.local_unit
    }

    fn units(&self) -> Vec<String> {
        self.remote_units
            .iter()
            .cloned()
            .chain(std::iter::once(self.local_unit.clone()))
            .collect()
    }

    fn read(&self, unit: &str, key: &str) -> Option<String> {
        self.get(unit, key).map(str::to_string)
    }

    fn write(&mut self, key: &str, value: &str) {
        let databag = self.data.entry(self.local_unit.clone()).or_default();
        if value.is_empty() {
            databag.remove(key);
        } else {
            databag.insert(key.to_string(), value.to_string());
        }
    }
}

/// All relations a unit takes part in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relations {
    pub peer: Relation,
    pub cni: Vec<Relation>,
}

impl Relations {
    /// Start from an unregistered peer relation for `local_unit`
    pub fn new(local_unit: &str) -> Self {
        Self {
            peer: Relation::unregistered(endpoint::PEERS, local_unit),
            cni: Vec::new(),
        }
    }

    /// Place a loaded relation under its endpoint.
    ///
    /// A registered peer relation replacing the unregistered one inherits the
    /// local keys it does not carry yet.
    pub fn insert(&mut self, mut relation: Relation) {
        match relation.endpoint.as_str() {
            endpoint::PEERS => {
                if self.peer.id.is_none() {
                    for (key, value) in self.peer.local_data() {
                        if relation.get(relation.local_unit(), &key).is_none() {
                            relation.write(&key, &value);
                        }
                    }
                }
                self.peer = relation;
            }
            endpoint::CNI => {
                self.cni.retain(|r| r.id != relation.id);
                self.cni.push(relation);
            }
            other => tracing::debug!(endpoint = other, id = ?relation.id, "Ignoring relation"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relation> {
        std::iter::once(&self.peer).chain(self.cni.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_include_self_last() {
        let mut peer = Relation::new(1, endpoint::PEERS, "calico-enterprise/0");
        peer.add_unit("calico-enterprise/2");
        peer.add_unit("calico-enterprise/1");
        peer.add_unit("calico-enterprise/0");
        assert_eq!(
            peer.units(),
            vec!["calico-enterprise/1", "calico-enterprise/2", "calico-enterprise/0"]
        );
    }

    #[test]
    fn test_write_only_touches_local_databag() {
        let mut peer = Relation::new(1, endpoint::PEERS, "calico-enterprise/0");
        peer.set_unit_data("calico-enterprise/1", "service-cidr", "10.152.183.0/24");
        peer.write("service-cidr", "10.1.0.0/16");

        assert_eq!(peer.read("calico-enterprise/1", "service-cidr").as_deref(), Some("10.152.183.0/24"));
        assert_eq!(peer.read("calico-enterprise/0", "service-cidr").as_deref(), Some("10.1.0.0/16"));

        peer.write("service-cidr", "");
        assert!(peer.read("calico-enterprise/0", "service-cidr").is_none());
        assert!(peer.local_data().is_empty());
    }

    #[test]
    fn test_relations_insert_by_endpoint() {
        let mut relations = Relations::new("calico-enterprise/0");
        relations.insert(Relation::new(4, endpoint::CNI, "calico-enterprise/0"));
        relations.insert(Relation::new(5, endpoint::CNI, "calico-enterprise/0"));
        relations.insert(Relation::new(4, endpoint::CNI, "calico-enterprise/0"));
        relations.insert(Relation::new(2, endpoint::PEERS, "calico-enterprise/0"));
        relations.insert(Relation::new(9, "juju-info", "calico-enterprise/0"));

        assert_eq!(relations.peer.id, Some(2));
        assert_eq!(relations.cni.len(), 2);
        assert!(relations.cni.iter().any(|r| r.id == Some(5)));
        assert_eq!(relations.iter().count(), 3);
    }

    #[test]
    fn test_registered_peer_inherits_local_data() {
        let mut relations = Relations::new("calico-enterprise/0");
        assert_eq!(relations.peer.id, None);
        relations.peer.write("bgp-parameters", "{}");
        relations.peer.write("service-cidr", "10.1.0.0/16");

        let mut registered = Relation::new(0, endpoint::PEERS, "calico-enterprise/0");
        registered.write("service-cidr", "10.2.0.0/16");
        relations.insert(registered);

        assert_eq!(relations.peer.id, Some(0));
        assert_eq!(relations.peer.get("calico-enterprise/0", "bgp-parameters"), Some("{}"));
        assert_eq!(relations.peer.get("calico-enterprise/0", "service-cidr"), Some("10.2.0.0/16"));

        // a registered peer is replaced as loaded
        relations.insert(Relation::new(7, endpoint::PEERS, "calico-enterprise/0"));
        assert!(relations.peer.local_data().is_empty());
    }
}

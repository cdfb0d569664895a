//! Event handlers converging the unit towards a configured Calico Enterprise.

mod events;
mod preflight;

pub use events::Event;

use serde::Deserialize;

use crate::config::{CharmConfig, Config, NicAutodetection};
use crate::early_network::{EarlyNetwork, HostIntrospection};
use crate::error::Error;
use crate::kubectl::{CommandError, Kubectl, Manifest, ManifestApplier, Tolerate};
use crate::models::{namespace, relation_key, BgpLayout, StoredState};
use crate::peer::{self, PeerConsensus, PeerEvent};
use crate::relation::{PeerStore, Relation, Relations};
use crate::status::{operator_pod_health, UnitStatus, NODE_CONFIGURED};
use crate::templates::{Renderer, PULL_SECRET};

const WAITING_FOR_CNI: &str = "Waiting for CNI relation";

/// CNI config file handed to the kubelet
pub const CNI_CONF_FILE: &str = "10-calico.conflist";

/// Attempts made while waiting for the operator pod
pub const READINESS_ATTEMPTS: u32 = 10;

const OPERATOR_SELECTOR: &str = "k8s-app=tigera-operator";

/// Calico Enterprise release deployed for each Kubernetes minor version
pub const TIGERA_DISTRO_VERSIONS: &[(&str, &str)] = &[("1.26", "3.16.1"), ("1.25", "3.15.2")];

/// Charm drives one unit through a single event
pub struct Charm<K, H> {
    runtime: Config,
    config: CharmConfig,
    peers: PeerConsensus<Relation>,
    cni: Vec<Relation>,
    state: StoredState,
    status: UnitStatus,
    applier: ManifestApplier<K>,
    early_network: EarlyNetwork<H>,
    renderer: Renderer,
}

impl<K: Kubectl, H: HostIntrospection> Charm<K, H> {
    pub fn new(
        runtime: Config,
        config: CharmConfig,
        relations: Relations,
        kubectl: K,
        host: H,
    ) -> Result<Self, Error> {
        let early_network = EarlyNetwork::new(host, runtime.early_service_path.clone());
        let override_source = config.override_layout_source().map(str::to_string);
        Ok(Self {
            peers: PeerConsensus::new(relations.peer, override_source),
            cni: relations.cni,
            state: StoredState::default(),
            status: UnitStatus::default(),
            applier: ManifestApplier::new(kubectl),
            early_network,
            renderer: Renderer::new()?,
            runtime,
            config,
        })
    }

    pub fn with_state(mut self, state: StoredState, status: UnitStatus) -> Self {
        self.state = state;
        self.status = status;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> &StoredState {
        &self.state
    }

    #[cfg(test)]
    pub fn status(&self) -> &UnitStatus {
        &self.status
    }

    #[cfg(test)]
    pub fn relations(&self) -> Relations {
        Relations {
            peer: self.peers.store().clone(),
            cni: self.cni.clone(),
        }
    }

    pub fn into_parts(self) -> (Relations, StoredState, UnitStatus) {
        let relations = Relations {
            peer: self.peers.into_store(),
            cni: self.cni,
        };
        (relations, self.state, self.status)
    }

    pub async fn dispatch(&mut self, event: &Event) {
        tracing::info!(event = event.name(), unit = %self.runtime.unit_name, "Handling event");
        match event {
            Event::Install => self.on_install(),
            Event::Start | Event::ConfigChanged => self.on_config_changed().await,
            Event::UpgradeCharm | Event::PeerRelationChanged { .. } => match self.peers.on_peer_event(&self.early_network) {
                PeerEvent::BgpParametersChanged => self.on_config_changed().await,
            },
            Event::CniRelationChanged {
                relation_id,
                remote_unit,
            } => {
                self.on_cni_relation_changed(*relation_id, remote_unit.as_deref())
                    .await
            }
            Event::RelationDeparted { .. } | Event::RelationBroken { .. } => self.on_relation_departed().await,
            Event::UpdateStatus => self.on_update_status().await,
            Event::Remove => tracing::info!("Nothing to clean up on remove"),
        }
    }

    fn set_status(&mut self, status: UnitStatus) {
        if status != self.status {
            tracing::info!(%status, "Unit status changed");
        }
        self.status = status;
    }

    pub fn on_install(&mut self) {
        if self.config.disable_early_network {
            tracing::info!("Early networking disabled, nothing to install");
            return;
        }

        if !self.peers.publish_self(&self.early_network) {
            tracing::info!("Local bgp parameters not available yet");
        }

        let Some(layout) = self.peers.override_layout() else {
            return;
        };
        let manifest = match peer::early_network_manifest(&layout) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!("Failed to generate early network configuration: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .early_network
            .write_host_config(&self.runtime.early_network_config_path, &manifest)
        {
            tracing::warn!(
                path = %self.runtime.early_network_config_path.display(),
                "Failed to write early network configuration: {}",
                e
            );
        }
    }

    pub async fn on_config_changed(&mut self) {
        self.state.tigera_configured = false;
        match self.reconcile().await {
            Ok(()) => {
                self.state.tigera_configured = true;
                self.set_status(UnitStatus::active(NODE_CONFIGURED));
            }
            Err(e) => {
                match &e {
                    Error::Command { .. } | Error::Io(_) => tracing::error!("Configuration cycle stopped: {}", e),
                    _ => tracing::warn!("Configuration cycle stopped: {}", e),
                }
                self.set_status(e.status());
            }
        }
    }

    async fn reconcile(&mut self) -> Result<(), Error> {
        let layout = self.peers.effective_layout();
        preflight::check(&self.config, &layout)?;

        let registry = self.cni_registry().ok_or_else(|| Error::not_ready(WAITING_FOR_CNI))?;

        if !self.runtime.is_leader {
            tracing::info!("Kubernetes is up but this unit is not the leader, leaving the cluster alone");
            return Ok(());
        }

        self.pre_init(&layout).await?;

        self.set_status(UnitStatus::maintenance("Configuring image secret and license file..."));
        self.configure_pull_secret(&registry).await?;

        self.set_status(UnitStatus::maintenance("Applying Tigera Operator"));
        self.apply_operator().await?;
        self.apply_license().await?;

        self.set_status(UnitStatus::maintenance("Generating bgp yamls..."));
        self.configure_bgp(&layout).await?;

        self.set_status(UnitStatus::maintenance("Applying Installation CRD"));
        let nic = self.config.nic_autodetection()?;
        self.apply_installation(&registry, &nic).await?;

        if self.config.addons {
            self.set_status(UnitStatus::maintenance("Applying Addons"));
            let addons = self.renderer.addons(&self.config)?;
            let result = self.applier.apply(&Manifest::Inline(addons), None).await;
            settle(result, Tolerate::Nothing, "Failed to apply addons")?;
        }

        self.wait_for_operator().await;
        Ok(())
    }

    /// Registry to pull from, once every CNI fact and the kubeconfig are in
    fn cni_registry(&self) -> Option<String> {
        self.peers.service_cidr()?;
        if !self.kubeconfig_available() {
            return None;
        }
        Some(self.config.image_registry.trim())
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .or_else(|| self.peers.image_registry())
    }

    /// A remote cni unit has rendered its kubeconfig
    fn kubeconfig_available(&self) -> bool {
        self.cni.iter().any(|relation| {
            relation.remote_units().any(|unit| {
                relation
                    .get(unit, relation_key::KUBECONFIG_HASH)
                    .is_some_and(|hash| !hash.is_empty())
            })
        })
    }

    /// Namespaces, rack labels and the bgp-layout ConfigMap
    async fn pre_init(&mut self, layout: &BgpLayout) -> Result<(), Error> {
        if !self.runtime.kubeconfig_path.exists() {
            return Err(Error::not_ready("Waiting for Kubeconfig to become available"));
        }
        let nodes = layout.renderable_nodes();
        if nodes.is_empty() {
            return Err(Error::not_ready("Waiting for BGP layout"));
        }

        for ns in namespace::ALL {
            let result = self.applier.create_namespace(ns).await;
            settle(result, Tolerate::AlreadyExists, &format!("Failed to create namespace {}", ns))?;
        }

        for node in nodes {
            let Some(hostname) = node.hostname() else {
                continue;
            };
            let result = self.applier.label_node(hostname, "rack", &node.labels.rack).await;
            if settle(result, Tolerate::NotFound, &format!("Failed to label node {}", hostname))?.is_none() {
                tracing::warn!("Node labelling failed. Does {} exist?", hostname);
            }
        }

        let config_map = peer::bgp_layout_config_map(layout)?;
        let result = self
            .applier
            .apply(&Manifest::Inline(config_map), Some(namespace::CALICO_SYSTEM))
            .await;
        settle(result, Tolerate::Nothing, "Failed to apply bgp-layout")?;
        Ok(())
    }

    async fn configure_pull_secret(&self, registry: &str) -> Result<(), Error> {
        let credentials = self.config.registry_credentials()?;

        let result = self
            .applier
            .delete("secret", PULL_SECRET, namespace::TIGERA_OPERATOR)
            .await;
        settle(result, Tolerate::NotFound, "Failed to remove the image pull secret")?;

        let username = format!("--docker-username={}", credentials.username);
        let password = format!("--docker-password={}", credentials.password);
        let server = format!("--docker-server={}", registry);
        let result = self
            .applier
            .execute(&[
                "create",
                "secret",
                "docker-registry",
                PULL_SECRET,
                &username,
                &password,
                &server,
                "-n",
                namespace::TIGERA_OPERATOR,
            ])
            .await;
        settle(result, Tolerate::AlreadyExists, "Failed to create the image pull secret")?;
        Ok(())
    }

    async fn apply_operator(&self) -> Result<(), Error> {
        for path in [&self.runtime.operator_manifest_path, &self.runtime.crd_manifest_path] {
            if !path.is_file() {
                tracing::error!(path = %path.display(), "Tigera resource missing");
                return Err(Error::config(
                    "Could not get tigera manifest resources. Check juju debug-log.",
                ));
            }
            let result = self.applier.create(&Manifest::Path(path.clone()), None).await;
            if settle(result, Tolerate::AlreadyExists, "Failed to create the tigera operator")?.is_none() {
                tracing::warn!(path = %path.display(), "Tigera resources already present");
            }
        }
        Ok(())
    }

    async fn apply_license(&self) -> Result<(), Error> {
        let license = self.config.license_manifest()?;
        let result = self.applier.apply(&Manifest::Inline(license), None).await;
        settle(result, Tolerate::Nothing, "Failed to apply the license")?;
        Ok(())
    }

    async fn configure_bgp(&self, layout: &BgpLayout) -> Result<(), Error> {
        let peers = layout.peer_bindings();
        if peers.is_empty() {
            tracing::warn!("BGP layout has no peerings, skipping BGPPeer resources");
        } else {
            let manifest = self.renderer.bgp_peers(&peers)?;
            let result = self
                .applier
                .apply(&Manifest::Inline(manifest), Some(namespace::TIGERA_OPERATOR))
                .await;
            settle(result, Tolerate::Nothing, "Failed to apply BGP peers")?;
        }

        let pools = self.renderer.ip_pools(&self.config)?;
        let result = self
            .applier
            .apply(&Manifest::Inline(pools), Some(namespace::TIGERA_OPERATOR))
            .await;
        settle(result, Tolerate::Nothing, "Failed to apply IP pools")?;
        Ok(())
    }

    async fn apply_installation(&self, registry: &str, nic: &NicAutodetection) -> Result<(), Error> {
        let installation = self.renderer.installation(&self.config, registry, nic)?;
        let result = self.applier.apply(&Manifest::Inline(installation), None).await;
        settle(result, Tolerate::Nothing, "Failed to apply the Installation")?;

        let bgp_configuration = self.peers.bgp_configuration()?;
        let result = self.applier.apply(&Manifest::Inline(bgp_configuration), None).await;
        settle(result, Tolerate::Nothing, "Failed to apply the BGPConfiguration")?;
        Ok(())
    }

    /// Poll until the operator pod is ready; returns whether it became ready
    async fn wait_for_operator(&mut self) -> bool {
        for attempt in 0..READINESS_ATTEMPTS {
            self.set_status(UnitStatus::maintenance(format!(
                "Wait #{} for the tigera operator...",
                attempt
            )));
            let result = self
                .applier
                .execute(&[
                    "wait",
                    "-n",
                    namespace::TIGERA_OPERATOR,
                    "--for=condition=ready",
                    "pod",
                    "-l",
                    OPERATOR_SELECTOR,
                ])
                .await;
            match result {
                Ok(output) if output.contains("met") => return true,
                Ok(_) => {}
                Err(e) => tracing::debug!("Tigera operator not ready yet: {}", e),
            }
            if attempt + 1 < READINESS_ATTEMPTS {
                tokio::time::sleep(self.runtime.readiness_retry_delay).await;
            }
        }
        tracing::warn!("Tigera operator not ready after {} attempts", READINESS_ATTEMPTS);
        false
    }

    pub async fn on_update_status(&mut self) {
        if !self.state.tigera_configured {
            return;
        }
        if self.cni_registry().is_none() {
            self.set_status(UnitStatus::waiting(WAITING_FOR_CNI));
            return;
        }

        let result = self
            .applier
            .execute(&["get", "pods", "-n", namespace::TIGERA_OPERATOR, "-l", OPERATOR_SELECTOR, "-o", "json"])
            .await;
        let status = match result {
            Ok(output) => match operator_pod_health(&output) {
                Ok(health) => health.status(),
                Err(e) => {
                    tracing::warn!("Unreadable tigera-operator pod list: {}", e);
                    UnitStatus::waiting("Unable to read tigera-operator pod status")
                }
            },
            Err(e) => {
                tracing::warn!("Failed to query tigera-operator pod: {}", e);
                UnitStatus::waiting("Unable to query tigera-operator pod")
            }
        };
        self.set_status(status);
    }

    /// Departed units and broken relations are already out of the loaded
    /// relations; converge against what is left
    pub async fn on_relation_departed(&mut self) {
        if self.cni.is_empty() {
            self.state.tigera_cni_configured = false;
        }
        self.on_config_changed().await;
    }

    pub async fn on_cni_relation_changed(&mut self, relation_id: i64, remote_unit: Option<&str>) {
        if !self.state.tigera_configured {
            self.on_config_changed().await;
        }

        let forwarded = self.forward_cni_data(relation_id, remote_unit);
        let cycle_status = self.status.clone();
        self.configure_cni_relation();

        // the cycle may have stopped waiting for the facts just forwarded
        if forwarded && !self.state.tigera_configured {
            self.on_config_changed().await;
        } else {
            self.set_status(cycle_status);
        }

        if self.state.tigera_configured && self.state.tigera_cni_configured {
            self.set_status(UnitStatus::active(NODE_CONFIGURED));
            self.record_workload_version().await;
        }
    }

    /// Copy CNI facts from the remote unit into the local peer databag
    fn forward_cni_data(&mut self, relation_id: i64, remote_unit: Option<&str>) -> bool {
        let (Some(relation), Some(unit)) = (self.cni.iter().find(|r| r.id == Some(relation_id)), remote_unit) else {
            tracing::debug!(relation_id, "No remote unit to forward CNI data from");
            return false;
        };

        let mut changed = false;
        for key in relation_key::FORWARDED_FROM_CNI {
            let Some(value) = relation.get(unit, key).filter(|v| !v.is_empty()) else {
                continue;
            };
            tracing::debug!(key, value, "Forwarding CNI data");
            if self.peers.store().get(self.peers.store().local_unit(), key) != Some(value) {
                self.peers.store_mut().write(key, value);
                changed = true;
            }
        }
        changed
    }

    /// Publish the pod CIDR and CNI config file on every cni relation
    pub fn configure_cni_relation(&mut self) {
        self.set_status(UnitStatus::maintenance("Configuring CNI relation"));
        let cidr = self.config.pod_cidr.trim().to_string();
        for relation in &mut self.cni {
            relation.write(relation_key::CIDR, &cidr);
            relation.write(relation_key::CNI_CONF_FILE, CNI_CONF_FILE);
        }
        self.state.tigera_cni_configured = !self.cni.is_empty();
    }

    async fn record_workload_version(&mut self) {
        let output = match self.applier.execute(&["version", "-o", "json"]).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Failed to read the Kubernetes version: {}", e);
                return;
            }
        };
        let Some(kubernetes) = kubernetes_minor_version(&output) else {
            tracing::warn!("Unrecognised kubectl version output");
            return;
        };
        match TIGERA_DISTRO_VERSIONS.iter().find(|(k8s, _)| *k8s == kubernetes) {
            Some((_, tigera)) => {
                tracing::info!(kubernetes = %kubernetes, tigera = *tigera, "Recorded workload version");
                self.state.workload_version = Some(tigera.to_string());
            }
            None => tracing::warn!(kubernetes = %kubernetes, "No Calico Enterprise release known for this Kubernetes version"),
        }
    }
}

/// Accept allow-listed failures; returns `None` when a failure was tolerated
fn settle(result: Result<String, CommandError>, tolerate: Tolerate, context: &str) -> Result<Option<String>, Error> {
    match result {
        Ok(output) => Ok(Some(output)),
        Err(e) if tolerate.matches(&e) => {
            tracing::debug!("{} (tolerated): {}", context, e.stderr());
            Ok(None)
        }
        Err(e) => {
            tracing::error!(stderr = e.stderr(), "{}", context);
            Err(Error::command(context, e))
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "serverVersion")]
    server: ServerVersion,
}

#[derive(Debug, Deserialize)]
struct ServerVersion {
    major: String,
    minor: String,
}

/// Server `major.minor` from `kubectl version -o json`, e.g. "1.26"
fn kubernetes_minor_version(output: &str) -> Option<String> {
    let info: VersionInfo = serde_json::from_str(output).ok()?;
    let minor: String = info.server.minor.chars().take_while(char::is_ascii_digit).collect();
    if info.server.major.is_empty() || minor.is_empty() {
        return None;
    }
    Some(format!("{}.{}", info.server.major, minor))
}

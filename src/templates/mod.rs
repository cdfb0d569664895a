use serde::Serialize;
use std::collections::BTreeSet;
use tera::{Context, Tera};

use crate::config::{CharmConfig, NicAutodetection};
use crate::error::Error;
use crate::models::BgpPeerBinding;

/// Template names registered with the renderer
pub mod template {
    pub const BGP_PEERS: &str = "bgppeer.yaml";
    pub const IP_POOLS: &str = "ippools.yaml";
    pub const INSTALLATION: &str = "calico_enterprise_install.yaml";
    pub const ADDONS: &str = "addons.yaml";
}

/// Pull secret referenced by the Installation
pub const PULL_SECRET: &str = "tigera-pull-secret";

const SOURCES: &[(&str, &str)] = &[
    (template::BGP_PEERS, include_str!("../../templates/bgppeer.yaml.tera")),
    (template::IP_POOLS, include_str!("../../templates/ippools.yaml.tera")),
    (
        template::INSTALLATION,
        include_str!("../../templates/calico_enterprise_install.yaml.tera"),
    ),
    (template::ADDONS, include_str!("../../templates/addons.yaml.tera")),
];

/// Renderer holds the manifest templates shipped with the charm
pub struct Renderer {
    tera: Tera,
}

impl Renderer {
    pub fn new() -> Result<Self, Error> {
        let mut tera = Tera::default();
        for (name, source) in SOURCES {
            tera.add_raw_template(name, source).map_err(|source| Error::Render {
                template: name.to_string(),
                source,
            })?;
        }
        Ok(Self { tera })
    }

    pub fn render(&self, name: &str, context: &Context) -> Result<String, Error> {
        self.tera.render(name, context).map_err(|source| Error::Render {
            template: name.to_string(),
            source,
        })
    }

    pub fn bgp_peers(&self, peers: &BTreeSet<BgpPeerBinding>) -> Result<String, Error> {
        #[derive(Serialize)]
        struct Peer<'a> {
            name: String,
            ip: String,
            asn: u32,
            rack: &'a str,
        }

        let peers: Vec<Peer<'_>> = peers
            .iter()
            .map(|p| Peer {
                name: p.resource_name(),
                ip: p.ip.to_string(),
                asn: p.asn,
                rack: &p.rack,
            })
            .collect();
        let mut context = Context::new();
        context.insert("peers", &peers);
        self.render(template::BGP_PEERS, &context)
    }

    pub fn ip_pools(&self, config: &CharmConfig) -> Result<String, Error> {
        let mut context = Context::new();
        context.insert("pod_cidr", config.pod_cidr.trim());
        context.insert("pod_cidr_block_size", &config.pod_cidr_block_size);
        context.insert("stable_ip_cidr", config.stable_ip_cidr.trim());
        self.render(template::IP_POOLS, &context)
    }

    pub fn installation(
        &self,
        config: &CharmConfig,
        registry: &str,
        nic: &NicAutodetection,
    ) -> Result<String, Error> {
        let mut context = Context::new();
        context.insert("pull_secret", PULL_SECRET);
        context.insert("image_registry", registry);
        context.insert("image_path", &config.image_path);
        context.insert("image_prefix", &config.image_prefix);
        context.insert("nic_key", nic.key());
        context.insert("nic_value", &nic.value());
        self.render(template::INSTALLATION, &context)
    }

    pub fn addons(&self, config: &CharmConfig) -> Result<String, Error> {
        let mut context = Context::new();
        context.insert("addons_storage_class", &config.addons_storage_class);
        self.render(template::ADDONS, &context)
    }
}

use base64::{engine::general_purpose::STANDARD, Engine};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;

use crate::error::Error;

/// CharmConfig holds the operator-facing options of the charm
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CharmConfig {
    /// Optional YAML list of nodes that replaces the peer-built layout
    pub bgp_parameters: String,
    pub pod_cidr: String,
    pub stable_ip_cidr: String,
    pub pod_cidr_block_size: u8,
    pub image_registry: String,
    /// `user:password`, plain or base64 encoded
    pub image_registry_secret: String,
    pub image_path: String,
    pub image_prefix: String,
    /// Base64 encoded license manifest
    pub license: String,
    pub nic_autodetection_regex: String,
    pub nic_autodetection_skip_interface: bool,
    /// Comma separated list of CIDRs
    pub nic_autodetection_cidrs: String,
    pub addons: bool,
    pub addons_storage_class: String,
    pub disable_early_network: bool,
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            bgp_parameters: String::new(),
            pod_cidr: "192.168.0.0/16".to_string(),
            stable_ip_cidr: String::new(),
            pod_cidr_block_size: 26,
            image_registry: String::new(),
            image_registry_secret: String::new(),
            image_path: String::new(),
            image_prefix: String::new(),
            license: String::new(),
            nic_autodetection_regex: String::new(),
            nic_autodetection_skip_interface: false,
            nic_autodetection_cidrs: String::new(),
            addons: false,
            addons_storage_class: String::new(),
            disable_early_network: false,
        }
    }
}

/// Docker registry login decoded from `image_registry_secret`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Host address autodetection method written into the Installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicAutodetection {
    SkipInterface(String),
    Interface(String),
    Cidrs(Vec<IpNet>),
}

impl NicAutodetection {
    /// Field name under `nodeAddressAutodetectionV4`
    pub fn key(&self) -> &'static str {
        match self {
            Self::SkipInterface(_) => "skipInterface",
            Self::Interface(_) => "interface",
            Self::Cidrs(_) => "cidrs",
        }
    }

    pub fn value(&self) -> serde_json::Value {
        match self {
            Self::SkipInterface(regex) | Self::Interface(regex) => serde_json::Value::from(regex.as_str()),
            Self::Cidrs(cidrs) => cidrs.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl CharmConfig {
    /// Load the options file written by the unit agent.
    ///
    /// A missing or empty file yields the defaults; an option of the wrong
    /// type is a config error naming it.
    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_yaml(&raw).map_err(|e| Error::config(format!("Invalid charm config: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Charm config not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// Operator override layout source, if one is set
    pub fn override_layout_source(&self) -> Option<&str> {
        Some(self.bgp_parameters.as_str()).filter(|s| !s.trim().is_empty())
    }

    /// Decode `image_registry_secret` into a username and password
    pub fn registry_credentials(&self) -> Result<RegistryCredentials, Error> {
        let raw = self.image_registry_secret.trim();
        if raw.is_empty() {
            return Err(Error::config("Registry secret is required"));
        }
        let decoded = decode_base64(raw).filter(|s| s.contains(':'));
        let secret = decoded.as_deref().unwrap_or(raw);
        match secret.split_once(':') {
            Some((username, password)) if !username.is_empty() => Ok(RegistryCredentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
            _ => Err(Error::config(
                "'image_registry_secret' config must be formatted as 'user:password'",
            )),
        }
    }

    /// License manifest decoded from base64
    pub fn license_manifest(&self) -> Result<String, Error> {
        let raw = self.license.trim();
        if raw.is_empty() {
            return Err(Error::config("Missing license config"));
        }
        decode_base64(raw)
            .map(|license| license.trim_end().to_string())
            .ok_or_else(|| Error::config("'license' config is not valid base64"))
    }

    /// Resolve the autodetection method: skip-interface regex, then interface regex, then CIDR list
    pub fn nic_autodetection(&self) -> Result<NicAutodetection, Error> {
        let regex = self.nic_autodetection_regex.trim();
        if !regex.is_empty() {
            regex_lite::Regex::new(regex).map_err(|e| {
                Error::config(format!("'nic_autodetection_regex' config is not a valid regex: {}", e))
            })?;
            return Ok(if self.nic_autodetection_skip_interface {
                NicAutodetection::SkipInterface(regex.to_string())
            } else {
                NicAutodetection::Interface(regex.to_string())
            });
        }

        let cidrs = self
            .nic_autodetection_cidrs
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| {
                parse_cidr(c).ok_or_else(|| {
                    Error::config(format!("'nic_autodetection_cidrs' entry '{}' is not valid CIDR", c))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if cidrs.is_empty() {
            return Err(Error::config(
                "NIC Autodetection settings are required. (nic_autodetection_* settings.)",
            ));
        }
        Ok(NicAutodetection::Cidrs(cidrs))
    }

    pub fn pod_network(&self) -> Result<IpNet, Error> {
        parse_cidr(&self.pod_cidr).ok_or_else(|| Error::config("'pod_cidr' config is not valid CIDR"))
    }

    pub fn stable_network(&self) -> Result<IpNet, Error> {
        parse_cidr(&self.stable_ip_cidr).ok_or_else(|| Error::config("'stable_ip_cidr' config is not valid CIDR"))
    }
}

/// Parse a network CIDR. Host bits must be clear; a bare address is a single-host network.
pub fn parse_cidr(value: &str) -> Option<IpNet> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return (net.trunc() == net).then_some(net);
    }
    value.parse::<IpAddr>().ok().map(IpNet::from)
}

fn decode_base64(raw: &str) -> Option<String> {
    let bytes = STANDARD.decode(raw).ok()?;
    String::from_utf8(bytes).ok()
}

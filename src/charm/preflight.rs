use crate::config::CharmConfig;
use crate::error::Error;
use crate::models::BgpLayout;

/// Checks run before the cycle touches anything; every failure blocks the unit
pub fn check(config: &CharmConfig, layout: &BgpLayout) -> Result<(), Error> {
    if layout.is_empty() {
        return Err(Error::config("BGP configuration is required."));
    }

    config.registry_credentials()?;

    if config.license.trim().is_empty() {
        return Err(Error::config("Missing license config"));
    }

    let pod_network = config.pod_network()?;
    config.stable_network()?;

    let block_size = config.pod_cidr_block_size;
    if block_size < pod_network.prefix_len() || block_size > pod_network.max_prefix_len() {
        return Err(Error::config(format!(
            "'pod_cidr_block_size' must be between {} and {}",
            pod_network.prefix_len(),
            pod_network.max_prefix_len()
        )));
    }

    if config.addons && config.addons_storage_class.trim().is_empty() {
        return Err(Error::config(
            "'addons_storage_class' config is required when addons are enabled",
        ));
    }

    Ok(())
}

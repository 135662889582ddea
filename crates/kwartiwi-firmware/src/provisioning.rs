//! First-boot configuration defaults
//!
//! Values come from the build environment (see `build.rs`) and are only
//! written for keys that are still missing, so anything saved at runtime
//! survives a reflash.

use kwartiwi_core::config::{
    ConfigError, ConfigStore, is_setup_complete, keys, set_setup_complete,
};
use log::info;

const DEFAULT_HOSTNAME: &str = "kwartiwi";
const DEFAULT_INSTANCE: &str = "kwartiwi energy display";

/// (namespace, key, value) triples baked into this build
fn defaults() -> [(&'static str, &'static str, Option<&'static str>); 5] {
    [
        (
            keys::NETWORKING,
            keys::STATION_SSID,
            option_env!("KWARTIWI_WIFI_SSID"),
        ),
        (
            keys::NETWORKING,
            keys::STATION_PASS,
            option_env!("KWARTIWI_WIFI_PASSWORD"),
        ),
        (
            keys::NETWORKING,
            keys::HOSTNAME,
            Some(option_env!("KWARTIWI_HOSTNAME").unwrap_or(DEFAULT_HOSTNAME)),
        ),
        (
            keys::NETWORKING,
            keys::MDNS_INSTANCE,
            Some(option_env!("KWARTIWI_MDNS_INSTANCE").unwrap_or(DEFAULT_INSTANCE)),
        ),
        (
            keys::WEB_CLIENT,
            keys::SERVER_HOST,
            option_env!("KWARTIWI_SERVER_HOST"),
        ),
    ]
}

/// Write every build-time default whose key is absent, then commit.
/// Returns the number of keys written. Setup counts as complete once station
/// credentials are stored.
pub fn seed_missing<S: ConfigStore + ?Sized>(store: &mut S) -> Result<usize, ConfigError> {
    let mut written = 0;
    for (namespace, key, value) in defaults() {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        if store.get(namespace, key)?.is_some() {
            continue;
        }
        info!("Provisioning {}/{}", namespace, key);
        store.set_str(namespace, key, value)?;
        written += 1;
    }

    if written > 0 {
        store.commit()?;
    }

    // A device with station credentials needs no further setup
    if !is_setup_complete(store)? && store.get(keys::NETWORKING, keys::STATION_SSID)?.is_some() {
        info!("Station credentials present, marking setup complete");
        set_setup_complete(store, true)?;
    }
    Ok(written)
}

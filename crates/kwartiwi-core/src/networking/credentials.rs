use core::str::FromStr;

use log::warn;

use crate::config::{ConfigError, ConfigStore, keys};

use super::driver::SSID_MAX_LEN;

pub const PASSPHRASE_MAX_LEN: usize = 64;
pub const HOSTNAME_MAX_LEN: usize = 32;
pub const INSTANCE_NAME_MAX_LEN: usize = 32;

/// Why stored or supplied settings could not be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    /// A mandatory key is absent from the config store
    Missing(&'static str),
    /// A value does not fit its bounded buffer
    TooLong(&'static str),
    Store(ConfigError),
}

impl From<ConfigError> for CredentialsError {
    fn from(e: ConfigError) -> Self {
        Self::Store(e)
    }
}

/// Station credentials plus the identity this device announces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiConfig {
    pub ssid: heapless::String<SSID_MAX_LEN>,
    pub passphrase: heapless::String<PASSPHRASE_MAX_LEN>,
    pub hostname: heapless::String<HOSTNAME_MAX_LEN>,
    pub instance_name: heapless::String<INSTANCE_NAME_MAX_LEN>,
}

impl WifiConfig {
    pub const fn new() -> Self {
        Self {
            ssid: heapless::String::new(),
            passphrase: heapless::String::new(),
            hostname: heapless::String::new(),
            instance_name: heapless::String::new(),
        }
    }

    /// Read the `networking` namespace.
    ///
    /// Missing credentials only produce a warning since the setup flow can
    /// provide them later. Hostname and instance name are mandatory.
    pub fn load<S: ConfigStore + ?Sized>(store: &mut S) -> Result<Self, CredentialsError> {
        let mut config = Self::new();

        match store.get_str(keys::NETWORKING, keys::STATION_SSID)? {
            Some(ssid) => config.ssid = bounded(&ssid, keys::STATION_SSID)?,
            None => warn!("No station SSID stored"),
        }
        match store.get_str(keys::NETWORKING, keys::STATION_PASS)? {
            Some(pass) => config.passphrase = bounded(&pass, keys::STATION_PASS)?,
            None => warn!("No station passphrase stored"),
        }

        let hostname = store
            .get_str(keys::NETWORKING, keys::HOSTNAME)?
            .ok_or(CredentialsError::Missing(keys::HOSTNAME))?;
        config.hostname = bounded(&hostname, keys::HOSTNAME)?;

        let instance = store
            .get_str(keys::NETWORKING, keys::MDNS_INSTANCE)?
            .ok_or(CredentialsError::Missing(keys::MDNS_INSTANCE))?;
        config.instance_name = bounded(&instance, keys::MDNS_INSTANCE)?;

        Ok(config)
    }

    pub fn set_credentials(&mut self, ssid: &str, passphrase: &str) -> Result<(), CredentialsError> {
        let ssid = bounded(ssid, keys::STATION_SSID)?;
        let passphrase = bounded(passphrase, keys::STATION_PASS)?;
        self.ssid = ssid;
        self.passphrase = passphrase;
        Ok(())
    }

    /// Write SSID and passphrase and commit
    pub fn save_credentials<S: ConfigStore + ?Sized>(&self, store: &mut S) -> Result<(), ConfigError> {
        store.set_str(keys::NETWORKING, keys::STATION_SSID, &self.ssid)?;
        store.set_str(keys::NETWORKING, keys::STATION_PASS, &self.passphrase)?;
        store.commit()
    }

    pub fn has_credentials(&self) -> bool {
        !self.ssid.is_empty()
    }
}

fn bounded<const N: usize>(
    value: &str,
    key: &'static str,
) -> Result<heapless::String<N>, CredentialsError> {
    heapless::String::from_str(value).map_err(|_| CredentialsError::TooLong(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;

    fn provisioned() -> MemoryConfigStore {
        let mut store = MemoryConfigStore::new();
        store.set_str(keys::NETWORKING, keys::HOSTNAME, "kwartiwi-display").unwrap();
        store.set_str(keys::NETWORKING, keys::MDNS_INSTANCE, "Kwartiwi Display").unwrap();
        store
    }

    #[test]
    fn test_load_without_credentials() {
        let config = WifiConfig::load(&mut provisioned()).unwrap();
        assert!(!config.has_credentials());
        assert_eq!(config.hostname.as_str(), "kwartiwi-display");
        assert_eq!(config.instance_name.as_str(), "Kwartiwi Display");
    }

    #[test]
    fn test_missing_hostname_is_error() {
        let mut store = MemoryConfigStore::new();
        store.set_str(keys::NETWORKING, keys::MDNS_INSTANCE, "x").unwrap();
        assert_eq!(
            WifiConfig::load(&mut store),
            Err(CredentialsError::Missing(keys::HOSTNAME))
        );
    }

    #[test]
    fn test_missing_instance_is_error() {
        let mut store = MemoryConfigStore::new();
        store.set_str(keys::NETWORKING, keys::HOSTNAME, "x").unwrap();
        assert_eq!(
            WifiConfig::load(&mut store),
            Err(CredentialsError::Missing(keys::MDNS_INSTANCE))
        );
    }

    #[test]
    fn test_overlong_ssid_rejected() {
        let mut config = WifiConfig::new();
        let long = "s".repeat(SSID_MAX_LEN + 1);
        assert_eq!(
            config.set_credentials(&long, "secret"),
            Err(CredentialsError::TooLong(keys::STATION_SSID))
        );
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_save_and_reload_credentials() {
        let mut store = provisioned();
        let mut config = WifiConfig::load(&mut store).unwrap();
        config.set_credentials("home", "hunter22").unwrap();
        config.save_credentials(&mut store).unwrap();

        let reloaded = WifiConfig::load(&mut store).unwrap();
        assert_eq!(reloaded.ssid.as_str(), "home");
        assert_eq!(reloaded.passphrase.as_str(), "hunter22");
    }
}

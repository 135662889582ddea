//! Persistent configuration access
//!
//! Components read and write their settings through the [`ConfigStore`]
//! trait using namespaced keys. Writes only become durable after
//! [`ConfigStore::commit`].
//!
//! [`MemoryConfigStore`] keeps the entries in RAM and can serialize itself
//! into a single checksummed image, which is what the firmware writes to its
//! configuration flash sector.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Namespaces and keys used by the core
pub mod keys {
    pub const NETWORKING: &str = "networking";
    pub const STATION_SSID: &str = "station_ssid";
    pub const STATION_PASS: &str = "station_pass";
    pub const HOSTNAME: &str = "hostname";
    pub const MDNS_INSTANCE: &str = "mdns_instance";

    pub const TOUCH: &str = "tsc2046";
    pub const CALIBRATION: &str = "cal_data";

    pub const WEB_CLIENT: &str = "web_client";
    pub const SERVER_HOST: &str = "srv-host";

    pub const GENERAL: &str = "general";
    pub const SETUP_DONE: &str = "setup_done";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Storage backend error: {0}")]
    Backend(heapless::String<64>),
    #[error("Stored value is not valid")]
    InvalidValue,
    #[error("Configuration image is corrupted")]
    Corrupted,
    #[error("Configuration does not fit the storage area")]
    TooLarge,
}

/// Key/value storage with get/set/commit semantics
pub trait ConfigStore {
    /// Read a value, `None` if the key was never written
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, ConfigError>;

    fn set(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), ConfigError>;

    /// Make all previous writes durable
    fn commit(&mut self) -> Result<(), ConfigError>;

    fn get_str(&mut self, namespace: &str, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(namespace, key)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue),
            None => Ok(None),
        }
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        self.set(namespace, key, value.as_bytes())
    }
}

/// Whether the first-run setup flow has been completed
pub fn is_setup_complete<S: ConfigStore + ?Sized>(store: &mut S) -> Result<bool, ConfigError> {
    Ok(matches!(
        store.get(keys::GENERAL, keys::SETUP_DONE)?.as_deref(),
        Some([flag]) if *flag != 0
    ))
}

pub fn set_setup_complete<S: ConfigStore + ?Sized>(
    store: &mut S,
    done: bool,
) -> Result<(), ConfigError> {
    store.set(keys::GENERAL, keys::SETUP_DONE, &[done as u8])?;
    store.commit()
}

// ============================================================================
// In-memory store and its flash image
// ============================================================================

const IMAGE_MAGIC: u32 = 0x4643_574B; // "KWCF"
const IMAGE_VERSION: u8 = 1;
/// magic (4) + version (1) + payload length (4) + checksum (4)
pub const IMAGE_HEADER_LEN: usize = 13;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entries {
    map: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

/// Configuration entries held in RAM
#[derive(Debug, Default, Clone)]
pub struct MemoryConfigStore {
    entries: Entries,
    dirty: bool,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when there are writes that have not been committed yet
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Serialize all entries into a checksummed image
    pub fn to_image(&self) -> Result<Vec<u8>, ConfigError> {
        let payload = postcard::to_allocvec(&self.entries).map_err(|_| ConfigError::TooLarge)?;
        let len = u32::try_from(payload.len()).map_err(|_| ConfigError::TooLarge)?;

        let mut image = Vec::with_capacity(IMAGE_HEADER_LEN + payload.len());
        image.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        image.push(IMAGE_VERSION);
        image.extend_from_slice(&len.to_le_bytes());
        image.extend_from_slice(&checksum32(&payload).to_le_bytes());
        image.extend_from_slice(&payload);
        Ok(image)
    }

    /// Rebuild a store from an image.
    ///
    /// Erased or foreign storage yields an empty store; an image with our
    /// magic but a bad checksum is reported as corrupted.
    pub fn from_image(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() < IMAGE_HEADER_LEN {
            return Ok(Self::new());
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != IMAGE_MAGIC {
            debug!("No configuration image found, starting empty");
            return Ok(Self::new());
        }
        if bytes[4] != IMAGE_VERSION {
            warn!("Unsupported configuration image version {}", bytes[4]);
            return Err(ConfigError::Corrupted);
        }

        let len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let expected = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
        let payload = bytes
            .get(IMAGE_HEADER_LEN..IMAGE_HEADER_LEN + len)
            .ok_or(ConfigError::Corrupted)?;
        if checksum32(payload) != expected {
            return Err(ConfigError::Corrupted);
        }

        let entries = postcard::from_bytes(payload).map_err(|_| ConfigError::Corrupted)?;
        Ok(Self {
            entries,
            dirty: false,
        })
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        Ok(self
            .entries
            .map
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn set(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), ConfigError> {
        self.entries
            .map
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        self.dirty = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ConfigError> {
        self.dirty = false;
        Ok(())
    }
}

/// 32-bit FNV-1a
fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C_9DC5u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_none() {
        let mut store = MemoryConfigStore::new();
        assert_eq!(store.get(keys::NETWORKING, keys::HOSTNAME), Ok(None));
        assert_eq!(store.get_str(keys::NETWORKING, keys::HOSTNAME), Ok(None));
    }

    #[test]
    fn test_namespaces_are_separate() {
        let mut store = MemoryConfigStore::new();
        store.set_str("a", "key", "one").unwrap();
        store.set_str("b", "key", "two").unwrap();

        assert_eq!(store.get_str("a", "key").unwrap().as_deref(), Some("one"));
        assert_eq!(store.get_str("b", "key").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut store = MemoryConfigStore::new();
        store.set("a", "key", &[0xFF, 0xFE]).unwrap();
        assert_eq!(store.get_str("a", "key"), Err(ConfigError::InvalidValue));
    }

    #[test]
    fn test_setup_flag() {
        let mut store = MemoryConfigStore::new();
        assert_eq!(is_setup_complete(&mut store), Ok(false));

        set_setup_complete(&mut store, true).unwrap();
        assert_eq!(is_setup_complete(&mut store), Ok(true));
        assert!(!store.is_dirty());

        set_setup_complete(&mut store, false).unwrap();
        assert_eq!(is_setup_complete(&mut store), Ok(false));
    }

    #[test]
    fn test_image_restores_entries() {
        let mut store = MemoryConfigStore::new();
        store
            .set_str(keys::WEB_CLIENT, keys::SERVER_HOST, "meter.local")
            .unwrap();
        store.set(keys::TOUCH, keys::CALIBRATION, &[1, 2, 3]).unwrap();

        let image = store.to_image().unwrap();
        let mut restored = MemoryConfigStore::from_image(&image).unwrap();

        assert_eq!(
            restored
                .get_str(keys::WEB_CLIENT, keys::SERVER_HOST)
                .unwrap()
                .as_deref(),
            Some("meter.local")
        );
        assert_eq!(
            restored.get(keys::TOUCH, keys::CALIBRATION).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert!(!restored.is_dirty());
    }

    #[test]
    fn test_erased_flash_is_empty_store() {
        let erased = [0xFFu8; 64];
        let mut store = MemoryConfigStore::from_image(&erased).unwrap();
        assert_eq!(store.get(keys::GENERAL, keys::SETUP_DONE), Ok(None));
    }

    #[test]
    fn test_corrupted_image_is_rejected() {
        let mut store = MemoryConfigStore::new();
        store.set_str("a", "b", "c").unwrap();
        let mut image = store.to_image().unwrap();
        let last = image.len() - 1;
        image[last] ^= 0x55;

        assert!(matches!(
            MemoryConfigStore::from_image(&image),
            Err(ConfigError::Corrupted)
        ));
    }

    #[test]
    fn test_checksum_known_value() {
        // FNV-1a reference vector
        assert_eq!(checksum32(b"a"), 0xE40C_292C);
    }
}

//! Configuration persisted in one SPI flash sector
//!
//! The whole [`MemoryConfigStore`] image lives in the last sector of the
//! `nvs` data partition. Reads happen once at boot; every commit erases and
//! rewrites the sector.

use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::partitions::{
    DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType, read_partition_table,
};
use esp_rom_sys::rom::spiflash::{
    ESP_ROM_SPIFLASH_RESULT_OK, esp_rom_spiflash_erase_sector, esp_rom_spiflash_read,
    esp_rom_spiflash_unlock, esp_rom_spiflash_write,
};
use kwartiwi_core::config::{ConfigError, ConfigStore, MemoryConfigStore};
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

extern crate alloc;
use alloc::vec;
use alloc::vec::Vec;

const SECTOR_SIZE: u32 = 4096;
const FLASH_CAPACITY: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    #[error("Partition table unreadable")]
    PartitionTable,
    #[error("No writable nvs partition")]
    PartitionMissing,
    #[error("Flash ROM call failed with {0}")]
    Rom(i32),
    #[error("Unaligned flash access")]
    Unaligned,
}

impl From<FlashError> for ConfigError {
    fn from(e: FlashError) -> Self {
        let mut message = heapless::String::new();
        let _ = core::fmt::write(&mut message, format_args!("{}", e));
        ConfigError::Backend(message)
    }
}

fn rom_result(rc: i32) -> Result<(), FlashError> {
    if rc == ESP_ROM_SPIFLASH_RESULT_OK {
        Ok(())
    } else {
        Err(FlashError::Rom(rc))
    }
}

/// Direct access to the boot flash through the ROM routines
struct RomFlash;

impl RomFlash {
    fn unlock() -> Result<Self, FlashError> {
        rom_result(unsafe { esp_rom_spiflash_unlock() })?;
        Ok(Self)
    }

    /// Read whole words starting at a word-aligned address
    fn read_words(&mut self, addr: u32, words: &mut [u32]) -> Result<(), FlashError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashError::Unaligned);
        }
        let len = (words.len() * 4) as u32;
        rom_result(unsafe { esp_rom_spiflash_read(addr, words.as_mut_ptr() as *const u32, len) })
    }

    fn write_words(&mut self, addr: u32, words: &[u32]) -> Result<(), FlashError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashError::Unaligned);
        }
        let len = (words.len() * 4) as u32;
        rom_result(unsafe { esp_rom_spiflash_write(addr, words.as_ptr(), len) })
    }

    fn erase(&mut self, sector_addr: u32) -> Result<(), FlashError> {
        if !sector_addr.is_multiple_of(SECTOR_SIZE) {
            return Err(FlashError::Unaligned);
        }
        rom_result(unsafe { esp_rom_spiflash_erase_sector(sector_addr / SECTOR_SIZE) })
    }
}

impl ReadStorage for RomFlash {
    type Error = FlashError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset & !0b11;
        let skip = (offset - start) as usize;
        let mut words = vec![0u32; (skip + bytes.len()).div_ceil(4)];
        self.read_words(start, &mut words)?;

        let raw = words.iter().flat_map(|w| w.to_le_bytes());
        for (dst, src) in bytes.iter_mut().zip(raw.skip(skip)) {
            *dst = src;
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        FLASH_CAPACITY
    }
}

impl Storage for RomFlash {
    /// Word-aligned writes into already erased flash only
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if !bytes.len().is_multiple_of(4) {
            return Err(FlashError::Unaligned);
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.write_words(offset, &words)
    }
}

/// [`ConfigStore`] backed by a single flash sector
pub struct FlashConfigStore {
    flash: RomFlash,
    sector_addr: u32,
    entries: MemoryConfigStore,
}

impl FlashConfigStore {
    /// Locate the storage sector and load its image. A corrupted image is
    /// discarded so the device can still be provisioned.
    pub fn open() -> Result<Self, FlashError> {
        let mut flash = RomFlash::unlock()?;
        let sector_addr = find_config_sector(&mut flash)?;
        info!("Configuration sector at {:#x}", sector_addr);

        let mut words = vec![0u32; (SECTOR_SIZE / 4) as usize];
        flash.read_words(sector_addr, &mut words)?;
        let image: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();

        let entries = MemoryConfigStore::from_image(&image).unwrap_or_else(|e| {
            warn!("Discarding stored configuration: {}", e);
            MemoryConfigStore::new()
        });

        Ok(Self {
            flash,
            sector_addr,
            entries,
        })
    }

    fn write_image(&mut self) -> Result<(), ConfigError> {
        let image = self.entries.to_image()?;
        if image.len() > SECTOR_SIZE as usize {
            error!("Configuration image of {} bytes exceeds the sector", image.len());
            return Err(ConfigError::TooLarge);
        }

        let words: Vec<u32> = image
            .chunks(4)
            .map(|chunk| {
                let mut word = [0xFF; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .collect();

        self.flash.erase(self.sector_addr)?;
        self.flash.write_words(self.sector_addr, &words)?;
        debug!("Wrote {} byte configuration image", image.len());
        Ok(())
    }
}

impl ConfigStore for FlashConfigStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        self.entries.get(namespace, key)
    }

    fn set(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), ConfigError> {
        self.entries.set(namespace, key, value)
    }

    fn commit(&mut self) -> Result<(), ConfigError> {
        if !self.entries.is_dirty() {
            return Ok(());
        }
        self.write_image()?;
        self.entries.commit()
    }
}

/// Last sector of the first writable `nvs` partition
fn find_config_sector(flash: &mut RomFlash) -> Result<u32, FlashError> {
    let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
    let table =
        read_partition_table(flash, &mut table_buf).map_err(|_| FlashError::PartitionTable)?;

    table
        .iter()
        .filter(|entry| !entry.is_read_only() && entry.len() >= SECTOR_SIZE)
        .find(|entry| {
            matches!(
                entry.partition_type(),
                PartitionType::Data(DataPartitionSubType::Nvs)
            )
        })
        .map(|entry| entry.offset() + entry.len() - SECTOR_SIZE)
        .ok_or(FlashError::PartitionMissing)
}

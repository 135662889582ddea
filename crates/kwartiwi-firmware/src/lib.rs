//! ESP32-S3 firmware-specific modules for kwartiwi
//!
//! This crate contains the code that only builds for the device: the flash
//! backed configuration store, the esp-radio Wi-Fi driver task, and the
//! embassy-net transports for HTTP and mDNS.

#![no_std]

extern crate alloc;

pub mod flash_store;
pub mod http_transport;
pub mod mdns;
pub mod provisioning;
pub mod wifi;

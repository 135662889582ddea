//! Hardware-independent core library for the kwartiwi energy-meter display
//!
//! This crate contains all platform-agnostic logic of the display device:
//! the event bus, the meter data store, touch panel acquisition and
//! calibration, the network connectivity state machine and the telemetry
//! client that pulls meter data from a kwartiwi P1 server.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).
//! Hardware access happens through small traits ([`config::ConfigStore`],
//! [`networking::WifiDriver`], [`telemetry::HttpTransport`],
//! [`telemetry::ServiceBrowser`]) and the `embedded-hal` SPI traits.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod data_manager;
pub mod event_bus;
pub mod networking;
pub mod telemetry;
pub mod touch;

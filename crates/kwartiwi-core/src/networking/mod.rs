//! Station-mode Wi-Fi connectivity
//!
//! [`Networking`] drives the association state machine
//!
//! ```text
//! Uninitialized → Starting → Started → Connecting → Connected | Disconnected
//!                                          ↑                        │
//!                                          └──── connect() ─────────┘
//! ```
//!
//! with an orthogonal scan state (`Idle → InProgress → Done`). The radio is
//! reached through the [`WifiDriver`] trait and reports back by calling
//! [`Networking::handle_driver_event`]. Outcomes are published on the
//! [`EventBus`] as [`NetworkingEvent`]s.
//!
//! Credentials live behind their own lock. Connection and scan state are
//! plain atomics so waiters never touch the configuration lock.

mod credentials;
mod driver;

pub use credentials::*;
pub use driver::*;

use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_time::{Duration, Timer, with_timeout};
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::config::{ConfigError, ConfigStore};
use crate::event_bus::{Event, EventBus, NetworkingEvent};

extern crate alloc;
use alloc::vec::Vec;

/// Consecutive failed associations before giving up
pub const MAX_ASSOCIATION_RETRIES: u8 = 5;

/// How long [`Networking::setup`] waits for the interface to start
pub const START_TIMEOUT: Duration = Duration::from_millis(1000);

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetState {
    Uninitialized = 0,
    Starting = 1,
    Started = 2,
    Connecting = 3,
    Connected = 4,
    Disconnected = 5,
}

impl NetState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Connecting,
            4 => Self::Connected,
            5 => Self::Disconnected,
            _ => Self::Uninitialized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanState {
    Idle = 0,
    InProgress = 1,
    Done = 2,
}

impl ScanState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::InProgress,
            2 => Self::Done,
            _ => Self::Idle,
        }
    }
}

/// Lock-free connection and scan status
#[derive(Debug)]
struct LinkStatus {
    state: AtomicU8,
    scan: AtomicU8,
    retries: AtomicU8,
    address: AtomicU32,
    initialized: AtomicBool,
}

impl LinkStatus {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(NetState::Uninitialized as u8),
            scan: AtomicU8::new(ScanState::Idle as u8),
            retries: AtomicU8::new(0),
            address: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    fn state(&self) -> NetState {
        NetState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, next: NetState) {
        let prev = NetState::from_raw(self.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            debug!("Network state {:?} -> {:?}", prev, next);
        }
    }

    fn scan(&self) -> ScanState {
        ScanState::from_raw(self.scan.load(Ordering::Acquire))
    }

    fn set_scan(&self, next: ScanState) {
        self.scan.store(next as u8, Ordering::Release);
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum NetworkingError<E> {
    #[error("Mandatory config key missing: {0}")]
    MissingConfig(&'static str),
    #[error("Value for {0} is too long")]
    ValueTooLong(&'static str),
    #[error("Config store error: {0}")]
    Config(ConfigError),
    #[error("Network interface did not start in time")]
    StartTimeout,
    #[error("Wi-Fi driver error: {0:?}")]
    Driver(E),
}

impl<E> From<CredentialsError> for NetworkingError<E> {
    fn from(e: CredentialsError) -> Self {
        match e {
            CredentialsError::Missing(key) => Self::MissingConfig(key),
            CredentialsError::TooLong(key) => Self::ValueTooLong(key),
            CredentialsError::Store(e) => Self::Config(e),
        }
    }
}

impl<E> From<ConfigError> for NetworkingError<E> {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ============================================================================
// Connectivity manager
// ============================================================================

pub struct Networking<'a, D: WifiDriver> {
    bus: &'a EventBus,
    driver: AsyncMutex<CriticalSectionRawMutex, D>,
    config: AsyncMutex<CriticalSectionRawMutex, WifiConfig>,
    status: LinkStatus,
}

impl<'a, D: WifiDriver> Networking<'a, D> {
    pub fn new(driver: D, bus: &'a EventBus) -> Self {
        Self {
            bus,
            driver: AsyncMutex::new(driver),
            config: AsyncMutex::new(WifiConfig::new()),
            status: LinkStatus::new(),
        }
    }

    /// Load the configuration, start the interface and advertise the device.
    ///
    /// Errors are fatal for the device: a missing hostname or instance name,
    /// or an interface that does not report [`DriverEvent::Started`] within
    /// [`START_TIMEOUT`].
    pub async fn setup<S: ConfigStore + ?Sized>(
        &self,
        store: &mut S,
    ) -> Result<(), NetworkingError<D::Error>> {
        if self.is_initialized() {
            warn!("Networking already set up");
            return Ok(());
        }

        let config = WifiConfig::load(store).inspect_err(|e| error!("Network config: {:?}", e))?;
        let hostname = config.hostname.clone();
        let instance = config.instance_name.clone();
        *self.config.lock().await = config;

        self.status.set_state(NetState::Starting);
        {
            let mut driver = self.driver.lock().await;
            driver
                .set_hostname(&hostname)
                .map_err(NetworkingError::Driver)?;
            driver.start().map_err(NetworkingError::Driver)?;
        }

        if !self
            .wait_for_state(|s| s != NetState::Starting, Some(START_TIMEOUT))
            .await
        {
            error!("Wi-Fi interface did not start within {} ms", START_TIMEOUT.as_millis());
            return Err(NetworkingError::StartTimeout);
        }

        self.driver
            .lock()
            .await
            .advertise(&hostname, &instance)
            .map_err(NetworkingError::Driver)?;

        self.status.initialized.store(true, Ordering::Release);
        info!("Networking initialized as {}", hostname.as_str());
        self.bus
            .publish(Event::Networking(NetworkingEvent::Initialized))
            .await;
        Ok(())
    }

    /// Request association with the stored network. Returns immediately; the
    /// outcome is published as `Connected` or `Disconnected`.
    pub async fn connect(&self) -> Result<(), NetworkingError<D::Error>> {
        let (ssid, passphrase) = {
            let config = self.config.lock().await;
            (config.ssid.clone(), config.passphrase.clone())
        };
        if ssid.is_empty() {
            warn!("Connecting without a configured SSID");
        }

        self.status.retries.store(0, Ordering::Release);
        self.status.set_state(NetState::Connecting);

        let mut driver = self.driver.lock().await;
        driver
            .set_credentials(&ssid, &passphrase)
            .map_err(NetworkingError::Driver)?;
        driver.connect().map_err(NetworkingError::Driver)?;
        info!("Connecting to {}", ssid.as_str());
        Ok(())
    }

    /// Start an asynchronous scan; completion is published as `ScanDone`
    pub async fn scan(&self) -> Result<(), NetworkingError<D::Error>> {
        self.status.set_scan(ScanState::InProgress);
        self.driver
            .lock()
            .await
            .start_scan()
            .map_err(|e| {
                self.status.set_scan(ScanState::Idle);
                NetworkingError::Driver(e)
            })
    }

    /// Networks found by the last scan, one entry per SSID
    pub async fn scan_results(&self) -> Result<Vec<AccessPoint>, NetworkingError<D::Error>> {
        let results = self
            .driver
            .lock()
            .await
            .scan_results()
            .map_err(NetworkingError::Driver)?;
        Ok(dedup_by_ssid(results))
    }

    /// Feed a radio notification into the state machine
    pub async fn handle_driver_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::Started => {
                info!("Wi-Fi station started");
                self.status.set_state(NetState::Started);
            }
            DriverEvent::StaDisconnected => self.on_disconnected().await,
            DriverEvent::GotIp(address) => {
                info!("Got IP address {}", address);
                self.status.retries.store(0, Ordering::Release);
                self.status
                    .address
                    .store(u32::from(address), Ordering::Release);
                self.status.set_state(NetState::Connected);
                self.bus
                    .publish(Event::Networking(NetworkingEvent::Connected))
                    .await;
            }
            DriverEvent::ScanDone => {
                self.status.set_scan(ScanState::Done);
                self.bus
                    .publish(Event::Networking(NetworkingEvent::ScanDone))
                    .await;
            }
        }
    }

    async fn on_disconnected(&self) {
        self.status.address.store(0, Ordering::Release);

        // Only associations we asked for are retried
        let state = self.status.state();
        if !matches!(state, NetState::Connecting | NetState::Connected) {
            debug!("Ignoring disconnect while {:?}", state);
            return;
        }

        let attempts = self.status.retries.load(Ordering::Acquire).saturating_add(1);
        if attempts < MAX_ASSOCIATION_RETRIES {
            self.status.retries.store(attempts, Ordering::Release);
            self.status.set_state(NetState::Connecting);
            info!(
                "Association failed, retrying ({}/{})",
                attempts, MAX_ASSOCIATION_RETRIES
            );
            if let Err(e) = self.driver.lock().await.connect() {
                error!("Reconnect request failed: {:?}", e);
            }
            return;
        }

        warn!("Giving up after {} failed associations", attempts);
        self.status.retries.store(0, Ordering::Release);
        self.status.set_state(NetState::Disconnected);
        self.bus
            .publish(Event::Networking(NetworkingEvent::Disconnected))
            .await;
    }

    /// Replace the in-memory credentials without persisting them
    pub async fn set_wifi_config(
        &self,
        ssid: &str,
        passphrase: &str,
    ) -> Result<(), NetworkingError<D::Error>> {
        self.config
            .lock()
            .await
            .set_credentials(ssid, passphrase)?;
        Ok(())
    }

    /// Persist credentials. `None` saves the ones currently in use.
    pub async fn save_wifi_config<S: ConfigStore + ?Sized>(
        &self,
        store: &mut S,
        credentials: Option<(&str, &str)>,
    ) -> Result<(), NetworkingError<D::Error>> {
        if let Some((ssid, passphrase)) = credentials {
            self.set_wifi_config(ssid, passphrase).await?;
        }
        let config = self.config.lock().await.clone();
        config.save_credentials(store)?;
        Ok(())
    }

    /// Block until `condition` holds for the connection state.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_state<F>(&self, condition: F, timeout: Option<Duration>) -> bool
    where
        F: Fn(NetState) -> bool,
    {
        let wait = async {
            while !condition(self.status.state()) {
                Timer::after(STATE_POLL_INTERVAL).await;
            }
        };
        match timeout {
            Some(limit) => with_timeout(limit, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    pub fn state(&self) -> NetState {
        self.status.state()
    }

    pub fn scan_state(&self) -> ScanState {
        self.status.scan()
    }

    pub fn is_initialized(&self) -> bool {
        self.status.initialized.load(Ordering::Acquire)
    }

    /// Consecutive failed associations in the current attempt
    pub fn association_retries(&self) -> u8 {
        self.status.retries.load(Ordering::Acquire)
    }

    /// Current DHCP address, if connected
    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        match self.status.address.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Ipv4Addr::from(raw)),
        }
    }

    pub async fn hostname(&self) -> heapless::String<HOSTNAME_MAX_LEN> {
        self.config.lock().await.hostname.clone()
    }

    pub async fn has_credentials(&self) -> bool {
        self.config.lock().await.has_credentials()
    }
}

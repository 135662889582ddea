use embassy_time::{Duration, Timer};
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use super::decode::{DecodeError, HISTORY_PATH, LIVE_PATH, decode_history, decode_live};
use super::link::{LinkMonitor, LinkState};
use super::{HttpTransport, TransportError};
use crate::config::{ConfigError, ConfigStore, keys};
use crate::data_manager::DataManager;
use crate::event_bus::{Event, EventBus, TelemetryEvent};

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;

/// Delay between live polls and between history retries
pub const REQUEST_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Mandatory config key missing: {0}")]
    MissingConfig(&'static str),
    #[error("Config store error: {0}")]
    Config(ConfigError),
}

impl From<ConfigError> for TelemetryError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Why a single request counted as failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Decode error: {0}")]
    Decode(DecodeError),
}

impl From<TransportError> for RequestError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<DecodeError> for RequestError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Bulk history not loaded yet
    AwaitingInitialSync,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    pub poll_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            poll_interval: REQUEST_INTERVAL,
            retry_delay: REQUEST_INTERVAL,
        }
    }
}

/// Persist the server host used on the next start
pub fn save_server_config<S: ConfigStore + ?Sized>(
    store: &mut S,
    host: &str,
) -> Result<(), ConfigError> {
    store.set_str(keys::WEB_CLIENT, keys::SERVER_HOST, host)?;
    store.commit()
}

pub struct TelemetryClient<'a, T: HttpTransport> {
    transport: T,
    data: &'a DataManager<'a>,
    bus: &'a EventBus,
    server_host: String,
    settings: ClientSettings,
    link: LinkMonitor,
    state: SyncState,
}

impl<'a, T: HttpTransport> TelemetryClient<'a, T> {
    /// Create a client for the server stored under `web_client/srv-host`
    pub fn new<S: ConfigStore + ?Sized>(
        transport: T,
        data: &'a DataManager<'a>,
        bus: &'a EventBus,
        store: &mut S,
    ) -> Result<Self, TelemetryError> {
        let server_host = store
            .get_str(keys::WEB_CLIENT, keys::SERVER_HOST)?
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                error!("No server host configured");
                TelemetryError::MissingConfig(keys::SERVER_HOST)
            })?;
        info!("Telemetry server: {}", server_host);

        Ok(Self {
            transport,
            data,
            bus,
            server_host,
            settings: ClientSettings::default(),
            link: LinkMonitor::new(),
            state: SyncState::AwaitingInitialSync,
        })
    }

    pub fn with_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    pub fn sync_state(&self) -> SyncState {
        self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// Client task: history first, then live polling forever
    pub async fn run(&mut self) -> ! {
        self.bus
            .publish(Event::Telemetry(TelemetryEvent::Initialized))
            .await;

        self.sync_history().await;

        loop {
            if self.poll_once().await.is_err() {
                debug!(
                    "Meter data request failed, retrying in {} ms",
                    self.settings.poll_interval.as_millis()
                );
            }
            Timer::after(self.settings.poll_interval).await;
        }
    }

    /// Fetch the bulk history until one attempt succeeds, then announce it
    pub async fn sync_history(&mut self) {
        while self.fetch_history().await.is_err() {
            warn!(
                "History request failed, retrying in {} ms",
                self.settings.retry_delay.as_millis()
            );
            Timer::after(self.settings.retry_delay).await;
        }
        self.data.announce_history().await;
        self.state = SyncState::Polling;
        info!("History synchronized");
    }

    /// One history request. Whatever decoded is stored even if the attempt
    /// fails.
    pub async fn fetch_history(&mut self) -> Result<(), RequestError> {
        let outcome: Result<(), RequestError> = async {
            let body = self.request(HISTORY_PATH).await?;
            let update = decode_history(&body)?;
            self.data
                .replace_history(update.yearly, &update.short_term)
                .await;
            rejected(update.rejected)
        }
        .await;
        self.record(outcome).await
    }

    /// One live request. Announces a snapshot when any field was applied.
    pub async fn poll_once(&mut self) -> Result<(), RequestError> {
        let outcome: Result<(), RequestError> = async {
            let body = self.request(LIVE_PATH).await?;
            let update = decode_live(&body)?;
            if !update.fields.is_empty() {
                self.data
                    .apply_live_update(&update.fields, update.history_sample)
                    .await;
                self.data.announce_snapshot().await;
            }
            rejected(update.rejected)
        }
        .await;
        self.record(outcome).await
    }

    // ========================================================================
    // Private Helper Methods
    // ========================================================================

    async fn request(&mut self, path: &str) -> Result<Vec<u8>, RequestError> {
        let response = self.transport.get(&self.server_host, path).await?;
        if response.status != 200 {
            return Err(RequestError::Status(response.status));
        }
        Ok(response.body)
    }

    async fn record(&mut self, outcome: Result<(), RequestError>) -> Result<(), RequestError> {
        let transition = match &outcome {
            Ok(()) => self.link.record_success(),
            Err(e) => {
                match e {
                    RequestError::Transport(_) => error!("GET {} failed: {}", self.server_host, e),
                    _ => warn!("Request to {} failed: {}", self.server_host, e),
                }
                self.link.record_failure()
            }
        };
        if let Some(event) = transition {
            self.bus.publish(Event::Telemetry(event)).await;
        }
        outcome
    }
}

fn rejected(count: usize) -> Result<(), RequestError> {
    match count {
        0 => Ok(()),
        n => Err(RequestError::Decode(DecodeError::Rejected(n))),
    }
}

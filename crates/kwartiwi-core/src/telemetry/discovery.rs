//! Finding meter-data servers on the local network

use core::cell::RefCell;
use core::future::Future;
use core::net::Ipv4Addr;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Duration;
use log::{debug, error, info};
use thiserror_no_std::Error;

use super::mdns::MdnsError;
use crate::event_bus::{Event, EventBus, TelemetryEvent};

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;

pub const SERVICE_TYPE: &str = "_kwartiwi-p1";
pub const SERVICE_PROTO: &str = "_tcp";
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(5000);
pub const MAX_SERVERS: usize = 5;

/// One answer to a PTR query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Full instance name
    pub instance: String,
    /// Target host without the `.local` suffix
    pub hostname: Option<String>,
    pub port: u16,
    pub address: Option<Ipv4Addr>,
}

/// A server the user can pick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    /// Resolvable name, `.local` included
    pub hostname: String,
    pub port: u16,
    pub address: Option<Ipv4Addr>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Socket error")]
    Socket,
    #[error("Invalid mDNS packet: {0}")]
    Packet(MdnsError),
}

impl From<MdnsError> for DiscoveryError {
    fn from(e: MdnsError) -> Self {
        Self::Packet(e)
    }
}

/// mDNS PTR lookups
pub trait ServiceBrowser {
    /// Collect up to `max_results` instances of `service.proto.local`,
    /// returning whatever answered once `timeout` elapses
    fn query_ptr(
        &mut self,
        service: &str,
        proto: &str,
        timeout: Duration,
        max_results: usize,
    ) -> impl Future<Output = Result<Vec<DiscoveredService>, DiscoveryError>>;
}

/// Results of the last discovery run
pub struct ServerDirectory {
    servers: Mutex<CriticalSectionRawMutex, RefCell<heapless::Vec<ServerRecord, MAX_SERVERS>>>,
}

impl ServerDirectory {
    pub const fn new() -> Self {
        Self {
            servers: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    pub fn servers(&self) -> Vec<ServerRecord> {
        self.servers.lock(|s| s.borrow().iter().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.servers.lock(|s| s.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn replace(&self, records: heapless::Vec<ServerRecord, MAX_SERVERS>) {
        self.servers.lock(|s| *s.borrow_mut() = records);
    }
}

impl Default for ServerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Browse for servers, replace `directory` with the results and publish
/// `ServersFound`. A failed query leaves the directory empty.
pub async fn discover_servers<B: ServiceBrowser>(
    browser: &mut B,
    directory: &ServerDirectory,
    bus: &EventBus,
) -> usize {
    info!("Searching for {}.{} servers", SERVICE_TYPE, SERVICE_PROTO);

    let services = match browser
        .query_ptr(SERVICE_TYPE, SERVICE_PROTO, DISCOVERY_TIMEOUT, MAX_SERVERS)
        .await
    {
        Ok(services) => services,
        Err(e) => {
            error!("Server query failed: {}", e);
            Vec::new()
        }
    };

    let mut records = heapless::Vec::new();
    for service in services {
        let Some(mut hostname) = service.hostname else {
            debug!("Skipping {} without a target host", service.instance);
            continue;
        };
        hostname.push_str(".local");
        debug!("Found server {}:{}", hostname, service.port);
        let record = ServerRecord {
            hostname,
            port: service.port,
            address: service.address,
        };
        if records.push(record).is_err() {
            break;
        }
    }

    let count = records.len();
    directory.replace(records);
    info!("Found {} servers", count);
    bus.publish(Event::Telemetry(TelemetryEvent::ServersFound(count as u8)))
        .await;
    count
}

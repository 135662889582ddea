//! Desktop simulator for the kwartiwi energy-meter display core.
//!
//! Runs the event bus, connectivity state machine, server discovery and
//! telemetry client on the host with std sockets in place of the radio and
//! embassy-net. Meter readings are logged instead of drawn.
//!
//! ```text
//! RUST_LOG=debug cargo run -p kwartiwi-simulator -- meter.local:8080
//! ```
//!
//! Without an argument the server comes from `KWARTIWI_SERVER_HOST`, or
//! from the first `_kwartiwi-p1._tcp` service that answers on mDNS.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Instant;

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer, with_timeout};
use log::{debug, error, info, warn};
use static_cell::StaticCell;

use kwartiwi_core::config::{ConfigStore, MemoryConfigStore, keys};
use kwartiwi_core::data_manager::DataManager;
use kwartiwi_core::event_bus::{DataEvent, Event, EventBase, EventBus};
use kwartiwi_core::networking::{AccessPoint, DriverEvent, Networking, ScanState, WifiDriver};
use kwartiwi_core::telemetry::http::{
    HTTP_PORT, HttpResponse, MAX_BODY_LEN, build_get_request, parse_response,
};
use kwartiwi_core::telemetry::mdns::{MDNS_GROUP, MDNS_PORT, build_ptr_query, service_name};
use kwartiwi_core::telemetry::{
    DiscoveredService, DiscoveryError, HttpTransport, ServerDirectory, ServiceBrowser,
    TelemetryClient, TransportError, discover_servers, save_server_config,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SIMULATED_SSID: &str = "kwartiwi-sim";
const SIMULATED_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const SCAN_TIMEOUT: Duration = Duration::from_secs(2);
/// Response size limit including headers
const MAX_RESPONSE_LEN: u64 = (MAX_BODY_LEN + 2048) as u64;

type SimNetworking = Networking<'static, SimulatedRadio>;

static BUS: EventBus = EventBus::new();
static SERVERS: ServerDirectory = ServerDirectory::new();
static RADIO_EVENTS: Channel<CriticalSectionRawMutex, DriverEvent, 8> = Channel::new();
static SNAPSHOT_READY: Signal<CriticalSectionRawMutex, ()> = Signal::new();
static HISTORY_READY: Signal<CriticalSectionRawMutex, ()> = Signal::new();

static DATA: StaticCell<DataManager<'static>> = StaticCell::new();
static NETWORKING: StaticCell<SimNetworking> = StaticCell::new();

// ---------------------------------------------------------------------------
// Simulated radio
// ---------------------------------------------------------------------------

/// Station that associates instantly with any configured network
#[derive(Default)]
struct SimulatedRadio {
    ssid: String,
}

impl SimulatedRadio {
    fn report(&self, event: DriverEvent) -> Result<(), &'static str> {
        RADIO_EVENTS
            .try_send(event)
            .map_err(|_| "radio event queue full")
    }
}

impl WifiDriver for SimulatedRadio {
    type Error = &'static str;

    fn set_hostname(&mut self, hostname: &str) -> Result<(), Self::Error> {
        debug!("Hostname set to {}", hostname);
        Ok(())
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        self.report(DriverEvent::Started)
    }

    fn set_credentials(&mut self, ssid: &str, _passphrase: &str) -> Result<(), Self::Error> {
        self.ssid = ssid.to_owned();
        Ok(())
    }

    fn connect(&mut self) -> Result<(), Self::Error> {
        if self.ssid == SIMULATED_SSID {
            self.report(DriverEvent::GotIp(SIMULATED_ADDRESS))
        } else {
            self.report(DriverEvent::StaDisconnected)
        }
    }

    fn start_scan(&mut self) -> Result<(), Self::Error> {
        self.report(DriverEvent::ScanDone)
    }

    fn scan_results(&mut self) -> Result<Vec<AccessPoint>, Self::Error> {
        let seen = [
            (SIMULATED_SSID, -42, true),
            ("neighbours", -67, true),
            (SIMULATED_SSID, -71, true),
            ("cafe", -80, false),
        ];
        Ok(seen
            .into_iter()
            .filter_map(|(ssid, rssi, secured)| {
                Some(AccessPoint {
                    ssid: ssid.try_into().ok()?,
                    rssi,
                    secured,
                })
            })
            .collect())
    }

    fn advertise(&mut self, hostname: &str, instance: &str) -> Result<(), Self::Error> {
        info!("Device would answer as {}.local ({})", hostname, instance);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host sockets
// ---------------------------------------------------------------------------

/// Blocking `TcpStream` transport; the simulator tolerates a stalled executor
struct StdHttpTransport;

fn io_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
        _ => TransportError::Io,
    }
}

fn resolve(server: &str) -> Result<SocketAddr, TransportError> {
    let with_port = if server.contains(':') {
        server.to_owned()
    } else {
        format!("{server}:{HTTP_PORT}")
    };
    with_port
        .to_socket_addrs()
        .map_err(|_| TransportError::Dns)?
        .find(SocketAddr::is_ipv4)
        .ok_or(TransportError::Dns)
}

impl HttpTransport for StdHttpTransport {
    async fn get(&mut self, server: &str, path: &str) -> Result<HttpResponse, TransportError> {
        let address = resolve(server)?;
        let host = server.split(':').next().unwrap_or(server);

        let mut stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).map_err(|e| {
            debug!("Connecting to {} failed: {}", address, e);
            TransportError::Connect
        })?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(io_error)?;
        stream
            .write_all(build_get_request(host, path).as_bytes())
            .map_err(io_error)?;

        let mut raw = Vec::new();
        stream
            .take(MAX_RESPONSE_LEN)
            .read_to_end(&mut raw)
            .map_err(io_error)?;
        Ok(parse_response(&raw)?)
    }
}

/// One-shot PTR queries from an ephemeral UDP port
struct StdServiceBrowser;

impl ServiceBrowser for StdServiceBrowser {
    async fn query_ptr(
        &mut self,
        service: &str,
        proto: &str,
        timeout: Duration,
        max_results: usize,
    ) -> Result<Vec<DiscoveredService>, DiscoveryError> {
        let name = service_name(service, proto);
        let query = build_ptr_query(0, &name)?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(|_| DiscoveryError::Socket)?;
        socket
            .send_to(&query, (MDNS_GROUP, MDNS_PORT))
            .map_err(|_| DiscoveryError::Socket)?;

        let deadline = Instant::now() + std::time::Duration::from_millis(timeout.as_millis());
        let mut found: Vec<DiscoveredService> = Vec::new();
        let mut packet = [0u8; 1536];
        while found.len() < max_results {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket
                .set_read_timeout(Some(remaining))
                .map_err(|_| DiscoveryError::Socket)?;
            let Ok((len, from)) = socket.recv_from(&mut packet) else {
                break;
            };
            match kwartiwi_core::telemetry::mdns::parse_response(&packet[..len], &name) {
                Ok(services) => {
                    for service in services {
                        if !found.iter().any(|f| f.instance == service.instance) {
                            found.push(service);
                        }
                    }
                }
                Err(e) => debug!("Ignoring packet from {}: {}", from, e),
            }
        }

        found.truncate(max_results);
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[embassy_executor::task]
async fn event_bus_task(bus: &'static EventBus) {
    bus.run().await;
}

#[embassy_executor::task]
async fn radio_task(networking: &'static SimNetworking) {
    loop {
        let event = RADIO_EVENTS.receive().await;
        networking.handle_driver_event(event).await;
    }
}

#[embassy_executor::task]
async fn telemetry_task(mut client: TelemetryClient<'static, StdHttpTransport>) {
    client.run().await;
}

/// Stand-in for the display: logs whatever the data manager announces
#[embassy_executor::task]
async fn display_task(data: &'static DataManager<'static>) {
    loop {
        match select(SNAPSHOT_READY.wait(), HISTORY_READY.wait()).await {
            Either::First(()) => {
                let s = data.snapshot().await;
                info!(
                    "t={} demand {:.3} kW usage {:.3} kW return {:.3} kW tariff {}",
                    s.p1_timestamp,
                    s.current_avg_demand,
                    s.current_power_usage,
                    s.current_power_return,
                    s.active_tariff
                );
                info!(
                    "month peak {:.3} kW at {}, predicted {:.3} kW at {}",
                    s.max_demand_month.demand,
                    s.max_demand_month.timestamp,
                    s.predicted_peak.demand,
                    s.predicted_peak.timestamp
                );
            }
            Either::Second(()) => {
                let yearly = data.yearly().await;
                let recent = data.get_recent_history(usize::MAX).await;
                info!(
                    "History: {} monthly peaks, {} short-term samples",
                    yearly.len(),
                    recent.len()
                );
                for peak in yearly.entries() {
                    info!("  peak {:.3} kW at {}", peak.demand, peak.timestamp);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn provision(store: &mut MemoryConfigStore, server: Option<&str>) {
    let entries = [
        (keys::NETWORKING, keys::STATION_SSID, SIMULATED_SSID),
        (keys::NETWORKING, keys::STATION_PASS, "simulated"),
        (keys::NETWORKING, keys::HOSTNAME, "kwartiwi-sim"),
        (keys::NETWORKING, keys::MDNS_INSTANCE, "kwartiwi simulator"),
    ];
    for (namespace, key, value) in entries {
        if let Err(e) = store.set_str(namespace, key, value) {
            error!("Cannot store {}/{}: {}", namespace, key, e);
        }
    }
    if let Some(server) = server {
        if let Err(e) = save_server_config(store, server) {
            error!("Cannot store server host: {}", e);
        }
    }
}

async fn subscribe_display(bus: &'static EventBus) {
    let result = bus
        .subscribe(EventBase::Data, |event| match event {
            Event::Data(DataEvent::SnapshotAvailable) => SNAPSHOT_READY.signal(()),
            Event::Data(DataEvent::HistoryAvailable) => HISTORY_READY.signal(()),
            _ => {}
        })
        .await;
    if let Err(e) = result {
        error!("Display subscription failed: {}", e);
    }
}

async fn list_networks(networking: &'static SimNetworking) {
    if let Err(e) = networking.scan().await {
        warn!("Scan request failed: {:?}", e);
        return;
    }
    let finished = with_timeout(SCAN_TIMEOUT, async {
        while networking.scan_state() != ScanState::Done {
            Timer::after(Duration::from_millis(10)).await;
        }
    })
    .await;
    if finished.is_err() {
        warn!("Scan did not finish");
        return;
    }
    for ap in networking.scan_results().await.unwrap_or_default() {
        info!(
            "Network {:<16} {} dBm{}",
            ap.ssid.as_str(),
            ap.rssi,
            if ap.secured { "" } else { " (open)" }
        );
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting kwartiwi simulator");

    let server = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KWARTIWI_SERVER_HOST").ok());
    let mut store = MemoryConfigStore::new();
    provision(&mut store, server.as_deref());

    spawner
        .spawn(event_bus_task(&BUS))
        .expect("event_bus_task spawn");
    subscribe_display(&BUS).await;
    let data: &'static DataManager<'static> = DATA.init(DataManager::new(&BUS));
    spawner
        .spawn(display_task(data))
        .expect("display_task spawn");

    let networking: &'static SimNetworking =
        NETWORKING.init(Networking::new(SimulatedRadio::default(), &BUS));
    spawner
        .spawn(radio_task(networking))
        .expect("radio_task spawn");
    if let Err(e) = networking.setup(&mut store).await {
        error!("Networking setup failed: {:?}", e);
        return;
    }
    list_networks(networking).await;
    if let Err(e) = networking.connect().await {
        error!("Connect request failed: {:?}", e);
        return;
    }

    discover_servers(&mut StdServiceBrowser, &SERVERS, &BUS).await;
    for record in SERVERS.servers() {
        info!("Discovered {}:{}", record.hostname, record.port);
    }
    if server.is_none() {
        match SERVERS.servers().first() {
            Some(record) => {
                let host = format!("{}:{}", record.hostname, record.port);
                if let Err(e) = save_server_config(&mut store, &host) {
                    error!("Cannot store server host: {}", e);
                }
            }
            None => warn!("No server given and none discovered"),
        }
    }

    match TelemetryClient::new(StdHttpTransport, data, &BUS, &mut store) {
        Ok(client) => spawner
            .spawn(telemetry_task(client))
            .expect("telemetry_task spawn"),
        Err(e) => error!("Telemetry client unavailable: {}", e),
    }
}

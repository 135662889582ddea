//! esp-radio backend for the connectivity state machine
//!
//! [`RadioHandle`] is the [`WifiDriver`] handed to [`Networking`]. It only
//! queues [`RadioCommand`]s; [`wifi_task`] owns the controller, executes the
//! commands one at a time and reports the outcome back through
//! [`Networking::handle_driver_event`].

use core::cell::RefCell;

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_net::{ConfigV4, DhcpConfig, Stack};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, with_timeout};
use esp_radio::wifi::{
    AuthMethod, ClientConfig, ModeConfig, ScanConfig, WifiController, WifiDevice, WifiEvent,
};
use kwartiwi_core::networking::{
    AccessPoint, DriverEvent, HOSTNAME_MAX_LEN, INSTANCE_NAME_MAX_LEN, Networking,
    PASSPHRASE_MAX_LEN, SSID_MAX_LEN, WifiDriver,
};
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::mdns::mdns_responder_task;

extern crate alloc;
use alloc::vec::Vec;

/// Time allowed between association and a DHCP lease
const DHCP_TIMEOUT: Duration = Duration::from_secs(15);
const COMMAND_QUEUE_DEPTH: usize = 8;

pub type DeviceNetworking = Networking<'static, RadioHandle>;

/// Work queued for [`wifi_task`]
#[derive(Debug, Clone)]
pub enum RadioCommand {
    SetHostname(heapless::String<HOSTNAME_MAX_LEN>),
    Start,
    SetCredentials {
        ssid: heapless::String<SSID_MAX_LEN>,
        passphrase: heapless::String<PASSPHRASE_MAX_LEN>,
    },
    Connect,
    Scan,
    Advertise {
        hostname: heapless::String<HOSTNAME_MAX_LEN>,
        instance: heapless::String<INSTANCE_NAME_MAX_LEN>,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio command queue is full")]
    QueueFull,
    #[error("Value does not fit")]
    TooLong,
}

static COMMANDS: Channel<CriticalSectionRawMutex, RadioCommand, COMMAND_QUEUE_DEPTH> =
    Channel::new();
static SCAN_RESULTS: Mutex<CriticalSectionRawMutex, RefCell<Vec<AccessPoint>>> =
    Mutex::new(RefCell::new(Vec::new()));

/// Command side of the radio
pub struct RadioHandle;

impl RadioHandle {
    fn send(&self, command: RadioCommand) -> Result<(), RadioError> {
        COMMANDS.try_send(command).map_err(|_| {
            error!("Radio command queue full");
            RadioError::QueueFull
        })
    }
}

fn bounded<const N: usize>(value: &str) -> Result<heapless::String<N>, RadioError> {
    heapless::String::try_from(value).map_err(|_| RadioError::TooLong)
}

impl WifiDriver for RadioHandle {
    type Error = RadioError;

    fn set_hostname(&mut self, hostname: &str) -> Result<(), RadioError> {
        self.send(RadioCommand::SetHostname(bounded(hostname)?))
    }

    fn start(&mut self) -> Result<(), RadioError> {
        self.send(RadioCommand::Start)
    }

    fn set_credentials(&mut self, ssid: &str, passphrase: &str) -> Result<(), RadioError> {
        self.send(RadioCommand::SetCredentials {
            ssid: bounded(ssid)?,
            passphrase: bounded(passphrase)?,
        })
    }

    fn connect(&mut self) -> Result<(), RadioError> {
        self.send(RadioCommand::Connect)
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        self.send(RadioCommand::Scan)
    }

    fn scan_results(&mut self) -> Result<Vec<AccessPoint>, RadioError> {
        Ok(SCAN_RESULTS.lock(|results| results.borrow().clone()))
    }

    fn advertise(&mut self, hostname: &str, instance: &str) -> Result<(), RadioError> {
        self.send(RadioCommand::Advertise {
            hostname: bounded(hostname)?,
            instance: bounded(instance)?,
        })
    }
}

#[embassy_executor::task]
pub async fn net_task(mut runner: embassy_net::Runner<'static, WifiDevice<'static>>) {
    runner.run().await;
}

/// Owns the Wi-Fi controller and executes [`RadioCommand`]s
#[embassy_executor::task]
pub async fn wifi_task(
    mut controller: WifiController<'static>,
    stack: Stack<'static>,
    networking: &'static DeviceNetworking,
    spawner: Spawner,
) {
    let mut client = ClientConfig::default();
    let mut advertising = false;

    loop {
        let command = if matches!(controller.is_connected(), Ok(true)) {
            match select(
                COMMANDS.receive(),
                controller.wait_for_event(WifiEvent::StaDisconnected),
            )
            .await
            {
                Either::First(command) => command,
                Either::Second(()) => {
                    warn!("Wi-Fi link lost");
                    networking
                        .handle_driver_event(DriverEvent::StaDisconnected)
                        .await;
                    continue;
                }
            }
        } else {
            COMMANDS.receive().await
        };
        debug!("Radio command {:?}", command);

        match command {
            RadioCommand::SetHostname(hostname) => {
                let mut dhcp = DhcpConfig::default();
                dhcp.hostname = hostname.as_str().try_into().ok();
                stack.set_config_v4(ConfigV4::Dhcp(dhcp));
            }
            RadioCommand::Start => {
                if let Err(e) = controller.set_config(&ModeConfig::Client(client.clone())) {
                    error!("Wi-Fi mode config failed: {:?}", e);
                    continue;
                }
                match controller.start_async().await {
                    Ok(()) => networking.handle_driver_event(DriverEvent::Started).await,
                    Err(e) => error!("Wi-Fi start failed: {:?}", e),
                }
            }
            RadioCommand::SetCredentials { ssid, passphrase } => {
                client = ClientConfig::default()
                    .with_ssid(ssid.as_str().into())
                    .with_password(passphrase.as_str().into());
                if let Err(e) = controller.set_config(&ModeConfig::Client(client.clone())) {
                    error!("Wi-Fi client config failed: {:?}", e);
                }
            }
            RadioCommand::Connect => {
                let event = associate(&mut controller, stack).await;
                networking.handle_driver_event(event).await;
            }
            RadioCommand::Scan => {
                let found = scan(&mut controller).await;
                info!("Scan found {} networks", found.len());
                SCAN_RESULTS.lock(|results| *results.borrow_mut() = found);
                networking.handle_driver_event(DriverEvent::ScanDone).await;
            }
            RadioCommand::Advertise { hostname, instance } => {
                if advertising {
                    continue;
                }
                info!("Advertising {}.local ({})", hostname.as_str(), instance.as_str());
                match spawner.spawn(mdns_responder_task(stack, hostname)) {
                    Ok(()) => advertising = true,
                    Err(e) => error!("mDNS responder spawn failed: {:?}", e),
                }
            }
        }
    }
}

/// Associate and wait for a lease. Any failure maps to a disconnect.
async fn associate(controller: &mut WifiController<'static>, stack: Stack<'static>) -> DriverEvent {
    if matches!(controller.is_connected(), Ok(true)) {
        let _ = controller.disconnect_async().await;
    }

    if let Err(e) = controller.connect_async().await {
        warn!("Wi-Fi association failed: {:?}", e);
        return DriverEvent::StaDisconnected;
    }

    if with_timeout(DHCP_TIMEOUT, stack.wait_config_up()).await.is_err() {
        warn!("No DHCP lease within {} s", DHCP_TIMEOUT.as_secs());
        let _ = controller.disconnect_async().await;
        return DriverEvent::StaDisconnected;
    }

    match stack.config_v4() {
        Some(config) => DriverEvent::GotIp(config.address.address()),
        None => DriverEvent::StaDisconnected,
    }
}

/// Visible networks, strongest first
async fn scan(controller: &mut WifiController<'static>) -> Vec<AccessPoint> {
    let found = match controller.scan_with_config_async(ScanConfig::default()).await {
        Ok(found) => found,
        Err(e) => {
            error!("Wi-Fi scan failed: {:?}", e);
            return Vec::new();
        }
    };

    let mut access_points: Vec<AccessPoint> = found
        .iter()
        .filter_map(|ap| {
            Some(AccessPoint {
                ssid: heapless::String::try_from(ap.ssid.as_str()).ok()?,
                rssi: ap.signal_strength,
                secured: !matches!(ap.auth_method, None | Some(AuthMethod::None)),
            })
        })
        .collect();
    access_points.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    access_points
}

//! Boundary between the connectivity state machine and the radio

use core::net::Ipv4Addr;

extern crate alloc;
use alloc::vec::Vec;

/// Longest SSID allowed by 802.11
pub const SSID_MAX_LEN: usize = 32;

/// Notifications the radio feeds back into [`super::Networking::handle_driver_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// Station interface is up
    Started,
    /// Association attempt failed or the link dropped
    StaDisconnected,
    /// DHCP lease acquired
    GotIp(Ipv4Addr),
    /// A scan requested with [`WifiDriver::start_scan`] finished
    ScanDone,
}

/// A network seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: heapless::String<SSID_MAX_LEN>,
    /// Signal strength in dBm
    pub rssi: i8,
    /// False for open networks
    pub secured: bool,
}

/// Station-mode Wi-Fi radio.
///
/// Every method only issues a request; outcomes come back asynchronously as
/// [`DriverEvent`]s.
pub trait WifiDriver {
    type Error: core::fmt::Debug;

    /// Hostname used for DHCP and mDNS
    fn set_hostname(&mut self, hostname: &str) -> Result<(), Self::Error>;

    /// Bring up the station interface
    fn start(&mut self) -> Result<(), Self::Error>;

    fn set_credentials(&mut self, ssid: &str, passphrase: &str) -> Result<(), Self::Error>;

    /// Request association with the configured network
    fn connect(&mut self) -> Result<(), Self::Error>;

    fn start_scan(&mut self) -> Result<(), Self::Error>;

    /// Results of the last finished scan, strongest first
    fn scan_results(&mut self) -> Result<Vec<AccessPoint>, Self::Error>;

    /// Announce this device on the local network under `instance`
    fn advertise(&mut self, hostname: &str, instance: &str) -> Result<(), Self::Error>;
}

/// Keep the first occurrence of every SSID
pub fn dedup_by_ssid(access_points: Vec<AccessPoint>) -> Vec<AccessPoint> {
    let mut unique: Vec<AccessPoint> = Vec::with_capacity(access_points.len());
    for ap in access_points {
        if !unique.iter().any(|seen| seen.ssid == ap.ssid) {
            unique.push(ap);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ap(ssid: &str, rssi: i8) -> AccessPoint {
        AccessPoint {
            ssid: ssid.try_into().unwrap(),
            rssi,
            secured: true,
        }
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let unique = dedup_by_ssid(vec![
            ap("home", -40),
            ap("guest", -55),
            ap("home", -70),
            ap("office", -80),
            ap("guest", -90),
        ]);

        let summary: Vec<(&str, i8)> = unique.iter().map(|a| (a.ssid.as_str(), a.rssi)).collect();
        assert_eq!(summary, [("home", -40), ("guest", -55), ("office", -80)]);
    }

    #[test]
    fn test_dedup_empty() {
        assert!(dedup_by_ssid(Vec::new()).is_empty());
    }
}

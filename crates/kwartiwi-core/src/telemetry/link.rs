use log::{info, warn};

use crate::event_bus::TelemetryEvent;

/// Consecutive failed requests before the server counts as unreachable
pub const DISCONNECT_THRESHOLD: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No request has completed yet
    Unknown,
    Connected,
    Disconnected,
}

/// Debounces request outcomes into server connectivity transitions.
///
/// Each method returns the event to publish, if the state changed.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    state: LinkState,
    consecutive_failures: u8,
}

impl LinkMonitor {
    pub const fn new() -> Self {
        Self {
            state: LinkState::Unknown,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) -> Option<TelemetryEvent> {
        self.consecutive_failures = 0;
        if self.state == LinkState::Connected {
            return None;
        }
        info!("Server reachable");
        self.state = LinkState::Connected;
        Some(TelemetryEvent::Connected)
    }

    pub fn record_failure(&mut self) -> Option<TelemetryEvent> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < DISCONNECT_THRESHOLD || self.state == LinkState::Disconnected
        {
            return None;
        }
        warn!(
            "{} consecutive failed requests, server unreachable",
            self.consecutive_failures
        );
        self.state = LinkState::Disconnected;
        Some(TelemetryEvent::Disconnected)
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u8 {
        self.consecutive_failures
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

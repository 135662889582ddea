//! Meter-data server client
//!
//! [`TelemetryClient`] first pulls the bulk history from the configured server,
//! retrying until it succeeds, and then polls the live readings. Every decoded
//! value goes into the [`crate::data_manager::DataManager`]. Server
//! reachability is debounced by a [`LinkMonitor`] and published on the bus.
//!
//! Servers are found with [`discover_servers`], which browses mDNS for
//! `_kwartiwi-p1._tcp`. The [`http`] and [`mdns`] modules hold the wire
//! formats shared by the firmware and simulator transports.

mod client;
mod decode;
mod discovery;
pub mod http;
mod link;
pub mod mdns;

pub use client::*;
pub use decode::*;
pub use discovery::*;
pub use link::*;

use core::future::Future;

use thiserror_no_std::Error;

use http::{FramingError, HttpResponse};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("Could not resolve host")]
    Dns,
    #[error("Connection failed")]
    Connect,
    #[error("Socket I/O failed")]
    Io,
    #[error("Request timed out")]
    Timeout,
    #[error("Invalid response: {0}")]
    Response(FramingError),
}

impl From<FramingError> for TransportError {
    fn from(e: FramingError) -> Self {
        Self::Response(e)
    }
}

/// Performs a single HTTP `GET` against the meter-data server
pub trait HttpTransport {
    fn get(
        &mut self,
        host: &str,
        path: &str,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>>;
}

//! HTTP/1.0 `GET` over an embassy-net TCP socket

use core::net::Ipv4Addr;

use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::{IpAddress, Stack};
use embassy_time::{Duration, with_timeout};
use kwartiwi_core::telemetry::http::{
    FramingError, HTTP_PORT, HttpResponse, MAX_BODY_LEN, build_get_request, parse_response,
};
use kwartiwi_core::telemetry::{HttpTransport, TransportError};
use log::{debug, warn};

use crate::mdns::resolve_local;

extern crate alloc;
use alloc::vec::Vec;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on everything before the body
const MAX_HEADER_LEN: usize = 2048;
const SOCKET_BUFFER_LEN: usize = 4096;

pub struct TcpHttpTransport {
    stack: Stack<'static>,
    rx_buffer: Vec<u8>,
    tx_buffer: Vec<u8>,
}

impl TcpHttpTransport {
    pub fn new(stack: Stack<'static>) -> Self {
        Self {
            stack,
            rx_buffer: alloc::vec![0; SOCKET_BUFFER_LEN],
            tx_buffer: alloc::vec![0; SOCKET_BUFFER_LEN],
        }
    }

    /// Literal addresses pass through, `.local` names go to mDNS and
    /// everything else to the DHCP-provided DNS server
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr, TransportError> {
        if let Ok(address) = host.parse::<Ipv4Addr>() {
            return Ok(address);
        }

        if host.ends_with(".local") {
            return resolve_local(self.stack, host).await.ok_or_else(|| {
                warn!("No mDNS answer for {}", host);
                TransportError::Dns
            });
        }

        let answers = self
            .stack
            .dns_query(host, DnsQueryType::A)
            .await
            .map_err(|e| {
                warn!("DNS lookup of {} failed: {:?}", host, e);
                TransportError::Dns
            })?;
        answers
            .iter()
            .find_map(|address| match address {
                IpAddress::Ipv4(v4) => Some(*v4),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .ok_or(TransportError::Dns)
    }
}

/// `host[:port]`
fn split_port(server: &str) -> (&str, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (server, HTTP_PORT),
        },
        None => (server, HTTP_PORT),
    }
}

impl HttpTransport for TcpHttpTransport {
    async fn get(&mut self, server: &str, path: &str) -> Result<HttpResponse, TransportError> {
        if with_timeout(SOCKET_TIMEOUT, self.stack.wait_config_up())
            .await
            .is_err()
        {
            return Err(TransportError::Timeout);
        }

        let (host, port) = split_port(server);
        let address = self.resolve(host).await?;
        debug!("GET http://{}:{}{} ({})", host, port, path, address);

        let mut socket = TcpSocket::new(self.stack, &mut self.rx_buffer, &mut self.tx_buffer);
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        socket.connect((address, port)).await.map_err(|e| {
            warn!("Connecting to {}:{} failed: {:?}", host, port, e);
            TransportError::Connect
        })?;

        let request = build_get_request(host, path);
        let mut pending = request.as_bytes();
        while !pending.is_empty() {
            let written = socket.write(pending).await.map_err(|_| TransportError::Io)?;
            if written == 0 {
                return Err(TransportError::Io);
            }
            pending = &pending[written..];
        }
        socket.flush().await.map_err(|_| TransportError::Io)?;

        // HTTP/1.0 with `Connection: close`: the response ends at EOF
        let mut raw = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let read = socket
                .read(&mut chunk)
                .await
                .map_err(|_| TransportError::Io)?;
            if read == 0 {
                break;
            }
            if raw.len() + read > MAX_HEADER_LEN + MAX_BODY_LEN {
                socket.abort();
                return Err(FramingError::BodyTooLarge.into());
            }
            raw.extend_from_slice(&chunk[..read]);
        }
        socket.close();

        Ok(parse_response(&raw)?)
    }
}

//! mDNS over embassy-net UDP sockets

use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, Stack};
use embassy_time::{Duration, Instant, with_timeout};
use kwartiwi_core::networking::HOSTNAME_MAX_LEN;
use kwartiwi_core::telemetry::mdns::{
    MDNS_GROUP, MDNS_PORT, address_questions, build_a_query, build_address_answer,
    build_ptr_query, parse_address, parse_response, service_name,
};
use kwartiwi_core::telemetry::{DiscoveredService, DiscoveryError, ServiceBrowser};
use log::{debug, error, info, warn};

extern crate alloc;
use alloc::format;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

const PACKET_LEN: usize = 1536;

/// Time to wait for the owner of a `.local` name to answer
pub const RESOLVE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Send `query` to the mDNS group from an ephemeral port and feed every
/// unicast reply to `on_packet` until it returns true or `timeout` elapses
async fn exchange<F>(
    stack: Stack<'static>,
    query: &[u8],
    timeout: Duration,
    mut on_packet: F,
) -> Result<(), DiscoveryError>
where
    F: FnMut(&[u8]) -> bool,
{
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0u8; PACKET_LEN * 2];
    let mut tx_meta = [PacketMetadata::EMPTY; 1];
    let mut tx_buffer = [0u8; 512];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    socket.bind(0).map_err(|e| {
        error!("mDNS query socket bind failed: {:?}", e);
        DiscoveryError::Socket
    })?;

    socket
        .send_to(query, IpEndpoint::from((MDNS_GROUP, MDNS_PORT)))
        .await
        .map_err(|e| {
            error!("mDNS query send failed: {:?}", e);
            DiscoveryError::Socket
        })?;

    let deadline = Instant::now() + timeout;
    let mut packet = [0u8; PACKET_LEN];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match with_timeout(remaining, socket.recv_from(&mut packet)).await {
            Err(_) => return Ok(()),
            Ok(Err(e)) => {
                warn!("mDNS receive failed: {:?}", e);
                return Ok(());
            }
            Ok(Ok((len, _))) => {
                if on_packet(&packet[..len]) {
                    return Ok(());
                }
            }
        }
    }
}

/// [`ServiceBrowser`] sending one-shot PTR queries
pub struct UdpServiceBrowser {
    stack: Stack<'static>,
}

impl UdpServiceBrowser {
    pub fn new(stack: Stack<'static>) -> Self {
        Self { stack }
    }
}

impl ServiceBrowser for UdpServiceBrowser {
    async fn query_ptr(
        &mut self,
        service: &str,
        proto: &str,
        timeout: Duration,
        max_results: usize,
    ) -> Result<Vec<DiscoveredService>, DiscoveryError> {
        let name = service_name(service, proto);
        let query = build_ptr_query(0, &name)?;
        let mut found: Vec<DiscoveredService> = Vec::new();

        exchange(self.stack, &query, timeout, |packet| {
            match parse_response(packet, &name) {
                Ok(services) => {
                    for service in services {
                        if !found.iter().any(|f| f.instance == service.instance) {
                            found.push(service);
                        }
                    }
                }
                Err(e) => debug!("Ignoring mDNS packet: {}", e),
            }
            found.len() >= max_results
        })
        .await?;

        found.truncate(max_results);
        Ok(found)
    }
}

/// Resolve a `.local` host through a one-shot A query
pub async fn resolve_local(stack: Stack<'static>, host: &str) -> Option<Ipv4Addr> {
    let query = build_a_query(0, host).ok()?;
    let mut address = None;
    exchange(stack, &query, RESOLVE_TIMEOUT, |packet| {
        address = parse_address(packet, host).ok().flatten();
        address.is_some()
    })
    .await
    .ok()?;
    address
}

/// Answers address questions for `<hostname>.local`
#[embassy_executor::task]
pub async fn mdns_responder_task(
    stack: Stack<'static>,
    hostname: heapless::String<HOSTNAME_MAX_LEN>,
) {
    let fqdn = format!("{}.local", hostname.as_str());

    if let Err(e) = stack.join_multicast_group(MDNS_GROUP) {
        error!("Joining the mDNS group failed: {:?}", e);
        return;
    }

    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0u8; PACKET_LEN * 2];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_buffer = [0u8; 512];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(e) = socket.bind(MDNS_PORT) {
        error!("mDNS responder bind failed: {:?}", e);
        return;
    }
    info!("mDNS responder up for {}", fqdn);

    let mut packet = [0u8; PACKET_LEN];
    loop {
        let (len, meta) = match socket.recv_from(&mut packet).await {
            Ok(received) => received,
            Err(e) => {
                warn!("mDNS responder receive failed: {:?}", e);
                continue;
            }
        };

        let asked = address_questions(&packet[..len])
            .map(|names| names.iter().any(|n| n.eq_ignore_ascii_case(&fqdn)))
            .unwrap_or(false);
        if !asked {
            continue;
        }
        let Some(config) = stack.config_v4() else {
            continue;
        };

        let answer = match build_address_answer(&fqdn, config.address.address()) {
            Ok(answer) => answer,
            Err(e) => {
                error!("Cannot encode mDNS answer: {}", e);
                continue;
            }
        };

        // Legacy resolvers query from their own port and expect a unicast reply
        let destination = if meta.endpoint.port == MDNS_PORT {
            IpEndpoint::from((MDNS_GROUP, MDNS_PORT))
        } else {
            meta.endpoint
        };
        if let Err(e) = socket.send_to(&answer, destination).await {
            warn!("mDNS answer send failed: {:?}", e);
        }
    }
}

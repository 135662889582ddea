//! One-shot mDNS service browsing
//!
//! Just enough of RFC 6762/6763 to find meter-data servers: a PTR question for
//! `<service>.<proto>.local` and a parser that joins the PTR, SRV and A
//! records of the answers into [`DiscoveredService`]s. Queries are sent from
//! an ephemeral port, so responders answer by unicast.
//!
//! The responder side only answers address questions for the device's own
//! hostname.

use core::net::Ipv4Addr;

use thiserror_no_std::Error;

use super::discovery::DiscoveredService;

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const CLASS_MASK: u16 = 0x7fff;
const CLASS_IN: u16 = 1;
const CACHE_FLUSH: u16 = 0x8000;
const ANSWER_TTL_SECS: u32 = 120;

const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_SRV: u16 = 33;
const TYPE_ANY: u16 = 255;

// Guards against pointer loops in compressed names
const MAX_POINTER_JUMPS: usize = 16;
const MAX_LABEL_LEN: usize = 63;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdnsError {
    #[error("Packet truncated")]
    Truncated,
    #[error("Invalid name label")]
    BadLabel,
    #[error("Name compression loop")]
    PointerLoop,
}

/// `_service._proto.local`
pub fn service_name(service: &str, proto: &str) -> String {
    let mut name = String::with_capacity(service.len() + proto.len() + 7);
    name.push_str(service);
    name.push('.');
    name.push_str(proto);
    name.push_str(".local");
    name
}

/// Encode a standard query with a single PTR question for `name`
pub fn build_ptr_query(id: u16, name: &str) -> Result<Vec<u8>, MdnsError> {
    build_query(id, name, TYPE_PTR)
}

/// Encode a standard query for the IPv4 address of `host`
pub fn build_a_query(id: u16, host: &str) -> Result<Vec<u8>, MdnsError> {
    build_query(id, host, TYPE_A)
}

/// Extract the instances of `name` advertised in a response packet.
///
/// Queries and records for other services yield an empty list.
pub fn parse_response(packet: &[u8], name: &str) -> Result<Vec<DiscoveredService>, MdnsError> {
    let mut answers = read_answers(packet)?;
    let pointers = core::mem::take(&mut answers.pointers);

    let services = pointers
        .into_iter()
        .filter(|(owner, _)| owner.eq_ignore_ascii_case(name))
        .map(|(_, instance)| {
            let target = answers
                .services
                .iter()
                .find(|(owner, _, _)| owner.eq_ignore_ascii_case(&instance));
            let address = target.and_then(|(_, host, _)| answers.address_of(host));
            DiscoveredService {
                hostname: target.map(|(_, host, _)| strip_local(host)),
                port: target.map(|(_, _, port)| *port).unwrap_or(0),
                address,
                instance,
            }
        })
        .fold(Vec::new(), |mut unique: Vec<DiscoveredService>, service| {
            if !unique.iter().any(|s| s.instance == service.instance) {
                unique.push(service);
            }
            unique
        });
    Ok(services)
}

/// The IPv4 address a response packet gives for `host`, if any
pub fn parse_address(packet: &[u8], host: &str) -> Result<Option<Ipv4Addr>, MdnsError> {
    Ok(read_answers(packet)?.address_of(host))
}

/// Names asked for with an A (or ANY) question in a query packet
pub fn address_questions(packet: &[u8]) -> Result<Vec<String>, MdnsError> {
    let mut reader = Reader::new(packet);
    let _id = reader.u16()?;
    let flags = reader.u16()?;
    let questions = reader.u16()?;
    reader.skip(6)?;
    if flags & FLAG_RESPONSE != 0 {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for _ in 0..questions {
        let name = reader.name()?;
        let qtype = reader.u16()?;
        let _class = reader.u16()?;
        if qtype == TYPE_A || qtype == TYPE_ANY {
            names.push(name);
        }
    }
    Ok(names)
}

/// Encode an authoritative response carrying one A record for `host`
pub fn build_address_answer(host: &str, address: Ipv4Addr) -> Result<Vec<u8>, MdnsError> {
    let mut packet = Vec::with_capacity(HEADER_LEN + host.len() + 16);
    // Response, authoritative, one answer
    packet.extend_from_slice(&[0, 0, 0x84, 0x00, 0, 0, 0, 1, 0, 0, 0, 0]);
    encode_name(&mut packet, host)?;
    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&(CLASS_IN | CACHE_FLUSH).to_be_bytes());
    packet.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    packet.extend_from_slice(&4u16.to_be_bytes());
    packet.extend_from_slice(&address.octets());
    Ok(packet)
}

fn encode_name(packet: &mut Vec<u8>, name: &str) -> Result<(), MdnsError> {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(MdnsError::BadLabel);
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    Ok(())
}

fn build_query(id: u16, name: &str, qtype: u16) -> Result<Vec<u8>, MdnsError> {
    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    // Flags, then one question and no records
    packet.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    encode_name(&mut packet, name)?;
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Records of interest from every section of a response
#[derive(Default)]
struct Answers {
    /// (service, instance)
    pointers: Vec<(String, String)>,
    /// (instance, target host, port)
    services: Vec<(String, String, u16)>,
    /// (host, address)
    addresses: Vec<(String, Ipv4Addr)>,
}

impl Answers {
    fn address_of(&self, host: &str) -> Option<Ipv4Addr> {
        let host = host.trim_end_matches('.');
        self.addresses
            .iter()
            .find(|(owner, _)| owner.eq_ignore_ascii_case(host))
            .map(|(_, addr)| *addr)
    }
}

fn read_answers(packet: &[u8]) -> Result<Answers, MdnsError> {
    let mut answers = Answers::default();
    let mut reader = Reader::new(packet);
    let _id = reader.u16()?;
    let flags = reader.u16()?;
    if flags & FLAG_RESPONSE == 0 {
        return Ok(answers);
    }
    let questions = reader.u16()?;
    let records = reader.u16()? as usize + reader.u16()? as usize + reader.u16()? as usize;

    for _ in 0..questions {
        reader.name()?;
        reader.skip(4)?;
    }

    for _ in 0..records {
        let owner = reader.name()?;
        let rtype = reader.u16()?;
        let class = reader.u16()? & CLASS_MASK;
        let _ttl = reader.u32()?;
        let len = reader.u16()? as usize;
        let start = reader.pos;
        reader.skip(len)?;
        if class != CLASS_IN {
            continue;
        }

        let mut rdata = Reader::at(packet, start);
        match rtype {
            TYPE_PTR => {
                let instance = rdata.name()?;
                answers.pointers.push((owner, instance));
            }
            TYPE_SRV => {
                rdata.skip(4)?;
                let port = rdata.u16()?;
                let target = rdata.name()?;
                answers.services.push((owner, target, port));
            }
            TYPE_A if len == 4 => {
                let octets = rdata.take(4)?;
                answers.addresses.push((
                    owner,
                    Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
                ));
            }
            _ => {}
        }
    }

    Ok(answers)
}

fn strip_local(host: &str) -> String {
    let host = host.trim_end_matches('.');
    match host.len().checked_sub(".local".len()) {
        Some(cut)
            if host
                .get(cut..)
                .is_some_and(|tail| tail.eq_ignore_ascii_case(".local")) =>
        {
            host[..cut].into()
        }
        _ => host.into(),
    }
}

// ============================================================================
// Packet reader
// ============================================================================

struct Reader<'p> {
    packet: &'p [u8],
    pos: usize,
}

impl<'p> Reader<'p> {
    fn new(packet: &'p [u8]) -> Self {
        Self::at(packet, 0)
    }

    fn at(packet: &'p [u8], pos: usize) -> Self {
        Self { packet, pos }
    }

    fn take(&mut self, len: usize) -> Result<&'p [u8], MdnsError> {
        let end = self.pos.checked_add(len).ok_or(MdnsError::Truncated)?;
        let bytes = self.packet.get(self.pos..end).ok_or(MdnsError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), MdnsError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, MdnsError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MdnsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MdnsError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a possibly compressed name as dotted text
    fn name(&mut self) -> Result<String, MdnsError> {
        let mut name = String::new();
        let mut cursor = Reader::at(self.packet, self.pos);
        let mut resume = None;
        let mut jumps = 0;

        loop {
            let len = cursor.u8()?;
            match len & 0xc0 {
                0x00 if len == 0 => break,
                0x00 => {
                    let label = core::str::from_utf8(cursor.take(len as usize)?)
                        .map_err(|_| MdnsError::BadLabel)?;
                    if !name.is_empty() {
                        name.push('.');
                    }
                    name.push_str(label);
                }
                0xc0 => {
                    let low = cursor.u8()?;
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(MdnsError::PointerLoop);
                    }
                    resume.get_or_insert(cursor.pos);
                    cursor.pos = (((len & 0x3f) as usize) << 8) | low as usize;
                }
                _ => return Err(MdnsError::BadLabel),
            }
        }

        self.pos = resume.unwrap_or(cursor.pos);
        Ok(name)
    }
}

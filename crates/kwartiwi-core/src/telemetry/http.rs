//! Minimal HTTP/1.0 framing for the meter-data API
//!
//! Requests are single `GET`s with `Connection: close`, so a response ends
//! when the server closes the socket. Transports read until EOF (or
//! [`MAX_BODY_LEN`] past the headers) and hand the raw bytes to
//! [`parse_response`].

use core::fmt::Write;

use thiserror_no_std::Error;

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;

/// Largest response body accepted
pub const MAX_BODY_LEN: usize = 100 * 1024;

/// Port the meter-data server listens on
pub const HTTP_PORT: u16 = 80;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("Response ended before the headers were complete")]
    Incomplete,
    #[error("Malformed status line")]
    MalformedStatusLine,
    #[error("Body shorter than its Content-Length")]
    TruncatedBody,
    #[error("Body exceeds the buffer limit")]
    BodyTooLarge,
}

/// Serialize a `GET` for `path` on `host`
pub fn build_get_request(host: &str, path: &str) -> String {
    let mut request = String::with_capacity(96 + host.len() + path.len());
    // Writing into a String cannot fail
    let _ = write!(
        request,
        "GET {path} HTTP/1.0\r\nHost: {host}\r\nAccept: application/json\r\nConnection: close\r\n\r\n"
    );
    request
}

/// Split a complete raw response into status code and body
pub fn parse_response(raw: &[u8]) -> Result<HttpResponse, FramingError> {
    let head_len = raw
        .windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .ok_or(FramingError::Incomplete)?;
    let head = core::str::from_utf8(&raw[..head_len])
        .map_err(|_| FramingError::MalformedStatusLine)?;

    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(parse_status_line)
        .ok_or(FramingError::MalformedStatusLine)?;

    let content_length = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    });

    let mut body = &raw[head_len + HEADER_END.len()..];
    if let Some(expected) = content_length {
        if body.len() < expected {
            return Err(FramingError::TruncatedBody);
        }
        body = &body[..expected];
    }
    if body.len() > MAX_BODY_LEN {
        return Err(FramingError::BodyTooLarge);
    }

    Ok(HttpResponse {
        status,
        body: body.to_vec(),
    })
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

//! Session descriptions and candidates for the UDP media transport.
//!
//! Offers are generated by the server, answers come from the viewer:
//!
//! ```text
//! v=0                                          <- version
//! o=- <session-id> 0 IN IP4 <addr>             <- origin
//! s=layercast                                  <- session name
//! c=IN IP4 <addr>                              <- media address
//! t=0 0                                        <- live
//! a=tool:layercast
//! m=application <port> udp layered             <- media port
//! ```
//!
//! Only `c=` and the `m=` port matter when reading an answer.
//!
//! Candidates use the usual host-candidate shape:
//! `candidate:1 1 udp 2130706431 <addr> <port> typ host`.

use std::net::{IpAddr, SocketAddr};

use crate::error::{Result, StreamError};

/// Generate the offer for a session whose media socket is `host:port`.
pub fn generate_offer(session_id: u64, host: &str, port: u16) -> String {
    let sdp = [
        "v=0".to_string(),
        format!("o=- {session_id} 0 IN IP4 {host}"),
        "s=layercast".to_string(),
        format!("c=IN IP4 {host}"),
        "t=0 0".to_string(),
        "a=tool:layercast".to_string(),
        format!("m=application {port} udp layered"),
    ];

    tracing::debug!(session_id, sdp = %sdp.join(" | "), "offer generated");

    format!("{}\r\n", sdp.join("\r\n"))
}

/// Generate an answer naming the viewer's media address.
pub fn generate_answer(addr: SocketAddr) -> String {
    format!(
        "v=0\r\no=- 0 0 IN IP4 {ip}\r\ns=viewer\r\nc=IN IP4 {ip}\r\nt=0 0\r\nm=application {port} udp layered\r\n",
        ip = addr.ip(),
        port = addr.port()
    )
}

/// Extract the media address from a session description.
pub fn parse_media_addr(sdp: &str) -> Result<SocketAddr> {
    let mut ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;

    for line in sdp.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("c=") {
            let addr = rest.split_whitespace().nth(2).ok_or_else(|| {
                StreamError::NegotiationFailure(format!("malformed connection line: {line}"))
            })?;
            ip = Some(addr.parse().map_err(|_| {
                StreamError::NegotiationFailure(format!("bad connection address: {addr}"))
            })?);
        } else if let Some(rest) = line.strip_prefix("m=") {
            let value = rest.split_whitespace().nth(1).ok_or_else(|| {
                StreamError::NegotiationFailure(format!("malformed media line: {line}"))
            })?;
            port = Some(value.parse().map_err(|_| {
                StreamError::NegotiationFailure(format!("bad media port: {value}"))
            })?);
        }
    }

    match (ip, port) {
        (Some(ip), Some(port)) if port != 0 => Ok(SocketAddr::new(ip, port)),
        _ => Err(StreamError::NegotiationFailure(
            "description has no usable c=/m= address".into(),
        )),
    }
}

/// Format a host candidate for `addr`.
pub fn format_candidate(addr: SocketAddr) -> String {
    format!(
        "candidate:1 1 udp 2130706431 {} {} typ host",
        addr.ip(),
        addr.port()
    )
}

/// Parse the address out of a candidate string.
pub fn parse_candidate(candidate: &str) -> Result<SocketAddr> {
    let fields: Vec<&str> = candidate.split_whitespace().collect();
    if fields.len() < 6 || !fields[0].starts_with("candidate:") {
        return Err(StreamError::NegotiationFailure(format!(
            "malformed candidate: {candidate}"
        )));
    }
    let ip: IpAddr = fields[4]
        .parse()
        .map_err(|_| StreamError::NegotiationFailure(format!("bad candidate address: {}", fields[4])))?;
    let port: u16 = fields[5]
        .parse()
        .map_err(|_| StreamError::NegotiationFailure(format!("bad candidate port: {}", fields[5])))?;
    Ok(SocketAddr::new(ip, port))
}

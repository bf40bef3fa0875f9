//! MQTT CONNECT Inspection
//!
//! Extracts the Client Identifier from the first bytes peeked off a
//! freshly accepted connection, without consuming the stream. The
//! forwarder receives and relays the same bytes afterwards.
//!
//! Only the CONNECT variable header is walked; nothing past the
//! Client Identifier is examined and no other packet type is parsed.

use std::net::IpAddr;

/// MQTT CONNECT fixed header: packet type 1, flags 0.
const CONNECT_FIXED_HEADER: u8 = 0x10;

/// Extracts the Client Identifier from a peeked CONNECT packet.
///
/// Walks the variable header (protocol name, level, connect flags,
/// keep-alive, plus the properties block on protocol level 5) to reach
/// the Client Identifier, the first field of the payload. Returns
/// `None` when the buffer does not hold a recognizable CONNECT prefix;
/// the returned identifier may be empty, which MQTT permits.
pub fn parse_client_id(buf: &[u8]) -> Option<String> {
    if buf.first() != Some(&CONNECT_FIXED_HEADER) {
        return None;
    }

    let mut cursor = 1usize;
    // Remaining length is only advanced over; the peeked buffer may be
    // shorter than the full packet and every later read is bounds-checked.
    skip_remaining_length(buf, &mut cursor)?;

    let protocol_name_len = read_u16(buf, &mut cursor)? as usize;
    skip(buf, &mut cursor, protocol_name_len)?;

    let protocol_level = read_u8(buf, &mut cursor)?;
    let _connect_flags = read_u8(buf, &mut cursor)?;
    let _keep_alive = read_u16(buf, &mut cursor)?;

    // MQTT 5 inserts a properties block before the payload.
    if protocol_level == 5 {
        let props_len = read_varint(buf, &mut cursor)?;
        skip(buf, &mut cursor, props_len)?;
    }

    let client_id_len = read_u16(buf, &mut cursor)? as usize;
    let end = cursor.checked_add(client_id_len)?;
    if end > buf.len() {
        return None;
    }

    String::from_utf8(buf[cursor..end].to_vec()).ok()
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Option<u8> {
    let byte = *buf.get(*cursor)?;
    *cursor += 1;
    Some(byte)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Option<u16> {
    let high = read_u8(buf, cursor)?;
    let low = read_u8(buf, cursor)?;
    Some(u16::from_be_bytes([high, low]))
}

fn skip(buf: &[u8], cursor: &mut usize, len: usize) -> Option<()> {
    let end = cursor.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    *cursor = end;
    Some(())
}

/// Decodes an MQTT variable-length integer (at most 4 bytes).
fn read_varint(buf: &[u8], cursor: &mut usize) -> Option<usize> {
    let mut value = 0usize;
    let mut shift = 0u32;
    for _ in 0..4 {
        let byte = read_u8(buf, cursor)?;
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

/// Advances over the remaining-length field without validating it
/// against the buffer; the peek window is usually shorter than the
/// packet it announces.
fn skip_remaining_length(buf: &[u8], cursor: &mut usize) -> Option<()> {
    read_varint(buf, cursor).map(|_| ())
}

/// Peer identity as surfaced to logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Textual peer IP address.
    pub ip: String,
    /// Client Identifier from the CONNECT packet. `None` when the
    /// packet was missing, unrecognized, or carried an empty id.
    pub client_id: Option<String>,
}

impl ClientInfo {
    /// Combines the peer address with the parsed Client Identifier.
    ///
    /// An absent or empty identifier falls back to anonymous.
    pub fn resolve(peer_ip: IpAddr, parsed_client_id: Option<String>) -> Self {
        ClientInfo {
            ip: peer_ip.to_string(),
            client_id: parsed_client_id.filter(|id| !id.is_empty()),
        }
    }

    /// Display name for logs: the Client Identifier, or `anonymous_<ip>`.
    pub fn display_id(&self) -> String {
        match &self.client_id {
            Some(id) => id.clone(),
            None => format!("anonymous_{}", self.ip),
        }
    }

    /// Raw Client Identifier for rate-limiter keying; empty when the
    /// client is anonymous (the limiter then keys by IP).
    pub fn limiter_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("")
    }
}

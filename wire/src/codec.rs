//! Fixed-header datagram framing: one 54-byte header followed by an
//! opaque, type-dependent data region.

use crate::error::WireError;

/// Size of the fixed header, in bytes.
pub const HEADER_LEN: usize = 54;

/// Largest data region that still fits a conventional 1500-byte Ethernet
/// MTU alongside the header.
pub const MAX_DATA_LEN: usize = 1500 - HEADER_LEN;

/// One of the eleven wire-visible message kinds, plus the deprecated
/// REDIRECT byte (decoded so it doesn't trip the unknown-type counter,
/// never emitted or routed — see `spec.md` §9 Open Question).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Accept = 0x01,
    Reject = 0x02,
    Join = 0x03,
    Rejoin = 0x04,
    Leave = 0x05,
    Redirect = 0x06,
    Error = 0xA0,
    Kalive = 0xC0,
    Gkalive = 0xC1,
    Ack = 0xC2,
    Actions = 0xD0,
    State = 0xD1,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => MessageType::Accept,
            0x02 => MessageType::Reject,
            0x03 => MessageType::Join,
            0x04 => MessageType::Rejoin,
            0x05 => MessageType::Leave,
            0x06 => MessageType::Redirect,
            0xA0 => MessageType::Error,
            0xC0 => MessageType::Kalive,
            0xC1 => MessageType::Gkalive,
            0xC2 => MessageType::Ack,
            0xD0 => MessageType::Actions,
            0xD1 => MessageType::State,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// Zero-pads a short ASCII identifier (lobby or player id) to 4 bytes.
/// Identifiers longer than 4 bytes are truncated, matching the fixed
/// header width — callers are expected to only ever hand this
/// `short_uuid()`-sized ids.
pub fn pack_short_id(id: &str) -> [u8; 4] {
    let mut out = [0u8; 4];
    let bytes = id.as_bytes();
    let n = bytes.len().min(4);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Right-trims the zero padding `pack_short_id` introduced.
pub fn unpack_short_id(bytes: [u8; 4]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(4);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A decoded (or to-be-encoded) wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub msg_type: MessageType,
    pub lobby_id: [u8; 4],
    pub player_id: [u8; 4],
    pub seq_num: u32,
    pub ttl: u8,
    pub source: [u8; 16],
    pub destination: [u8; 16],
    pub port: u32,
    pub data: Vec<u8>,
}

impl Payload {
    /// Canonical compressed IPv6 text form of `source`, for logging and
    /// cache keys.
    pub fn short_source(&self) -> String {
        crate::location::short_addr(&self.source)
    }

    /// Canonical compressed IPv6 text form of `destination`.
    pub fn short_destination(&self) -> String {
        crate::location::short_addr(&self.destination)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len());
        buf.push(self.msg_type.into());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.lobby_id);
        buf.extend_from_slice(&self.player_id);
        buf.extend_from_slice(&self.seq_num.to_be_bytes());
        buf.push(self.ttl);
        buf.extend_from_slice(&self.source);
        buf.extend_from_slice(&self.destination);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::MalformedHeader);
        }

        let msg_type = MessageType::try_from(bytes[0])?;
        let length = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
        let lobby_id: [u8; 4] = bytes[5..9].try_into().unwrap();
        let player_id: [u8; 4] = bytes[9..13].try_into().unwrap();
        let seq_num = u32::from_be_bytes(bytes[13..17].try_into().unwrap());
        let ttl = bytes[17];
        let source: [u8; 16] = bytes[18..34].try_into().unwrap();
        let destination: [u8; 16] = bytes[34..50].try_into().unwrap();
        let port = u32::from_be_bytes(bytes[50..54].try_into().unwrap());

        if HEADER_LEN + length > bytes.len() {
            return Err(WireError::MalformedHeader);
        }
        let data = bytes[HEADER_LEN..HEADER_LEN + length].to_vec();

        Ok(Self {
            msg_type,
            lobby_id,
            player_id,
            seq_num,
            ttl,
            source,
            destination,
            port,
            data,
        })
    }
}

/// A 6-byte `(cur_x, cur_y, cur_tile, nxt_x, nxt_y, nxt_tile)` record,
/// carrying either a client intent or a server-authored delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub cur_x: u8,
    pub cur_y: u8,
    pub cur_tile: u8,
    pub nxt_x: u8,
    pub nxt_y: u8,
    pub nxt_tile: u8,
}

impl Change {
    pub const LEN: usize = 6;

    pub fn encode(&self) -> [u8; Self::LEN] {
        [
            self.cur_x,
            self.cur_y,
            self.cur_tile,
            self.nxt_x,
            self.nxt_y,
            self.nxt_tile,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(Self {
            cur_x: bytes[0],
            cur_y: bytes[1],
            cur_tile: bytes[2],
            nxt_x: bytes[3],
            nxt_y: bytes[4],
            nxt_tile: bytes[5],
        })
    }
}

/// Concatenates change records for an ACTIONS/STATE-adjacent data region.
pub fn encode_changes(changes: &[Change]) -> Vec<u8> {
    let mut out = Vec::with_capacity(changes.len() * Change::LEN);
    for change in changes {
        out.extend_from_slice(&change.encode());
    }
    out
}

/// Decodes `len / 6` consecutive change records, ignoring any residual
/// bytes that don't make up a full record.
pub fn decode_changes(data: &[u8]) -> Vec<Change> {
    data.chunks_exact(Change::LEN)
        .map(|chunk| Change::decode(chunk).expect("chunks_exact guarantees len == LEN"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(data: Vec<u8>) -> Payload {
        Payload {
            msg_type: MessageType::Actions,
            lobby_id: pack_short_id("ab1"),
            player_id: pack_short_id("p1"),
            seq_num: 42,
            ttl: 3,
            source: [0u8; 16],
            destination: [1u8; 16],
            port: 9999,
            data,
        }
    }

    #[test]
    fn round_trip_empty_data() {
        let p = sample_payload(vec![]);
        assert_eq!(Payload::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn round_trip_with_changes() {
        let changes = vec![Change {
            cur_x: 1,
            cur_y: 1,
            cur_tile: 10,
            nxt_x: 2,
            nxt_y: 1,
            nxt_tile: 0,
        }];
        let p = sample_payload(encode_changes(&changes));
        let decoded = Payload::decode(&p.encode()).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decode_changes(&decoded.data), changes);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert_eq!(
            Payload::decode(&[0u8; HEADER_LEN - 1]),
            Err(WireError::MalformedHeader)
        );
    }

    #[test]
    fn decode_rejects_length_overrun() {
        let mut buf = vec![MessageType::Kalive.into()];
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; HEADER_LEN - 5]);
        assert_eq!(Payload::decode(&buf), Err(WireError::MalformedHeader));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = vec![0xFFu8];
        buf.extend_from_slice(&[0u8; HEADER_LEN - 1]);
        assert_eq!(Payload::decode(&buf), Err(WireError::UnknownType(0xFF)));
    }

    #[test]
    fn short_id_pads_and_trims() {
        assert_eq!(pack_short_id("ab"), [b'a', b'b', 0, 0]);
        assert_eq!(unpack_short_id([b'a', b'b', 0, 0]), "ab");
        assert_eq!(unpack_short_id([b'a', b'b', b'c', b'd']), "abcd");
    }

    #[test]
    fn decode_changes_ignores_residual_bytes() {
        let mut data = encode_changes(&[Change {
            cur_x: 0,
            cur_y: 0,
            cur_tile: 0,
            nxt_x: 0,
            nxt_y: 0,
            nxt_tile: 0,
        }]);
        data.push(0xFF); // residual, not a full record
        assert_eq!(decode_changes(&data).len(), 1);
    }
}

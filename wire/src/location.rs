//! Euclidean distance, IPv6 address packing, short-id generation, and
//! the node-location contract each binary's `main()` fills in.

use rand::Rng;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv6Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// Euclidean distance between two `(x, y)` positions.
pub fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

/// Packs an IPv6 address into its 16-byte wire form.
pub fn pack_addr(addr: Ipv6Addr) -> [u8; 16] {
    addr.octets()
}

/// Canonical (compressed) textual form of a 16-byte IPv6 address, for
/// logging and cache keys.
pub fn short_addr(bytes: &[u8; 16]) -> String {
    Ipv6Addr::from(*bytes).to_string()
}

/// Base-57 alphabet: base62 (digits + upper + lower) with the
/// visually ambiguous `0 O I l 1` removed.
const SHORT_UUID_ALPHABET: &[u8] =
    b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// A 4-character identifier drawn from [`SHORT_UUID_ALPHABET`]. Collision
/// resistant enough at the scale of <=4 players per lobby and a small
/// number of concurrent lobbies; callers that admit new ids (the front
/// door, new lobby creation) are expected to regenerate on collision.
pub fn short_uuid() -> String {
    let mut rng = rand::thread_rng();
    (0..4)
        .map(|_| SHORT_UUID_ALPHABET[rng.gen_range(0..SHORT_UUID_ALPHABET.len())] as char)
        .collect()
}

/// Formats a position as the ASCII `"x,y"` string carried in
/// KALIVE/GKALIVE payload data.
pub fn format_xy(position: (f32, f32)) -> String {
    format!("{},{}", position.0, position.1)
}

/// Parses a `"x,y"` payload data region back into a position. Empty or
/// malformed data (e.g. the bodyless KALIVE some senders emit) yields
/// `None` rather than an error — coordinates are optional on the wire.
pub fn parse_xy(data: &[u8]) -> Option<(f32, f32)> {
    let text = std::str::from_utf8(data).ok()?;
    let (x, y) = text.trim().split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// A node's geographic position and the IPv6 address it is reachable at.
/// The two are obtained from whatever external file/DNS format a given
/// deployment uses; the core only consumes this value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeLocation {
    pub position: (f32, f32),
    pub address: Ipv6Addr,
}

/// Pluggable source of a node's location. Map-file and CORE/EMANE XML
/// readers are external collaborators with their own formats; this
/// crate depends only on this trait's contract.
pub trait NodeLocator {
    fn locate(&self) -> io::Result<NodeLocation>;
}

/// Reads position from a single-line `"x,y"` file (empty/absent ⇒
/// `(0.0, 0.0)`) and resolves the address from a literal IPv6 string or
/// a DNS name. Sufficient for tests and for a deployment that doesn't
/// need the CORE/EMANE XML reader.
pub struct StaticNodeLocator {
    pub position_file: Option<PathBuf>,
    pub address: String,
}

impl NodeLocator for StaticNodeLocator {
    fn locate(&self) -> io::Result<NodeLocation> {
        let position = match &self.position_file {
            Some(path) => parse_position_file(path)?,
            None => (0.0, 0.0),
        };
        let address = resolve_ipv6(&self.address)?;
        Ok(NodeLocation { position, address })
    }
}

fn parse_position_file(path: &Path) -> io::Result<(f32, f32)> {
    let content = fs::read_to_string(path)?;
    let (x, y) = content
        .trim()
        .split_once(',')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected \"x,y\""))?;
    let x: f32 = x
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad x coordinate"))?;
    let y: f32 = y
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad y coordinate"))?;
    Ok((x, y))
}

/// Accepts a literal IPv6 address or resolves a DNS name, mapping a v4
/// result into its v6-mapped form.
fn resolve_ipv6(address: &str) -> io::Result<Ipv6Addr> {
    if let Ok(addr) = address.parse::<Ipv6Addr>() {
        return Ok(addr);
    }
    (address, 0)
        .to_socket_addrs()?
        .find_map(|a| match a.ip() {
            IpAddr::V6(v6) => Some(v6),
            IpAddr::V4(v4) => Some(v4.to_ipv6_mapped()),
        })
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved for node"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        assert_eq!(distance((0.0, 0.0), (3.0, 4.0)), 5.0);
    }

    #[test]
    fn pack_and_short_addr_round_trip_through_display() {
        let addr: Ipv6Addr = "fe80::1".parse().unwrap();
        let packed = pack_addr(addr);
        assert_eq!(short_addr(&packed), "fe80::1");
    }

    #[test]
    fn alphabet_has_57_entries() {
        assert_eq!(SHORT_UUID_ALPHABET.len(), 57);
    }

    #[test]
    fn short_uuid_is_four_chars_from_alphabet() {
        for _ in 0..100 {
            let id = short_uuid();
            assert_eq!(id.len(), 4);
            assert!(id
                .bytes()
                .all(|b| SHORT_UUID_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn static_locator_reads_position_file_and_literal_address() {
        let mut path = std::env::temp_dir();
        path.push(format!("wire-location-test-{}", short_uuid()));
        std::fs::write(&path, "12.5,-3.25\n").unwrap();

        let locator = StaticNodeLocator {
            position_file: Some(path.clone()),
            address: "fe80::2".into(),
        };
        let location = locator.locate().unwrap();
        assert_eq!(location.position, (12.5, -3.25));
        assert_eq!(location.address, "fe80::2".parse::<Ipv6Addr>().unwrap());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn static_locator_defaults_position_without_file() {
        let locator = StaticNodeLocator {
            position_file: None,
            address: "::1".into(),
        };
        assert_eq!(locator.locate().unwrap().position, (0.0, 0.0));
    }
}

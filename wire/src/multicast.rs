//! The DTN multicast group both mobile clients and gateways beacon and
//! listen on.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv6Addr, SocketAddrV6, UdpSocket};
use std::time::Duration;

/// `ff15:1234:5678:9101:1121:3141:5161:0001` — the DTN beacon group.
pub const DTN_GROUP: Ipv6Addr = Ipv6Addr::new(
    0xff15, 0x1234, 0x5678, 0x9101, 0x1121, 0x3141, 0x5161, 0x0001,
);
pub const DTN_PORT: u16 = 9998;
pub const DTN_HOP_LIMIT: u32 = 3;

/// Builds a UDP socket bound to `DTN_PORT`, joined to `DTN_GROUP` on
/// the default interface, with outgoing multicast hop limit capped at
/// `DTN_HOP_LIMIT` and a 2-second read timeout for the caller's recv
/// loop.
pub fn bind_dtn_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_hops_v6(DTN_HOP_LIMIT)?;
    socket.join_multicast_v6(&DTN_GROUP, 0)?;
    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, DTN_PORT, 0, 0);
    socket.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(Duration::from_secs(2)))?;
    Ok(socket)
}

//! Bridges the DTN multicast overlay to the wired authoritative server:
//! beacon, wired-in, dtn-in, outbound, cache-cleanup.

use crate::error::GatewayError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wire::cache::RetransmitCache;
use wire::codec::{pack_short_id, unpack_short_id, MessageType, Payload};
use wire::location::{distance, format_xy, pack_addr, parse_xy};
use wire::routing::{preferred_next_hop, NeighborInfo, NeighborMap};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);
const BEACON_INTERVAL: Duration = Duration::from_secs(1);
const OUTBOUND_INTERVAL: Duration = Duration::from_millis(30);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const CACHE_TIMEOUT: Duration = Duration::from_secs(20);

pub struct GatewayConfig {
    pub node_id: String,
    pub local_address: Ipv6Addr,
    pub front_door: SocketAddr,
}

/// One gateway instance: a wired socket toward the authoritative
/// server, a DTN socket joined to the beacon multicast group, and the
/// five cooperating loops `run` spawns.
pub struct Gateway {
    config: GatewayConfig,
    wired_socket: UdpSocket,
    dtn_socket: UdpSocket,
    running: Arc<AtomicBool>,
    local_position: Mutex<(f32, f32)>,
    mobile_nodes: Mutex<NeighborMap>,
    /// `lobby_id -> lobby address`, learned by watching ACCEPT replies
    /// pass through on the wired side (the only place a lobby's
    /// ephemeral port is ever announced).
    lobby_routes: Mutex<HashMap<String, SocketAddr>>,
    /// Packets from the server, queued for delivery into the DTN mesh.
    outgoing_mobile: RetransmitCache,
    /// Packets from the DTN side, queued for delivery to the server.
    outgoing_server: RetransmitCache,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Gateway {
    pub fn bind(config: GatewayConfig, position: (f32, f32)) -> Result<Arc<Self>, GatewayError> {
        let wired_socket = UdpSocket::bind((config.local_address, 0))?;
        wired_socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        let dtn_socket = wire::bind_dtn_socket()?;

        Ok(Arc::new(Self {
            config,
            wired_socket,
            dtn_socket,
            running: Arc::new(AtomicBool::new(true)),
            local_position: Mutex::new(position),
            mobile_nodes: Mutex::new(NeighborMap::new()),
            lobby_routes: Mutex::new(HashMap::new()),
            outgoing_mobile: RetransmitCache::new(CACHE_TIMEOUT),
            outgoing_server: RetransmitCache::new(CACHE_TIMEOUT),
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn terminate(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn run(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        for name in ["beacon", "wired-in", "dtn-in", "outbound", "cache-cleanup"] {
            let gateway = Arc::clone(self);
            let node_id = self.config.node_id.clone();
            let handle = thread::Builder::new()
                .name(format!("gateway-{node_id}-{name}"))
                .spawn(move || match name {
                    "beacon" => gateway.beacon_loop(),
                    "wired-in" => gateway.wired_in_loop(),
                    "dtn-in" => gateway.dtn_in_loop(),
                    "outbound" => gateway.outbound_loop(),
                    _ => gateway.cache_cleanup_loop(),
                })
                .expect("failed to spawn gateway thread");
            handles.push(handle);
        }
    }

    pub fn join(&self) {
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn beacon_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(BEACON_INTERVAL);
            let position = *self.local_position.lock();
            let payload = Payload {
                msg_type: MessageType::Gkalive,
                lobby_id: pack_short_id(""),
                player_id: pack_short_id(""),
                seq_num: 0,
                ttl: wire::DTN_HOP_LIMIT as u8,
                source: pack_addr(self.config.local_address),
                destination: [0; 16],
                port: 0,
                data: format_xy(position).into_bytes(),
            };
            let group = SocketAddr::V6(SocketAddrV6::new(wire::DTN_GROUP, wire::DTN_PORT, 0, 0));
            let _ = self.dtn_socket.send_to(&payload.encode(), group);
        }
    }

    fn wired_in_loop(self: Arc<Self>) {
        let mut buf = [0u8; 1500];
        while self.running.load(Ordering::Relaxed) {
            let (n, from) = match self.wired_socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    warn!(gateway = %self.config.node_id, error = %e, "wired recv failed");
                    continue;
                }
            };
            let payload = match Payload::decode(&buf[..n]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(gateway = %self.config.node_id, error = %e, "malformed datagram on wired socket");
                    continue;
                }
            };

            if payload.msg_type == MessageType::Accept {
                if let Some(port) = payload.data.get(0..2).and_then(|s| s.try_into().ok()).map(u16::from_be_bytes) {
                    let lobby_id = unpack_short_id(payload.lobby_id);
                    self.lobby_routes.lock().insert(lobby_id, SocketAddr::new(from.ip(), port));
                }
            }

            let dest_ip = Ipv6Addr::from(payload.destination);
            let target = SocketAddr::V6(SocketAddrV6::new(dest_ip, wire::DTN_PORT, 0, 0));
            self.outgoing_mobile.add_unsent(target, payload);
        }
    }

    fn dtn_in_loop(self: Arc<Self>) {
        let mut buf = [0u8; 1500];
        while self.running.load(Ordering::Relaxed) {
            let (n, from) = match self.dtn_socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    warn!(gateway = %self.config.node_id, error = %e, "dtn recv failed");
                    continue;
                }
            };
            let payload = match Payload::decode(&buf[..n]) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let addr = match from.ip() {
                IpAddr::V6(v6) => v6,
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            };
            if addr == self.config.local_address {
                continue;
            }

            match payload.msg_type {
                MessageType::Gkalive => {
                    // Another gateway's beacon; mobile-neighbor bookkeeping is
                    // this gateway's only concern, not peer gateways.
                }
                MessageType::Kalive => {
                    if let Some(position) = parse_xy(&payload.data) {
                        let hops = wire::DTN_HOP_LIMIT.saturating_sub(payload.ttl as u32) as u8;
                        let info = NeighborInfo {
                            distance: distance(*self.local_position.lock(), position),
                            position,
                            last_seen: Instant::now(),
                            hops,
                        };
                        self.mobile_nodes.lock().insert(addr, info);
                    }
                    self.forward_to_server(Payload { data: Vec::new(), ..payload });
                }
                MessageType::Ack => {
                    self.outgoing_mobile.ack(from, &payload);
                }
                _ => self.forward_to_server(payload),
            }
        }
    }

    fn forward_to_server(&self, payload: Payload) {
        match self.route_for(&payload) {
            Some(target) => self.outgoing_server.add_unsent(target, payload),
            None => debug!(
                gateway = %self.config.node_id,
                lobby = %unpack_short_id(payload.lobby_id),
                "no known route for lobby yet, dropping",
            ),
        }
    }

    fn route_for(&self, payload: &Payload) -> Option<SocketAddr> {
        let lobby_id = unpack_short_id(payload.lobby_id);
        if lobby_id.is_empty() {
            return Some(self.config.front_door);
        }
        self.lobby_routes.lock().get(&lobby_id).copied()
    }

    fn outbound_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(OUTBOUND_INTERVAL);

            let preferred = preferred_next_hop(&NeighborMap::new(), &self.mobile_nodes.lock());
            for (_, payload) in self.outgoing_mobile.drain_unsent() {
                self.send_to_mobile(&payload, preferred);
            }
            for (_, payload) in self.outgoing_mobile.pending_retransmit(RETRY_INTERVAL) {
                self.send_to_mobile(&payload, preferred);
            }

            for (addr, payload) in self.outgoing_server.drain_unsent() {
                let _ = self.wired_socket.send_to(&payload.encode(), addr);
            }
            for (addr, payload) in self.outgoing_server.pending_retransmit(RETRY_INTERVAL) {
                let _ = self.wired_socket.send_to(&payload.encode(), addr);
            }
        }
    }

    /// Delivers to whichever mobile neighbor currently scores best —
    /// `preferred_next_hop` with an empty gateway map degenerates to
    /// "closest known mobile node", exactly the "next-hop mobile" this
    /// leg needs.
    fn send_to_mobile(&self, payload: &Payload, preferred: Option<Ipv6Addr>) {
        let Some(hop) = preferred else {
            return;
        };
        let target = SocketAddr::V6(SocketAddrV6::new(hop, wire::DTN_PORT, 0, 0));
        let _ = self.dtn_socket.send_to(&payload.encode(), target);
    }

    fn cache_cleanup_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(CACHE_TIMEOUT);
            self.outgoing_mobile.purge_expired();
            self.outgoing_server.purge_expired();
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> Arc<Gateway> {
        Gateway::bind(
            GatewayConfig {
                node_id: "gw1".into(),
                local_address: Ipv6Addr::LOCALHOST,
                front_door: "[::1]:9999".parse().unwrap(),
            },
            (0.0, 0.0),
        )
        .unwrap()
    }

    #[test]
    fn route_for_falls_back_to_front_door_for_empty_lobby_id() {
        let gw = gateway();
        let payload = Payload {
            msg_type: MessageType::Join,
            lobby_id: pack_short_id(""),
            player_id: pack_short_id(""),
            seq_num: 0,
            ttl: 3,
            source: [0; 16],
            destination: [0; 16],
            port: 0,
            data: Vec::new(),
        };
        assert_eq!(gw.route_for(&payload), Some("[::1]:9999".parse().unwrap()));
    }

    #[test]
    fn route_for_uses_learned_lobby_route() {
        let gw = gateway();
        gw.lobby_routes.lock().insert("ab12".into(), "[::1]:40000".parse().unwrap());
        let payload = Payload {
            msg_type: MessageType::Actions,
            lobby_id: pack_short_id("ab12"),
            player_id: pack_short_id("p1"),
            seq_num: 1,
            ttl: 3,
            source: [0; 16],
            destination: [0; 16],
            port: 0,
            data: Vec::new(),
        };
        assert_eq!(gw.route_for(&payload), Some("[::1]:40000".parse().unwrap()));
    }

    #[test]
    fn route_for_is_none_without_a_learned_route() {
        let gw = gateway();
        let payload = Payload {
            msg_type: MessageType::Actions,
            lobby_id: pack_short_id("zzzz"),
            player_id: pack_short_id("p1"),
            seq_num: 1,
            ttl: 3,
            source: [0; 16],
            destination: [0; 16],
            port: 0,
            data: Vec::new(),
        };
        assert_eq!(gw.route_for(&payload), None);
    }
}

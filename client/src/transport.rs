//! Join handshake and the per-session loops: keep-alive, input, state
//! application, output, and (mobile mode only) DTN neighbor discovery.

use crate::error::ClientError;
use crossbeam::channel::{self, Receiver, Sender};
use gamestate::{GameState, StateBootstrap};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wire::cache::RetransmitCache;
use wire::codec::{decode_changes, pack_short_id, unpack_short_id, Change, MessageType, Payload};
use wire::location::{distance, format_xy, pack_addr, parse_xy};
use wire::routing::{preferred_next_hop, prune_stale, NeighborInfo, NeighborMap};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const TIMEOUTS_BEFORE_REJOIN: u32 = 8;
const MAX_RECONNECTS: u32 = 5;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);
const CACHE_TIMEOUT: Duration = Duration::from_secs(10);
const KALIVE_INTERVAL: Duration = Duration::from_secs(1);
const KALIVE_STALE_WARN: Duration = Duration::from_secs(5);
const STATE_TICK: Duration = Duration::from_millis(30);
const OUTPUT_INTERVAL: Duration = Duration::from_millis(30);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const METRICS_INTERVAL: Duration = Duration::from_secs(5);
const STALE_NEIGHBOR_AGE: Duration = Duration::from_secs(10);

/// What the join handshake learns about the match we're now part of.
struct JoinedSession {
    player_id: String,
    lobby_id: String,
    lobby_addr: SocketAddr,
}

/// What this client instance was told on the command line.
pub struct ClientConfig {
    pub node_id: String,
    pub local_address: Ipv6Addr,
    pub authority: SocketAddr,
    pub display_name: String,
    pub mobile: bool,
}

/// One joined session: the handshake socket (reused for all further
/// traffic), an optional DTN beacon socket when `mobile`, and the
/// loops spawned by `run`.
pub struct Client {
    config: ClientConfig,
    socket: UdpSocket,
    dtn_socket: Option<UdpSocket>,
    session: JoinedSession,
    cache: RetransmitCache,
    running: Arc<AtomicBool>,
    game: Mutex<GameState>,
    in_game: AtomicBool,
    seat: AtomicU8,
    local_position: Mutex<(f32, f32)>,
    last_inbound_kalive: Mutex<Instant>,
    mobile_map: Mutex<NeighborMap>,
    gateway_map: Mutex<NeighborMap>,
    preferred: Mutex<Option<Ipv6Addr>>,
    inbound_tx: Sender<Change>,
    inbound_rx: Receiver<Change>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Client {
    /// Runs the JOIN/REJOIN handshake against `config.authority` and, on
    /// ACCEPT, builds a connected `Client` ready for `run`.
    pub fn connect(config: ClientConfig, position: (f32, f32)) -> Result<Arc<Self>, ClientError> {
        let socket = UdpSocket::bind((config.local_address, 0))?;
        let local_addr_bytes = pack_addr(config.local_address);

        let session = handshake(
            &socket,
            config.authority,
            &config.node_id,
            &config.display_name,
            local_addr_bytes,
        )?;
        socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;

        let dtn_socket = if config.mobile {
            Some(wire::bind_dtn_socket()?)
        } else {
            None
        };

        let (inbound_tx, inbound_rx) = channel::unbounded();
        info!(
            node = %config.node_id,
            lobby = %session.lobby_id,
            player = %session.player_id,
            lobby_addr = %session.lobby_addr,
            "session established",
        );

        Ok(Arc::new(Self {
            config,
            socket,
            dtn_socket,
            session,
            cache: RetransmitCache::new(CACHE_TIMEOUT),
            running: Arc::new(AtomicBool::new(true)),
            game: Mutex::new(GameState::new()),
            in_game: AtomicBool::new(false),
            seat: AtomicU8::new(0),
            local_position: Mutex::new(position),
            last_inbound_kalive: Mutex::new(Instant::now()),
            mobile_map: Mutex::new(NeighborMap::new()),
            gateway_map: Mutex::new(NeighborMap::new()),
            preferred: Mutex::new(None),
            inbound_tx,
            inbound_rx,
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// This client's numeric seat (1..=4), or `0` before the first
    /// STATE bootstrap arrives.
    pub fn seat(&self) -> u8 {
        self.seat.load(Ordering::Relaxed)
    }

    pub fn terminate(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Spawns the wired-mode loops, plus the DTN discovery loops when
    /// this client is mobile, and returns immediately.
    pub fn run(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        let names: &[&str] = if self.config.mobile {
            &["kalive", "input", "state", "output", "dtn-input", "metrics"]
        } else {
            &["kalive", "input", "state", "output"]
        };
        for &name in names {
            let client = Arc::clone(self);
            let node_id = self.config.node_id.clone();
            let handle = thread::Builder::new()
                .name(format!("client-{node_id}-{name}"))
                .spawn(move || match name {
                    "kalive" => client.kalive_loop(),
                    "input" => client.input_loop(),
                    "state" => client.state_loop(),
                    "dtn-input" => client.dtn_input_loop(),
                    "metrics" => client.metrics_loop(),
                    _ => client.output_loop(),
                })
                .expect("failed to spawn client thread");
            handles.push(handle);
        }
    }

    pub fn join(&self) {
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Sends a best-effort LEAVE directly to the lobby (or its current
    /// preferred hop) so the lobby doesn't have to wait out a keep-alive
    /// timeout to reap this seat.
    pub fn leave(&self) {
        let payload = Payload {
            msg_type: MessageType::Leave,
            lobby_id: pack_short_id(&self.session.lobby_id),
            player_id: pack_short_id(&self.session.player_id),
            seq_num: 0,
            ttl: 3,
            source: pack_addr(self.config.local_address),
            destination: addr_bytes(self.session.lobby_addr),
            port: 0,
            data: Vec::new(),
        };
        let target = self.physical_target(self.session.lobby_addr);
        let _ = self.socket.send_to(&payload.encode(), target);
    }

    fn kalive_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(KALIVE_INTERVAL);
            let position = *self.local_position.lock();
            let payload = Payload {
                msg_type: MessageType::Kalive,
                lobby_id: pack_short_id(&self.session.lobby_id),
                player_id: pack_short_id(&self.session.player_id),
                seq_num: 0,
                ttl: wire::DTN_HOP_LIMIT as u8,
                source: pack_addr(self.config.local_address),
                destination: addr_bytes(self.session.lobby_addr),
                port: 0,
                data: format_xy(position).into_bytes(),
            };
            let encoded = payload.encode();

            if self.config.mobile {
                if let Some(dtn) = &self.dtn_socket {
                    let group = SocketAddr::V6(SocketAddrV6::new(wire::DTN_GROUP, wire::DTN_PORT, 0, 0));
                    let _ = dtn.send_to(&encoded, group);
                }
            } else {
                let _ = self.socket.send_to(&encoded, self.session.lobby_addr);
            }

            let last = *self.last_inbound_kalive.lock();
            if Instant::now().duration_since(last) > KALIVE_STALE_WARN {
                warn!(node = %self.config.node_id, "no inbound keep-alive heard in over 5s");
            }
        }
    }

    fn input_loop(self: Arc<Self>) {
        let mut buf = [0u8; 1500];
        while self.running.load(Ordering::Relaxed) {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    warn!(node = %self.config.node_id, error = %e, "recv failed");
                    continue;
                }
            };
            match Payload::decode(&buf[..n]) {
                Ok(payload) => self.handle_inbound(payload, from),
                Err(e) => debug!(node = %self.config.node_id, error = %e, "malformed datagram dropped"),
            }
        }
    }

    fn handle_inbound(&self, payload: Payload, from: SocketAddr) {
        match payload.msg_type {
            MessageType::State => match serde_json::from_slice::<StateBootstrap>(&payload.data) {
                Ok(boot) => {
                    self.seat.store(boot.id, Ordering::Relaxed);
                    self.game.lock().apply_bootstrap(&boot);
                    info!(node = %self.config.node_id, seat = boot.id, "received STATE bootstrap");
                }
                Err(e) => debug!(node = %self.config.node_id, error = %e, "malformed STATE bootstrap"),
            },
            MessageType::Actions => {
                self.in_game.store(true, Ordering::Relaxed);
                for change in decode_changes(&payload.data) {
                    let _ = self.inbound_tx.send(change);
                }
                self.cache.add_unsent(from, self.build_ack(&payload));
            }
            MessageType::Kalive => {
                *self.last_inbound_kalive.lock() = Instant::now();
            }
            MessageType::Ack => {
                self.cache.ack(self.session.lobby_addr, &payload);
            }
            MessageType::Reject => {
                warn!(
                    node = %self.config.node_id,
                    reason = %String::from_utf8_lossy(&payload.data),
                    "rejected after session was established",
                );
            }
            other => debug!(node = %self.config.node_id, ?other, "unexpected message type at client socket"),
        }
    }

    fn build_ack(&self, payload: &Payload) -> Payload {
        Payload {
            msg_type: MessageType::Ack,
            lobby_id: payload.lobby_id,
            player_id: payload.player_id,
            seq_num: payload.seq_num,
            ttl: wire::DTN_HOP_LIMIT as u8,
            source: pack_addr(self.config.local_address),
            destination: payload.source,
            port: 0,
            data: Vec::new(),
        }
    }

    fn state_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(STATE_TICK);
            if !self.in_game.load(Ordering::Relaxed) {
                continue;
            }
            let mut game = self.game.lock();
            while let Ok(change) = self.inbound_rx.try_recv() {
                game.apply_delta(change);
            }
        }
    }

    fn output_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(OUTPUT_INTERVAL);
            for (addr, payload) in self.cache.drain_unsent() {
                let target = self.physical_target(addr);
                let _ = self.socket.send_to(&payload.encode(), target);
            }
            for (addr, payload) in self.cache.pending_retransmit(RETRY_INTERVAL) {
                let target = self.physical_target(addr);
                let _ = self.socket.send_to(&payload.encode(), target);
            }
            self.cache.purge_expired();
        }
    }

    /// Mobile mode only: listens on the DTN multicast socket purely to
    /// harvest KALIVE/GKALIVE beacons into `mobile_map`/`gateway_map`.
    /// All real game traffic still flows over `socket`, relayed back
    /// along the same unicast address a gateway first saw it arrive
    /// from.
    fn dtn_input_loop(self: Arc<Self>) {
        let Some(dtn) = self.dtn_socket.as_ref() else {
            return;
        };
        let mut buf = [0u8; 1500];
        while self.running.load(Ordering::Relaxed) {
            let (n, from) = match dtn.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    warn!(node = %self.config.node_id, error = %e, "dtn recv failed");
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
            let Some(position) = parse_xy(&payload.data) else {
                continue;
            };
            let hops = wire::DTN_HOP_LIMIT.saturating_sub(payload.ttl as u32) as u8;
            let info = NeighborInfo {
                distance: distance(*self.local_position.lock(), position),
                position,
                last_seen: Instant::now(),
                hops,
            };
            match payload.msg_type {
                MessageType::Gkalive => {
                    self.gateway_map.lock().insert(addr, info);
                }
                MessageType::Kalive => {
                    self.mobile_map.lock().insert(addr, info);
                }
                _ => {}
            }
        }
    }

    /// Mobile mode only: periodically prunes stale neighbors and
    /// recomputes the preferred next hop the output loop should target.
    fn metrics_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(METRICS_INTERVAL);
            let now = Instant::now();
            let preferred = {
                let mut gateways = self.gateway_map.lock();
                let mut mobiles = self.mobile_map.lock();
                prune_stale(&mut gateways, now, STALE_NEIGHBOR_AGE);
                prune_stale(&mut mobiles, now, STALE_NEIGHBOR_AGE);
                preferred_next_hop(&gateways, &mobiles)
            };
            debug!(node = %self.config.node_id, ?preferred, "recomputed preferred next hop");
            *self.preferred.lock() = preferred;
        }
    }

    /// Maps a cache entry's logical destination to where the payload
    /// should actually be sent. Only the lobby's own logical address is
    /// ever redirected (to the current preferred hop, mobile mode
    /// only); entries addressed anywhere else (e.g. an ACK back to
    /// whoever we last heard from) go out unchanged.
    fn physical_target(&self, logical: SocketAddr) -> SocketAddr {
        resolve_physical_target(
            self.config.mobile,
            logical,
            self.session.lobby_addr,
            *self.preferred.lock(),
        )
    }
}

fn resolve_physical_target(
    mobile: bool,
    logical: SocketAddr,
    lobby_addr: SocketAddr,
    preferred: Option<Ipv6Addr>,
) -> SocketAddr {
    if mobile && logical == lobby_addr {
        if let Some(hop) = preferred {
            return SocketAddr::V6(SocketAddrV6::new(hop, wire::DTN_PORT, 0, 0));
        }
    }
    logical
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

fn addr_bytes(addr: SocketAddr) -> [u8; 16] {
    match addr.ip() {
        IpAddr::V6(v6) => pack_addr(v6),
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
    }
}

/// Sends JOIN, falling back to REJOIN on each subsequent reconnect
/// attempt, until ACCEPT/REJECT arrives or `MAX_RECONNECTS` attempts
/// are exhausted. Each attempt waits up to `TIMEOUTS_BEFORE_REJOIN`
/// read-timeout cycles for a reply before moving on.
fn handshake(
    socket: &UdpSocket,
    authority: SocketAddr,
    node_id: &str,
    display_name: &str,
    local_addr_bytes: [u8; 16],
) -> Result<JoinedSession, ClientError> {
    socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let mut buf = [0u8; 1500];

    for attempt in 0..MAX_RECONNECTS {
        let msg_type = if attempt == 0 { MessageType::Join } else { MessageType::Rejoin };
        let request = Payload {
            msg_type,
            lobby_id: pack_short_id(""),
            player_id: pack_short_id(""),
            seq_num: 0,
            ttl: wire::DTN_HOP_LIMIT as u8,
            source: local_addr_bytes,
            destination: [0; 16],
            port: 0,
            data: display_name.as_bytes().to_vec(),
        };
        socket.send_to(&request.encode(), authority)?;

        for _ in 0..TIMEOUTS_BEFORE_REJOIN {
            let (n, from) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            if from != authority {
                continue;
            }
            let reply = match Payload::decode(&buf[..n]) {
                Ok(p) => p,
                Err(_) => continue,
            };
            match reply.msg_type {
                MessageType::Accept => {
                    let port_bytes: [u8; 2] = reply.data.get(0..2).and_then(|s| s.try_into().ok()).unwrap_or([0, 0]);
                    let lobby_addr = SocketAddr::new(authority.ip(), u16::from_be_bytes(port_bytes));
                    return Ok(JoinedSession {
                        player_id: unpack_short_id(reply.player_id),
                        lobby_id: unpack_short_id(reply.lobby_id),
                        lobby_addr,
                    });
                }
                MessageType::Reject => {
                    return Err(ClientError::JoinFailed(String::from_utf8_lossy(&reply.data).into_owned()));
                }
                _ => continue,
            }
        }
        warn!(node = %node_id, attempt, "join handshake timed out, retrying");
    }

    Err(ClientError::JoinFailed(
        "no response from authority after maximum reconnect attempts".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn physical_target_passes_through_when_wired() {
        let lobby = addr("[::1]:9000");
        let gw: Ipv6Addr = "fe80::1".parse().unwrap();
        assert_eq!(resolve_physical_target(false, lobby, lobby, Some(gw)), lobby);
    }

    #[test]
    fn physical_target_redirects_lobby_logical_key_when_mobile() {
        let lobby = addr("[::1]:9000");
        let gw: Ipv6Addr = "fe80::1".parse().unwrap();
        let target = resolve_physical_target(true, lobby, lobby, Some(gw));
        assert_eq!(target, SocketAddr::V6(SocketAddrV6::new(gw, wire::DTN_PORT, 0, 0)));
    }

    #[test]
    fn physical_target_falls_back_to_logical_without_a_preferred_hop() {
        let lobby = addr("[::1]:9000");
        assert_eq!(resolve_physical_target(true, lobby, lobby, None), lobby);
    }

    #[test]
    fn physical_target_leaves_non_lobby_keys_alone_even_when_mobile() {
        let lobby = addr("[::1]:9000");
        let ack_dest = addr("[::1]:7777");
        let gw: Ipv6Addr = "fe80::1".parse().unwrap();
        assert_eq!(resolve_physical_target(true, ack_dest, lobby, Some(gw)), ack_dest);
    }
}

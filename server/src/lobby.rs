//! One runtime per match: membership, intent queue, state tick,
//! broadcast, liveness reaping. State machine: Waiting -> Starting ->
//! InGame -> Ended -> terminal.

use crate::connection::Connection;
use crossbeam::channel::{self, Receiver, Sender};
use gamestate::GameState;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use wire::cache::RetransmitCache;
use wire::codec::{decode_changes, encode_changes, pack_short_id, Change, MessageType, Payload};
use wire::location::{pack_addr, short_uuid};

pub const CAPACITY: usize = 4;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);
const TICK_INTERVAL: Duration = Duration::from_millis(30);
const OUTBOUND_INTERVAL: Duration = Duration::from_millis(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const CACHE_TIMEOUT: Duration = Duration::from_secs(30);
const STARTING_BURST: Duration = Duration::from_secs(2);
const STARTING_PERIOD: Duration = Duration::from_millis(50);
const WAITING_PURGE_INTERVAL: Duration = Duration::from_secs(1);
const ENDED_DRAIN: Duration = Duration::from_secs(1);
const CRATE_DENSITY: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Waiting,
    Starting,
    InGame,
    Ended,
}

struct Shared {
    phase: Phase,
    members: Vec<Connection>,
    game: GameState,
    outbound_deltas: Vec<Change>,
    next_seq: HashMap<String, u32>,
    ever_had_member: bool,
    phase_entered_at: Instant,
    starting_burst_sent_at: Instant,
}

/// A single match: one bound UDP socket, one authoritative `GameState`,
/// four cooperating loops. Owns its connections by value; no connection
/// holds a back-reference.
pub struct Lobby {
    pub id: String,
    pub port: u16,
    socket: UdpSocket,
    local_addr: [u8; 16],
    running: Arc<AtomicBool>,
    shared: Mutex<Shared>,
    cache: RetransmitCache,
    intent_tx: Sender<(u8, Change)>,
    intent_rx: Receiver<(u8, Change)>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Lobby {
    pub fn bind(id: String, local_addr: Ipv6Addr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((local_addr, 0))?;
        socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        let port = socket.local_addr()?.port();
        let (intent_tx, intent_rx) = channel::unbounded();
        let now = Instant::now();
        Ok(Self {
            id,
            port,
            socket,
            local_addr: pack_addr(local_addr),
            running: Arc::new(AtomicBool::new(true)),
            shared: Mutex::new(Shared {
                phase: Phase::Waiting,
                members: Vec::new(),
                game: GameState::new(),
                outbound_deltas: Vec::new(),
                next_seq: HashMap::new(),
                ever_had_member: false,
                phase_entered_at: now,
                starting_burst_sent_at: now - STARTING_PERIOD,
            }),
            cache: RetransmitCache::new(CACHE_TIMEOUT),
            intent_tx,
            intent_rx,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn member_count(&self) -> usize {
        self.shared.lock().members.len()
    }

    pub fn is_full(&self) -> bool {
        self.member_count() >= CAPACITY
    }

    pub fn is_accepting(&self) -> bool {
        self.running.load(Ordering::Relaxed) && self.shared.lock().phase == Phase::Waiting
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Admits a new connection if the lobby is still in `Waiting` and
    /// under capacity. Reaching capacity flips the lobby into
    /// `Starting`.
    pub fn add_player(&self, display_name: String, address: SocketAddr, byte_address: [u8; 16]) -> Option<Connection> {
        let mut shared = self.shared.lock();
        if shared.phase != Phase::Waiting || shared.members.len() >= CAPACITY {
            return None;
        }
        let seat = shared.members.len() as u8 + 1;
        let conn = Connection::new(short_uuid(), display_name, address, byte_address, self.id.clone(), seat);
        shared.members.push(conn.clone());
        shared.ever_had_member = true;
        if shared.members.len() >= CAPACITY {
            shared.phase = Phase::Starting;
            shared.phase_entered_at = Instant::now();
        }
        Some(conn)
    }

    /// Spawns the four cooperating loops and returns immediately; the
    /// loops run until `terminate` is called or they self-terminate
    /// (empty Waiting lobby, or drained Ended lobby).
    pub fn run(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        for name in ["inbound", "tick", "outbound", "keepalive"] {
            let lobby = Arc::clone(self);
            let lobby_id = self.id.clone();
            let handle = thread::Builder::new()
                .name(format!("lobby-{lobby_id}-{name}"))
                .spawn(move || match name {
                    "inbound" => lobby.inbound_loop(),
                    "tick" => lobby.tick_loop(),
                    "outbound" => lobby.outbound_loop(),
                    _ => lobby.keepalive_loop(),
                })
                .expect("failed to spawn lobby thread");
            handles.push(handle);
        }
    }

    pub fn terminate(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// `true` once every loop thread has exited. Callers (the front
    /// door's reaper) join the handles and drop the lobby from the
    /// registry once this returns `true`.
    pub fn is_drained(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
            && self.handles.lock().iter().all(|h| h.is_finished())
    }

    pub fn join(&self) {
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn inbound_loop(self: Arc<Self>) {
        let mut buf = [0u8; 1500];
        while self.running.load(Ordering::Relaxed) {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!(lobby = %self.id, error = %e, "inbound recv failed");
                    continue;
                }
            };
            match Payload::decode(&buf[..n]) {
                Ok(payload) => self.handle_inbound(payload, from),
                Err(e) => debug!(lobby = %self.id, error = %e, "malformed datagram dropped"),
            }
        }
    }

    fn handle_inbound(&self, payload: Payload, from: SocketAddr) {
        if payload.msg_type == MessageType::Ack {
            self.cache.ack(from, &payload);
            return;
        }

        let mut shared = self.shared.lock();
        let phase = shared.phase;
        let idx = shared.members.iter().position(|c| c.address == from);

        match payload.msg_type {
            MessageType::Kalive => {
                if let Some(i) = idx {
                    shared.members[i].touch();
                }
            }
            MessageType::Leave => {
                if let Some(i) = idx {
                    let conn = shared.members.remove(i);
                    if phase == Phase::InGame {
                        if let Some(delta) = shared.game.remove_player(conn.seat) {
                            shared.outbound_deltas.push(delta);
                        }
                    }
                    info!(lobby = %self.id, player = %conn.id, "player left");
                }
            }
            MessageType::Actions if phase == Phase::InGame => {
                if let Some(i) = idx {
                    let seat = shared.members[i].seat;
                    let is_stale = payload.seq_num <= shared.members[i].expected_seq;
                    shared.members[i].touch();
                    if !is_stale {
                        shared.members[i].expected_seq = payload.seq_num;
                        for change in decode_changes(&payload.data) {
                            let _ = self.intent_tx.send((seat, change));
                        }
                    }
                }
                drop(shared);
                self.send_ack(&payload, from);
            }
            MessageType::Actions => {
                // Waiting/Starting/Ended: discarded, but always acked so
                // the sender can release its cache entry.
                drop(shared);
                self.send_ack(&payload, from);
            }
            other => {
                debug!(lobby = %self.id, ?other, "unexpected message type at lobby socket");
            }
        }
    }

    fn send_ack(&self, payload: &Payload, from: SocketAddr) {
        let ack = Payload {
            msg_type: MessageType::Ack,
            lobby_id: payload.lobby_id,
            player_id: payload.player_id,
            seq_num: payload.seq_num,
            ttl: 3,
            source: self.local_addr,
            destination: addr_bytes(from),
            port: self.port as u32,
            data: Vec::new(),
        };
        let _ = self.socket.send_to(&ack.encode(), from);
    }

    fn tick_loop(self: Arc<Self>) {
        let mut last_waiting_purge = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            thread::sleep(TICK_INTERVAL);
            let now = Instant::now();
            let mut shared = self.shared.lock();

            match shared.phase {
                Phase::Waiting => {
                    if now.duration_since(last_waiting_purge) >= WAITING_PURGE_INTERVAL {
                        last_waiting_purge = now;
                        shared.members.retain(|c| !c.timed_out(now));
                        if shared.ever_had_member && shared.members.is_empty() {
                            drop(shared);
                            info!(lobby = %self.id, "waiting lobby emptied, terminating");
                            self.terminate();
                            break;
                        }
                    }
                }
                Phase::Starting => {
                    self.drive_starting(&mut shared, now);
                }
                Phase::InGame => {
                    self.drive_in_game(&mut shared, now);
                }
                Phase::Ended => {
                    if now.duration_since(shared.phase_entered_at) >= ENDED_DRAIN {
                        drop(shared);
                        self.terminate();
                        break;
                    }
                }
            }
        }
    }

    fn drive_starting(&self, shared: &mut Shared, now: Instant) {
        if shared.game.boxes.is_empty() && shared.game.players.is_empty() {
            let mut rng = rand::thread_rng();
            shared.game.reset(shared.members.len(), CRATE_DENSITY, &mut rng);
        }

        if now.duration_since(shared.starting_burst_sent_at) >= STARTING_PERIOD {
            shared.starting_burst_sent_at = now;
            let unix_now = now_unix();
            for conn in shared.members.clone() {
                let boot = shared.game.bootstrap(conn.seat, conn.id.clone(), unix_now);
                self.send_state(&conn, &boot);
            }
        }

        if now.duration_since(shared.phase_entered_at) >= STARTING_BURST {
            shared.phase = Phase::InGame;
            shared.phase_entered_at = now;
            info!(lobby = %self.id, "lobby entering InGame");
        }
    }

    fn drive_in_game(&self, shared: &mut Shared, now: Instant) {
        while let Ok((seat, change)) = self.intent_rx.try_recv() {
            let deltas = shared.game.apply_change(seat, change, now);
            shared.outbound_deltas.extend(deltas);
        }
        let tick_deltas = shared.game.tick(now);
        shared.outbound_deltas.extend(tick_deltas);

        let timed_out: Vec<usize> = shared
            .members
            .iter()
            .enumerate()
            .filter(|(_, c)| c.timed_out(now))
            .map(|(i, _)| i)
            .collect();
        for i in timed_out.into_iter().rev() {
            let conn = shared.members.remove(i);
            if let Some(delta) = shared.game.remove_player(conn.seat) {
                shared.outbound_deltas.push(delta);
            }
            warn!(lobby = %self.id, player = %conn.id, "reaped unresponsive connection");
        }

        if shared.game.winner().is_some() || shared.members.is_empty() {
            shared.phase = Phase::Ended;
            shared.phase_entered_at = now;
            info!(lobby = %self.id, "match ended");
        }
    }

    fn send_state(&self, conn: &Connection, boot: &gamestate::StateBootstrap) {
        let data = match serde_json::to_vec(boot) {
            Ok(d) => d,
            Err(e) => {
                warn!(lobby = %self.id, error = %e, "failed to encode STATE bootstrap");
                return;
            }
        };
        let payload = Payload {
            msg_type: MessageType::State,
            lobby_id: pack_short_id(&self.id),
            player_id: pack_short_id(&conn.id),
            seq_num: 0,
            ttl: 3,
            source: self.local_addr,
            destination: conn.byte_address,
            port: self.port as u32,
            data,
        };
        if let Err(e) = self.socket.send_to(&payload.encode(), conn.address) {
            warn!(lobby = %self.id, error = %e, "failed to send STATE burst");
        }
    }

    fn outbound_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(OUTBOUND_INTERVAL);
            self.coalesce_and_send();
        }
    }

    fn coalesce_and_send(&self) {
        let mut shared = self.shared.lock();
        if matches!(shared.phase, Phase::Waiting | Phase::Starting) {
            return;
        }

        if !shared.outbound_deltas.is_empty() {
            let deltas = std::mem::take(&mut shared.outbound_deltas);
            let members = shared.members.clone();
            let next_seq = Mutex::new(std::mem::take(&mut shared.next_seq));
            drop(shared);

            let data = encode_changes(&deltas);
            let payloads: Vec<(SocketAddr, Payload)> = members
                .par_iter()
                .map(|conn| {
                    let seq_num = {
                        let mut next_seq = next_seq.lock();
                        let entry = next_seq.entry(conn.id.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    let payload = Payload {
                        msg_type: MessageType::Actions,
                        lobby_id: pack_short_id(&self.id),
                        player_id: pack_short_id(&conn.id),
                        seq_num,
                        ttl: 3,
                        source: self.local_addr,
                        destination: conn.byte_address,
                        port: self.port as u32,
                        data: data.clone(),
                    };
                    (conn.address, payload)
                })
                .collect();

            for (addr, payload) in &payloads {
                self.cache.add_unsent(*addr, payload.clone());
            }

            self.shared.lock().next_seq = next_seq.into_inner();
        }

        for (addr, payload) in self.cache.drain_unsent() {
            if let Err(e) = self.socket.send_to(&payload.encode(), addr) {
                warn!(lobby = %self.id, error = %e, "send failed, payload remains cached");
            }
        }
        for (addr, payload) in self.cache.pending_retransmit(RETRY_INTERVAL) {
            let _ = self.socket.send_to(&payload.encode(), addr);
        }
        self.cache.purge_expired();
    }

    fn keepalive_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(KEEPALIVE_INTERVAL);
            let shared = self.shared.lock();
            if shared.phase == Phase::Ended {
                continue;
            }
            let members = shared.members.clone();
            drop(shared);
            for conn in members {
                let payload = Payload {
                    msg_type: MessageType::Kalive,
                    lobby_id: pack_short_id(&self.id),
                    player_id: pack_short_id(&conn.id),
                    seq_num: 0,
                    ttl: 3,
                    source: self.local_addr,
                    destination: conn.byte_address,
                    port: self.port as u32,
                    data: Vec::new(),
                };
                let _ = self.socket.send_to(&payload.encode(), conn.address);
            }
        }
    }
}

fn addr_bytes(addr: SocketAddr) -> [u8; 16] {
    match addr.ip() {
        std::net::IpAddr::V6(v6) => pack_addr(v6),
        std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby() -> Arc<Lobby> {
        Arc::new(Lobby::bind("tst1".into(), Ipv6Addr::LOCALHOST).unwrap())
    }

    #[test]
    fn add_player_assigns_sequential_seats() {
        let l = lobby();
        let a = l.add_player("A".into(), "[::1]:1".parse().unwrap(), [0; 16]).unwrap();
        let b = l.add_player("B".into(), "[::1]:2".parse().unwrap(), [0; 16]).unwrap();
        assert_eq!(a.seat, 1);
        assert_eq!(b.seat, 2);
        assert_eq!(l.member_count(), 2);
    }

    #[test]
    fn lobby_full_at_capacity_leaves_waiting() {
        let l = lobby();
        for i in 0..CAPACITY {
            let addr: SocketAddr = format!("[::1]:{}", 100 + i).parse().unwrap();
            l.add_player(format!("P{i}"), addr, [0; 16]).unwrap();
        }
        assert!(l.is_full());
        assert!(!l.is_accepting(), "lobby should have moved past Waiting");
        let overflow = l.add_player("X".into(), "[::1]:999".parse().unwrap(), [0; 16]);
        assert!(overflow.is_none());
    }
}

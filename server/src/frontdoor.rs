//! Single well-known-port admission socket: picks or creates a lobby
//! for each JOIN/REJOIN and replies ACCEPT/REJECT.

use crate::error::ServerError;
use crate::lobby::Lobby;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wire::codec::{pack_short_id, unpack_short_id, MessageType, Payload};
use wire::location::pack_addr;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FrontDoor {
    socket: UdpSocket,
    local_addr_v6: Ipv6Addr,
    local_addr_bytes: [u8; 16],
    lobbies: Mutex<HashMap<String, Arc<Lobby>>>,
}

impl FrontDoor {
    pub fn bind(address: Ipv6Addr, port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((address, port))?;
        socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        Ok(Self {
            socket,
            local_addr_v6: address,
            local_addr_bytes: pack_addr(address),
            lobbies: Mutex::new(HashMap::new()),
        })
    }

    /// Runs forever on the calling thread; the front door has exactly
    /// one receive loop (lobby creation spawns the lobby's own loops).
    pub fn run(&self) -> ! {
        let mut buf = [0u8; 1500];
        loop {
            self.reap_drained_lobbies();

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
                    warn!(error = %e, "front door recv failed");
                    continue;
                }
            };

            let payload = match Payload::decode(&buf[..n]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "malformed datagram at front door");
                    continue;
                }
            };

            match payload.msg_type {
                MessageType::Join | MessageType::Rejoin => self.handle_join(payload, from),
                other => debug!(?other, "unexpected message type at front door, dropping"),
            }
        }
    }

    fn reap_drained_lobbies(&self) {
        let mut lobbies = self.lobbies.lock();
        lobbies.retain(|id, lobby| {
            if lobby.is_drained() {
                lobby.join();
                info!(lobby = %id, "lobby fully drained, removed from registry");
                false
            } else {
                true
            }
        });
    }

    fn handle_join(&self, payload: Payload, from: SocketAddr) {
        let requested_id = unpack_short_id(payload.lobby_id);
        let display_name = String::from_utf8_lossy(&payload.data).into_owned();

        let lobby = self.find_or_create_lobby(&requested_id);
        let lobby = match lobby {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to create lobby");
                self.send_reject(&payload, from, &e);
                return;
            }
        };

        let byte_address = match from.ip() {
            std::net::IpAddr::V6(v6) => pack_addr(v6),
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        };

        match lobby.add_player(display_name, from, byte_address) {
            Some(conn) => {
                info!(lobby = %lobby.id, player = %conn.id, address = %from, "admitted player");
                self.send_accept(&payload, from, &lobby, &conn.id);
            }
            None => {
                self.send_reject(&payload, from, &ServerError::AdmissionDenied("lobby is full".into()));
            }
        }
    }

    fn find_or_create_lobby(&self, requested_id: &str) -> Result<Arc<Lobby>, ServerError> {
        let mut lobbies = self.lobbies.lock();

        if !requested_id.is_empty() {
            if let Some(lobby) = lobbies.get(requested_id) {
                if lobby.is_accepting() && !lobby.is_full() {
                    return Ok(Arc::clone(lobby));
                }
            }
        } else if let Some(lobby) = lobbies.values().find(|l| l.is_accepting() && !l.is_full()) {
            return Ok(Arc::clone(lobby));
        }

        let id = if requested_id.is_empty() {
            wire::location::short_uuid()
        } else {
            requested_id.to_string()
        };
        let lobby = Arc::new(Lobby::bind(id.clone(), self.local_addr_v6)?);
        lobby.run();
        lobbies.insert(id, Arc::clone(&lobby));
        Ok(lobby)
    }

    fn send_accept(&self, payload: &Payload, to: SocketAddr, lobby: &Lobby, player_id: &str) {
        let reply = Payload {
            msg_type: MessageType::Accept,
            lobby_id: pack_short_id(&lobby.id),
            player_id: pack_short_id(player_id),
            seq_num: 0,
            ttl: 3,
            source: self.local_addr_bytes,
            destination: payload.source,
            port: lobby.port as u32,
            data: lobby.port.to_be_bytes().to_vec(),
        };
        let _ = self.socket.send_to(&reply.encode(), to);
    }

    fn send_reject(&self, payload: &Payload, to: SocketAddr, reason: &ServerError) {
        let reply = Payload {
            msg_type: MessageType::Reject,
            lobby_id: payload.lobby_id,
            player_id: payload.player_id,
            seq_num: 0,
            ttl: 3,
            source: self.local_addr_bytes,
            destination: payload.source,
            port: 0,
            data: reason.to_string().into_bytes(),
        };
        let _ = self.socket.send_to(&reply.encode(), to);
    }
}

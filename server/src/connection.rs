//! Per-player session record. Pure data: no I/O, no locking.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connection with no keep-alive for this long is reaped at the next
/// keep-alive tick.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub display_name: String,
    pub address: SocketAddr,
    pub byte_address: [u8; 16],
    pub last_keepalive: Instant,
    pub expected_seq: u32,
    pub lobby_id: String,
    /// Numeric game-state player id (1..=4), assigned when the lobby
    /// admits the connection.
    pub seat: u8,
}

impl Connection {
    pub fn new(
        id: String,
        display_name: String,
        address: SocketAddr,
        byte_address: [u8; 16],
        lobby_id: String,
        seat: u8,
    ) -> Self {
        Self {
            id,
            display_name,
            address,
            byte_address,
            last_keepalive: Instant::now(),
            expected_seq: 0,
            lobby_id,
            seat,
        }
    }

    pub fn touch(&mut self) {
        self.last_keepalive = Instant::now();
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_keepalive) > KEEPALIVE_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(
            "ab12".into(),
            "A".into(),
            "[::1]:1".parse().unwrap(),
            [0; 16],
            "lob1".into(),
            1,
        )
    }

    #[test]
    fn touch_resets_timeout() {
        let mut c = conn();
        c.last_keepalive = Instant::now() - Duration::from_secs(10);
        assert!(c.timed_out(Instant::now()));
        c.touch();
        assert!(!c.timed_out(Instant::now()));
    }

    #[test]
    fn fresh_connection_is_not_timed_out() {
        assert!(!conn().timed_out(Instant::now()));
    }
}

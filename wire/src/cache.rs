//! Per-destination retransmit cache: holds unacked payloads by
//! destination, classified as `not_sent` or `sent`, purged by ack or
//! timeout.

use crate::codec::Payload;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct Entry {
    payload: Payload,
    queued_at: Instant,
}

type Bucket = HashMap<SocketAddr, Vec<Entry>>;

/// Tracks in-flight payloads per destination so a sender can retransmit
/// on timeout and release an entry once its ACK arrives. All operations
/// are atomic with respect to a single instance.
pub struct RetransmitCache {
    timeout: Duration,
    not_sent: Mutex<Bucket>,
    sent: Mutex<Bucket>,
}

impl RetransmitCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            not_sent: Mutex::new(HashMap::new()),
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// Queues a payload for `addr` that has not yet been transmitted.
    pub fn add_unsent(&self, addr: SocketAddr, payload: Payload) {
        self.not_sent.lock().entry(addr).or_default().push(Entry {
            payload,
            queued_at: Instant::now(),
        });
    }

    /// Moves a previously-unsent payload into the sent bucket once it has
    /// actually gone out over the socket. A no-op if no matching unsent
    /// entry exists (e.g. it was already moved by `drain_unsent`).
    pub fn mark_sent(&self, addr: SocketAddr, payload: &Payload) {
        let mut not_sent = self.not_sent.lock();
        let Some(list) = not_sent.get_mut(&addr) else {
            return;
        };
        if let Some(pos) = list.iter().position(|e| e.payload.seq_num == payload.seq_num) {
            let entry = list.remove(pos);
            self.sent.lock().entry(addr).or_default().push(entry);
        }
    }

    /// Removes the entry matching `(addr, payload.seq_num)` from
    /// whichever bucket holds it, releasing it on ACK.
    pub fn ack(&self, addr: SocketAddr, payload: &Payload) {
        for bucket in [&self.sent, &self.not_sent] {
            let mut guard = bucket.lock();
            if let Some(list) = guard.get_mut(&addr) {
                list.retain(|e| e.payload.seq_num != payload.seq_num);
            }
        }
    }

    /// Returns every not-yet-sent entry, moving each into the sent
    /// bucket as it is returned. Ordering within a destination is
    /// insertion order.
    pub fn drain_unsent(&self) -> Vec<(SocketAddr, Payload)> {
        let mut not_sent = self.not_sent.lock();
        let mut sent = self.sent.lock();
        let mut out = Vec::new();

        for (addr, entries) in not_sent.drain() {
            let sent_bucket = sent.entry(addr).or_default();
            for entry in entries {
                out.push((addr, entry.payload.clone()));
                sent_bucket.push(entry);
            }
        }
        out
    }

    /// Removes (and returns) every entry, in either bucket, older than
    /// `cache_timeout`. Callers may use the returned list for one final
    /// best-effort send before giving up on a payload.
    pub fn purge_expired(&self) -> Vec<(SocketAddr, Payload)> {
        let now = Instant::now();
        let mut expired = Vec::new();

        for bucket in [&self.sent, &self.not_sent] {
            let mut guard = bucket.lock();
            guard.retain(|addr, entries| {
                let mut kept = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if now.duration_since(entry.queued_at) > self.timeout {
                        expired.push((*addr, entry.payload));
                    } else {
                        kept.push(entry);
                    }
                }
                *entries = kept;
                !entries.is_empty()
            });
        }
        expired
    }

    /// Entries in the sent bucket whose age exceeds `retry_interval` but
    /// have not yet expired — candidates for retransmission.
    pub fn pending_retransmit(&self, retry_interval: Duration) -> Vec<(SocketAddr, Payload)> {
        let now = Instant::now();
        let sent = self.sent.lock();
        let mut out = Vec::new();
        for (addr, entries) in sent.iter() {
            for entry in entries {
                let age = now.duration_since(entry.queued_at);
                if age > retry_interval && age <= self.timeout {
                    out.push((*addr, entry.payload.clone()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{pack_short_id, MessageType};
    use std::thread::sleep;

    fn addr() -> SocketAddr {
        "[::1]:9999".parse().unwrap()
    }

    fn payload(seq_num: u32) -> Payload {
        Payload {
            msg_type: MessageType::Ack,
            lobby_id: pack_short_id("l"),
            player_id: pack_short_id("p"),
            seq_num,
            ttl: 3,
            source: [0; 16],
            destination: [0; 16],
            port: 0,
            data: vec![],
        }
    }

    #[test]
    fn add_then_drain_moves_to_sent() {
        let cache = RetransmitCache::new(Duration::from_secs(30));
        cache.add_unsent(addr(), payload(1));
        let drained = cache.drain_unsent();
        assert_eq!(drained.len(), 1);
        assert_eq!(cache.drain_unsent().len(), 0, "second drain is empty");
        assert_eq!(cache.pending_retransmit(Duration::from_secs(0)).len(), 1);
    }

    #[test]
    fn ack_removes_from_either_bucket() {
        let cache = RetransmitCache::new(Duration::from_secs(30));
        cache.add_unsent(addr(), payload(7));
        cache.ack(addr(), &payload(7));
        assert_eq!(cache.drain_unsent().len(), 0);

        cache.add_unsent(addr(), payload(8));
        cache.drain_unsent();
        cache.ack(addr(), &payload(8));
        assert_eq!(cache.pending_retransmit(Duration::from_secs(0)).len(), 0);
    }

    #[test]
    fn purge_expired_removes_stale_entries_from_both_buckets() {
        let cache = RetransmitCache::new(Duration::from_millis(10));
        cache.add_unsent(addr(), payload(1));
        cache.add_unsent(addr(), payload(2));
        cache.drain_unsent(); // payload(2) now "sent", payload(1) too — both in `sent`
        sleep(Duration::from_millis(20));
        let expired = cache.purge_expired();
        assert_eq!(expired.len(), 2);
        assert_eq!(cache.pending_retransmit(Duration::from_secs(0)).len(), 0);
    }

    #[test]
    fn no_entry_exists_in_both_buckets_simultaneously() {
        let cache = RetransmitCache::new(Duration::from_secs(30));
        cache.add_unsent(addr(), payload(1));
        cache.mark_sent(addr(), &payload(1));
        assert_eq!(cache.drain_unsent().len(), 0);
        assert_eq!(cache.pending_retransmit(Duration::from_secs(0)).len(), 1);
    }
}

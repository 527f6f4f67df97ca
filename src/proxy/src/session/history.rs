use crate::protocol::mariadb::packet::Packet;

use hashbrown::HashMap;
use std::collections::VecDeque;
use std::hash::Hasher;
use tracing::debug;
use twox_hash::XxHash64;

const DIGEST_SEED: u64 = 0x6d78_7331;

/// One session-affecting command retained for replay. The digest slot is
/// filled once the original backend's reply has been seen.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: u64,
    pub command: Vec<u8>,
    pub digest: Option<u64>,
}

/// Handle identifying one backend's replay subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Bounded, ordered log of session-affecting commands. Backends subscribe
/// and replay forward; an entry may only be evicted once every live
/// subscriber has replayed past it.
#[derive(Debug, Default)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    next_id: u64,
    next_subscriber: u64,
    cap: usize,
    /// Per subscriber: the id of the next entry it still has to replay.
    positions: HashMap<SubscriberId, u64>,
}

impl History {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a command before it is routed. Returns the entry id whose
    /// digest slot is to be filled when the reply completes.
    pub fn append(&mut self, command: Vec<u8>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(HistoryEntry {
            id,
            command,
            digest: None,
        });
        self.try_evict();
        id
    }

    /// Record the reply digest of the original execution.
    pub fn record_digest(&mut self, id: u64, digest: u64) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.digest = Some(digest);
        }
    }

    /// A backend that is already caught up (it executed the commands live)
    /// subscribes at the tail; a fresh or pooled backend subscribes at the
    /// head and must replay everything.
    pub fn subscribe(&mut self, caught_up: bool) -> SubscriberId {
        let sub = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        let pos = if caught_up {
            self.next_id
        } else {
            self.entries.front().map(|e| e.id).unwrap_or(self.next_id)
        };
        self.positions.insert(sub, pos);
        sub
    }

    pub fn unsubscribe(&mut self, sub: SubscriberId) {
        self.positions.remove(&sub);
        self.try_evict();
    }

    /// Next entry the subscriber has to replay, if any.
    pub fn pending(&self, sub: SubscriberId) -> Option<&HistoryEntry> {
        let pos = *self.positions.get(&sub)?;
        self.entries.iter().find(|e| e.id >= pos)
    }

    /// Compare the replay digest against the recorded one and advance the
    /// subscriber. A mismatch is a contract violation: the caller must stop
    /// reusing the backend.
    pub fn confirm_replay(
        &mut self,
        sub: SubscriberId,
        id: u64,
        digest: u64,
    ) -> Result<(), ReplayMismatch> {
        let recorded = self
            .entries
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.digest);
        if let Some(pos) = self.positions.get_mut(&sub) {
            *pos = id + 1;
        }
        self.try_evict();
        match recorded {
            Some(expected) if expected != digest => Err(ReplayMismatch {
                command_id: id,
                expected,
                got: digest,
            }),
            _ => Ok(()),
        }
    }

    /// When the session executes a command live on a bound backend, that
    /// backend observed it without replay.
    pub fn advance(&mut self, sub: SubscriberId, id: u64) {
        if let Some(pos) = self.positions.get_mut(&sub) {
            *pos = (*pos).max(id + 1);
        }
    }

    fn min_position(&self) -> Option<u64> {
        self.positions.values().min().copied()
    }

    /// FIFO eviction over the cap, deferred while some bound backend has not
    /// replayed the front entry yet.
    fn try_evict(&mut self) {
        while self.entries.len() > self.cap {
            let front_id = match self.entries.front() {
                Some(e) => e.id,
                None => return,
            };
            let safe = self.min_position().map(|p| p > front_id).unwrap_or(true);
            if !safe {
                debug!("history eviction deferred: entry {front_id} not yet replayed everywhere");
                return;
            }
            self.entries.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayMismatch {
    pub command_id: u64,
    pub expected: u64,
    pub got: u64,
}

/// Digest of a command's reply, excluding fields that legitimately differ
/// between servers. OK packets contribute only their header and row counts
/// (status flags and session-track payloads vary per connection); everything
/// else contributes its full payload.
#[derive(Debug)]
pub struct ReplyDigest {
    hasher: XxHash64,
}

impl Default for ReplyDigest {
    fn default() -> Self {
        Self {
            hasher: XxHash64::with_seed(DIGEST_SEED),
        }
    }
}

impl ReplyDigest {
    pub fn update(&mut self, packet: &Packet) {
        if packet.is_ok_packet() {
            // header + lenenc affected_rows + lenenc last_insert_id
            let mut end = 1usize;
            for _ in 0..2 {
                end += lenenc_width(packet, end);
            }
            self.hasher.write(&packet[..end.min(packet.len())]);
        } else {
            self.hasher.write(packet);
        }
    }

    pub fn finish(self) -> u64 {
        self.hasher.finish()
    }
}

fn lenenc_width(bytes: &[u8], at: usize) -> usize {
    match bytes.get(at) {
        Some(0xfc) => 3,
        Some(0xfd) => 4,
        Some(0xfe) => 9,
        Some(_) => 1,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_reply(affected: u8, status: u16) -> Packet {
        Packet::from_vec(vec![
            0x00,
            affected,
            0x00,
            (status & 0xff) as u8,
            (status >> 8) as u8,
            0x00,
            0x00,
        ])
    }

    fn digest_of(p: &Packet) -> u64 {
        let mut d = ReplyDigest::default();
        d.update(p);
        d.finish()
    }

    #[test]
    fn append_and_replay_in_order() {
        let mut h = History::new(10);
        let a = h.append(b"SET @a=1".to_vec());
        let b = h.append(b"SET @b=2".to_vec());
        h.record_digest(a, 11);
        h.record_digest(b, 22);

        let sub = h.subscribe(false);
        let first = h.pending(sub).unwrap();
        assert_eq!(first.command, b"SET @a=1");
        h.confirm_replay(sub, a, 11).unwrap();
        let second = h.pending(sub).unwrap();
        assert_eq!(second.command, b"SET @b=2");
        h.confirm_replay(sub, b, 22).unwrap();
        assert!(h.pending(sub).is_none());
    }

    #[test]
    fn digest_mismatch_is_reported() {
        let mut h = History::new(10);
        let a = h.append(b"SET @a=1".to_vec());
        h.record_digest(a, 11);
        let sub = h.subscribe(false);
        let err = h.confirm_replay(sub, a, 99).unwrap_err();
        assert_eq!(err.command_id, a);
        assert_eq!(err.expected, 11);
        assert_eq!(err.got, 99);
    }

    #[test]
    fn eviction_respects_slowest_subscriber() {
        let mut h = History::new(2);
        let sub = h.subscribe(true);
        let a = h.append(b"one".to_vec());
        let _b = h.append(b"two".to_vec());
        // sub subscribed caught-up before these entries existed; it is now
        // behind, so the over-cap front entry must not disappear
        let slow = h.subscribe(false);
        let _ = slow;
        let _c = h.append(b"three".to_vec());
        assert_eq!(h.len(), 3);

        // catching the slow subscriber up releases the eviction
        h.advance(slow, a);
        h.advance(sub, u64::MAX - 1);
        let _d = h.append(b"four".to_vec());
        assert!(h.len() <= 3);
    }

    #[test]
    fn caught_up_subscriber_sees_nothing() {
        let mut h = History::new(10);
        h.append(b"one".to_vec());
        let sub = h.subscribe(true);
        assert!(h.pending(sub).is_none());
    }

    #[test]
    fn ok_digest_ignores_status_flags() {
        // same logical result, different status flags (e.g. in-trx bit)
        let p1 = ok_reply(1, 0x0002);
        let p2 = ok_reply(1, 0x0003);
        assert_eq!(digest_of(&p1), digest_of(&p2));
        // different affected-row counts do differ
        let p3 = ok_reply(2, 0x0002);
        assert_ne!(digest_of(&p1), digest_of(&p3));
    }

    #[test]
    fn err_digest_covers_message() {
        let e1 = Packet::from_vec(b"\xff\x15\x04#28000denied".to_vec());
        let e2 = Packet::from_vec(b"\xff\x15\x04#28000denied!".to_vec());
        assert_ne!(digest_of(&e1), digest_of(&e2));
    }
}

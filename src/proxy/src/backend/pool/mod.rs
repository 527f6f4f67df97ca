use crate::session::Fingerprint;

use coarsetime::Instant;
use hashbrown::HashMap;
use std::collections::VecDeque;
use tracing::debug;

pub const DEFAULT_POOL_CAP: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    server: String,
    fingerprint: Fingerprint,
}

struct Idle<C> {
    conn: C,
    parked_at: Instant,
    /// Monotonic park order; coarse timestamps alone cannot break ties.
    seq: u64,
}

/// Per-worker pool of idle, authenticated backend connections. Owned by the
/// worker, so no synchronisation: a connection is either bound to a session
/// or parked here, never both.
///
/// Generic over the connection type so the eviction and matching logic is
/// testable without sockets.
pub struct ConnPool<C> {
    entries: HashMap<PoolKey, VecDeque<Idle<C>>>,
    len: usize,
    cap: usize,
    next_seq: u64,
}

impl<C> ConnPool<C> {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            len: 0,
            cap,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take any idle connection matching (server, fingerprint). Most
    /// recently parked first; their server-side state is freshest.
    pub fn acquire(&mut self, server: &str, fingerprint: &Fingerprint) -> Option<C> {
        let key = PoolKey {
            server: server.to_string(),
            fingerprint: fingerprint.clone(),
        };
        let queue = self.entries.get_mut(&key)?;
        let idle = queue.pop_back()?;
        if queue.is_empty() {
            self.entries.remove(&key);
        }
        self.len -= 1;
        Some(idle.conn)
    }

    /// Take any idle connection to `server` regardless of fingerprint; the
    /// caller must run the change-user reuse path before binding it.
    pub fn acquire_any(&mut self, server: &str) -> Option<C> {
        let key = self
            .entries
            .keys()
            .find(|k| k.server == server)
            .cloned()?;
        let queue = self.entries.get_mut(&key)?;
        let idle = queue.pop_back()?;
        if queue.is_empty() {
            self.entries.remove(&key);
        }
        self.len -= 1;
        Some(idle.conn)
    }

    /// Park a connection after the owning session released it in a clean
    /// state. Evicts oldest-first when the worker cap is exceeded.
    pub fn release(&mut self, server: &str, fingerprint: Fingerprint, conn: C) -> Vec<C> {
        let key = PoolKey {
            server: server.to_string(),
            fingerprint,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.entry(key).or_default().push_back(Idle {
            conn,
            parked_at: Instant::now(),
            seq,
        });
        self.len += 1;
        self.evict_over_cap()
    }

    fn evict_over_cap(&mut self) -> Vec<C> {
        let mut evicted = Vec::new();
        while self.len > self.cap {
            let oldest_key = self
                .entries
                .iter()
                .min_by_key(|(_, q)| q.front().map(|i| i.seq).unwrap_or(u64::MAX))
                .map(|(k, _)| k.clone());
            let Some(key) = oldest_key else { break };
            if let Some(queue) = self.entries.get_mut(&key) {
                if let Some(idle) = queue.pop_front() {
                    evicted.push(idle.conn);
                    self.len -= 1;
                }
                if queue.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
        evicted
    }

    /// Drop every idle connection for a server; invoked when the monitor
    /// reports it as no longer running.
    pub fn drop_server(&mut self, server: &str) -> Vec<C> {
        let keys: Vec<PoolKey> = self
            .entries
            .keys()
            .filter(|k| k.server == server)
            .cloned()
            .collect();
        let mut dropped = Vec::new();
        for key in keys {
            if let Some(queue) = self.entries.remove(&key) {
                self.len -= queue.len();
                dropped.extend(queue.into_iter().map(|i| i.conn));
            }
        }
        if !dropped.is_empty() {
            debug!("dropped {} pooled connections to {server}", dropped.len());
        }
        dropped
    }

    /// Drop idle connections parked for longer than `max_idle` seconds.
    pub fn expire_idle(&mut self, max_idle_secs: u64) -> Vec<C> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries.retain(|_, queue| {
            while let Some(front) = queue.front() {
                if now.duration_since(front.parked_at).as_secs() > max_idle_secs {
                    let idle = queue.pop_front().unwrap();
                    expired.push(idle.conn);
                } else {
                    break;
                }
            }
            !queue.is_empty()
        });
        self.len -= expired.len();
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_common::constants::CapabilityFlags;

    fn fp(user: &str, db: Option<&str>) -> Fingerprint {
        Fingerprint {
            user: user.to_string(),
            database: db.map(|d| d.to_string()),
            collation: 33,
            wire_caps: CapabilityFlags::CLIENT_PROTOCOL_41.bits(),
        }
    }

    #[test]
    fn acquire_requires_exact_fingerprint() {
        let mut pool: ConnPool<u32> = ConnPool::new(8);
        pool.release("s1", fp("alice", Some("test")), 1);

        assert!(pool.acquire("s1", &fp("bob", Some("test"))).is_none());
        assert!(pool.acquire("s1", &fp("alice", None)).is_none());
        assert!(pool.acquire("s2", &fp("alice", Some("test"))).is_none());
        assert_eq!(pool.acquire("s1", &fp("alice", Some("test"))), Some(1));
        assert!(pool.is_empty());
    }

    #[test]
    fn capability_bits_split_the_pool() {
        let mut pool: ConnPool<u32> = ConnPool::new(8);
        let mut deprecate = fp("alice", None);
        deprecate.wire_caps |= CapabilityFlags::CLIENT_DEPRECATE_EOF.bits();
        pool.release("s1", deprecate.clone(), 7);
        assert!(pool.acquire("s1", &fp("alice", None)).is_none());
        assert_eq!(pool.acquire("s1", &deprecate), Some(7));
    }

    #[test]
    fn eviction_is_oldest_first() {
        let mut pool: ConnPool<u32> = ConnPool::new(2);
        assert!(pool.release("s1", fp("a", None), 1).is_empty());
        assert!(pool.release("s1", fp("b", None), 2).is_empty());
        let evicted = pool.release("s1", fp("c", None), 3);
        assert_eq!(evicted, vec![1]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn drop_server_flushes_only_that_server() {
        let mut pool: ConnPool<u32> = ConnPool::new(8);
        pool.release("s1", fp("a", None), 1);
        pool.release("s1", fp("b", None), 2);
        pool.release("s2", fp("a", None), 3);
        let mut dropped = pool.drop_server("s1");
        dropped.sort_unstable();
        assert_eq!(dropped, vec![1, 2]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.acquire("s2", &fp("a", None)), Some(3));
    }

    #[test]
    fn most_recently_parked_is_reused_first() {
        let mut pool: ConnPool<u32> = ConnPool::new(8);
        pool.release("s1", fp("a", None), 1);
        pool.release("s1", fp("a", None), 2);
        assert_eq!(pool.acquire("s1", &fp("a", None)), Some(2));
        assert_eq!(pool.acquire("s1", &fp("a", None)), Some(1));
    }
}

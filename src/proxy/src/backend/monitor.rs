use bitflags::bitflags;
use std::sync::Arc;
use tokio::sync::watch;

bitflags! {
    /// Role and availability flags maintained by the monitor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RoleFlags: u32 {
        const MASTER      = 1 << 0;
        const SLAVE       = 1 << 1;
        const MAINTENANCE = 1 << 2;
        const RUNNING     = 1 << 3;
        const DRAINING    = 1 << 4;
        const SYNCED      = 1 << 5;
    }
}

/// Smaller rank is strictly preferred during candidate selection.
pub const RANK_PRIMARY: i32 = 1;
pub const RANK_SECONDARY: i32 = 2;

/// One monitored server as of a snapshot. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub roles: RoleFlags,
    /// Monotonic version of the status this descriptor was built from.
    pub status_version: u64,
    pub rank: i32,
    /// Replication lag estimate in seconds; `None` when unknown.
    pub lag_secs: Option<u64>,
    /// Connection count estimate used by the least-connections criterion.
    pub connections: u32,
}

impl ServerDescriptor {
    pub fn is_master(&self) -> bool {
        self.roles.contains(RoleFlags::MASTER)
    }

    pub fn is_slave(&self) -> bool {
        self.roles.contains(RoleFlags::SLAVE)
    }

    pub fn is_usable(&self) -> bool {
        self.roles.contains(RoleFlags::RUNNING)
            && !self
                .roles
                .intersects(RoleFlags::MAINTENANCE | RoleFlags::DRAINING)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Immutable view of the whole server set, swapped atomically by the
/// monitor. Workers hold a reader and refresh at session-boundary safe
/// points only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub version: u64,
    pub servers: Vec<ServerDescriptor>,
}

impl ServerSnapshot {
    pub fn master(&self) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.is_master() && s.is_usable())
    }

    pub fn usable_slaves(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter().filter(|s| s.is_slave() && s.is_usable())
    }

    pub fn by_name(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Single-writer handle owned by the monitor task.
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<ServerSnapshot>>,
    version: u64,
}

pub type SnapshotReader = watch::Receiver<Arc<ServerSnapshot>>;

impl SnapshotPublisher {
    pub fn new(initial: ServerSnapshot) -> (Self, SnapshotReader) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        (Self { tx, version: 0 }, rx)
    }

    /// Publish a new snapshot. Old snapshots stay alive until the last
    /// worker drops its `Arc`.
    pub fn publish(&mut self, mut snapshot: ServerSnapshot) {
        self.version += 1;
        snapshot.version = self.version;
        let _ = self.tx.send(Arc::new(snapshot));
    }

    /// Rebuild the current snapshot with one server's flags changed; used by
    /// the admin set/clear-flag verbs.
    pub fn alter_flags(&mut self, server: &str, set: RoleFlags, clear: RoleFlags) -> bool {
        let current = self.tx.borrow().as_ref().clone();
        let mut next = current;
        let mut found = false;
        for s in &mut next.servers {
            if s.name == server {
                s.roles |= set;
                s.roles.remove(clear);
                s.status_version += 1;
                found = true;
            }
        }
        if found {
            self.publish(next);
        }
        found
    }

    pub fn current(&self) -> Arc<ServerSnapshot> {
        self.tx.borrow().clone()
    }
}

/// Fetch the latest snapshot at a safe point. Never blocks.
pub fn refresh(reader: &mut SnapshotReader) -> Arc<ServerSnapshot> {
    reader.borrow_and_update().clone()
}

#[cfg(test)]
pub(crate) fn test_descriptor(name: &str, roles: RoleFlags, rank: i32) -> ServerDescriptor {
    ServerDescriptor {
        name: name.to_string(),
        addr: "127.0.0.1".to_string(),
        port: 3306,
        roles: roles | RoleFlags::RUNNING,
        status_version: 1,
        rank,
        lag_secs: Some(0),
        connections: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_observe() {
        let (mut publisher, mut reader) = SnapshotPublisher::new(ServerSnapshot::default());
        let before = refresh(&mut reader);
        assert_eq!(before.version, 0);

        publisher.publish(ServerSnapshot {
            version: 0,
            servers: vec![test_descriptor("s1", RoleFlags::MASTER, RANK_PRIMARY)],
        });
        let after = refresh(&mut reader);
        assert_eq!(after.version, 1);
        assert_eq!(after.master().unwrap().name, "s1");
        // the previously observed snapshot is untouched
        assert_eq!(before.version, 0);
    }

    #[test]
    fn alter_flags_bumps_status_version() {
        let (mut publisher, mut reader) = SnapshotPublisher::new(ServerSnapshot {
            version: 0,
            servers: vec![test_descriptor("s2", RoleFlags::SLAVE, RANK_SECONDARY)],
        });
        assert!(publisher.alter_flags("s2", RoleFlags::MAINTENANCE, RoleFlags::empty()));
        let snap = refresh(&mut reader);
        let s2 = snap.by_name("s2").unwrap();
        assert!(!s2.is_usable());
        assert_eq!(s2.status_version, 2);
        assert!(!publisher.alter_flags("nope", RoleFlags::empty(), RoleFlags::empty()));
    }

    #[test]
    fn draining_server_is_unusable() {
        let mut d = test_descriptor("s3", RoleFlags::SLAVE, RANK_SECONDARY);
        assert!(d.is_usable());
        d.roles |= RoleFlags::DRAINING;
        assert!(!d.is_usable());
    }
}

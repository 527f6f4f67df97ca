pub mod history;

pub use history::History;

use crate::classifier::{Classification, SqlMode, TableName, TypeMask};
use crate::hint::HintRegistry;

use hashbrown::{HashMap, HashSet};
use mysql_common::constants::CapabilityFlags;

/// Capability bits that change the shape of packets after the handshake.
/// Two connections agreeing on these can swap mid-session; anything else is
/// cosmetic for pooling purposes.
pub const WIRE_FORMAT_CAPS: CapabilityFlags = CapabilityFlags::CLIENT_PROTOCOL_41
    .union(CapabilityFlags::CLIENT_DEPRECATE_EOF)
    .union(CapabilityFlags::CLIENT_FOUND_ROWS)
    .union(CapabilityFlags::CLIENT_MULTI_STATEMENTS)
    .union(CapabilityFlags::CLIENT_MULTI_RESULTS)
    .union(CapabilityFlags::CLIENT_PS_MULTI_RESULTS)
    .union(CapabilityFlags::CLIENT_SESSION_TRACK)
    .union(CapabilityFlags::CLIENT_TRANSACTIONS);

/// Transaction state tri-value tracked per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrxState {
    #[default]
    None,
    Active,
    ReadOnly,
}

/// Pool key: a backend authenticated with a matching fingerprint can be
/// bound to the session without a full re-handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub user: String,
    pub database: Option<String>,
    pub collation: u16,
    pub wire_caps: u32,
}

/// Client-side prepared-statement bookkeeping: the id the proxy advertised
/// and any accumulated COM_STMT_SEND_LONG_DATA chunks awaiting execute.
#[derive(Debug, Default)]
pub struct PreparedStatement {
    pub statement: Vec<u8>,
    pub param_count: u16,
    pub long_data: HashMap<u16, Vec<u8>>,
}

/// Everything the proxy remembers about one client session. Owned by exactly
/// one worker for the session's whole lifetime; no locking anywhere.
pub struct SessionState {
    pub user: String,
    pub database: Option<String>,
    pub capabilities: CapabilityFlags,
    pub collation: u16,
    pub autocommit: bool,
    pub trx: TrxState,
    pub sql_mode: SqlMode,
    pub history: History,
    pub hints: HintRegistry,
    /// Temporary tables created in this session; reads of them must follow
    /// the creating backend.
    pub tmp_tables: HashSet<TableName>,
    /// Proxy-assigned prepared-statement ids, stable towards the client.
    pub prepared: HashMap<u32, PreparedStatement>,
    next_ps_id: u32,
    /// READ ONLY / READ WRITE armed by a bare SET TRANSACTION for the next
    /// transaction only.
    next_trx_read_only: Option<bool>,
}

impl SessionState {
    pub fn new(
        user: String,
        database: Option<String>,
        capabilities: CapabilityFlags,
        collation: u16,
        history_cap: usize,
    ) -> Self {
        Self {
            user,
            database,
            capabilities,
            collation,
            autocommit: true,
            trx: TrxState::None,
            sql_mode: SqlMode::Default,
            history: History::new(history_cap),
            hints: HintRegistry::default(),
            tmp_tables: HashSet::new(),
            prepared: HashMap::new(),
            next_ps_id: 0,
            next_trx_read_only: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            user: self.user.clone(),
            database: self.database.clone(),
            collation: self.collation,
            wire_caps: (self.capabilities & WIRE_FORMAT_CAPS).bits(),
        }
    }

    pub fn next_prepared_id(&mut self) -> u32 {
        self.next_ps_id += 1;
        self.next_ps_id
    }

    /// Whether the session currently holds an open (write) transaction.
    pub fn in_write_trx(&self) -> bool {
        self.trx == TrxState::Active
    }

    pub fn in_read_only_trx(&self) -> bool {
        self.trx == TrxState::ReadOnly
    }

    /// Apply the transaction-control effects of a classified statement.
    /// Called before routing so the decision sees the new state.
    pub fn apply_trx_effects(&mut self, classification: &Classification) {
        let trx = classification.trx_type_mask();
        if trx.is_empty() {
            return;
        }
        if trx.contains(TypeMask::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
            self.trx = TrxState::None;
        }
        if trx.contains(TypeMask::DISABLE_AUTOCOMMIT) {
            // autocommit off leaves the session permanently inside a
            // transaction from the server's point of view
            self.autocommit = false;
            if self.trx == TrxState::None {
                self.trx = TrxState::Active;
            }
        }
        if trx.contains(TypeMask::NEXT_TRX) {
            if trx.contains(TypeMask::READONLY) {
                self.next_trx_read_only = Some(true);
            } else if trx.contains(TypeMask::READWRITE) {
                self.next_trx_read_only = Some(false);
            }
            return;
        }
        if trx.contains(TypeMask::BEGIN_TRX) {
            let read_only = if trx.contains(TypeMask::READONLY) {
                true
            } else if trx.contains(TypeMask::READWRITE) {
                false
            } else {
                self.next_trx_read_only.take().unwrap_or(false)
            };
            self.trx = if read_only {
                TrxState::ReadOnly
            } else {
                TrxState::Active
            };
        }
        if trx.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            self.trx = if self.autocommit {
                TrxState::None
            } else {
                TrxState::Active
            };
        }
    }

    /// Track temporary tables and flag reads that touch them.
    pub fn note_tmp_tables(&mut self, classification: &mut Classification) {
        if classification.type_mask.contains(TypeMask::CREATE_TMP_TABLE) {
            if let Some(t) = &classification.created_table {
                self.tmp_tables.insert(t.clone());
            }
        }
        if !self.tmp_tables.is_empty()
            && classification
                .tables
                .iter()
                .any(|t| self.tmp_tables.contains(t))
        {
            classification.type_mask |= TypeMask::READ_TMP_TABLE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{classify, ClassifyContext};

    fn session() -> SessionState {
        SessionState::new(
            "app".to_string(),
            Some("test".to_string()),
            CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_DEPRECATE_EOF,
            33,
            50,
        )
    }

    fn apply(s: &mut SessionState, sql: &str) {
        let c = classify(sql, &ClassifyContext::default());
        s.apply_trx_effects(&c);
    }

    #[test]
    fn begin_commit_cycle() {
        let mut s = session();
        assert_eq!(s.trx, TrxState::None);
        apply(&mut s, "START TRANSACTION");
        assert_eq!(s.trx, TrxState::Active);
        apply(&mut s, "COMMIT");
        assert_eq!(s.trx, TrxState::None);
    }

    #[test]
    fn read_only_transaction() {
        let mut s = session();
        apply(&mut s, "START TRANSACTION READ ONLY");
        assert_eq!(s.trx, TrxState::ReadOnly);
        assert!(s.in_read_only_trx());
        apply(&mut s, "ROLLBACK");
        assert_eq!(s.trx, TrxState::None);
    }

    #[test]
    fn next_trx_modifier_applies_once() {
        let mut s = session();
        apply(&mut s, "SET TRANSACTION READ ONLY");
        assert_eq!(s.trx, TrxState::None);
        apply(&mut s, "BEGIN");
        assert_eq!(s.trx, TrxState::ReadOnly);
        apply(&mut s, "COMMIT");
        apply(&mut s, "BEGIN");
        assert_eq!(s.trx, TrxState::Active);
    }

    #[test]
    fn autocommit_off_means_open_trx() {
        let mut s = session();
        apply(&mut s, "SET autocommit = 0");
        assert_eq!(s.trx, TrxState::Active);
        apply(&mut s, "COMMIT");
        // still inside an implicit transaction
        assert_eq!(s.trx, TrxState::Active);
        apply(&mut s, "SET autocommit = 1");
        assert_eq!(s.trx, TrxState::None);
    }

    #[test]
    fn fingerprint_ignores_non_wire_caps() {
        let mut s = session();
        let f1 = s.fingerprint();
        s.capabilities |= CapabilityFlags::CLIENT_CONNECT_ATTRS;
        assert_eq!(f1, s.fingerprint());
        s.capabilities.remove(CapabilityFlags::CLIENT_DEPRECATE_EOF);
        assert_ne!(f1, s.fingerprint());
    }

    #[test]
    fn tmp_table_reads_flagged() {
        let mut s = session();
        let ctx = ClassifyContext::default();
        let mut create = classify("CREATE TEMPORARY TABLE tmp1 (a INT)", &ctx);
        s.note_tmp_tables(&mut create);
        let mut read = classify("SELECT a FROM tmp1", &ctx);
        s.note_tmp_tables(&mut read);
        assert!(read.type_mask.contains(TypeMask::READ_TMP_TABLE));
        assert!(read.type_mask.needs_master());
    }
}

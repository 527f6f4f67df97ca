mod parser;
pub mod tokenizer;

use bitflags::bitflags;
use std::cell::Cell;
use strum_macros::AsRefStr;

bitflags! {
    /// Statement type bitmask. More than one bit may be set for a single
    /// statement; routing tests bits with `contains`/`intersects`, never
    /// equality.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMask: u32 {
        /// Read non-database data, can execute anywhere.
        const LOCAL_READ         = 1 << 0;
        const READ               = 1 << 1;
        const WRITE              = 1 << 2;
        const MASTER_READ        = 1 << 3;
        const SESSION_WRITE      = 1 << 4;
        const USERVAR_WRITE      = 1 << 5;
        const USERVAR_READ       = 1 << 6;
        const SYSVAR_READ        = 1 << 7;
        const GSYSVAR_READ       = 1 << 8;
        const GSYSVAR_WRITE      = 1 << 9;
        const BEGIN_TRX          = 1 << 10;
        const ENABLE_AUTOCOMMIT  = 1 << 11;
        const DISABLE_AUTOCOMMIT = 1 << 12;
        const ROLLBACK           = 1 << 13;
        const COMMIT             = 1 << 14;
        const PREPARE_NAMED_STMT = 1 << 15;
        const PREPARE_STMT       = 1 << 16;
        const EXEC_STMT          = 1 << 17;
        const CREATE_TMP_TABLE   = 1 << 18;
        const READ_TMP_TABLE     = 1 << 19;
        const SHOW_DATABASES     = 1 << 20;
        const SHOW_TABLES        = 1 << 21;
        const DEALLOC_PREPARE    = 1 << 22;
        /// The READ ONLY part of SET TRANSACTION.
        const READONLY           = 1 << 23;
        /// The READ WRITE part of SET TRANSACTION.
        const READWRITE          = 1 << 24;
        /// SET TRANSACTION that applies to the next transaction only.
        const NEXT_TRX           = 1 << 25;
    }
}

impl TypeMask {
    /// The transaction-related subset: begin/commit/rollback, autocommit
    /// toggles, and the READ ONLY / READ WRITE / NEXT TRANSACTION modifiers
    /// together with their read/write markers.
    pub fn trx_bits(self) -> TypeMask {
        self & (TypeMask::BEGIN_TRX
            | TypeMask::COMMIT
            | TypeMask::ROLLBACK
            | TypeMask::ENABLE_AUTOCOMMIT
            | TypeMask::DISABLE_AUTOCOMMIT
            | TypeMask::READONLY
            | TypeMask::READWRITE
            | TypeMask::NEXT_TRX
            | TypeMask::READ
            | TypeMask::WRITE)
    }

    /// True when the statement must reach the master under RW-split rules.
    pub fn needs_master(self) -> bool {
        self.intersects(
            TypeMask::WRITE
                | TypeMask::MASTER_READ
                | TypeMask::SESSION_WRITE
                | TypeMask::USERVAR_WRITE
                | TypeMask::GSYSVAR_WRITE
                | TypeMask::BEGIN_TRX
                | TypeMask::COMMIT
                | TypeMask::ROLLBACK
                | TypeMask::CREATE_TMP_TABLE
                | TypeMask::READ_TMP_TABLE,
        )
    }
}

/// To what extent the statement could be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ParseResult {
    /// Not recognized at all.
    #[default]
    Invalid,
    /// Classified from leading tokens only; incompletely classified.
    Tokenized,
    /// Statement fragment; classification may be missing pieces.
    PartiallyParsed,
    /// Completely classified.
    Parsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr)]
pub enum QueryOp {
    #[default]
    Undefined,
    Alter,
    Call,
    ChangeDb,
    Create,
    Delete,
    Drop,
    Execute,
    Explain,
    Grant,
    Insert,
    Load,
    LoadLocal,
    Revoke,
    Select,
    Set,
    SetTransaction,
    Show,
    Truncate,
    Update,
    Kill,
}

bitflags! {
    /// Context a field reference appears in. A set bit does not mean the
    /// field appears only there.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FieldContext: u32 {
        /// Right-hand side of a UNION.
        const UNION    = 1 << 0;
        const SUBQUERY = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub db: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn new(db: Option<&str>, table: &str) -> Self {
        Self {
            db: db.map(|d| d.to_string()),
            table: table.to_string(),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.db {
            Some(db) => write!(f, "{}.{}", db, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub database: Option<String>,
    pub table: Option<String>,
    pub column: String,
    pub context: FieldContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    /// Fields any invocation of the function touches directly (not through
    /// nested function calls).
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillType {
    #[default]
    Connection,
    Query,
    QueryId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KillInfo {
    pub target: String,
    /// `target` names a user rather than a thread id.
    pub user: bool,
    pub soft: bool,
    pub kill_type: KillType,
}

/// The full classification result for one statement.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub result: ParseResult,
    pub type_mask: TypeMask,
    pub op: QueryOp,
    pub tables: Vec<TableName>,
    pub databases: Vec<String>,
    pub fields: Vec<FieldInfo>,
    pub functions: Vec<FunctionInfo>,
    /// Name of a user-level prepared statement (PREPARE/EXECUTE/DEALLOCATE).
    pub prepare_name: Option<String>,
    /// Embedded preparable statement of `PREPARE x FROM '...'`.
    pub preparable: Option<Box<Classification>>,
    pub kill: Option<KillInfo>,
    pub created_table: Option<TableName>,
    /// Byte offset of the text after the first statement separator, when the
    /// payload held more than one statement.
    pub remainder_offset: Option<usize>,
}

impl Classification {
    pub fn trx_type_mask(&self) -> TypeMask {
        if self.type_mask.intersects(
            TypeMask::BEGIN_TRX
                | TypeMask::COMMIT
                | TypeMask::ROLLBACK
                | TypeMask::ENABLE_AUTOCOMMIT
                | TypeMask::DISABLE_AUTOCOMMIT
                | TypeMask::READONLY
                | TypeMask::READWRITE
                | TypeMask::NEXT_TRX,
        ) {
            self.type_mask.trx_bits()
        } else {
            TypeMask::empty()
        }
    }
}

/// Identifier quoting and reserved words the classifier should assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlMode {
    #[default]
    Default,
    Oracle,
}

/// Classification context, threaded explicitly through the call graph and
/// seeded per worker. The server version may affect how a statement is
/// classified; encoded as major * 10000 + minor * 100 + patch.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext {
    pub sql_mode: SqlMode,
    pub server_version: u64,
}

impl Default for ClassifyContext {
    fn default() -> Self {
        Self {
            sql_mode: SqlMode::Default,
            server_version: 10_11_02u64,
        }
    }
}

thread_local! {
    static WORKER_CONTEXT: Cell<ClassifyContext> = Cell::new(ClassifyContext::default());
}

/// Worker-local context accessors, initialised once at worker start and
/// updated when the session's SQL mode changes.
pub fn worker_classify_context() -> ClassifyContext {
    WORKER_CONTEXT.with(|c| c.get())
}

pub fn set_worker_classify_context(ctx: ClassifyContext) {
    WORKER_CONTEXT.with(|c| c.set(ctx));
}

/// Classify one statement. Robust against truncation: a fragment yields
/// `PartiallyParsed`, never an error.
pub fn classify(sql: &str, ctx: &ClassifyContext) -> Classification {
    parser::classify_statement(sql, ctx)
}

/// Classify the payload of a COM_QUERY / COM_STMT_PREPARE packet (the bytes
/// after the command byte).
pub fn classify_payload(payload: &[u8], ctx: &ClassifyContext) -> Classification {
    match std::str::from_utf8(payload) {
        Ok(sql) => classify(sql, ctx),
        Err(e) => {
            // classify the longest valid prefix; the tail is a fragment
            let valid = &payload[..e.valid_up_to()];
            let sql = std::str::from_utf8(valid).unwrap_or("");
            let mut c = classify(sql, ctx);
            if c.result > ParseResult::PartiallyParsed {
                c.result = ParseResult::PartiallyParsed;
            }
            c
        }
    }
}

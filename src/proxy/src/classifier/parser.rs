use super::tokenizer::{Spanned, Token, Tokenizer};
use super::{
    Classification, ClassifyContext, FieldContext, FieldInfo, FunctionInfo, KillInfo, KillType,
    ParseResult, QueryOp, TableName, TypeMask,
};

use hashbrown::HashSet;
use std::sync::OnceLock;

/// Words that can never be a column or table reference in the positions the
/// scanner looks at them.
fn reserved_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        HashSet::from_iter([
            "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "NULL", "LIKE", "IN", "IS", "AS", "ON",
            "JOIN", "INNER", "LEFT", "RIGHT", "OUTER", "CROSS", "NATURAL", "STRAIGHT_JOIN",
            "GROUP", "BY", "HAVING", "ORDER", "LIMIT", "OFFSET", "UNION", "ALL", "DISTINCT",
            "DISTINCTROW", "CASE", "WHEN", "THEN", "ELSE", "END", "BETWEEN", "EXISTS", "ASC",
            "DESC", "INTO", "VALUES", "VALUE", "SET", "DUPLICATE", "KEY", "UPDATE", "FOR",
            "SHARE", "LOCK", "MODE", "USING", "INTERVAL", "DIV", "MOD", "XOR", "REGEXP", "RLIKE",
            "BINARY", "COLLATE", "WITH", "ROLLUP", "PARTITION", "IGNORE", "LOW_PRIORITY",
            "HIGH_PRIORITY", "DELAYED", "QUICK", "SQL_CALC_FOUND_ROWS", "SQL_NO_CACHE",
            "SQL_CACHE", "TABLE", "IF", "TRUE", "FALSE", "UNKNOWN", "ESCAPE", "SOUNDS",
        ])
    })
}

fn is_reserved(word: &str) -> bool {
    reserved_words().contains(word.to_ascii_uppercase().as_str())
}

struct Cursor<'a> {
    toks: &'a [Spanned<'a>],
    i: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&Token<'a>> {
        self.toks.get(self.i).map(|s| &s.tok)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token<'a>> {
        self.toks.get(self.i + ahead).map(|s| &s.tok)
    }

    fn next(&mut self) -> Option<&Token<'a>> {
        let t = self.toks.get(self.i).map(|s| &s.tok);
        if t.is_some() {
            self.i += 1;
        }
        t
    }

    fn at_end(&self) -> bool {
        self.i >= self.toks.len()
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(t) if t.is_kw(kw)) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn peek_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(t) if t.is_kw(kw))
    }
}

/// Accumulates the classification while the cursor walks the statement.
#[derive(Default)]
struct Collector {
    out: Classification,
}

impl Collector {
    fn add_type(&mut self, bits: TypeMask) {
        self.out.type_mask |= bits;
    }

    fn add_table(&mut self, t: TableName) {
        if let Some(db) = &t.db {
            self.add_database(db.clone());
        }
        if !self.out.tables.contains(&t) {
            self.out.tables.push(t);
        }
    }

    fn add_database(&mut self, db: String) {
        if !self.out.databases.contains(&db) {
            self.out.databases.push(db);
        }
    }

    fn add_field(&mut self, f: FieldInfo) {
        if let Some(existing) = self.out.fields.iter_mut().find(|e| {
            e.column == f.column && e.table == f.table && e.database == f.database
        }) {
            existing.context |= f.context;
        } else {
            self.out.fields.push(f);
        }
    }

    fn add_function(&mut self, f: FunctionInfo) {
        if let Some(existing) = self
            .out
            .functions
            .iter_mut()
            .find(|e| e.name.eq_ignore_ascii_case(&f.name))
        {
            for fld in f.fields {
                if !existing.fields.iter().any(|e| e.column == fld.column) {
                    existing.fields.push(fld);
                }
            }
        } else {
            self.out.functions.push(f);
        }
    }
}

pub(super) fn classify_statement(sql: &str, ctx: &ClassifyContext) -> Classification {
    let mut tz = Tokenizer::new(sql, ctx.sql_mode);
    let mut toks: Vec<Spanned<'_>> = Vec::new();
    let mut remainder_offset = None;
    loop {
        match tz.next() {
            Some(s) if s.tok == Token::Punct(';') => {
                // remainder is reported through the continuation hook; the
                // classification covers the first statement only
                if let Some(next) = tz.next() {
                    remainder_offset = Some(next.start);
                }
                break;
            }
            Some(s) => toks.push(s),
            None => break,
        }
    }
    let truncated = tz.truncated;
    let saw_comment = tz.saw_comment;

    let mut col = Collector::default();
    col.out.remainder_offset = remainder_offset;

    if toks.is_empty() {
        col.out.result = if saw_comment {
            ParseResult::Tokenized
        } else {
            ParseResult::Invalid
        };
        return col.out;
    }

    let mut cur = Cursor { toks: &toks, i: 0 };
    let recognized = dispatch(&mut cur, &mut col, ctx);

    col.out.result = match (recognized, truncated) {
        (Recognized::No, _) => ParseResult::Invalid,
        (_, true) => ParseResult::PartiallyParsed,
        (Recognized::Tokens, false) => ParseResult::Tokenized,
        (Recognized::Partial, false) => ParseResult::PartiallyParsed,
        (Recognized::Full, false) => ParseResult::Parsed,
    };
    col.out
}

enum Recognized {
    No,
    Tokens,
    Partial,
    Full,
}

fn dispatch(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    let first = match cur.peek() {
        Some(t) => *t,
        None => return Recognized::No,
    };
    let word = match first.ident() {
        Some(w) => w.to_ascii_uppercase(),
        None => return Recognized::No,
    };
    cur.next();

    match word.as_str() {
        "SELECT" => parse_select(cur, col, ctx, FieldContext::empty()),
        "INSERT" | "REPLACE" => parse_insert(cur, col, ctx),
        "UPDATE" => parse_update(cur, col, ctx),
        "DELETE" => parse_delete(cur, col, ctx),
        "CREATE" => parse_create(cur, col, ctx),
        "DROP" => parse_drop(cur, col),
        "ALTER" => parse_alter(cur, col),
        "TRUNCATE" => parse_truncate(cur, col),
        "GRANT" => {
            col.out.op = QueryOp::Grant;
            col.add_type(TypeMask::WRITE);
            Recognized::Full
        }
        "REVOKE" => {
            col.out.op = QueryOp::Revoke;
            col.add_type(TypeMask::WRITE);
            Recognized::Full
        }
        "LOAD" => parse_load(cur, col),
        "CALL" => parse_call(cur, col, ctx),
        "SET" => parse_set(cur, col),
        "SHOW" => parse_show(cur, col),
        "KILL" => parse_kill(cur, col),
        "PREPARE" => parse_prepare(cur, col, ctx),
        "EXECUTE" => parse_execute(cur, col, ctx),
        "DEALLOCATE" => parse_deallocate(cur, col),
        "USE" => parse_use(cur, col),
        "BEGIN" => {
            cur.eat_kw("WORK");
            col.add_type(TypeMask::BEGIN_TRX);
            Recognized::Full
        }
        "START" => parse_start(cur, col),
        "COMMIT" => {
            cur.eat_kw("WORK");
            col.add_type(TypeMask::COMMIT);
            Recognized::Full
        }
        "ROLLBACK" => {
            cur.eat_kw("WORK");
            if cur.peek_kw("TO") {
                // rolling back to a savepoint keeps the transaction open
                col.add_type(TypeMask::WRITE);
            } else {
                col.add_type(TypeMask::ROLLBACK);
            }
            Recognized::Full
        }
        "EXPLAIN" | "DESCRIBE" | "DESC" => parse_explain(cur, col, ctx),
        "LOCK" => {
            col.add_type(TypeMask::WRITE | TypeMask::SESSION_WRITE);
            Recognized::Tokens
        }
        "UNLOCK" => {
            col.add_type(TypeMask::SESSION_WRITE);
            Recognized::Tokens
        }
        "FLUSH" | "RENAME" | "OPTIMIZE" | "ANALYZE" | "REPAIR" | "XA" | "HANDLER" => {
            col.add_type(TypeMask::WRITE);
            Recognized::Tokens
        }
        _ => Recognized::No,
    }
}

fn table_ref(cur: &mut Cursor<'_>) -> Option<TableName> {
    let first = cur.peek()?.ident()?.to_string();
    cur.next();
    if matches!(cur.peek(), Some(Token::Punct('.'))) {
        cur.next();
        let table = cur.peek().and_then(|t| t.ident()).map(|s| s.to_string());
        cur.next();
        Some(TableName {
            db: Some(first),
            table: table.unwrap_or_default(),
        })
    } else {
        Some(TableName {
            db: None,
            table: first,
        })
    }
}

/// Generic expression/clause scanner used by every DML statement once its
/// prologue has been consumed. Tracks clause keywords to tell table
/// references from field references, recurses into subqueries, and flips the
/// UNION context at top level.
fn scan_body(
    cur: &mut Cursor<'_>,
    col: &mut Collector,
    ctx: &ClassifyContext,
    mut field_ctx: FieldContext,
) {
    let mut table_mode = false;
    loop {
        let Some(tok) = cur.peek().copied() else {
            return;
        };
        match tok {
            Token::Punct(')') => return,
            Token::Punct('(') => {
                cur.next();
                if cur.peek_kw("SELECT") {
                    cur.next();
                    parse_select(cur, col, ctx, field_ctx | FieldContext::SUBQUERY);
                } else {
                    scan_body(cur, col, ctx, field_ctx);
                }
                // closing paren, if present
                if matches!(cur.peek(), Some(Token::Punct(')'))) {
                    cur.next();
                }
            }
            Token::Ident(w) if w.eq_ignore_ascii_case("UNION") => {
                cur.next();
                cur.eat_kw("ALL");
                cur.eat_kw("DISTINCT");
                field_ctx |= FieldContext::UNION;
                if cur.eat_kw("SELECT") {
                    // fall through: same scan continues with UNION context
                }
                table_mode = false;
            }
            Token::Ident(w)
                if matches!(
                    w.to_ascii_uppercase().as_str(),
                    "FROM" | "JOIN" | "INTO"
                ) =>
            {
                cur.next();
                table_mode = true;
            }
            Token::Ident(w)
                if matches!(
                    w.to_ascii_uppercase().as_str(),
                    "WHERE" | "SET" | "GROUP" | "HAVING" | "ORDER" | "LIMIT" | "ON" | "USING"
                        | "VALUES" | "VALUE" | "SELECT" | "WHEN" | "THEN" | "CASE" | "ELSE"
                ) =>
            {
                cur.next();
                table_mode = false;
            }
            Token::Ident(w) if w.eq_ignore_ascii_case("FOR") => {
                cur.next();
                if cur.eat_kw("UPDATE") {
                    col.add_type(TypeMask::WRITE);
                }
            }
            Token::Ident(w)
                if w.eq_ignore_ascii_case("LOCK")
                    && matches!(cur.peek_at(1), Some(t) if t.is_kw("IN")) =>
            {
                cur.next();
                col.add_type(TypeMask::WRITE);
            }
            Token::Ident(_) | Token::QuotedIdent(_) => {
                if table_mode {
                    if let Some(t) = table_ref(cur) {
                        col.add_table(t);
                    }
                    // optional alias
                    if let Some(Token::Ident(a)) = cur.peek().copied() {
                        if a.eq_ignore_ascii_case("AS") {
                            cur.next();
                            cur.next();
                        } else if !is_reserved(a) {
                            cur.next();
                        }
                    }
                    // a comma keeps us in the table list
                    if matches!(cur.peek(), Some(Token::Punct(','))) {
                        cur.next();
                    } else {
                        table_mode = false;
                    }
                } else {
                    consume_field_or_function(cur, col, ctx, field_ctx);
                }
            }
            Token::SysVar(name) => {
                cur.next();
                add_sysvar_read(col, name);
            }
            Token::UserVar(_) => {
                cur.next();
                if matches!(cur.peek(), Some(Token::Op(":="))) {
                    cur.next();
                    col.add_type(TypeMask::USERVAR_WRITE);
                } else {
                    col.add_type(TypeMask::USERVAR_READ);
                }
            }
            _ => {
                cur.next();
            }
        }
    }
}

fn add_sysvar_read(col: &mut Collector, name: &str) {
    let lowered = name.to_ascii_lowercase();
    if lowered.starts_with("global.") {
        col.add_type(TypeMask::GSYSVAR_READ);
    } else {
        col.add_type(TypeMask::SYSVAR_READ);
    }
}

/// `a`, `a.b`, `a.b.c` as a field reference, or `name(...)` as a function
/// whose directly-touched fields are collected.
fn consume_field_or_function(
    cur: &mut Cursor<'_>,
    col: &mut Collector,
    ctx: &ClassifyContext,
    field_ctx: FieldContext,
) {
    let mut parts: Vec<String> = Vec::new();
    while let Some(t) = cur.peek() {
        match t {
            Token::Ident(s) | Token::QuotedIdent(s) => {
                if parts.is_empty() && is_reserved(s) {
                    cur.next();
                    return;
                }
                parts.push(s.to_string());
                cur.next();
                if matches!(cur.peek(), Some(Token::Punct('.'))) {
                    cur.next();
                    // `t.*` touches no named field
                    if matches!(cur.peek(), Some(Token::Punct('*'))) {
                        cur.next();
                        return;
                    }
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    if parts.is_empty() {
        cur.next();
        return;
    }

    if matches!(cur.peek(), Some(Token::Punct('('))) && parts.len() == 1 {
        cur.next();
        let name = parts.pop().unwrap();
        if name.eq_ignore_ascii_case("LAST_INSERT_ID") {
            col.add_type(TypeMask::MASTER_READ);
        }
        let direct = scan_function_args(cur, col, ctx, field_ctx);
        col.add_function(FunctionInfo {
            name,
            fields: direct,
        });
        return;
    }

    let field = match parts.len() {
        1 => FieldInfo {
            database: None,
            table: None,
            column: parts.pop().unwrap(),
            context: field_ctx,
        },
        2 => {
            let column = parts.pop().unwrap();
            FieldInfo {
                database: None,
                table: parts.pop(),
                column,
                context: field_ctx,
            }
        }
        _ => {
            let column = parts.pop().unwrap();
            let table = parts.pop();
            FieldInfo {
                database: parts.pop(),
                table,
                column,
                context: field_ctx,
            }
        }
    };
    col.add_field(field);
}

/// Inside `f(...)`: fields at paren depth 1 belong to `f` directly; nested
/// calls keep their own field sets.
fn scan_function_args(
    cur: &mut Cursor<'_>,
    col: &mut Collector,
    ctx: &ClassifyContext,
    field_ctx: FieldContext,
) -> Vec<FieldInfo> {
    let mut direct = Vec::new();
    loop {
        let Some(tok) = cur.peek().copied() else {
            return direct;
        };
        match tok {
            Token::Punct(')') => {
                cur.next();
                return direct;
            }
            Token::Punct('(') => {
                cur.next();
                if cur.peek_kw("SELECT") {
                    cur.next();
                    parse_select(cur, col, ctx, field_ctx | FieldContext::SUBQUERY);
                } else {
                    scan_body(cur, col, ctx, field_ctx);
                }
                if matches!(cur.peek(), Some(Token::Punct(')'))) {
                    cur.next();
                }
            }
            Token::Ident(s) | Token::QuotedIdent(s) => {
                if is_reserved(s) {
                    cur.next();
                    continue;
                }
                let before = col.out.fields.len();
                consume_field_or_function(cur, col, ctx, field_ctx);
                // a new entry in the global list at this depth is a direct field
                if col.out.fields.len() > before {
                    direct.push(col.out.fields.last().unwrap().clone());
                }
            }
            Token::SysVar(name) => {
                cur.next();
                add_sysvar_read(col, name);
            }
            Token::UserVar(_) => {
                cur.next();
                col.add_type(TypeMask::USERVAR_READ);
            }
            _ => {
                cur.next();
            }
        }
    }
}

fn parse_select(
    cur: &mut Cursor<'_>,
    col: &mut Collector,
    ctx: &ClassifyContext,
    field_ctx: FieldContext,
) -> Recognized {
    if col.out.op == QueryOp::Undefined {
        col.out.op = QueryOp::Select;
    }
    col.add_type(TypeMask::READ);
    scan_body(cur, col, ctx, field_ctx);
    Recognized::Full
}

fn parse_insert(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    col.out.op = QueryOp::Insert;
    col.add_type(TypeMask::WRITE);
    while cur.eat_kw("LOW_PRIORITY")
        || cur.eat_kw("DELAYED")
        || cur.eat_kw("HIGH_PRIORITY")
        || cur.eat_kw("IGNORE")
    {}
    cur.eat_kw("INTO");
    if let Some(t) = table_ref(cur) {
        col.add_table(t);
    } else {
        return Recognized::Partial;
    }
    scan_body(cur, col, ctx, FieldContext::empty());
    Recognized::Full
}

fn parse_update(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    col.out.op = QueryOp::Update;
    col.add_type(TypeMask::WRITE);
    while cur.eat_kw("LOW_PRIORITY") || cur.eat_kw("IGNORE") {}
    loop {
        match table_ref(cur) {
            Some(t) => col.add_table(t),
            None => return Recognized::Partial,
        }
        if matches!(cur.peek(), Some(Token::Punct(','))) {
            cur.next();
        } else {
            break;
        }
    }
    scan_body(cur, col, ctx, FieldContext::empty());
    Recognized::Full
}

fn parse_delete(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    col.out.op = QueryOp::Delete;
    col.add_type(TypeMask::WRITE);
    while cur.eat_kw("LOW_PRIORITY") || cur.eat_kw("QUICK") || cur.eat_kw("IGNORE") {}
    if !cur.eat_kw("FROM") {
        return Recognized::Partial;
    }
    match table_ref(cur) {
        Some(t) => col.add_table(t),
        None => return Recognized::Partial,
    }
    scan_body(cur, col, ctx, FieldContext::empty());
    Recognized::Full
}

fn parse_create(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    col.out.op = QueryOp::Create;
    col.add_type(TypeMask::WRITE);
    if cur.eat_kw("OR") {
        cur.eat_kw("REPLACE");
    }
    let temporary = cur.eat_kw("TEMPORARY");
    if cur.eat_kw("TABLE") {
        if temporary {
            col.add_type(TypeMask::CREATE_TMP_TABLE);
        }
        if cur.eat_kw("IF") {
            cur.eat_kw("NOT");
            cur.eat_kw("EXISTS");
        }
        match table_ref(cur) {
            Some(t) => {
                col.out.created_table = Some(t.clone());
                col.add_table(t);
            }
            None => return Recognized::Partial,
        }
        // CREATE TABLE ... AS SELECT / LIKE other
        scan_body(cur, col, ctx, FieldContext::empty());
        return Recognized::Full;
    }
    if cur.eat_kw("DATABASE") || cur.eat_kw("SCHEMA") {
        if cur.eat_kw("IF") {
            cur.eat_kw("NOT");
            cur.eat_kw("EXISTS");
        }
        if let Some(db) = cur.peek().and_then(|t| t.ident()) {
            col.add_database(db.to_string());
            cur.next();
        }
        return Recognized::Full;
    }
    if cur.eat_kw("INDEX") || cur.eat_kw("UNIQUE") || cur.eat_kw("FULLTEXT") {
        while !cur.at_end() && !cur.eat_kw("ON") {
            cur.next();
        }
        if let Some(t) = table_ref(cur) {
            col.add_table(t);
        }
        return Recognized::Full;
    }
    if cur.eat_kw("VIEW") {
        if let Some(t) = table_ref(cur) {
            col.add_table(t);
        }
        while !cur.at_end() && !cur.eat_kw("SELECT") {
            cur.next();
        }
        parse_select(cur, col, ctx, FieldContext::empty());
        col.out.op = QueryOp::Create;
        return Recognized::Full;
    }
    Recognized::Tokens
}

fn parse_drop(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.out.op = QueryOp::Drop;
    if cur.eat_kw("PREPARE") {
        // DROP PREPARE is the DEALLOCATE alias
        col.add_type(TypeMask::DEALLOC_PREPARE);
        if let Some(name) = cur.peek().and_then(|t| t.ident()) {
            col.out.prepare_name = Some(name.to_string());
            cur.next();
        }
        return Recognized::Full;
    }
    col.add_type(TypeMask::WRITE);
    cur.eat_kw("TEMPORARY");
    if cur.eat_kw("TABLE") {
        if cur.eat_kw("IF") {
            cur.eat_kw("EXISTS");
        }
        loop {
            match table_ref(cur) {
                Some(t) => col.add_table(t),
                None => break,
            }
            if matches!(cur.peek(), Some(Token::Punct(','))) {
                cur.next();
            } else {
                break;
            }
        }
        return Recognized::Full;
    }
    if cur.eat_kw("DATABASE") || cur.eat_kw("SCHEMA") {
        if cur.eat_kw("IF") {
            cur.eat_kw("EXISTS");
        }
        if let Some(db) = cur.peek().and_then(|t| t.ident()) {
            col.add_database(db.to_string());
            cur.next();
        }
        return Recognized::Full;
    }
    Recognized::Tokens
}

fn parse_alter(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.out.op = QueryOp::Alter;
    col.add_type(TypeMask::WRITE);
    cur.eat_kw("ONLINE");
    cur.eat_kw("IGNORE");
    if cur.eat_kw("TABLE") {
        if let Some(t) = table_ref(cur) {
            col.add_table(t);
        }
        return Recognized::Full;
    }
    Recognized::Tokens
}

fn parse_truncate(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.out.op = QueryOp::Truncate;
    col.add_type(TypeMask::WRITE);
    cur.eat_kw("TABLE");
    match table_ref(cur) {
        Some(t) => {
            col.add_table(t);
            Recognized::Full
        }
        None => Recognized::Partial,
    }
}

fn parse_load(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.add_type(TypeMask::WRITE);
    if !cur.eat_kw("DATA") {
        col.out.op = QueryOp::Load;
        return Recognized::Tokens;
    }
    cur.eat_kw("LOW_PRIORITY");
    cur.eat_kw("CONCURRENT");
    let local = cur.eat_kw("LOCAL");
    col.out.op = if local { QueryOp::LoadLocal } else { QueryOp::Load };
    cur.eat_kw("INFILE");
    cur.next(); // file name literal
    cur.eat_kw("REPLACE");
    cur.eat_kw("IGNORE");
    if cur.eat_kw("INTO") && cur.eat_kw("TABLE") {
        if let Some(t) = table_ref(cur) {
            col.add_table(t);
        }
    }
    Recognized::Full
}

fn parse_call(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    col.out.op = QueryOp::Call;
    col.add_type(TypeMask::WRITE);
    if let Some(name) = cur.peek().and_then(|t| t.ident()) {
        let name = name.to_string();
        cur.next();
        if matches!(cur.peek(), Some(Token::Punct('('))) {
            cur.next();
            let direct = scan_function_args(cur, col, ctx, FieldContext::empty());
            col.add_function(FunctionInfo {
                name,
                fields: direct,
            });
        } else {
            col.add_function(FunctionInfo {
                name,
                fields: Vec::new(),
            });
        }
        Recognized::Full
    } else {
        Recognized::Partial
    }
}

#[derive(PartialEq)]
enum SetScope {
    None,
    Session,
    Global,
}

fn parse_set(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.out.op = QueryOp::Set;
    loop {
        let mut scope = SetScope::None;
        if cur.eat_kw("GLOBAL") {
            scope = SetScope::Global;
        } else if cur.eat_kw("SESSION") || cur.eat_kw("LOCAL") {
            scope = SetScope::Session;
        }

        if cur.eat_kw("TRANSACTION") {
            parse_set_transaction(cur, col, &scope);
        } else if cur.eat_kw("NAMES") || cur.eat_kw("CHARACTER") || cur.eat_kw("CHARSET") {
            cur.eat_kw("SET");
            cur.next(); // charset name
            col.add_type(TypeMask::SESSION_WRITE);
            if matches!(cur.peek(), Some(t) if t.is_kw("COLLATE")) {
                cur.next();
                cur.next();
            }
        } else {
            match cur.peek().copied() {
                Some(Token::UserVar(_)) => {
                    cur.next();
                    col.add_type(TypeMask::USERVAR_WRITE);
                    skip_assignment_value(cur, col, false);
                }
                Some(Token::SysVar(name)) => {
                    cur.next();
                    let is_autocommit = set_variable_bits(col, name, &scope);
                    skip_assignment_value(cur, col, is_autocommit);
                }
                Some(Token::Ident(name)) | Some(Token::QuotedIdent(name)) => {
                    cur.next();
                    let is_autocommit = set_variable_bits(col, name, &scope);
                    skip_assignment_value(cur, col, is_autocommit);
                }
                _ => return Recognized::Partial,
            }
        }

        if matches!(cur.peek(), Some(Token::Punct(','))) {
            cur.next();
        } else {
            break;
        }
    }
    Recognized::Full
}

fn parse_set_transaction(cur: &mut Cursor<'_>, col: &mut Collector, scope: &SetScope) {
    col.out.op = QueryOp::SetTransaction;
    match scope {
        SetScope::Global => col.add_type(TypeMask::GSYSVAR_WRITE),
        SetScope::Session => col.add_type(TypeMask::SESSION_WRITE),
        // a bare SET TRANSACTION applies to the next transaction only
        SetScope::None => col.add_type(TypeMask::SESSION_WRITE | TypeMask::NEXT_TRX),
    }
    loop {
        if cur.eat_kw("READ") {
            if cur.eat_kw("ONLY") {
                col.add_type(TypeMask::READONLY);
            } else if cur.eat_kw("WRITE") {
                col.add_type(TypeMask::READWRITE);
            }
        } else if cur.eat_kw("ISOLATION") {
            cur.eat_kw("LEVEL");
            while matches!(cur.peek(), Some(Token::Ident(_))) {
                let done = !matches!(
                    cur.peek().and_then(|t| t.ident()),
                    Some(s) if matches!(
                        s.to_ascii_uppercase().as_str(),
                        "REPEATABLE" | "READ" | "COMMITTED" | "UNCOMMITTED" | "SERIALIZABLE"
                    )
                );
                if done {
                    break;
                }
                cur.next();
            }
        } else if !matches!(cur.peek(), Some(Token::Punct(','))) {
            break;
        }
        if matches!(cur.peek(), Some(Token::Punct(','))) {
            cur.next();
        } else {
            break;
        }
    }
}

fn set_variable_bits(col: &mut Collector, raw_name: &str, scope: &SetScope) -> bool {
    let lowered = raw_name.to_ascii_lowercase();
    let (prefix_global, name) = if let Some(stripped) = lowered.strip_prefix("global.") {
        (true, stripped.to_string())
    } else if let Some(stripped) = lowered.strip_prefix("session.") {
        (false, stripped.to_string())
    } else if let Some(stripped) = lowered.strip_prefix("local.") {
        (false, stripped.to_string())
    } else {
        (false, lowered)
    };
    let global = prefix_global || *scope == SetScope::Global;

    if name == "autocommit" {
        col.add_type(TypeMask::SESSION_WRITE);
        if global {
            col.add_type(TypeMask::GSYSVAR_WRITE);
        }
        return true;
    }
    if global {
        col.add_type(TypeMask::GSYSVAR_WRITE | TypeMask::SESSION_WRITE);
    } else {
        col.add_type(TypeMask::SESSION_WRITE);
    }
    false
}

/// Consume `= value` (or `:= value`). If the assignment target was
/// `autocommit`, the literal decides the enable/disable bit.
fn skip_assignment_value(cur: &mut Cursor<'_>, col: &mut Collector, autocommit: bool) {
    if matches!(cur.peek(), Some(Token::Punct('='))) || matches!(cur.peek(), Some(Token::Op(":=")))
    {
        cur.next();
    } else {
        return;
    }
    let mut depth = 0usize;
    let mut first_value_token = true;
    while let Some(tok) = cur.peek().copied() {
        match tok {
            Token::Punct('(') => {
                depth += 1;
                cur.next();
            }
            Token::Punct(')') => {
                if depth == 0 {
                    return;
                }
                depth -= 1;
                cur.next();
            }
            Token::Punct(',') if depth == 0 => return,
            t => {
                if first_value_token && autocommit {
                    record_autocommit_value(col, &t);
                }
                first_value_token = false;
                cur.next();
            }
        }
    }
}

fn record_autocommit_value(col: &mut Collector, tok: &Token<'_>) {
    let text = match tok {
        Token::Number(n) => *n,
        Token::Ident(s) => *s,
        Token::StringLit(s) => *s,
        _ => return,
    };
    if text == "1" || text.eq_ignore_ascii_case("on") || text.eq_ignore_ascii_case("true") {
        col.add_type(TypeMask::ENABLE_AUTOCOMMIT);
    } else if text == "0" || text.eq_ignore_ascii_case("off") || text.eq_ignore_ascii_case("false")
    {
        col.add_type(TypeMask::DISABLE_AUTOCOMMIT);
    }
}

fn parse_show(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.out.op = QueryOp::Show;
    col.add_type(TypeMask::READ);
    cur.eat_kw("FULL");
    if cur.eat_kw("DATABASES") || cur.eat_kw("SCHEMAS") {
        col.add_type(TypeMask::SHOW_DATABASES);
    } else if cur.eat_kw("TABLES") {
        col.add_type(TypeMask::SHOW_TABLES);
    }
    Recognized::Full
}

fn parse_kill(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.out.op = QueryOp::Kill;
    col.add_type(TypeMask::WRITE);
    let mut info = KillInfo::default();
    if cur.eat_kw("SOFT") {
        info.soft = true;
    } else {
        cur.eat_kw("HARD");
    }
    if cur.eat_kw("QUERY") {
        info.kill_type = if cur.eat_kw("ID") {
            KillType::QueryId
        } else {
            KillType::Query
        };
    } else {
        cur.eat_kw("CONNECTION");
    }
    if cur.eat_kw("USER") {
        info.user = true;
        if let Some(name) = cur.peek().and_then(|t| t.ident()) {
            info.target = name.to_string();
            cur.next();
        }
    } else if let Some(Token::Number(n)) = cur.peek() {
        info.target = n.to_string();
        cur.next();
    } else {
        col.out.kill = Some(info);
        return Recognized::Partial;
    }
    col.out.kill = Some(info);
    Recognized::Full
}

fn parse_prepare(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    col.add_type(TypeMask::PREPARE_NAMED_STMT);
    let name = match cur.peek().and_then(|t| t.ident()) {
        Some(n) => n.to_string(),
        None => return Recognized::Partial,
    };
    cur.next();
    col.out.prepare_name = Some(name);
    if !cur.eat_kw("FROM") {
        return Recognized::Partial;
    }
    match cur.peek().copied() {
        Some(Token::StringLit(sql)) => {
            cur.next();
            let inner = classify_statement(sql, ctx);
            col.out.preparable = Some(Box::new(inner));
            Recognized::Full
        }
        Some(Token::UserVar(_)) => {
            cur.next();
            col.add_type(TypeMask::USERVAR_READ);
            Recognized::Full
        }
        _ => Recognized::Partial,
    }
}

fn parse_execute(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    col.add_type(TypeMask::EXEC_STMT);
    col.out.op = QueryOp::Execute;
    if cur.eat_kw("IMMEDIATE") {
        if let Some(Token::StringLit(sql)) = cur.peek().copied() {
            cur.next();
            let inner = classify_statement(sql, ctx);
            col.out.preparable = Some(Box::new(inner));
        }
        return Recognized::Full;
    }
    match cur.peek().and_then(|t| t.ident()) {
        Some(name) => {
            col.out.prepare_name = Some(name.to_string());
            cur.next();
        }
        None => return Recognized::Partial,
    }
    if cur.eat_kw("USING") {
        while let Some(Token::UserVar(_)) = cur.peek() {
            cur.next();
            col.add_type(TypeMask::USERVAR_READ);
            if matches!(cur.peek(), Some(Token::Punct(','))) {
                cur.next();
            }
        }
    }
    Recognized::Full
}

fn parse_deallocate(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.add_type(TypeMask::DEALLOC_PREPARE);
    cur.eat_kw("PREPARE");
    match cur.peek().and_then(|t| t.ident()) {
        Some(name) => {
            col.out.prepare_name = Some(name.to_string());
            cur.next();
            Recognized::Full
        }
        None => Recognized::Partial,
    }
}

fn parse_use(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    col.out.op = QueryOp::ChangeDb;
    col.add_type(TypeMask::SESSION_WRITE);
    match cur.peek().and_then(|t| t.ident()) {
        Some(db) => {
            col.add_database(db.to_string());
            cur.next();
            Recognized::Full
        }
        None => Recognized::Partial,
    }
}

fn parse_start(cur: &mut Cursor<'_>, col: &mut Collector) -> Recognized {
    if !cur.eat_kw("TRANSACTION") {
        // START SLAVE and friends: recognized, administratively routed
        col.add_type(TypeMask::WRITE);
        return Recognized::Tokens;
    }
    col.add_type(TypeMask::BEGIN_TRX);
    loop {
        if cur.eat_kw("READ") {
            if cur.eat_kw("ONLY") {
                col.add_type(TypeMask::READONLY | TypeMask::READ);
            } else if cur.eat_kw("WRITE") {
                col.add_type(TypeMask::READWRITE | TypeMask::WRITE);
            }
        } else if cur.eat_kw("WITH") {
            cur.eat_kw("CONSISTENT");
            cur.eat_kw("SNAPSHOT");
        } else {
            break;
        }
        if matches!(cur.peek(), Some(Token::Punct(','))) {
            cur.next();
        }
    }
    Recognized::Full
}

fn parse_explain(cur: &mut Cursor<'_>, col: &mut Collector, ctx: &ClassifyContext) -> Recognized {
    col.out.op = QueryOp::Explain;
    col.add_type(TypeMask::READ);
    while cur.eat_kw("EXTENDED") || cur.eat_kw("FORMAT") {
        if matches!(cur.peek(), Some(Token::Punct('='))) {
            cur.next();
            cur.next();
        }
    }
    match cur.peek().copied() {
        Some(t)
            if t.is_kw("SELECT")
                || t.is_kw("INSERT")
                || t.is_kw("UPDATE")
                || t.is_kw("DELETE")
                || t.is_kw("REPLACE") =>
        {
            // tables and fields come from the explained statement; its write
            // bits do not, since EXPLAIN executes nothing
            let mut inner = Collector::default();
            dispatch(cur, &mut inner, ctx);
            for t in inner.out.tables {
                col.add_table(t);
            }
            for f in inner.out.fields {
                col.add_field(f);
            }
            for f in inner.out.functions {
                col.add_function(f);
            }
            Recognized::Full
        }
        Some(_) => {
            if let Some(t) = table_ref(cur) {
                col.add_table(t);
            }
            Recognized::Full
        }
        None => Recognized::Partial,
    }
}

#[cfg(test)]
mod tests {
    use crate::classifier::*;

    fn c(sql: &str) -> Classification {
        classify(sql, &ClassifyContext::default())
    }

    #[test]
    fn plain_select_is_read() {
        let r = c("SELECT a, b FROM t1 WHERE c = 3");
        assert_eq!(r.result, ParseResult::Parsed);
        assert_eq!(r.op, QueryOp::Select);
        assert_eq!(r.type_mask, TypeMask::READ);
        assert_eq!(r.tables, vec![TableName::new(None, "t1")]);
        let cols: Vec<_> = r.fields.iter().map(|f| f.column.as_str()).collect();
        assert_eq!(cols, vec!["a", "b", "c"]);
    }

    #[test]
    fn qualified_tables_and_databases() {
        let r = c("SELECT x FROM db1.t1 JOIN db2.t2 ON t1.id = t2.id");
        assert!(r.tables.contains(&TableName::new(Some("db1"), "t1")));
        assert!(r.tables.contains(&TableName::new(Some("db2"), "t2")));
        assert_eq!(r.databases, vec!["db1".to_string(), "db2".to_string()]);
    }

    #[test]
    fn insert_is_write() {
        let r = c("INSERT INTO t1 VALUES (1)");
        assert_eq!(r.op, QueryOp::Insert);
        assert!(r.type_mask.contains(TypeMask::WRITE));
        assert!(r.type_mask.needs_master());
        assert_eq!(r.tables, vec![TableName::new(None, "t1")]);
    }

    #[test]
    fn select_sysvar_reads() {
        let r = c("SELECT @@server_id");
        assert!(r.type_mask.contains(TypeMask::SYSVAR_READ));
        assert!(!r.type_mask.needs_master());
        let r = c("SELECT @@global.max_connections");
        assert!(r.type_mask.contains(TypeMask::GSYSVAR_READ));
    }

    #[test]
    fn uservar_assignment_in_select_is_a_write() {
        let r = c("SELECT @a := 1");
        assert!(r.type_mask.contains(TypeMask::USERVAR_WRITE));
        assert!(r.type_mask.needs_master());
        let r = c("SELECT @a");
        assert!(r.type_mask.contains(TypeMask::USERVAR_READ));
        assert!(!r.type_mask.contains(TypeMask::USERVAR_WRITE));
    }

    #[test]
    fn select_for_update_is_write() {
        let r = c("SELECT a FROM t1 FOR UPDATE");
        assert!(r.type_mask.contains(TypeMask::WRITE));
    }

    #[test]
    fn last_insert_id_reads_master() {
        let r = c("SELECT LAST_INSERT_ID()");
        assert!(r.type_mask.contains(TypeMask::MASTER_READ));
        assert!(r.type_mask.needs_master());
    }

    #[test]
    fn trx_controls() {
        assert!(c("BEGIN").type_mask.contains(TypeMask::BEGIN_TRX));
        assert!(c("START TRANSACTION")
            .type_mask
            .contains(TypeMask::BEGIN_TRX));
        assert!(c("COMMIT").type_mask.contains(TypeMask::COMMIT));
        assert!(c("ROLLBACK").type_mask.contains(TypeMask::ROLLBACK));
        let ro = c("START TRANSACTION READ ONLY");
        assert!(ro.type_mask.contains(TypeMask::BEGIN_TRX | TypeMask::READONLY));
        let rw = c("START TRANSACTION READ WRITE");
        assert!(rw.type_mask.contains(TypeMask::BEGIN_TRX | TypeMask::READWRITE));
        assert!(c("ROLLBACK TO SAVEPOINT sp1")
            .trx_type_mask()
            .is_empty());
    }

    #[test]
    fn set_autocommit_variants() {
        for sql in [
            "SET autocommit = 1",
            "SET autocommit=ON",
            "SET @@autocommit = true",
            "SET SESSION autocommit = 1",
        ] {
            let r = c(sql);
            assert!(
                r.type_mask.contains(TypeMask::ENABLE_AUTOCOMMIT),
                "{sql} => {:?}",
                r.type_mask
            );
        }
        for sql in ["SET autocommit = 0", "SET autocommit=off", "SET autocommit=FALSE"] {
            let r = c(sql);
            assert!(r.type_mask.contains(TypeMask::DISABLE_AUTOCOMMIT), "{sql}");
        }
    }

    #[test]
    fn set_transaction_scopes() {
        let next = c("SET TRANSACTION READ ONLY");
        assert_eq!(next.op, QueryOp::SetTransaction);
        assert!(next
            .type_mask
            .contains(TypeMask::READONLY | TypeMask::NEXT_TRX));

        let session = c("SET SESSION TRANSACTION READ WRITE");
        assert!(session.type_mask.contains(TypeMask::READWRITE));
        assert!(!session.type_mask.contains(TypeMask::NEXT_TRX));

        let global = c("SET GLOBAL TRANSACTION ISOLATION LEVEL READ COMMITTED");
        assert!(global.type_mask.contains(TypeMask::GSYSVAR_WRITE));
    }

    #[test]
    fn set_user_and_global_vars() {
        let r = c("SET @a = 1, @b = 2");
        assert!(r.type_mask.contains(TypeMask::USERVAR_WRITE));
        let r = c("SET GLOBAL max_connections = 100");
        assert!(r.type_mask.contains(TypeMask::GSYSVAR_WRITE));
        let r = c("SET sql_mode = 'ORACLE'");
        assert!(r.type_mask.contains(TypeMask::SESSION_WRITE));
    }

    #[test]
    fn show_bits() {
        assert!(c("SHOW DATABASES")
            .type_mask
            .contains(TypeMask::SHOW_DATABASES));
        assert!(c("SHOW TABLES").type_mask.contains(TypeMask::SHOW_TABLES));
        assert_eq!(c("SHOW STATUS").op, QueryOp::Show);
    }

    #[test]
    fn kill_descriptor() {
        let r = c("KILL 42");
        let k = r.kill.unwrap();
        assert_eq!(k.target, "42");
        assert_eq!(k.kill_type, KillType::Connection);
        assert!(!k.soft);

        let r = c("KILL SOFT QUERY 7");
        let k = r.kill.unwrap();
        assert!(k.soft);
        assert_eq!(k.kill_type, KillType::Query);

        let r = c("KILL QUERY ID 9");
        assert_eq!(r.kill.unwrap().kill_type, KillType::QueryId);

        let r = c("KILL USER app");
        let k = r.kill.unwrap();
        assert!(k.user);
        assert_eq!(k.target, "app");
    }

    #[test]
    fn prepare_embeds_preparable() {
        let r = c("PREPARE stmt1 FROM 'SELECT a FROM t1 WHERE b = ?'");
        assert!(r.type_mask.contains(TypeMask::PREPARE_NAMED_STMT));
        assert_eq!(r.prepare_name.as_deref(), Some("stmt1"));
        let inner = r.preparable.unwrap();
        let direct = c("SELECT a FROM t1 WHERE b = ?");
        assert_eq!(inner.tables, direct.tables);
        let inner_cols: Vec<_> = inner.fields.iter().map(|f| &f.column).collect();
        let direct_cols: Vec<_> = direct.fields.iter().map(|f| &f.column).collect();
        assert_eq!(inner_cols, direct_cols);
    }

    #[test]
    fn execute_and_deallocate() {
        let r = c("EXECUTE stmt1 USING @x");
        assert!(r.type_mask.contains(TypeMask::EXEC_STMT));
        assert_eq!(r.prepare_name.as_deref(), Some("stmt1"));
        assert!(r.type_mask.contains(TypeMask::USERVAR_READ));

        let r = c("DEALLOCATE PREPARE stmt1");
        assert!(r.type_mask.contains(TypeMask::DEALLOC_PREPARE));
        let r = c("DROP PREPARE stmt1");
        assert!(r.type_mask.contains(TypeMask::DEALLOC_PREPARE));
    }

    #[test]
    fn create_temporary_table() {
        let r = c("CREATE TEMPORARY TABLE tmp1 (a INT)");
        assert!(r
            .type_mask
            .contains(TypeMask::CREATE_TMP_TABLE | TypeMask::WRITE));
        assert_eq!(r.created_table, Some(TableName::new(None, "tmp1")));
    }

    #[test]
    fn comment_only_is_tokenized() {
        let r = c("/* just a comment */");
        assert_eq!(r.result, ParseResult::Tokenized);
        assert!(r.type_mask.is_empty());
    }

    #[test]
    fn truncated_statement_is_partial() {
        let r = c("SELECT a FROM t1 WHERE b = 'unterminated");
        assert_eq!(r.result, ParseResult::PartiallyParsed);
        // everything up to the truncation point is still collected
        assert_eq!(r.tables, vec![TableName::new(None, "t1")]);
    }

    #[test]
    fn garbage_is_invalid() {
        assert_eq!(c("WIBBLE WOBBLE").result, ParseResult::Invalid);
        assert_eq!(c("]]]").result, ParseResult::Invalid);
    }

    #[test]
    fn multi_statement_reports_remainder() {
        let sql = "SELECT 1; INSERT INTO t1 VALUES (2)";
        let r = c(sql);
        assert_eq!(r.op, QueryOp::Select);
        let off = r.remainder_offset.unwrap();
        assert_eq!(&sql[off..], "INSERT INTO t1 VALUES (2)");
    }

    #[test]
    fn union_and_subquery_contexts() {
        let r = c("SELECT a FROM t1 UNION SELECT b FROM t2");
        let a = r.fields.iter().find(|f| f.column == "a").unwrap();
        let b = r.fields.iter().find(|f| f.column == "b").unwrap();
        assert!(!a.context.contains(FieldContext::UNION));
        assert!(b.context.contains(FieldContext::UNION));

        let r = c("SELECT a FROM t1 WHERE x IN (SELECT y FROM t2)");
        let y = r.fields.iter().find(|f| f.column == "y").unwrap();
        assert!(y.context.contains(FieldContext::SUBQUERY));
        assert!(r.tables.contains(&TableName::new(None, "t2")));
    }

    #[test]
    fn function_direct_fields() {
        let r = c("SELECT length(a), length(concat(b, length(a))) FROM t");
        let length = r
            .functions
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case("length"))
            .unwrap();
        let length_fields: Vec<_> = length.fields.iter().map(|f| f.column.as_str()).collect();
        assert!(length_fields.contains(&"a"));
        let concat = r
            .functions
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case("concat"))
            .unwrap();
        let concat_fields: Vec<_> = concat.fields.iter().map(|f| f.column.as_str()).collect();
        assert!(concat_fields.contains(&"b"));
        assert!(!concat_fields.contains(&"a"));
    }

    #[test]
    fn explain_does_not_inherit_write() {
        let r = c("EXPLAIN UPDATE t1 SET a = 1");
        assert_eq!(r.op, QueryOp::Explain);
        assert!(!r.type_mask.contains(TypeMask::WRITE));
        assert!(r.tables.contains(&TableName::new(None, "t1")));
    }

    #[test]
    fn use_statement() {
        let r = c("USE test");
        assert_eq!(r.op, QueryOp::ChangeDb);
        assert_eq!(r.databases, vec!["test".to_string()]);
    }

    #[test]
    fn update_collects_set_fields() {
        let r = c("UPDATE t1 SET a = 1 WHERE b = 2");
        assert_eq!(r.op, QueryOp::Update);
        assert!(r.type_mask.contains(TypeMask::WRITE));
        let cols: Vec<_> = r.fields.iter().map(|f| f.column.as_str()).collect();
        assert!(cols.contains(&"a"));
        assert!(cols.contains(&"b"));
    }

    #[test]
    fn payload_with_invalid_utf8_tail_is_partial() {
        let mut payload = b"SELECT a FROM t1 WHERE b = ".to_vec();
        payload.extend([0xff, 0xfe]);
        let r = classify_payload(&payload, &ClassifyContext::default());
        assert_eq!(r.result, ParseResult::PartiallyParsed);
        assert_eq!(r.tables, vec![TableName::new(None, "t1")]);
    }

    #[test]
    fn oracle_mode_quoted_identifier() {
        let ctx = ClassifyContext {
            sql_mode: SqlMode::Oracle,
            ..Default::default()
        };
        let r = classify(r#"SELECT "col" FROM t"#, &ctx);
        assert!(r.fields.iter().any(|f| f.column == "col"));
    }
}

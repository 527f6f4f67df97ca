use crate::protocol::mariadb::basic::{ok_packet, read_length_encoded_number};
use crate::protocol::mariadb::constants::CommandCode;
use crate::protocol::mariadb::packet::Packet;

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use winnow::binary::{le_u16, le_u32};
use winnow::Parser;

/// What kind of reply a command produces; known in advance from the command
/// code, before the first reply byte arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyExpectation {
    /// Single OK or ERR packet.
    Ok,
    /// OK/ERR, a local-infile request, or a result set (possibly several).
    ResultSet,
    /// COM_STMT_PREPARE response.
    Prepare,
    /// One non-framed string packet (COM_STATISTICS).
    Statistics,
    /// No reply at all.
    None,
}

pub fn expectation_for(com: CommandCode) -> ReplyExpectation {
    match com {
        CommandCode::ComQuery
        | CommandCode::ComStmtExecute
        | CommandCode::ComStmtFetch
        | CommandCode::ComProcessInfo => ReplyExpectation::ResultSet,
        // COM_FIELD_LIST replies with bare column definitions up to EOF,
        // which the result-set machine handles as a header-less set
        CommandCode::ComFieldList => ReplyExpectation::ResultSet,
        CommandCode::ComStmtPrepare => ReplyExpectation::Prepare,
        CommandCode::ComStatistics => ReplyExpectation::Statistics,
        CommandCode::ComQuit
        | CommandCode::ComStmtSendLongData
        | CommandCode::ComStmtClose => ReplyExpectation::None,
        _ => ReplyExpectation::Ok,
    }
}

/// COM_STMT_PREPARE OK header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub columns: u16,
    pub params: u16,
}

pub fn parse_prepare_ok(pkt: &Packet) -> Option<PrepareOk> {
    if !pkt.is_ok_packet() || pkt.len() < 12 {
        return None;
    }
    let i = &pkt[1..];
    let (i, statement_id) = le_u32::<_, winnow::error::InputError<&[u8]>>
        .parse_peek(i)
        .ok()?;
    let (i, columns) = le_u16::<_, winnow::error::InputError<&[u8]>>
        .parse_peek(i)
        .ok()?;
    let (_, params) = le_u16::<_, winnow::error::InputError<&[u8]>>
        .parse_peek(i)
        .ok()?;
    Some(PrepareOk {
        statement_id,
        columns,
        params,
    })
}

/// Overwrite the statement id of a COM_STMT_PREPARE response in place.
pub fn rewrite_prepare_ok_id(pkt: &mut Packet, new_id: u32) {
    let bytes = pkt.as_mut();
    if bytes.len() >= 5 && bytes[0] == 0x00 {
        bytes[1..5].copy_from_slice(&new_id.to_le_bytes());
    }
}

/// What to do when a result set exceeds the configured size limits. Both
/// behaviors are kept selectable; see the service configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSizeAction {
    /// Drop the remaining rows and synthesize a terminating EOF so the
    /// connection survives.
    #[default]
    TruncateWithEof,
    /// Terminate the session.
    Terminate,
}

/// Per-reply outcome of feeding one packet to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// More packets belong to this reply.
    InProgress,
    /// The reply is delimited; `ok` is false when it ended with ERR.
    Complete { ok: bool },
    /// The backend requested a local-infile upload; the caller must relay
    /// the file data before the reply continues.
    LocalInfile,
    /// A size limit was crossed mid-result-set.
    LimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    ColumnDefs { remaining: u64 },
    AwaitRowsEof,
    Rows,
    PrepareTail { remaining: u64 },
    Done,
}

/// Reply-parsing state machine for one command's reply stream. Counts rows
/// and bytes so policy layers can veto mid-stream, and knows where the reply
/// ends under both EOF conventions.
#[derive(Debug)]
pub struct ReplyTracker {
    expectation: ReplyExpectation,
    state: State,
    deprecate_eof: bool,
    capabilities: CapabilityFlags,
    pub rows_seen: u64,
    pub bytes_seen: u64,
    pub max_rows: Option<u64>,
    pub max_size: Option<u64>,
    /// Filled from the first packet of a COM_STMT_PREPARE response.
    pub prepare_ok: Option<PrepareOk>,
    was_err: bool,
}

impl ReplyTracker {
    pub fn new(com: CommandCode, capabilities: CapabilityFlags) -> Self {
        Self::with_expectation(expectation_for(com), capabilities)
    }

    pub fn with_expectation(expectation: ReplyExpectation, capabilities: CapabilityFlags) -> Self {
        Self {
            expectation,
            state: if expectation == ReplyExpectation::None {
                State::Done
            } else {
                State::Start
            },
            deprecate_eof: capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF),
            capabilities,
            rows_seen: 0,
            bytes_seen: 0,
            max_rows: None,
            max_size: None,
            prepare_ok: None,
            was_err: false,
        }
    }

    pub fn with_limits(mut self, max_rows: Option<u64>, max_size: Option<u64>) -> Self {
        self.max_rows = max_rows;
        self.max_size = max_size;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    fn complete(&mut self, ok: bool) -> ReplyStatus {
        self.state = State::Done;
        self.was_err = !ok;
        ReplyStatus::Complete { ok }
    }

    fn ok_keeps_reply_open(&self, pkt: &Packet) -> bool {
        ok_packet(pkt, self.capabilities)
            .map(|(_, ok)| {
                ok.status_flags
                    .contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS)
            })
            .unwrap_or(false)
    }

    fn eof_keeps_reply_open(&self, pkt: &Packet) -> bool {
        if pkt.len() >= 5 {
            let status = u16::from_le_bytes([pkt[3], pkt[4]]);
            StatusFlags::from_bits_truncate(status)
                .contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS)
        } else {
            false
        }
    }

    /// Advance the machine with one reply packet.
    pub fn observe(&mut self, pkt: &Packet) -> ReplyStatus {
        self.bytes_seen += pkt.len() as u64;
        match self.state {
            State::Done => ReplyStatus::Complete { ok: !self.was_err },
            State::Start => self.observe_start(pkt),
            State::ColumnDefs { remaining } => {
                let left = remaining - 1;
                if left == 0 {
                    self.state = if self.deprecate_eof {
                        State::Rows
                    } else {
                        State::AwaitRowsEof
                    };
                } else {
                    self.state = State::ColumnDefs { remaining: left };
                }
                ReplyStatus::InProgress
            }
            State::AwaitRowsEof => {
                // the EOF between column definitions and rows
                self.state = State::Rows;
                ReplyStatus::InProgress
            }
            State::Rows => self.observe_row(pkt),
            State::PrepareTail { remaining } => {
                let left = remaining - 1;
                if left == 0 {
                    self.complete(true)
                } else {
                    self.state = State::PrepareTail { remaining: left };
                    ReplyStatus::InProgress
                }
            }
        }
    }

    fn observe_start(&mut self, pkt: &Packet) -> ReplyStatus {
        if pkt.is_err_packet() {
            return self.complete(false);
        }
        match self.expectation {
            ReplyExpectation::Ok | ReplyExpectation::Statistics => {
                if self.expectation == ReplyExpectation::Ok && self.ok_keeps_reply_open(pkt) {
                    // OK with SERVER_MORE_RESULTS_EXIST keeps the reply open
                    self.state = State::Start;
                    return ReplyStatus::InProgress;
                }
                self.complete(true)
            }
            ReplyExpectation::Prepare => {
                let Some(header) = parse_prepare_ok(pkt) else {
                    return self.complete(false);
                };
                self.prepare_ok = Some(header);
                let mut tail = header.columns as u64 + header.params as u64;
                if !self.deprecate_eof {
                    if header.columns > 0 {
                        tail += 1;
                    }
                    if header.params > 0 {
                        tail += 1;
                    }
                }
                if tail == 0 {
                    self.complete(true)
                } else {
                    self.state = State::PrepareTail { remaining: tail };
                    ReplyStatus::InProgress
                }
            }
            ReplyExpectation::ResultSet => {
                if pkt.is_ok_packet() {
                    if self.ok_keeps_reply_open(pkt) {
                        self.state = State::Start;
                        return ReplyStatus::InProgress;
                    }
                    return self.complete(true);
                }
                if pkt.is_local_in_file_packet() {
                    // after the file transfer the backend answers with OK/ERR
                    self.expectation = ReplyExpectation::Ok;
                    self.state = State::Start;
                    return ReplyStatus::LocalInfile;
                }
                if pkt.is_eof_packet() {
                    // header-less sets (COM_FIELD_LIST) end at the first EOF
                    if self.eof_keeps_reply_open(pkt) {
                        self.state = State::Start;
                        return ReplyStatus::InProgress;
                    }
                    return self.complete(true);
                }
                match read_length_encoded_number(pkt) {
                    Ok((_, columns)) if columns > 0 => {
                        self.state = State::ColumnDefs { remaining: columns };
                        ReplyStatus::InProgress
                    }
                    _ => {
                        // COM_FIELD_LIST streams bare definitions; treat the
                        // packet as the first of an unbounded row stream
                        self.state = State::Rows;
                        ReplyStatus::InProgress
                    }
                }
            }
            ReplyExpectation::None => ReplyStatus::Complete { ok: true },
        }
    }

    fn observe_row(&mut self, pkt: &Packet) -> ReplyStatus {
        if pkt.is_err_packet() {
            return self.complete(false);
        }
        let terminal = if self.deprecate_eof {
            pkt.is_result_set_eof_packet()
        } else {
            pkt.is_eof_packet()
        };
        if terminal {
            if self.eof_or_ok_more_results(pkt) {
                self.state = State::Start;
                return ReplyStatus::InProgress;
            }
            return self.complete(true);
        }
        self.rows_seen += 1;
        if self
            .max_rows
            .is_some_and(|limit| self.rows_seen > limit)
            || self.max_size.is_some_and(|limit| self.bytes_seen > limit)
        {
            return ReplyStatus::LimitExceeded;
        }
        ReplyStatus::InProgress
    }

    fn eof_or_ok_more_results(&self, pkt: &Packet) -> bool {
        if self.deprecate_eof {
            self.ok_keeps_reply_open(pkt)
        } else {
            self.eof_keeps_reply_open(pkt)
        }
    }

    /// Terminal EOF to send after truncating a result set mid-stream under
    /// [`ResultSizeAction::TruncateWithEof`].
    pub fn synthesized_eof(&self) -> Vec<u8> {
        if self.deprecate_eof {
            // OK-as-EOF: header 0xfe, no rows, no insert id, empty status
            vec![0xfe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        } else {
            vec![0xfe, 0x00, 0x00, 0x00, 0x00]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::default_capabilities;

    fn caps_no_deprecate() -> CapabilityFlags {
        default_capabilities() - CapabilityFlags::CLIENT_DEPRECATE_EOF
    }

    fn ok_pkt(more_results: bool) -> Packet {
        let status: u16 = if more_results { 0x0008 } else { 0 };
        Packet::from_vec(vec![
            0x00,
            0x00,
            0x00,
            (status & 0xff) as u8,
            (status >> 8) as u8,
            0x00,
            0x00,
        ])
    }

    fn eof_pkt(more_results: bool) -> Packet {
        let status: u16 = if more_results { 0x0008 } else { 0 };
        Packet::from_vec(vec![
            0xfe,
            0x00,
            0x00,
            (status & 0xff) as u8,
            (status >> 8) as u8,
        ])
    }

    fn row_pkt() -> Packet {
        Packet::from_vec(vec![0x03, b'a', b'b', b'c'])
    }

    #[test]
    fn single_ok_reply() {
        let mut t = ReplyTracker::new(CommandCode::ComInitDB, default_capabilities());
        assert_eq!(t.observe(&ok_pkt(false)), ReplyStatus::Complete { ok: true });
        assert!(t.is_complete());
    }

    #[test]
    fn err_reply() {
        let mut t = ReplyTracker::new(CommandCode::ComQuery, default_capabilities());
        let err = Packet::from_vec(b"\xff\x15\x04#28000denied".to_vec());
        assert_eq!(t.observe(&err), ReplyStatus::Complete { ok: false });
    }

    #[test]
    fn result_set_with_eof_convention() {
        let mut t = ReplyTracker::new(CommandCode::ComQuery, caps_no_deprecate());
        assert_eq!(t.observe(&Packet::from_vec(vec![0x02])), ReplyStatus::InProgress); // 2 columns
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::InProgress); // col def 1
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::InProgress); // col def 2
        assert_eq!(t.observe(&eof_pkt(false)), ReplyStatus::InProgress); // eof after defs
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::InProgress);
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::InProgress);
        assert_eq!(t.observe(&eof_pkt(false)), ReplyStatus::Complete { ok: true });
        assert_eq!(t.rows_seen, 2);
    }

    #[test]
    fn result_set_under_deprecate_eof() {
        let mut t = ReplyTracker::new(CommandCode::ComQuery, default_capabilities());
        assert_eq!(t.observe(&Packet::from_vec(vec![0x01])), ReplyStatus::InProgress);
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::InProgress); // col def
        // no EOF between defs and rows under DEPRECATE_EOF
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::InProgress);
        // OK-as-EOF terminator (len >= 7, header 0xfe)
        let term = Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(t.observe(&term), ReplyStatus::Complete { ok: true });
        assert_eq!(t.rows_seen, 1);
    }

    #[test]
    fn multi_result_chain() {
        let mut t = ReplyTracker::new(CommandCode::ComQuery, default_capabilities());
        // OK with SERVER_MORE_RESULTS_EXISTS keeps the reply open
        assert_eq!(t.observe(&ok_pkt(true)), ReplyStatus::InProgress);
        assert_eq!(t.observe(&ok_pkt(false)), ReplyStatus::Complete { ok: true });
    }

    #[test]
    fn prepare_response_counts_definitions() {
        let caps = caps_no_deprecate();
        let mut t = ReplyTracker::new(CommandCode::ComStmtPrepare, caps);
        let mut head = vec![0x00];
        head.extend(17u32.to_le_bytes());
        head.extend(1u16.to_le_bytes()); // 1 column
        head.extend(2u16.to_le_bytes()); // 2 params
        head.push(0);
        head.extend(0u16.to_le_bytes());
        assert_eq!(t.observe(&Packet::from_vec(head)), ReplyStatus::InProgress);
        let ok = t.prepare_ok.unwrap();
        assert_eq!(ok.statement_id, 17);
        assert_eq!(ok.columns, 1);
        assert_eq!(ok.params, 2);
        // 2 param defs + eof + 1 col def + eof
        for _ in 0..4 {
            assert_eq!(t.observe(&row_pkt()), ReplyStatus::InProgress);
        }
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::Complete { ok: true });
    }

    #[test]
    fn local_infile_request() {
        let mut t = ReplyTracker::new(CommandCode::ComQuery, default_capabilities());
        let req = Packet::from_vec(b"\xfb/tmp/data.csv".to_vec());
        assert_eq!(t.observe(&req), ReplyStatus::LocalInfile);
        // after the upload, the backend acknowledges
        assert_eq!(t.observe(&ok_pkt(false)), ReplyStatus::Complete { ok: true });
    }

    #[test]
    fn row_limit_vetoes_midstream() {
        let mut t = ReplyTracker::new(CommandCode::ComQuery, caps_no_deprecate())
            .with_limits(Some(1), None);
        t.observe(&Packet::from_vec(vec![0x01]));
        t.observe(&row_pkt());
        t.observe(&eof_pkt(false));
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::InProgress);
        assert_eq!(t.observe(&row_pkt()), ReplyStatus::LimitExceeded);
    }

    #[test]
    fn rewrite_prepare_id_in_place() {
        let mut head = vec![0x00];
        head.extend(17u32.to_le_bytes());
        head.extend([0u8; 7]);
        let mut pkt = Packet::from_vec(head);
        rewrite_prepare_ok_id(&mut pkt, 1);
        assert_eq!(parse_prepare_ok(&pkt).unwrap().statement_id, 1);
    }
}

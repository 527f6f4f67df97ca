use crate::protocol::mariadb::constants::CommandCode as ComInfo;
use crate::protocol::mariadb::constants::SCRAMBLE_SIZE;

use hashbrown::HashMap;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::combinator::{alt, preceded, rest};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};
use winnow::{Parser, Partial};

/// One decoded client command packet. Payload slices borrow from the packet
/// buffer; nothing is copied on the hot path.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Query(&'a [u8]),
    ListFields(&'a [u8]),
    Close(u32),
    Prepare(&'a [u8]),
    Init(&'a [u8]),
    Execute {
        stmt: u32,
        params: &'a [u8],
    },
    SendLongData {
        stmt: u32,
        param: u16,
        data: &'a [u8],
    },
    ChangeUser(&'a [u8]),
    ResetConnection,
    SetOption(u16),
    Statistics,
    Ping,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    /// header
    pub header: u8,
    /// affected rows in update/insert
    pub affected_rows: u64,
    /// insert_id in update/insert
    pub last_insert_id: u64,
    /// StatusFlags associated with this query
    pub status_flags: StatusFlags,
    /// Warnings
    pub warnings: u16,
    /// Extra information
    pub info: String,
    /// session state change information
    pub session_state_info: String,
}

/// Borrowed view of an ERR packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrView<'a> {
    pub code: u16,
    pub sqlstate: Option<&'a [u8]>,
    pub message: &'a [u8],
}

/// The server greeting (initial handshake v10) as read from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: Vec<u8>,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub capabilities: CapabilityFlags,
    pub collation: u8,
    pub status_flags: StatusFlags,
    pub auth_plugin: Vec<u8>,
}

/// `HandshakeResponse` represents the client's reply to the server greeting.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
    pub connect_attributes: Option<HashMap<String, String>>,
}

impl HandshakeResponse {
    pub fn user_string(&self) -> String {
        match &self.username {
            Some(username) => String::from_utf8_lossy(username).to_string(),
            None => "_NONE".to_string(),
        }
    }

    pub fn database_string(&self) -> Option<String> {
        self.database
            .as_ref()
            .map(|db| String::from_utf8_lossy(db).to_string())
    }
}

fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(input)
}

pub fn eof_server_status(i: &[u8]) -> IResult<&[u8], StatusFlags> {
    let status_flag_slice = &i[3..i.len()];
    let (i, status_flags_code) = le_u16.parse_peek(status_flag_slice)?;
    Ok((i, StatusFlags::from_bits_truncate(status_flags_code)))
}

/// Length-encoded integer: one byte below 0xfb is the value, 0xfc/0xfd/0xfe
/// introduce 2/3/8-byte little-endian values, 0xfb is the NULL marker.
pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

/// Same as [`read_length_encoded_number`] but keeps the NULL marker distinct,
/// for row decoding where 0xfb means SQL NULL rather than zero.
pub fn read_length_encoded_opt(i: &[u8]) -> IResult<&[u8], Option<u64>> {
    let (rest, b) = le_u8.parse_peek(i)?;
    if b == 0xfb {
        return Ok((rest, None));
    }
    let (rest, n) = read_length_encoded_number(i)?;
    Ok((rest, Some(n)))
}

pub fn ok_packet(i: &[u8], capabilities: CapabilityFlags) -> winnow::IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;

    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (info, session_state_info) =
        if !i.is_empty() && capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            let (i, info_size) = read_length_encoded_number(i)?;
            let (i, info) = take(info_size).parse_peek(i)?;

            let session_state_info =
                if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) {
                    let (i, s_t_size) = read_length_encoded_number(i)?;
                    let (_i, session_state_info) = take(s_t_size).parse_peek(i)?;
                    std::str::from_utf8(session_state_info).unwrap_or("")
                } else {
                    ""
                };
            (
                std::str::from_utf8(info).unwrap_or("").to_string(),
                session_state_info.to_string(),
            )
        } else {
            ("".to_string(), "".to_string())
        };

    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state_info,
        },
    ))
}

/// Borrow the pieces of an ERR packet. The '#'-prefixed SQLSTATE is only
/// present under CLIENT_PROTOCOL_41.
pub fn err_packet_view(i: &[u8]) -> IResult<&[u8], ErrView<'_>> {
    let (i, _header) = literal([0xff_u8]).parse_peek(i)?;
    let (i, code) = le_u16.parse_peek(i)?;
    if i.first() == Some(&b'#') {
        let (i, _) = take(1u8).parse_peek(i)?;
        let (i, sqlstate) = take(5u8).parse_peek(i)?;
        let (i, message) = rest.parse_peek(i)?;
        Ok((
            i,
            ErrView {
                code,
                sqlstate: Some(sqlstate),
                message,
            },
        ))
    } else {
        let (i, message) = rest.parse_peek(i)?;
        Ok((
            i,
            ErrView {
                code,
                sqlstate: None,
                message,
            },
        ))
    }
}

/// Parse the backend's initial handshake (protocol v10) into a
/// [`ServerHandshake`], reassembling the split scramble.
pub fn server_handshake(i: &[u8]) -> IResult<&[u8], ServerHandshake> {
    let (i, protocol_version) = le_u8.parse_peek(i)?;
    let (i, server_version) = take_until(1.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, thread_id) = le_u32.parse_peek(i)?;
    let (i, scramble_part_1) = take(8u8).parse_peek(i)?;
    let (i, _filler) = take(1u8).parse_peek(i)?;
    let (i, cap_low) = le_u16.parse_peek(i)?;
    let (i, collation) = le_u8.parse_peek(i)?;
    let (i, status_flags) = le_u16.parse_peek(i)?;
    let (i, cap_high) = le_u16.parse_peek(i)?;
    let (i, scramble_len) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(10u8).parse_peek(i)?;

    let capabilities =
        CapabilityFlags::from_bits_truncate((cap_high as u32) << 16 | cap_low as u32);

    let mut scramble = scramble_part_1.to_vec();
    let (i, auth_plugin) = if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        let part_2_len = std::cmp::max(13, scramble_len.saturating_sub(8)) as usize;
        let (i, scramble_part_2) = take(part_2_len).parse_peek(i)?;
        // part-2 carries a trailing NUL that is not part of the scramble
        let trimmed = scramble_part_2
            .split_last()
            .map(|(_, head)| head)
            .unwrap_or(scramble_part_2);
        scramble.extend_from_slice(trimmed);
        scramble.truncate(SCRAMBLE_SIZE);
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            let (i, plugin) = take_until(0.., "\0").parse_peek(i)?;
            (i, plugin.to_vec())
        } else {
            (i, Vec::new())
        }
    } else {
        (i, Vec::new())
    };

    Ok((
        i,
        ServerHandshake {
            protocol_version,
            server_version: server_version.to_vec(),
            thread_id,
            scramble,
            capabilities,
            collation,
            status_flags: StatusFlags::from_bits_truncate(status_flags),
            auth_plugin,
        },
    ))
}

pub fn client_handshake_response(
    i: &[u8],
    is_after_tls: bool,
) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let mut capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        // HandshakeResponse41
        let (i, cap2) = le_u16.parse_peek(i)?;
        let cap = (cap2 as u32) << 16 | capability_flags as u32;

        capabilities = CapabilityFlags::from_bits_truncate(cap);

        let (i, max_packet_len) = le_u32.parse_peek(i)?;
        let (i, collation) = take(1u8).parse_peek(i)?;

        let (i, _) = take(23u8).parse_peek(i)?;

        if !is_after_tls && capabilities.contains(CapabilityFlags::CLIENT_SSL) {
            // SSLRequest: nothing follows; the true response arrives after
            // the TLS handshake completes
            return Ok((
                i,
                HandshakeResponse {
                    client_flag: capabilities,
                    max_packet_len,
                    collation: u16::from(collation[0]),
                    username: None,
                    auth_response: vec![],
                    auth_plugin: vec![],
                    database: None,
                    connect_attributes: None,
                },
            ));
        }

        let (i, username) = {
            let (i, user) = take_until(1.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, Some(user.to_owned()))
        };
        let (i, auth_response) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
                let (i, size) = read_length_encoded_number(i)?;
                take(size).parse_peek(i)?
            } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                let (i, size) = le_u8.parse_peek(i)?;
                take(size).parse_peek(i)?
            } else {
                take_until(1.., "\0").parse_peek(i)?
            };

        let (i, db) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty() {
                let (i, db) = take_until(1.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;
                (i, Some(db))
            } else {
                (i, None)
            };

        let (i, auth_plugin) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
                let (i, auth_plugin) = take_until(1.., "\0").parse_peek(i)?;

                let (i, _) = literal("\0").parse_peek(i)?;
                (i, auth_plugin)
            } else {
                (i, &b""[..])
            };

        let (i, connect_attributes) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
                let (i, data_len) = read_length_encoded_number(i)?;
                let (i, data) = take(data_len).parse_peek(i)?;
                let mut input = data;
                let mut connect_attributes = HashMap::new();
                while !input.is_empty() {
                    let (remaining, k) = read_length_encoded_string(input)?;
                    let (remaining, v) = read_length_encoded_string(remaining)?;
                    let conn_attr_key = String::from_utf8_lossy(k).to_string();
                    let conn_attr_val = String::from_utf8_lossy(v).to_string();
                    connect_attributes.insert(conn_attr_key, conn_attr_val);
                    input = remaining;
                }
                (i, Some(connect_attributes))
            } else {
                (i, None)
            };

        Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: u16::from(collation[0]),
                username,
                auth_response: auth_response.to_vec(),
                auth_plugin: auth_plugin.to_vec(),
                database: db.map(|c| c.to_vec()),
                connect_attributes,
            },
        ))
    } else {
        // HandshakeResponse320
        let (i, max_packet_len_v1) = le_u16.parse_peek(i)?;
        let (i, max_packet_len_v2) = le_u8.parse_peek(i)?;
        let max_packet_len = (max_packet_len_v2 as u32) << 16 | max_packet_len_v1 as u32;
        let (i, username) = take_until(1.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;

        let (i, auth_response, db) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
                let (i, auth_response) = take_until(0.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;

                let (i, db) = take_until(0.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;

                (i, auth_response, Some(db))
            } else {
                (&b""[..], i, None)
            };

        Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: 0,
                username: Some(username.to_vec()),
                auth_response: auth_response.to_vec(),
                auth_plugin: vec![],
                database: db.map(|c| c.to_vec()),
                connect_attributes: None,
            },
        ))
    }
}

fn send_long_data(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, Command<'_>> {
    let (remaining, stmt) = le_u32.parse_peek(i)?;
    let (remaining, param) = le_u16.parse_peek(remaining)?;
    let data = *remaining;
    Ok((remaining, Command::SendLongData { stmt, param, data }))
}

fn execute(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, Command<'_>> {
    let (remaining, stmt) = le_u32.parse_peek(i)?;
    let (remaining, _flags) = take(1u8).parse_peek(remaining)?;
    let (remaining, _iterations) = le_u32.parse_peek(remaining)?;
    let params = *remaining;
    Ok((remaining, Command::Execute { stmt, params }))
}

pub fn from_packet(pkt: &[u8]) -> IResult<Partial<&[u8]>, Command<'_>> {
    alt((
        preceded(literal([ComInfo::ComQuery as u8]), rest).map(Command::Query),
        preceded(literal([ComInfo::ComFieldList as u8]), rest).map(Command::ListFields),
        preceded(literal([ComInfo::ComInitDB as u8]), rest).map(Command::Init),
        preceded(literal([ComInfo::ComStmtPrepare as u8]), rest).map(Command::Prepare),
        preceded(
            literal([ComInfo::ComStmtExecute as u8]),
            winnow::unpeek(execute),
        ),
        preceded(
            literal([ComInfo::ComStmtSendLongData as u8]),
            winnow::unpeek(send_long_data),
        ),
        preceded(literal([ComInfo::ComStmtClose as u8]), le_u32).map(Command::Close),
        preceded(literal([ComInfo::ComChangeUser as u8]), rest).map(Command::ChangeUser),
        preceded(literal([ComInfo::ComSetOption as u8]), le_u16).map(Command::SetOption),
        literal([ComInfo::ComResetConnection as u8]).map(|_| Command::ResetConnection),
        literal([ComInfo::ComStatistics as u8]).map(|_| Command::Statistics),
        literal([ComInfo::ComQuit as u8]).map(|_| Command::Quit),
        literal([ComInfo::ComPing as u8]).map(|_| Command::Ping),
    ))
    .parse_peek(Partial::new(pkt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mariadb::charset::collation_names;
    use crate::protocol::mariadb::packet::packet_reader::PacketReader;

    #[tokio::test]
    pub async fn test_handshake_parse() {
        let bytes = &[
            0x5b, 0x00, 0x00, 0x01, 0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c,
            0x74, 0x00, 0x14, 0xf7, 0xd1, 0x6c, 0xe9, 0x0d, 0x2f, 0x34, 0xb0, 0x2f, 0xd8, 0x1d,
            0x18, 0xc7, 0xa4, 0xe8, 0x98, 0x97, 0x67, 0xeb, 0xad, 0x64, 0x65, 0x66, 0x61, 0x75,
            0x6c, 0x74, 0x00, 0x6d, 0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61, 0x74, 0x69, 0x76,
            0x65, 0x5f, 0x70, 0x61, 0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
        ];
        let mut packet_reader = PacketReader::new(&bytes[..]);
        let (_, packet) = packet_reader.next_async().await.unwrap().unwrap();

        let handshake_rs = client_handshake_response(&packet, false);
        assert!(handshake_rs.is_ok());
        let handshake = handshake_rs.unwrap().1;
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_RESULTS));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert_eq!(
            handshake.collation,
            *collation_names().get("utf8_general_ci").unwrap() as u16
        );
        assert_eq!(handshake.username.unwrap(), &b"default"[..]);
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[tokio::test]
    pub async fn test_handshake_parse_with_ssl() {
        let binary = &[
            0x25, 0x00, 0x00, 0x01, 0x85, 0xae, 0x3f, 0x20, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x6a, 0x6f, 0x6e, 0x00, 0x00, 0x05,
        ];
        let mut packet_reader = PacketReader::new(&binary[..]);
        let (_, packet) = packet_reader.next_async().await.unwrap().unwrap();
        let (_, handshake) = client_handshake_response(&packet, true).unwrap();
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(!handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake.client_flag.contains(CapabilityFlags::CLIENT_SSL));
        assert_eq!(handshake.username.unwrap(), &b"jon"[..]);
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[test]
    fn test_lenenc_number_boundaries() {
        // value widths: 1, 2, 3, 8 bytes
        assert_eq!(read_length_encoded_number(&[0xfa]).unwrap().1, 0xfa);
        assert_eq!(
            read_length_encoded_number(&[0xfc, 0xfb, 0x00]).unwrap().1,
            0xfb
        );
        assert_eq!(
            read_length_encoded_number(&[0xfd, 0x01, 0x00, 0x01]).unwrap().1,
            0x010001
        );
        assert_eq!(
            read_length_encoded_number(&[0xfe, 1, 0, 0, 0, 0, 0, 0, 0x80])
                .unwrap()
                .1,
            0x8000_0000_0000_0001
        );
    }

    #[test]
    fn test_lenenc_null_marker() {
        let (_, v) = read_length_encoded_opt(&[0xfb]).unwrap();
        assert_eq!(v, None);
        let (_, v) = read_length_encoded_opt(&[0x2a]).unwrap();
        assert_eq!(v, Some(42));
    }

    #[test]
    fn test_err_packet_view() {
        let mut body = vec![0xff, 0x15, 0x04, b'#'];
        body.extend(b"28000");
        body.extend(b"Access denied");
        let (_, err) = err_packet_view(&body).unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sqlstate.unwrap(), b"28000");
        assert_eq!(err.message, b"Access denied");
    }

    #[test]
    fn test_server_handshake_parse() {
        let mut body = vec![10u8];
        body.extend(b"11.1.2-MariaDB\0");
        body.extend(17u32.to_le_bytes()); // thread id
        body.extend(b"abcdefgh"); // scramble part 1
        body.push(0);
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        let bits = caps.bits().to_le_bytes();
        body.extend(&bits[..2]);
        body.push(33); // collation
        body.extend(2u16.to_le_bytes()); // status: autocommit
        body.extend(&bits[2..4]);
        body.push(21); // scramble len
        body.extend([0u8; 10]);
        body.extend(b"ijklmnopqrst\0"); // part 2 (12 + NUL = 13)
        body.extend(b"mysql_native_password\0");

        let (_, hs) = server_handshake(&body).unwrap();
        assert_eq!(hs.protocol_version, 10);
        assert_eq!(hs.thread_id, 17);
        assert_eq!(hs.scramble, b"abcdefghijklmnopqrst");
        assert_eq!(hs.auth_plugin, b"mysql_native_password");
        assert!(hs.capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH));
    }

    #[test]
    fn test_command_decode() {
        let (_, cmd) = from_packet(&[0x03, b'S', b'E', b'L']).unwrap();
        assert_eq!(cmd, Command::Query(b"SEL"));
        let (_, cmd) = from_packet(&[0x1f]).unwrap();
        assert_eq!(cmd, Command::ResetConnection);
        let mut exec = vec![0x17];
        exec.extend(41u32.to_le_bytes());
        exec.push(0);
        exec.extend(1u32.to_le_bytes());
        let (_, cmd) = from_packet(&exec).unwrap();
        assert_eq!(
            cmd,
            Command::Execute {
                stmt: 41,
                params: &[]
            }
        );
    }
}

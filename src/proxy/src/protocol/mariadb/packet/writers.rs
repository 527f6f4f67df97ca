use crate::protocol::mariadb::basic::OkPacket;
use crate::protocol::mariadb::charset::DEFAULT_COLLATION_ID;
use crate::protocol::mariadb::constants::AuthPluginName::AuthNativePassword;
use crate::protocol::mariadb::constants::{CommandCode, AUTH_PLUGIN_DATA_PART_1_LENGTH};
use crate::protocol::mariadb::error_codes::ErrorKind;
use crate::protocol::mariadb::packet::packet_writer::PacketWriter;

use crate::server::default_capabilities;
use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::WriteMysqlExt;
use std::io::{self, Write};
use std::net::SocketAddr;
use tokio::io::AsyncWrite;

pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await
}

pub async fn write_eof_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_all(&[0xfe, 0x00, 0x00])?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.end_packet().await
}

pub async fn write_ok_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    rows: u64,
    last_insert_id: u64,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_u8(0x00)?; // OK packet type
    w.write_lenenc_int(rows)?;
    w.write_lenenc_int(last_insert_id)?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.write_all(&[0x00, 0x00])?; // no warnings
    w.end_packet().await
}

pub async fn write_ok_packet_with_client_flags<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    client_capabilities: CapabilityFlags,
    ok_packet: OkPacket,
) -> io::Result<()> {
    w.write_u8(ok_packet.header)?;
    w.write_lenenc_int(ok_packet.affected_rows)?;
    w.write_lenenc_int(ok_packet.last_insert_id)?;
    if client_capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        w.write_u16::<LittleEndian>(ok_packet.status_flags.bits())?;
        w.write_all(&[0x00, 0x00])?; // no warnings
    } else if client_capabilities.contains(CapabilityFlags::CLIENT_TRANSACTIONS) {
        w.write_u16::<LittleEndian>(ok_packet.status_flags.bits())?;
    }

    if client_capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
        w.write_lenenc_str(ok_packet.info.as_bytes())?;
        if ok_packet
            .status_flags
            .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED)
        {
            w.write_lenenc_str(ok_packet.session_state_info.as_bytes())?;
        }
    } else {
        w.write_all(ok_packet.info.as_bytes())?;
    }
    w.end_packet().await
}

/// Server greeting: initial handshake v10 with the scramble split across
/// auth-plugin-data part 1 and part 2.
pub async fn write_initial_handshake<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    conn_id: u64,
    scramble: [u8; 20],
    server_version: &[u8],
    with_ssl: bool,
) -> io::Result<()> {
    writer.write_all(&[10])?; // protocol 10

    writer.write_all(server_version)?;
    writer.write_all(&[0x00])?;
    // connection_id (4 bytes)
    let conn_id_bytes = &[
        conn_id as u8,
        (conn_id >> 8) as u8,
        (conn_id >> 16) as u8,
        (conn_id >> 24) as u8,
    ];
    writer.write_all(conn_id_bytes)?;
    let mut server_capabilities = default_capabilities();
    if with_ssl {
        server_capabilities |= CapabilityFlags::CLIENT_SSL;
    }
    let server_capabilities_vec = server_capabilities.bits().to_le_bytes();

    writer.write_all(&scramble[0..AUTH_PLUGIN_DATA_PART_1_LENGTH])?; // auth-plugin-data-part-1
    writer.write_all(&[0x00])?;

    writer.write_all(&server_capabilities_vec[..2])?; // lower 2 bytes of the capability flags

    writer.write_all(&DEFAULT_COLLATION_ID.to_le_bytes())?;
    writer.write_all(&StatusFlags::SERVER_STATUS_AUTOCOMMIT.bits().to_le_bytes())?;
    writer.write_all(&server_capabilities_vec[2..4])?; // upper 2 bytes of the capability flags

    writer.write_all(&((scramble.len() + 1) as u8).to_le_bytes())?;

    writer.write_all(&[0x00; 10][..])?; // 10 bytes filler
                                        // Part2 of the auth_plugin_data
    writer.write_all(&scramble[AUTH_PLUGIN_DATA_PART_1_LENGTH..])?; // 12 bytes
    writer.write_all(&[0x00])?;

    writer.write_all(AuthNativePassword.as_ref().as_bytes())?;
    writer.write_all(&[0x00])?;
    writer.end_packet().await?;
    writer.flush_all().await
}

/// SSLRequest: the short HandshakeResponse41 prefix with CLIENT_SSL set and
/// no user payload. Sent to a backend before the TLS handshake starts.
pub async fn write_ssl_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    capabilities: CapabilityFlags,
    max_packet_len: u32,
    collation: u8,
) -> io::Result<()> {
    let caps = capabilities | CapabilityFlags::CLIENT_SSL;
    w.write_u32::<LittleEndian>(caps.bits())?;
    w.write_u32::<LittleEndian>(max_packet_len)?;
    w.write_u8(collation)?;
    w.write_all(&[0u8; 23])?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_query_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    data: &[u8],
) -> io::Result<()> {
    w.write_u8(CommandCode::ComQuery as u8)?;
    w.write_all(data)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_init_db<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    database: &[u8],
) -> io::Result<()> {
    w.write_u8(CommandCode::ComInitDB as u8)?;
    w.write_all(database)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_ping<W: AsyncWrite + Unpin>(w: &mut PacketWriter<W>) -> io::Result<()> {
    w.write_u8(CommandCode::ComPing as u8)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_reset_connection<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(CommandCode::ComResetConnection as u8)?;
    w.end_packet().await?;
    w.flush_all().await
}

/// COM_CHANGE_USER with the scramble response already computed. The trailing
/// charset and plugin name follow the documented more-data layout.
pub async fn write_change_user<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    user: &[u8],
    auth_response: &[u8],
    database: Option<&[u8]>,
    collation: u16,
    auth_plugin: &[u8],
) -> io::Result<()> {
    w.write_u8(CommandCode::ComChangeUser as u8)?;
    w.write_all(user)?;
    w.write_u8(0x00)?;
    w.write_u8(auth_response.len() as u8)?;
    w.write_all(auth_response)?;
    if let Some(db) = database {
        w.write_all(db)?;
    }
    w.write_u8(0x00)?;
    w.write_u16::<LittleEndian>(collation)?;
    w.write_all(auth_plugin)?;
    w.write_u8(0x00)?;
    w.end_packet().await?;
    w.flush_all().await
}

/// Proxy-protocol v1: single text line before any MariaDB byte.
pub fn proxy_protocol_v1(client: &SocketAddr, server: &SocketAddr) -> Vec<u8> {
    let family = if client.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        client.ip(),
        server.ip(),
        client.port(),
        server.port()
    )
    .into_bytes()
}

/// Proxy-protocol v2: 12-byte signature, version/command, family, length,
/// then source/destination addresses.
pub fn proxy_protocol_v2(client: &SocketAddr, server: &SocketAddr) -> Vec<u8> {
    const SIG: [u8; 12] = [
        0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
    ];
    let mut out = Vec::with_capacity(16 + 36);
    out.extend_from_slice(&SIG);
    out.push(0x21); // version 2, PROXY command
    match (client, server) {
        (SocketAddr::V4(c), SocketAddr::V4(s)) => {
            out.push(0x11); // AF_INET, STREAM
            out.extend_from_slice(&12u16.to_be_bytes());
            out.extend_from_slice(&c.ip().octets());
            out.extend_from_slice(&s.ip().octets());
            out.extend_from_slice(&c.port().to_be_bytes());
            out.extend_from_slice(&s.port().to_be_bytes());
        }
        (SocketAddr::V6(c), SocketAddr::V6(s)) => {
            out.push(0x21); // AF_INET6, STREAM
            out.extend_from_slice(&36u16.to_be_bytes());
            out.extend_from_slice(&c.ip().octets());
            out.extend_from_slice(&s.ip().octets());
            out.extend_from_slice(&c.port().to_be_bytes());
            out.extend_from_slice(&s.port().to_be_bytes());
        }
        _ => {
            out.push(0x00); // UNSPEC on mixed families
            out.extend_from_slice(&0u16.to_be_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mariadb::basic::{err_packet_view, ok_packet};
    use crate::protocol::mariadb::packet::packet;

    #[tokio::test]
    async fn ok_packet_round_trip() {
        let mut w = PacketWriter::new(Vec::new());
        write_ok_packet(&mut w, 3, 7, StatusFlags::SERVER_STATUS_AUTOCOMMIT)
            .await
            .unwrap();
        let (_, (_, pkt)) = packet(&w.inner_writer).unwrap();
        let (_, ok) = ok_packet(&pkt, default_capabilities()).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 7);
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
    }

    #[tokio::test]
    async fn err_packet_round_trip() {
        let mut w = PacketWriter::new(Vec::new());
        write_err_packet(ErrorKind::ER_ACCESS_DENIED_ERROR, b"denied", &mut w)
            .await
            .unwrap();
        let (_, (_, pkt)) = packet(&w.inner_writer).unwrap();
        assert!(pkt.is_err_packet());
        let (_, err) = err_packet_view(&pkt).unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.message, b"denied");
    }

    #[test]
    fn proxy_v1_header_text() {
        let c: SocketAddr = "10.0.0.1:5501".parse().unwrap();
        let s: SocketAddr = "10.0.0.2:3306".parse().unwrap();
        assert_eq!(
            proxy_protocol_v1(&c, &s),
            b"PROXY TCP4 10.0.0.1 10.0.0.2 5501 3306\r\n".to_vec()
        );
    }

    #[test]
    fn proxy_v2_header_layout() {
        let c: SocketAddr = "10.0.0.1:5501".parse().unwrap();
        let s: SocketAddr = "10.0.0.2:3306".parse().unwrap();
        let hdr = proxy_protocol_v2(&c, &s);
        assert_eq!(hdr.len(), 16 + 12);
        assert_eq!(hdr[12], 0x21);
        assert_eq!(hdr[13], 0x11);
        assert_eq!(&hdr[16..20], &[10, 0, 0, 1]);
    }
}

use crate::async_packet_read;
use crate::backend::reply::{ReplyStatus, ReplyTracker};
use crate::config::ProxyProtocol;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol::mariadb::basic::{err_packet_view, server_handshake, ServerHandshake};
use crate::protocol::mariadb::constants::CommandCode;
use crate::protocol::mariadb::packet::packet_reader::PacketReader;
use crate::protocol::mariadb::packet::packet_writer::PacketWriter;
use crate::protocol::mariadb::packet::{writers, Packet};
use crate::server::auth::{BackendAuthPlugin, BackendExchange};
use crate::session::history::{ReplyDigest, SubscriberId};
use crate::session::History;

use hashbrown::HashMap;
use mysql_common::constants::CapabilityFlags;
use num_traits::FromPrimitive;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Backend socket, plain TCP or upgraded to TLS in the START_SSL state.
pub enum BackendStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    SendProxyHdr,
    ExpectHs,
    StartSsl,
    SslNeg,
    SendHsResp,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Handshaking(HandshakeState),
    Authenticating,
    ConnectionInit,
    SendDelayq,
    Routing,
    SendChangeUser,
    ReadChangeUser,
    ResetConnection,
    ResetConnectionFast,
    Pinging,
    Pooled,
    SendHistory,
    ReadHistory,
    PreparePs,
    Failed,
}

/// Prepared-statement translation entry on one backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsEntry {
    /// The id the backend assigned; used on the wire towards the server.
    pub real_id: u32,
    pub n_params: u16,
    pub exec_metadata_sent: bool,
}

/// Bidirectional O(1) mapping between proxy-assigned statement ids (stable
/// towards the client) and the backend's real ids.
#[derive(Debug, Default)]
pub struct PsMap {
    to_backend: HashMap<u32, PsEntry>,
    to_client: HashMap<u32, u32>,
}

impl PsMap {
    pub fn insert(&mut self, client_id: u32, real_id: u32, n_params: u16) {
        self.to_backend.insert(
            client_id,
            PsEntry {
                real_id,
                n_params,
                exec_metadata_sent: false,
            },
        );
        self.to_client.insert(real_id, client_id);
    }

    pub fn entry(&self, client_id: u32) -> Option<&PsEntry> {
        self.to_backend.get(&client_id)
    }

    pub fn entry_mut(&mut self, client_id: u32) -> Option<&mut PsEntry> {
        self.to_backend.get_mut(&client_id)
    }

    pub fn client_id_for(&self, real_id: u32) -> Option<u32> {
        self.to_client.get(&real_id).copied()
    }

    pub fn remove(&mut self, client_id: u32) -> Option<PsEntry> {
        let entry = self.to_backend.remove(&client_id)?;
        self.to_client.remove(&entry.real_id);
        Some(entry)
    }

    pub fn clear(&mut self) {
        self.to_backend.clear();
        self.to_client.clear();
    }

    /// Rewrite the statement id of an outgoing COM_STMT_* packet in place.
    /// Returns false when the client id is unknown on this backend.
    pub fn rewrite_to_backend(&self, pkt: &mut Packet) -> bool {
        let bytes = pkt.as_mut();
        if bytes.len() < 5 {
            return false;
        }
        let client_id = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        match self.to_backend.get(&client_id) {
            Some(entry) => {
                bytes[1..5].copy_from_slice(&entry.real_id.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

/// Everything needed to open and authenticate one backend connection.
pub struct BackendConnectOptions {
    pub server_name: String,
    pub endpoint: String,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub capabilities: CapabilityFlags,
    pub collation: u16,
    pub proxy_protocol: Option<ProxyProtocol>,
    /// Client address to present in the proxy-protocol header.
    pub client_addr: Option<SocketAddr>,
    pub init_queries: Vec<String>,
    #[cfg(feature = "tls")]
    pub tls: Option<(tokio_rustls::TlsConnector, String)>,
}

/// One backend connection and its protocol state machine. Owned by a
/// session (bound) or by the worker's pool (parked), never both.
pub struct BackendConn {
    pub server_name: String,
    state: BackendState,
    pub thread_id: u32,
    pub server_capabilities: CapabilityFlags,
    pub server_version: Vec<u8>,
    reader: PacketReader<ReadHalf<BackendStream>>,
    writer: PacketWriter<WriteHalf<BackendStream>>,
    pub ps_map: PsMap,
    delayq: VecDeque<Packet>,
    /// Subscription into the owning session's history.
    pub subscriber: Option<SubscriberId>,
    /// Account and default database last authenticated on this connection.
    pub account: String,
    pub database: Option<String>,
}

impl BackendConn {
    fn set_state(&mut self, next: BackendState) {
        debug!(
            server = %self.server_name,
            "backend state {:?} -> {next:?}", self.state
        );
        self.state = next;
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn is_routing(&self) -> bool {
        self.state == BackendState::Routing
    }

    /// Full connect sequence: proxy header, greeting, optional TLS,
    /// handshake response, authentication rounds, connection-init queries.
    pub async fn connect(
        opts: &BackendConnectOptions,
        auth: &mut dyn BackendAuthPlugin,
    ) -> ProxyResult<Self> {
        let backend_io = |source: io::Error| ProxyError::BackendIo {
            server: opts.server_name.clone(),
            source,
        };
        let mut stream = TcpStream::connect(&opts.endpoint).await.map_err(backend_io)?;
        stream.set_nodelay(true).map_err(backend_io)?;

        // SEND_PROXY_HDR: the header goes out before any MariaDB byte
        if let Some(version) = opts.proxy_protocol {
            let client = opts
                .client_addr
                .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
            let server = stream.peer_addr().map_err(backend_io)?;
            let header = match version {
                ProxyProtocol::V1 => writers::proxy_protocol_v1(&client, &server),
                ProxyProtocol::V2 => writers::proxy_protocol_v2(&client, &server),
            };
            stream.write_all(&header).await.map_err(backend_io)?;
        }

        // EXPECT_HS: read the greeting, learn capabilities and thread id
        let mut greeting_reader = PacketReader::new(&mut stream);
        let (greeting_seq, greeting) = greeting_reader
            .next_async()
            .await
            .map_err(backend_io)?
            .ok_or_else(|| {
                backend_io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "backend closed before greeting",
                ))
            })?;
        if greeting.is_err_packet() {
            let msg = err_packet_view(&greeting)
                .map(|(_, e)| String::from_utf8_lossy(e.message).to_string())
                .unwrap_or_else(|_| "backend refused connection".to_string());
            return Err(backend_io(io::Error::new(io::ErrorKind::ConnectionRefused, msg)));
        }
        let (_, hs) = server_handshake(&greeting).map_err(|_| {
            ProxyError::ProtocolViolation("malformed backend greeting".to_string())
        })?;

        let response_caps = Self::negotiate_capabilities(&hs, opts);

        // START_SSL / SSL_NEG
        #[cfg(feature = "tls")]
        let stream = if let Some((connector, domain)) = &opts.tls {
            if !hs.capabilities.contains(CapabilityFlags::CLIENT_SSL) {
                return Err(ProxyError::ProtocolViolation(format!(
                    "server {} does not support TLS",
                    opts.server_name
                )));
            }
            let mut ssl_writer = PacketWriter::new(&mut stream);
            ssl_writer.set_seq(greeting_seq.wrapping_add(1));
            writers::write_ssl_request(
                &mut ssl_writer,
                response_caps,
                16 * 1024 * 1024,
                opts.collation as u8,
            )
            .await
            .map_err(backend_io)?;
            let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(domain.clone())
                .map_err(|e| ProxyError::ProtocolViolation(format!("bad TLS name: {e}")))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(backend_io)?;
            BackendStream::Tls(Box::new(tls))
        } else {
            BackendStream::Plain(stream)
        };
        #[cfg(not(feature = "tls"))]
        let stream = BackendStream::Plain(stream);

        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn = Self {
            server_name: opts.server_name.clone(),
            state: BackendState::Handshaking(HandshakeState::SendHsResp),
            thread_id: hs.thread_id,
            server_capabilities: hs.capabilities,
            server_version: hs.server_version.clone(),
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
            ps_map: PsMap::default(),
            delayq: VecDeque::new(),
            subscriber: None,
            account: opts.user.clone(),
            database: opts.database.clone(),
        };

        // SEND_HS_RESP
        #[cfg(feature = "tls")]
        let resp_seq = if opts.tls.is_some() {
            greeting_seq.wrapping_add(2)
        } else {
            greeting_seq.wrapping_add(1)
        };
        #[cfg(not(feature = "tls"))]
        let resp_seq = greeting_seq.wrapping_add(1);
        conn.send_handshake_response(resp_seq, response_caps, &hs, opts, auth)
            .await?;

        conn.set_state(BackendState::Authenticating);
        conn.authenticate(auth).await?;

        conn.set_state(BackendState::ConnectionInit);
        conn.run_init_queries(&opts.init_queries).await?;

        conn.set_state(BackendState::Routing);
        Ok(conn)
    }

    fn negotiate_capabilities(
        hs: &ServerHandshake,
        opts: &BackendConnectOptions,
    ) -> CapabilityFlags {
        let mut caps = opts.capabilities
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        if opts.database.is_some() {
            caps |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        } else {
            caps.remove(CapabilityFlags::CLIENT_CONNECT_WITH_DB);
        }
        caps & (hs.capabilities
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB)
    }

    async fn send_handshake_response(
        &mut self,
        seq: u8,
        caps: CapabilityFlags,
        hs: &ServerHandshake,
        opts: &BackendConnectOptions,
        auth: &mut dyn BackendAuthPlugin,
    ) -> ProxyResult<()> {
        let token = match auth.exchange(&hs.scramble) {
            BackendExchange::Send(token) => token,
            BackendExchange::Fail => {
                self.set_state(BackendState::Failed);
                return Err(ProxyError::AuthFailure {
                    user: opts.user.clone(),
                });
            }
        };
        let w = &mut self.writer;
        w.set_seq(seq);
        w.write_all(&caps.bits().to_le_bytes())?;
        w.write_all(&(16u32 * 1024 * 1024).to_le_bytes())?;
        w.write_all(&[opts.collation.min(255) as u8])?;
        w.write_all(&[0u8; 23])?;
        w.write_all(opts.user.as_bytes())?;
        w.write_all(&[0x00])?;
        w.write_all(&[token.len() as u8])?;
        w.write_all(&token)?;
        if let Some(db) = &opts.database {
            w.write_all(db.as_bytes())?;
            w.write_all(&[0x00])?;
        }
        w.write_all(auth.name().as_bytes())?;
        w.write_all(&[0x00])?;
        w.end_packet().await?;
        w.flush_all().await?;
        Ok(())
    }

    /// AUTHENTICATING: iterate the plugin until OK or ERR; handles the
    /// AuthSwitchRequest round-trips.
    async fn authenticate(&mut self, auth: &mut dyn BackendAuthPlugin) -> ProxyResult<()> {
        loop {
            let (seq, pkt) = async_packet_read!(&mut self.reader);
            if pkt.is_ok_packet() {
                return Ok(());
            }
            if pkt.is_err_packet() {
                let message = err_packet_view(&pkt)
                    .map(|(_, e)| String::from_utf8_lossy(e.message).to_string())
                    .unwrap_or_default();
                warn!(server = %self.server_name, "backend auth failed: {message}");
                self.set_state(BackendState::Failed);
                return Err(ProxyError::AuthFailure {
                    user: self.account.clone(),
                });
            }
            match auth.exchange(&pkt) {
                BackendExchange::Send(token) => {
                    self.writer.set_seq(seq.wrapping_add(1));
                    self.writer.write_all(&token)?;
                    self.writer.end_packet().await?;
                    self.writer.flush_all().await?;
                }
                BackendExchange::Fail => {
                    self.set_state(BackendState::Failed);
                    return Err(ProxyError::AuthFailure {
                        user: self.account.clone(),
                    });
                }
            }
        }
    }

    /// CONNECTION_INIT: run the configured initialisation queries, counting
    /// OK packets.
    async fn run_init_queries(&mut self, queries: &[String]) -> ProxyResult<()> {
        for q in queries {
            self.writer.reset_seq();
            writers::write_query_request(&mut self.writer, q.as_bytes()).await?;
            let mut tracker = ReplyTracker::new(CommandCode::ComQuery, self.server_capabilities);
            loop {
                let (_, pkt) = async_packet_read!(&mut self.reader);
                match tracker.observe(&pkt) {
                    ReplyStatus::Complete { ok: true } => break,
                    ReplyStatus::Complete { ok: false } => {
                        let message = err_packet_view(&pkt)
                            .map(|(_, e)| String::from_utf8_lossy(e.message).to_string())
                            .unwrap_or_default();
                        self.set_state(BackendState::Failed);
                        return Err(ProxyError::ProtocolViolation(format!(
                            "connection init query failed: {message}"
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Queue a packet routed while the connection was still handshaking.
    pub fn queue_delayed(&mut self, pkt: Packet) {
        self.delayq.push_back(pkt);
    }

    /// SEND_DELAYQ: flush packets the router queued during handshake.
    pub async fn send_delayed(&mut self) -> io::Result<()> {
        if self.delayq.is_empty() {
            return Ok(());
        }
        self.set_state(BackendState::SendDelayq);
        while let Some(pkt) = self.delayq.pop_front() {
            self.writer.reset_seq();
            self.writer.write_all(&pkt)?;
            self.writer.end_packet().await?;
        }
        self.writer.flush_all().await?;
        self.set_state(BackendState::Routing);
        Ok(())
    }

    /// Forward one client command packet. Statement-carrying commands get
    /// their id rewritten to the backend's real id in place.
    pub async fn forward_command(
        &mut self,
        com: CommandCode,
        mut pkt: Packet,
    ) -> ProxyResult<()> {
        if com.carries_stmt_id() {
            let client_id = pkt
                .get(1..5)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
            if !self.ps_map.rewrite_to_backend(&mut pkt) {
                return Err(ProxyError::ProtocolViolation(format!(
                    "unknown statement id on {}",
                    self.server_name
                )));
            }
            if com == CommandCode::ComStmtExecute {
                if let Some(entry) = client_id.and_then(|id| self.ps_map.entry_mut(id)) {
                    entry.exec_metadata_sent = true;
                }
            }
        }
        self.writer.reset_seq();
        self.writer.write_all(&pkt)?;
        self.writer.end_packet().await?;
        self.writer.flush_all().await?;
        Ok(())
    }

    pub async fn read_packet(&mut self) -> io::Result<(u8, Packet)> {
        let pkt = async_packet_read!(&mut self.reader);
        Ok(pkt)
    }

    /// Relay a packet verbatim with the caller's sequence number (local
    /// infile file chunks keep the client's numbering).
    pub async fn forward_raw(&mut self, seq: u8, payload: &[u8]) -> io::Result<()> {
        self.writer.set_seq(seq);
        self.writer.write_all(payload)?;
        self.writer.end_packet().await?;
        self.writer.flush_all().await
    }

    /// PINGING: liveness probe while parked.
    pub async fn ping(&mut self) -> ProxyResult<bool> {
        self.set_state(BackendState::Pinging);
        self.writer.reset_seq();
        writers::write_ping(&mut self.writer).await?;
        let (_, pkt) = async_packet_read!(&mut self.reader);
        self.set_state(BackendState::Pooled);
        Ok(pkt.is_ok_packet())
    }

    pub fn set_pooled(&mut self) {
        self.subscriber = None;
        self.set_state(BackendState::Pooled);
    }

    /// Whether COM_RESET_CONNECTION is available on this backend.
    pub fn supports_reset_connection(&self) -> bool {
        match parse_version(&self.server_version) {
            Some(v) => v >= (5, 7, 3),
            None => false,
        }
    }

    /// Reuse a parked connection for (possibly) another account: the fast
    /// COM_RESET_CONNECTION path when the backend supports it, otherwise a
    /// full COM_CHANGE_USER re-authentication. History replay follows
    /// before the connection re-enters ROUTING.
    pub async fn reuse(
        &mut self,
        user: &str,
        database: Option<&str>,
        collation: u16,
        auth: &mut dyn BackendAuthPlugin,
    ) -> ProxyResult<()> {
        let same_account = self.account == user && self.database.as_deref() == database;
        if same_account && self.supports_reset_connection() {
            self.set_state(BackendState::ResetConnectionFast);
            self.writer.reset_seq();
            writers::write_reset_connection(&mut self.writer).await?;
            let (_, pkt) = async_packet_read!(&mut self.reader);
            if !pkt.is_ok_packet() {
                self.set_state(BackendState::Failed);
                return Err(ProxyError::ProtocolViolation(
                    "reset connection rejected".to_string(),
                ));
            }
        } else {
            self.set_state(BackendState::SendChangeUser);
            self.writer.reset_seq();
            writers::write_change_user(
                &mut self.writer,
                user.as_bytes(),
                &[],
                database.map(|d| d.as_bytes()),
                collation,
                auth.name().as_bytes(),
            )
            .await?;
            self.set_state(BackendState::ReadChangeUser);
            self.authenticate(auth).await?;
            self.account = user.to_string();
            self.database = database.map(|d| d.to_string());
        }
        // server-side statements are gone either way
        self.ps_map.clear();
        self.set_state(BackendState::Routing);
        Ok(())
    }

    /// SEND_HISTORY / READ_HISTORY: catch this connection up to the session
    /// state by replaying every pending entry and checking reply digests.
    /// `map_prepare` resolves a replayed COM_STMT_PREPARE back to the
    /// proxy-assigned id so the translation map can be rebuilt.
    pub async fn replay_history(
        &mut self,
        history: &mut History,
        session_caps: CapabilityFlags,
        mut map_prepare: impl FnMut(&[u8]) -> Option<u32>,
    ) -> ProxyResult<()> {
        let sub = match self.subscriber {
            Some(sub) => sub,
            None => {
                let sub = history.subscribe(false);
                self.subscriber = Some(sub);
                sub
            }
        };
        loop {
            let entry = match history.pending(sub) {
                Some(e) => (e.id, e.command.clone()),
                None => break,
            };
            let (id, command) = entry;
            self.set_state(BackendState::SendHistory);
            let com = command
                .first()
                .and_then(|b| CommandCode::from_u8(*b))
                .unwrap_or(CommandCode::ComQuery);
            if com == CommandCode::ComStmtPrepare {
                self.set_state(BackendState::PreparePs);
            }
            self.writer.reset_seq();
            self.writer.write_all(&command)?;
            self.writer.end_packet().await?;
            self.writer.flush_all().await?;

            self.set_state(BackendState::ReadHistory);
            let mut tracker = ReplyTracker::new(com, session_caps);
            let mut digest = ReplyDigest::default();
            let mut ok = true;
            if !com.is_fire_and_forget() {
                loop {
                    let (_, pkt) = async_packet_read!(&mut self.reader);
                    digest_replay_packet(&mut digest, com, &pkt);
                    match tracker.observe(&pkt) {
                        ReplyStatus::Complete { ok: completed_ok } => {
                            ok = completed_ok;
                            break;
                        }
                        _ => continue,
                    }
                }
            }
            if let (Some(prepare_ok), true) = (tracker.prepare_ok, ok) {
                if let Some(client_id) = map_prepare(&command[1..]) {
                    self.ps_map
                        .insert(client_id, prepare_ok.statement_id, prepare_ok.params);
                }
            }
            if let Err(mismatch) = history.confirm_replay(sub, id, digest.finish()) {
                warn!(
                    server = %self.server_name,
                    "history replay mismatch at command {}", mismatch.command_id
                );
                self.set_state(BackendState::Failed);
                return Err(ProxyError::HistoryMismatch {
                    server: self.server_name.clone(),
                    command_id: mismatch.command_id,
                });
            }
        }
        self.set_state(BackendState::Routing);
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Digest one replay reply packet with server-identity fields excluded: the
/// statement id of a prepare response differs per connection by design.
pub fn digest_replay_packet(digest: &mut ReplyDigest, com: CommandCode, pkt: &Packet) {
    if com == CommandCode::ComStmtPrepare && pkt.is_ok_packet() {
        let mut normalized = pkt.clone();
        crate::backend::reply::rewrite_prepare_ok_id(&mut normalized, 0);
        digest.update(&normalized);
    } else {
        digest.update(pkt);
    }
}

/// Parse the numeric prefix of a server version string such as
/// `11.1.2-MariaDB-1:11.1.2+maria~ubu2204`.
pub fn parse_version(version: &[u8]) -> Option<(u32, u32, u32)> {
    let text = std::str::from_utf8(version).ok()?;
    // strip the MariaDB replication-hack prefix "5.5.5-"
    let text = text.strip_prefix("5.5.5-").unwrap_or(text);
    let mut parts = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_map_is_bidirectional() {
        let mut map = PsMap::default();
        map.insert(1, 17, 2);
        map.insert(2, 41, 0);
        assert_eq!(map.entry(1).unwrap().real_id, 17);
        assert_eq!(map.entry(2).unwrap().real_id, 41);
        assert_eq!(map.client_id_for(41), Some(2));
        assert_eq!(map.client_id_for(17), Some(1));
        map.remove(1);
        assert!(map.entry(1).is_none());
        assert_eq!(map.client_id_for(17), None);
    }

    #[test]
    fn execute_id_rewrite_in_place() {
        let mut map = PsMap::default();
        map.insert(2, 41, 0);
        // COM_STMT_EXECUTE with client id 2
        let mut pkt = vec![CommandCode::ComStmtExecute as u8];
        pkt.extend(2u32.to_le_bytes());
        pkt.push(0);
        pkt.extend(1u32.to_le_bytes());
        let mut pkt = Packet::from_vec(pkt);
        assert!(map.rewrite_to_backend(&mut pkt));
        let forwarded_id = u32::from_le_bytes([pkt[1], pkt[2], pkt[3], pkt[4]]);
        assert_eq!(forwarded_id, 41);
    }

    #[test]
    fn unknown_stmt_id_is_refused() {
        let map = PsMap::default();
        let mut pkt = vec![CommandCode::ComStmtClose as u8];
        pkt.extend(9u32.to_le_bytes());
        let mut pkt = Packet::from_vec(pkt);
        assert!(!map.rewrite_to_backend(&mut pkt));
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version(b"11.1.2-MariaDB"), Some((11, 1, 2)));
        assert_eq!(parse_version(b"5.5.5-10.6.14-MariaDB-log"), Some((10, 6, 14)));
        assert_eq!(parse_version(b"5.6.51"), Some((5, 6, 51)));
        assert_eq!(parse_version(b"garbage"), None);
    }

    #[test]
    fn reset_support_by_version() {
        assert!((5, 7, 3) <= (10, 6, 14));
        assert!((5, 7, 3) > (5, 6, 51));
    }

    use crate::protocol::mariadb::packet::packet_reader::PacketReader as TestReader;
    use crate::protocol::mariadb::packet::packet_writer::PacketWriter as TestWriter;
    use crate::server::auth::native_password::NativePasswordBackend;
    use crate::server::default_capabilities;
    use crate::session::History;
    use mysql_common::constants::StatusFlags;
    use std::io::Write as _;
    use tokio::net::TcpListener;

    fn greeting_payload(thread_id: u32) -> Vec<u8> {
        let mut body = vec![10u8];
        body.extend(b"11.1.2-MariaDB\0");
        body.extend(thread_id.to_le_bytes());
        body.extend(b"abcdefgh");
        body.push(0);
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_DEPRECATE_EOF;
        let bits = caps.bits().to_le_bytes();
        body.extend(&bits[..2]);
        body.push(33);
        body.extend(2u16.to_le_bytes());
        body.extend(&bits[2..4]);
        body.push(21);
        body.extend([0u8; 10]);
        body.extend(b"ijklmnopqrst\0");
        body.extend(b"mysql_native_password\0");
        body
    }

    /// Minimal scripted backend: greeting, auth OK, then OK (or a prepare
    /// response) to every command until COM_QUIT.
    async fn scripted_backend(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (rh, wh) = stream.into_split();
        let mut reader = TestReader::new(rh);
        let mut writer = TestWriter::new(wh);

        writer.reset_seq();
        writer.write_all(&greeting_payload(17)).unwrap();
        writer.end_packet().await.unwrap();
        writer.flush_all().await.unwrap();

        let (seq, _handshake_response) = reader.next_async().await.unwrap().unwrap();
        writer.set_seq(seq.wrapping_add(1));
        writers::write_ok_packet(&mut writer, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT)
            .await
            .unwrap();
        writer.flush_all().await.unwrap();

        while let Ok(Some((cmd_seq, pkt))) = reader.next_async().await {
            writer.set_seq(cmd_seq.wrapping_add(1));
            match pkt.command() {
                Some(CommandCode::ComQuit) => break,
                Some(CommandCode::ComStmtPrepare) => {
                    let mut head = vec![0x00];
                    head.extend(41u32.to_le_bytes());
                    head.extend(0u16.to_le_bytes());
                    head.extend(0u16.to_le_bytes());
                    head.push(0);
                    head.extend(0u16.to_le_bytes());
                    writer.write_all(&head).unwrap();
                    writer.end_packet().await.unwrap();
                    writer.flush_all().await.unwrap();
                }
                _ => {
                    writers::write_ok_packet(
                        &mut writer,
                        0,
                        0,
                        StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                    )
                    .await
                    .unwrap();
                    writer.flush_all().await.unwrap();
                }
            }
        }
    }

    fn test_options(endpoint: String) -> BackendConnectOptions {
        BackendConnectOptions {
            server_name: "s1".to_string(),
            endpoint,
            user: "app".to_string(),
            password: "secret".to_string(),
            database: None,
            capabilities: default_capabilities(),
            collation: 33,
            proxy_protocol: None,
            client_addr: None,
            init_queries: vec!["SET NAMES utf8".to_string()],
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[tokio::test]
    async fn connect_reuse_and_replay_against_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(scripted_backend(listener));

        let opts = test_options(endpoint);
        let mut auth = NativePasswordBackend::new(opts.password.clone());
        let mut conn = BackendConn::connect(&opts, &mut auth).await.unwrap();
        assert_eq!(conn.state(), BackendState::Routing);
        assert_eq!(conn.thread_id, 17);
        assert!(conn.supports_reset_connection());

        // pooled liveness probe, then the fast reuse path
        assert!(conn.ping().await.unwrap());
        assert_eq!(conn.state(), BackendState::Pooled);
        conn.reuse("app", None, 33, &mut auth).await.unwrap();
        assert_eq!(conn.state(), BackendState::Routing);

        // replay a session write and a prepare; the prepare rebuilds the
        // statement-id translation
        let mut history = History::new(10);
        let mut set_cmd = vec![CommandCode::ComQuery as u8];
        set_cmd.extend(b"SET @a := 1");
        history.append(set_cmd);
        let mut prepare_cmd = vec![CommandCode::ComStmtPrepare as u8];
        prepare_cmd.extend(b"SELECT ?");
        history.append(prepare_cmd);

        conn.replay_history(&mut history, default_capabilities(), |stmt| {
            (stmt == &b"SELECT ?"[..]).then_some(5)
        })
        .await
        .unwrap();
        assert_eq!(conn.state(), BackendState::Routing);
        assert_eq!(conn.ps_map.entry(5).unwrap().real_id, 41);

        // a later execute is rewritten to the backend's id
        let mut exec = vec![CommandCode::ComStmtExecute as u8];
        exec.extend(5u32.to_le_bytes());
        exec.push(0);
        exec.extend(1u32.to_le_bytes());
        conn.forward_command(CommandCode::ComStmtExecute, Packet::from_vec(exec))
            .await
            .unwrap();
        let (_, reply) = conn.read_packet().await.unwrap();
        assert!(reply.is_ok_packet());
        assert!(conn.ps_map.entry(5).unwrap().exec_metadata_sent);

        conn.shutdown().await;
        drop(conn);
        let _ = server.await;
    }

    #[test]
    fn prepare_digest_ignores_statement_id() {
        let mut head_a = vec![0x00];
        head_a.extend(17u32.to_le_bytes());
        head_a.extend([0u8; 7]);
        let mut head_b = vec![0x00];
        head_b.extend(41u32.to_le_bytes());
        head_b.extend([0u8; 7]);

        let mut d1 = ReplyDigest::default();
        digest_replay_packet(&mut d1, CommandCode::ComStmtPrepare, &Packet::from_vec(head_a));
        let mut d2 = ReplyDigest::default();
        digest_replay_packet(&mut d2, CommandCode::ComStmtPrepare, &Packet::from_vec(head_b));
        assert_eq!(d1.finish(), d2.finish());
    }
}

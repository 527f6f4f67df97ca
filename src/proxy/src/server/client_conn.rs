use crate::backend::conn::{BackendConn, BackendConnectOptions};
use crate::backend::monitor::{self, ServerSnapshot};
use crate::backend::reply::{
    rewrite_prepare_ok_id, ReplyStatus, ReplyTracker, ResultSizeAction,
};
use crate::backend::router::rw_split::RwSplitRouter;
use crate::backend::router::{FailureAction, RouteDecision, RouteInput};
use crate::classifier::{self, Classification, ClassifyContext, SqlMode};
use crate::config::{LimitsConfig, ProxyConfig, ServerEntry, ServiceConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::hint::hint_for_statement;
use crate::protocol::mariadb::basic::{client_handshake_response, HandshakeResponse, OkPacket};
use crate::protocol::mariadb::constants::CommandCode;
use crate::protocol::mariadb::error_codes::ErrorKind;
use crate::protocol::mariadb::packet::packet_reader::PacketReader;
use crate::protocol::mariadb::packet::packet_writer::PacketWriter;
use crate::protocol::mariadb::packet::{writers, Packet};
use crate::server::auth::{
    backend_plugin_by_name, client_plugin_by_name, AuthResult, ClientExchange, Credentials,
};
use crate::server::worker::WorkerContext;
use crate::server::{default_capabilities, DEFAULT_SERVER_VERSION};
use crate::session::history::ReplyDigest;
use crate::session::{PreparedStatement, SessionState, TrxState};
use crate::{async_packet_read, backend::conn::digest_replay_packet};

use hashbrown::HashMap;
use mysql_common::constants::CapabilityFlags;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Client socket, plain TCP or upgraded to TLS when the client set
/// CLIENT_SSL in its handshake response.
pub enum ClientStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

type ClientReader = PacketReader<ReadHalf<ClientStream>>;
type ClientWriter = PacketWriter<WriteHalf<ClientStream>>;

/// One client session: handshake, authentication, then the command loop.
/// Created by the worker's adopt task and pinned to it for life.
pub struct ClientConn {
    ctx: Rc<WorkerContext>,
    peer: SocketAddr,
    reader: ClientReader,
    writer: ClientWriter,
    session: SessionState,
    router: RwSplitRouter,
    backends: HashMap<String, BackendConn>,
    config: Arc<ProxyConfig>,
    service: ServiceConfig,
    limits: LimitsConfig,
    credentials: Credentials,
}

impl ClientConn {
    pub async fn run(stream: TcpStream, peer: SocketAddr, ctx: Rc<WorkerContext>) -> ProxyResult<()> {
        // session-start safe point: observe the latest config snapshot
        let config: Arc<ProxyConfig> = ctx.config.borrow_mut().borrow_and_update().clone();
        let service = config
            .services
            .first()
            .cloned()
            .ok_or_else(|| ProxyError::ProtocolViolation("no service configured".to_string()))?;

        let mut conn = Self::handshake(stream, peer, ctx, config, service).await?;
        let result = conn.command_loop().await;
        conn.teardown().await;
        result
    }

    /// ACCEPT through AUTH_DONE: greeting, handshake response, optional TLS
    /// upgrade, plugin exchange, verdict.
    async fn handshake(
        mut stream: TcpStream,
        peer: SocketAddr,
        ctx: Rc<WorkerContext>,
        config: Arc<ProxyConfig>,
        service: ServiceConfig,
    ) -> ProxyResult<Self> {
        let salt = crate::server::auth::gen_user_salt();
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        // HANDSHAKE_SEND
        #[cfg(feature = "tls")]
        let with_ssl = ctx.tls_acceptor.is_some();
        #[cfg(not(feature = "tls"))]
        let with_ssl = false;
        let mut hs_writer = PacketWriter::new(&mut stream);
        writers::write_initial_handshake(
            &mut hs_writer,
            conn_id,
            salt,
            DEFAULT_SERVER_VERSION,
            with_ssl,
        )
        .await?;

        // HANDSHAKE_RECV
        let mut hs_reader = PacketReader::new(&mut stream);
        let (mut seq, response_pkt) = async_packet_read!(&mut hs_reader);
        let (_, mut response) = client_handshake_response(&response_pkt, false)
            .map_err(|_| ProxyError::ProtocolViolation("malformed handshake response".into()))?;
        drop(hs_reader);

        // an SSLRequest carries no user payload; the true handshake
        // response follows once the TLS handshake completes
        let mut stream = if response.client_flag.contains(CapabilityFlags::CLIENT_SSL) {
            #[cfg(feature = "tls")]
            {
                let Some(acceptor) = ctx.tls_acceptor.clone() else {
                    return Err(ProxyError::ProtocolViolation(
                        "client requested SSL but this listener has no TLS configured".to_string(),
                    ));
                };
                let tls = acceptor.accept(stream).await?;
                ClientStream::Tls(Box::new(tls))
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(ProxyError::ProtocolViolation(
                    "client requested SSL but this listener has no TLS configured".to_string(),
                ));
            }
        } else {
            ClientStream::Plain(stream)
        };

        if response.client_flag.contains(CapabilityFlags::CLIENT_SSL) {
            let mut tls_reader = PacketReader::new(&mut stream);
            let (s, pkt) = async_packet_read!(&mut tls_reader);
            let (_, resp) = client_handshake_response(&pkt, true).map_err(|_| {
                ProxyError::ProtocolViolation("malformed handshake response after TLS".into())
            })?;
            seq = s;
            response = resp;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        Self::authenticate(
            &mut reader,
            &mut writer,
            &mut response,
            seq,
            &salt,
            &service,
        )
        .await?;

        let caps = response.client_flag & default_capabilities();
        let session = SessionState::new(
            response.user_string(),
            response.database_string(),
            caps,
            response.collation,
            service.limits.history_cap,
        );
        let router = RwSplitRouter::new(service.router_options.clone());
        let credentials = Credentials {
            user: service.user.clone(),
            password: service.password.clone(),
        };
        let limits = service.limits.clone();
        Ok(Self {
            ctx,
            peer,
            reader,
            writer,
            session,
            router,
            backends: HashMap::new(),
            config,
            service,
            limits,
            credentials,
        })
    }

    /// AUTH_EXCHANGE / AUTH_DONE against the authentication plugin named in
    /// the handshake.
    async fn authenticate(
        reader: &mut ClientReader,
        writer: &mut ClientWriter,
        response: &mut HandshakeResponse,
        seq: u8,
        salt: &[u8],
        service: &ServiceConfig,
    ) -> ProxyResult<()> {
        let credentials = Credentials {
            user: service.user.clone(),
            password: service.password.clone(),
        };
        let user = response.user_string();

        let mut seq = seq;
        let mut auth_data = std::mem::take(&mut response.auth_response);
        let mut plugin = match client_plugin_by_name(&response.auth_plugin) {
            Some(p) => p,
            None => {
                // switch the client over to a plugin we implement
                let p = client_plugin_by_name(b"").unwrap();
                writer.set_seq(seq.wrapping_add(1));
                writer.write_all(&[0xfe])?;
                writer.write_all(p.name().as_bytes())?;
                writer.write_all(&[0x00])?;
                writer.write_all(salt)?;
                writer.write_all(&[0x00])?;
                writer.end_packet().await?;
                writer.flush_all().await?;
                let (s, pkt) = async_packet_read!(reader);
                seq = s;
                auth_data = pkt.to_vec();
                p
            }
        };

        loop {
            match plugin.exchange(&auth_data) {
                ClientExchange::Done => break,
                ClientExchange::Continue(pkt) => {
                    writer.set_seq(seq.wrapping_add(1));
                    writer.write_all(&pkt)?;
                    writer.end_packet().await?;
                    writer.flush_all().await?;
                    let (s, next) = async_packet_read!(reader);
                    seq = s;
                    auth_data = next.to_vec();
                }
                ClientExchange::Fail => {
                    return Self::reject_auth(writer, seq, &user).await;
                }
            }
        }

        if user != credentials.user {
            return Self::reject_auth(writer, seq, &user).await;
        }
        match plugin.authenticate(salt, &credentials) {
            AuthResult::Ok => {
                writer.set_seq(seq.wrapping_add(1));
                writers::write_ok_packet_with_client_flags(
                    writer,
                    response.client_flag & default_capabilities(),
                    OkPacket {
                        status_flags:
                            mysql_common::constants::StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                        ..Default::default()
                    },
                )
                .await?;
                writer.flush_all().await?;
                Ok(())
            }
            AuthResult::Fail { message, .. } => {
                warn!("authentication failed for {user:?}: {message}");
                Self::reject_auth(writer, seq, &user).await
            }
        }
    }

    async fn reject_auth(writer: &mut ClientWriter, seq: u8, user: &str) -> ProxyResult<()> {
        writer.set_seq(seq.wrapping_add(1));
        writers::write_err_packet(
            ErrorKind::ER_ACCESS_DENIED_ERROR,
            format!("Access denied for user '{user}'").as_bytes(),
            writer,
        )
        .await?;
        writer.flush_all().await?;
        Err(ProxyError::AuthFailure {
            user: user.to_string(),
        })
    }

    /// READY → ROUTING → STREAMING → READY until QUIT, error, or timeout.
    async fn command_loop(&mut self) -> ProxyResult<()> {
        let idle = Duration::from_secs(self.limits.client_idle_timeout_secs.max(1));
        loop {
            let next = match timeout(idle, self.reader.next_async()).await {
                Err(_) => {
                    debug!("closing idle session from {}", self.peer);
                    return Ok(());
                }
                Ok(read) => read?,
            };
            let Some((seq, pkt)) = next else {
                return Ok(());
            };
            let Some(com) = pkt.command() else {
                self.writer.set_seq(seq.wrapping_add(1));
                writers::write_err_packet(
                    ErrorKind::ER_UNKNOWN_COM_ERROR,
                    b"unknown command",
                    &mut self.writer,
                )
                .await?;
                self.writer.flush_all().await?;
                continue;
            };

            match com {
                CommandCode::ComQuit => return Ok(()),
                CommandCode::ComStmtSendLongData => {
                    self.accumulate_long_data(&pkt);
                    continue;
                }
                CommandCode::ComStmtClose => {
                    self.close_statement(pkt).await;
                    continue;
                }
                CommandCode::ComChangeUser => {
                    self.change_user(seq, pkt).await?;
                    continue;
                }
                CommandCode::ComResetConnection => {
                    self.reset_connection(seq).await?;
                    continue;
                }
                _ => {}
            }

            let com_labels = vec![("proxy_com", format!("{com:?}"))];
            let _com_latency = common::metrics::MetricsTimer::new_with_labels(
                common::metrics::metric_def::PROXY_COM_LATENCY,
                &com_labels,
            );
            if let Err(e) = self.dispatch_command(seq, com, pkt).await {
                match e {
                    ProxyError::BackendIo { .. } | ProxyError::Timeout(_) => {
                        if self.handle_backend_failure(seq, &e).await? {
                            continue;
                        }
                        return Err(e);
                    }
                    other => return Err(other),
                }
            }
        }
    }

    /// ROUTING: classify, consult hints, apply transaction effects, pick a
    /// backend, then STREAMING the reply back.
    async fn dispatch_command(
        &mut self,
        seq: u8,
        com: CommandCode,
        pkt: Packet,
    ) -> ProxyResult<()> {
        // safe point between client commands: refresh the server snapshot
        let snapshot: Arc<ServerSnapshot> =
            monitor::refresh(&mut self.ctx.snapshot.borrow_mut());

        let classify_ctx = ClassifyContext {
            sql_mode: self.session.sql_mode,
            ..classifier::worker_classify_context()
        };

        let mut classification: Option<Classification> = None;
        let mut hint = None;
        match com {
            CommandCode::ComQuery | CommandCode::ComStmtPrepare => {
                let sql = String::from_utf8_lossy(&pkt[1..]).to_string();
                let mut c = classifier::classify(&sql, &classify_ctx);
                if com == CommandCode::ComStmtPrepare {
                    // the id is assigned by the server, not named by the user
                    c.type_mask |= crate::classifier::TypeMask::PREPARE_STMT;
                }
                self.session.note_tmp_tables(&mut c);
                hint = hint_for_statement(&sql, &mut self.session.hints);
                if c.type_mask.contains(crate::classifier::TypeMask::SESSION_WRITE)
                    && sql.to_ascii_lowercase().contains("sql_mode")
                    && sql.to_ascii_uppercase().contains("ORACLE")
                {
                    self.session.sql_mode = SqlMode::Oracle;
                }
                self.session.apply_trx_effects(&c);
                classification = Some(c);
            }
            CommandCode::ComStmtExecute | CommandCode::ComStmtReset | CommandCode::ComStmtFetch => {
                // route by the classification of the prepared text
                if let Some(client_id) = stmt_id_of(&pkt) {
                    if let Some(ps) = self.session.prepared.get(&client_id) {
                        let sql = String::from_utf8_lossy(&ps.statement).to_string();
                        let mut c = classifier::classify(&sql, &classify_ctx);
                        self.session.note_tmp_tables(&mut c);
                        self.session.apply_trx_effects(&c);
                        classification = Some(c);
                    }
                }
            }
            CommandCode::ComInitDB => {
                self.session.database =
                    Some(String::from_utf8_lossy(&pkt[1..]).to_string());
            }
            _ => {}
        }

        let input = RouteInput {
            command: com,
            classification: classification.as_ref(),
            hint: hint.as_ref(),
            trx: self.session.trx,
        };
        let decision = self.router.route(&input, &snapshot);
        let server = match decision {
            RouteDecision::Route { server } => server,
            RouteDecision::ErrorToClient { kind, message } => {
                self.writer.set_seq(seq.wrapping_add(1));
                writers::write_err_packet(kind, message.as_bytes(), &mut self.writer).await?;
                self.writer.flush_all().await?;
                return Ok(());
            }
            RouteDecision::CloseSession { kind, message } => {
                self.writer.set_seq(seq.wrapping_add(1));
                writers::write_err_packet(kind, message.as_bytes(), &mut self.writer).await?;
                self.writer.flush_all().await?;
                return Err(ProxyError::NoTarget(message));
            }
        };

        self.ensure_backend(&server, &snapshot).await?;

        // session-affecting commands join the history before being routed
        let session_affecting = com.is_session_command()
            || classification
                .as_ref()
                .map(|c| is_session_affecting(c))
                .unwrap_or(false);
        let history_id = if session_affecting && com != CommandCode::ComStmtClose {
            Some(self.session.history.append(pkt.to_vec()))
        } else {
            None
        };

        // a new statement id is assigned before the backend answers so the
        // client-visible id is stable across backends
        let prepare_client_id = if com == CommandCode::ComStmtPrepare {
            let id = self.session.next_prepared_id();
            self.session.prepared.insert(
                id,
                PreparedStatement {
                    statement: pkt[1..].to_vec(),
                    param_count: 0,
                    long_data: HashMap::new(),
                },
            );
            Some(id)
        } else {
            None
        };

        // flush accumulated long data ahead of the execute
        if com == CommandCode::ComStmtExecute {
            self.flush_long_data(&server, &pkt).await?;
        }

        let backend = self.backends.get_mut(&server).expect("backend just bound");
        backend.forward_command(com, pkt).await?;

        let relay = relay_reply(
            backend,
            &mut self.reader,
            &mut self.writer,
            com,
            self.session.capabilities,
            &self.limits,
            prepare_client_id,
            history_id.is_some(),
        );
        // the per-command timeout marks the backend as failed; the failure
        // policy then decides whether the session survives
        let outcome = match self.limits.command_timeout_secs {
            Some(secs) => match timeout(Duration::from_secs(secs.max(1)), relay).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    return Err(ProxyError::BackendIo {
                        server: server.clone(),
                        source: io::Error::new(io::ErrorKind::TimedOut, "command timed out"),
                    });
                }
            },
            None => relay.await?,
        };

        if let Some(id) = history_id {
            if let Some(digest) = outcome.digest {
                self.session.history.record_digest(id, digest);
            }
            if let Some(sub) = backend.subscriber {
                self.session.history.advance(sub, id);
            }
        }
        if let (Some(client_id), Some(prepare_ok)) = (prepare_client_id, outcome.prepare_ok) {
            backend
                .ps_map
                .insert(client_id, prepare_ok.statement_id, prepare_ok.params);
            if let Some(ps) = self.session.prepared.get_mut(&client_id) {
                ps.param_count = prepare_ok.params;
            }
        } else if prepare_client_id.is_some() && outcome.prepare_ok.is_none() {
            // the backend refused the prepare; forget the provisional id
            if let Some(id) = prepare_client_id {
                self.session.prepared.remove(&id);
            }
        }
        Ok(())
    }

    /// Bind a backend for `server`: reuse the session's own, then the
    /// worker pool (reset/change-user plus history replay), else connect
    /// fresh and replay.
    async fn ensure_backend(
        &mut self,
        server: &str,
        snapshot: &ServerSnapshot,
    ) -> ProxyResult<()> {
        if self.backends.contains_key(server) {
            // catch up on any session commands it missed
            let caps = self.session.capabilities;
            let backend = self.backends.get_mut(server).unwrap();
            let prepared = &self.session.prepared;
            backend
                .replay_history(&mut self.session.history, caps, |stmt| {
                    prepared
                        .iter()
                        .find(|(_, ps)| ps.statement == stmt)
                        .map(|(id, _)| *id)
                })
                .await?;
            return Ok(());
        }

        let entry = self
            .config
            .server(server)
            .cloned()
            .or_else(|| {
                snapshot.by_name(server).map(|d| ServerEntry {
                    name: d.name.clone(),
                    address: d.addr.clone(),
                    port: d.port,
                    tls: false,
                    rank: d.rank,
                    initial_pool_size: 0,
                    proxy_protocol: None,
                    connection_init_queries: Vec::new(),
                })
            })
            .ok_or_else(|| ProxyError::NoTarget(server.to_string()))?;

        let mut auth = backend_plugin_by_name(b"", &self.credentials.password)
            .expect("native password plugin");

        let fingerprint = self.session.fingerprint();
        let pooled = {
            let mut pool = self.ctx.pool.borrow_mut();
            // a fingerprint miss can still be reused through change-user
            pool.acquire(server, &fingerprint)
                .or_else(|| pool.acquire_any(server))
        };

        let mut backend = match pooled {
            Some(mut conn) => {
                match conn
                    .reuse(
                        &self.credentials.user,
                        self.session.database.as_deref(),
                        self.session.collation,
                        auth.as_mut(),
                    )
                    .await
                {
                    Ok(()) => conn,
                    Err(e) => {
                        debug!("pooled connection reuse failed ({e}); opening fresh");
                        conn.shutdown().await;
                        self.connect_backend(&entry, auth.as_mut()).await?
                    }
                }
            }
            None => self.connect_backend(&entry, auth.as_mut()).await?,
        };

        backend.subscriber = Some(self.session.history.subscribe(false));
        let caps = self.session.capabilities;
        let prepared = &self.session.prepared;
        backend
            .replay_history(&mut self.session.history, caps, |stmt| {
                prepared
                    .iter()
                    .find(|(_, ps)| ps.statement == stmt)
                    .map(|(id, _)| *id)
            })
            .await?;
        self.backends.insert(server.to_string(), backend);
        Ok(())
    }

    async fn connect_backend(
        &self,
        entry: &ServerEntry,
        auth: &mut dyn crate::server::auth::BackendAuthPlugin,
    ) -> ProxyResult<BackendConn> {
        let opts = BackendConnectOptions {
            server_name: entry.name.clone(),
            endpoint: format!("{}:{}", entry.address, entry.port),
            user: self.credentials.user.clone(),
            password: self.credentials.password.clone(),
            database: self.session.database.clone(),
            capabilities: self.session.capabilities,
            collation: self.session.collation,
            proxy_protocol: entry.proxy_protocol,
            client_addr: Some(self.peer),
            init_queries: entry.connection_init_queries.clone(),
            #[cfg(feature = "tls")]
            tls: None,
        };
        BackendConn::connect(&opts, auth).await
    }

    fn accumulate_long_data(&mut self, pkt: &Packet) {
        let Some(client_id) = stmt_id_of(pkt) else {
            return;
        };
        if pkt.len() < 7 {
            return;
        }
        let param = u16::from_le_bytes([pkt[5], pkt[6]]);
        if let Some(ps) = self.session.prepared.get_mut(&client_id) {
            ps.long_data
                .entry(param)
                .or_default()
                .extend_from_slice(&pkt[7..]);
        }
    }

    /// Replay accumulated COM_STMT_SEND_LONG_DATA chunks to the executing
    /// backend just before the execute itself.
    async fn flush_long_data(&mut self, server: &str, exec_pkt: &Packet) -> ProxyResult<()> {
        let Some(client_id) = stmt_id_of(exec_pkt) else {
            return Ok(());
        };
        let chunks: Vec<(u16, Vec<u8>)> = match self.session.prepared.get_mut(&client_id) {
            Some(ps) if !ps.long_data.is_empty() => ps.long_data.drain().collect(),
            _ => return Ok(()),
        };
        let backend = self
            .backends
            .get_mut(server)
            .expect("backend bound before long data flush");
        // long-data chunks have no reply; stage them in the delay queue and
        // drain it in one burst ahead of the execute
        for (param, data) in chunks {
            let mut pkt = vec![CommandCode::ComStmtSendLongData as u8];
            pkt.extend(client_id.to_le_bytes());
            pkt.extend(param.to_le_bytes());
            pkt.extend(&data);
            let mut pkt = Packet::from_vec(pkt);
            if backend.ps_map.rewrite_to_backend(&mut pkt) {
                backend.queue_delayed(pkt);
            }
        }
        if let Err(source) = backend.send_delayed().await {
            return Err(ProxyError::BackendIo {
                server: backend.server_name.clone(),
                source,
            });
        }
        Ok(())
    }

    /// COM_STMT_CLOSE has no reply; it is forwarded to every backend that
    /// knows the statement.
    async fn close_statement(&mut self, pkt: Packet) {
        let Some(client_id) = stmt_id_of(&pkt) else {
            return;
        };
        self.session.prepared.remove(&client_id);
        for backend in self.backends.values_mut() {
            if backend.ps_map.entry(client_id).is_some() {
                if backend
                    .forward_command(CommandCode::ComStmtClose, pkt.clone())
                    .await
                    .is_ok()
                {
                    backend.ps_map.remove(client_id);
                }
            }
        }
    }

    /// COM_CHANGE_USER: re-authenticate the session. The account must stay
    /// within the service credentials; bound backends are switched with
    /// their own change-user round and the session state starts over.
    async fn change_user(&mut self, seq: u8, pkt: Packet) -> ProxyResult<()> {
        let new_user = pkt[1..]
            .split(|b| *b == 0)
            .next()
            .map(|u| String::from_utf8_lossy(u).to_string())
            .unwrap_or_default();
        if new_user != self.credentials.user {
            self.writer.set_seq(seq.wrapping_add(1));
            writers::write_err_packet(
                ErrorKind::ER_ACCESS_DENIED_ERROR,
                format!("Access denied for user '{new_user}'").as_bytes(),
                &mut self.writer,
            )
            .await?;
            self.writer.flush_all().await?;
            return Ok(());
        }

        let mut auth = backend_plugin_by_name(b"", &self.credentials.password)
            .expect("native password plugin");
        let mut failed: Vec<String> = Vec::new();
        for (name, backend) in self.backends.iter_mut() {
            if backend
                .reuse(
                    &new_user,
                    self.session.database.as_deref(),
                    self.session.collation,
                    auth.as_mut(),
                )
                .await
                .is_err()
            {
                failed.push(name.clone());
            }
        }
        for name in failed {
            if let Some(mut b) = self.backends.remove(&name) {
                b.shutdown().await;
            }
        }

        // the session state starts over: history, statements, hints
        let caps = self.session.capabilities;
        let collation = self.session.collation;
        let db = self.session.database.clone();
        self.session = SessionState::new(
            new_user,
            db,
            caps,
            collation,
            self.limits.history_cap,
        );
        for backend in self.backends.values_mut() {
            backend.subscriber = Some(self.session.history.subscribe(true));
        }

        self.writer.set_seq(seq.wrapping_add(1));
        writers::write_ok_packet(
            &mut self.writer,
            0,
            0,
            mysql_common::constants::StatusFlags::SERVER_STATUS_AUTOCOMMIT,
        )
        .await?;
        self.writer.flush_all().await?;
        Ok(())
    }

    /// COM_RESET_CONNECTION: wipe session state on every bound backend and
    /// in the proxy, then acknowledge.
    async fn reset_connection(&mut self, seq: u8) -> ProxyResult<()> {
        let mut auth = backend_plugin_by_name(b"", &self.credentials.password)
            .expect("native password plugin");
        let mut failed: Vec<String> = Vec::new();
        for (name, backend) in self.backends.iter_mut() {
            if backend
                .reuse(
                    &self.credentials.user,
                    self.session.database.as_deref(),
                    self.session.collation,
                    auth.as_mut(),
                )
                .await
                .is_err()
            {
                failed.push(name.clone());
            }
        }
        for name in failed {
            if let Some(mut b) = self.backends.remove(&name) {
                b.shutdown().await;
            }
        }

        let caps = self.session.capabilities;
        let collation = self.session.collation;
        let user = self.session.user.clone();
        let db = self.session.database.clone();
        self.session = SessionState::new(user, db, caps, collation, self.limits.history_cap);
        for backend in self.backends.values_mut() {
            backend.subscriber = Some(self.session.history.subscribe(true));
        }

        self.writer.set_seq(seq.wrapping_add(1));
        writers::write_ok_packet(
            &mut self.writer,
            0,
            0,
            mysql_common::constants::StatusFlags::SERVER_STATUS_AUTOCOMMIT,
        )
        .await?;
        self.writer.flush_all().await?;
        Ok(())
    }

    /// A backend died mid-command. Per the failure policy the session either
    /// survives (ERR for this command only) or ends.
    async fn handle_backend_failure(&mut self, seq: u8, e: &ProxyError) -> ProxyResult<bool> {
        let failed_server = match e {
            ProxyError::BackendIo { server, .. } => server.clone(),
            _ => String::new(),
        };
        let snapshot = monitor::refresh(&mut self.ctx.snapshot.borrow_mut());
        let was_master = snapshot
            .by_name(&failed_server)
            .map(|s| s.is_master())
            .unwrap_or(false);
        if let Some(mut b) = self.backends.remove(&failed_server) {
            if let Some(sub) = b.subscriber.take() {
                self.session.history.unsubscribe(sub);
            }
            b.shutdown().await;
        }
        let action = self.router.on_backend_failure(
            &failed_server,
            was_master,
            self.session.in_write_trx(),
            self.session.in_write_trx(),
        );
        match action {
            FailureAction::KillSession => {
                self.writer.set_seq(seq.wrapping_add(1));
                let _ = writers::write_err_packet(
                    ErrorKind::ER_CONNECTION_KILLED,
                    b"backend connection failed",
                    &mut self.writer,
                )
                .await;
                let _ = self.writer.flush_all().await;
                Ok(false)
            }
            FailureAction::Continue => {
                warn!("backend {failed_server} failed; session continues");
                self.writer.set_seq(seq.wrapping_add(1));
                writers::write_err_packet(
                    ErrorKind::ER_NET_READ_ERROR,
                    b"lost connection to backend during query",
                    &mut self.writer,
                )
                .await?;
                self.writer.flush_all().await?;
                Ok(true)
            }
        }
    }

    /// Unwind at the next suspension point: pool-eligible backends go back
    /// to the worker pool, the rest are dropped.
    async fn teardown(&mut self) {
        let fingerprint = self.session.fingerprint();
        let clean = self.session.trx == TrxState::None;
        for (server, mut backend) in self.backends.drain() {
            if let Some(sub) = backend.subscriber.take() {
                self.session.history.unsubscribe(sub);
            }
            if clean && backend.is_routing() {
                backend.set_pooled();
                let evicted = self
                    .ctx
                    .pool
                    .borrow_mut()
                    .release(&server, fingerprint.clone(), backend);
                for mut old in evicted {
                    old.shutdown().await;
                }
            } else {
                backend.shutdown().await;
            }
        }
    }
}

fn stmt_id_of(pkt: &Packet) -> Option<u32> {
    if pkt.len() < 5 {
        return None;
    }
    Some(u32::from_le_bytes([pkt[1], pkt[2], pkt[3], pkt[4]]))
}

fn is_session_affecting(c: &Classification) -> bool {
    use crate::classifier::TypeMask;
    c.type_mask.intersects(
        TypeMask::SESSION_WRITE
            | TypeMask::USERVAR_WRITE
            | TypeMask::GSYSVAR_WRITE
            | TypeMask::PREPARE_NAMED_STMT
            | TypeMask::DEALLOC_PREPARE
            | TypeMask::ENABLE_AUTOCOMMIT
            | TypeMask::DISABLE_AUTOCOMMIT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{classify, ClassifyContext};

    #[test]
    fn stmt_id_extraction() {
        let mut pkt = vec![CommandCode::ComStmtExecute as u8];
        pkt.extend(7u32.to_le_bytes());
        assert_eq!(stmt_id_of(&Packet::from_vec(pkt)), Some(7));
        assert_eq!(stmt_id_of(&Packet::from_vec(vec![0x17, 0x01])), None);
    }

    #[test]
    fn session_affecting_detection() {
        let ctx = ClassifyContext::default();
        assert!(is_session_affecting(&classify("SET @a = 1", &ctx)));
        assert!(is_session_affecting(&classify("SET autocommit = 0", &ctx)));
        assert!(is_session_affecting(&classify(
            "PREPARE s FROM 'SELECT 1'",
            &ctx
        )));
        assert!(!is_session_affecting(&classify("SELECT 1", &ctx)));
        assert!(!is_session_affecting(&classify(
            "INSERT INTO t1 VALUES (1)",
            &ctx
        )));
    }
}

/// What `relay_reply` learned while streaming.
pub struct ReplyOutcome {
    pub ok: bool,
    pub digest: Option<u64>,
    pub prepare_ok: Option<crate::backend::reply::PrepareOk>,
}

/// STREAMING: relay reply packets from the backend to the client until the
/// tracker sees the reply end. Sequence numbers are preserved; statement ids
/// in prepare responses are rewritten to the proxy's stable ids; size limits
/// are enforced mid-stream.
#[allow(clippy::too_many_arguments)]
async fn relay_reply(
    backend: &mut BackendConn,
    client_reader: &mut ClientReader,
    client_writer: &mut ClientWriter,
    com: CommandCode,
    caps: CapabilityFlags,
    limits: &LimitsConfig,
    prepare_client_id: Option<u32>,
    want_digest: bool,
) -> ProxyResult<ReplyOutcome> {
    if com.is_fire_and_forget() {
        return Ok(ReplyOutcome {
            ok: true,
            digest: None,
            prepare_ok: None,
        });
    }
    let mut tracker =
        ReplyTracker::new(com, caps).with_limits(limits.max_result_rows, limits.max_result_size);
    let mut digest = want_digest.then(ReplyDigest::default);
    let mut truncating = false;
    let mut last_seq = 0u8;
    let mut unflushed = 0usize;

    loop {
        let (seq, mut pkt) = match backend.read_packet().await {
            Ok(read) => read,
            Err(source) => {
                return Err(ProxyError::BackendIo {
                    server: backend.server_name.clone(),
                    source,
                })
            }
        };
        let status = tracker.observe(&pkt);

        if let Some(d) = digest.as_mut() {
            digest_replay_packet(d, com, &pkt);
        }

        match status {
            ReplyStatus::LocalInfile => {
                // relay the request, then pump the client's file chunks to
                // the backend until the empty terminator
                client_writer.set_seq(seq);
                client_writer.write_all(&pkt)?;
                client_writer.end_packet().await?;
                client_writer.flush_all().await?;
                loop {
                    let (fseq, fpkt) = async_packet_read!(client_reader);
                    let done = fpkt.is_empty();
                    if let Err(source) = backend.forward_raw(fseq, &fpkt).await {
                        return Err(ProxyError::BackendIo {
                            server: backend.server_name.clone(),
                            source,
                        });
                    }
                    if done {
                        break;
                    }
                }
            }
            ReplyStatus::LimitExceeded => match limits.result_size_action {
                ResultSizeAction::Terminate => {
                    return Err(ProxyError::ResourceExhausted(format!(
                        "result set exceeded limit after {} rows",
                        tracker.rows_seen
                    )));
                }
                ResultSizeAction::TruncateWithEof => {
                    // swallow the rest of the stream; the terminator is
                    // synthesized when the backend is done
                    truncating = true;
                }
            },
            ReplyStatus::InProgress | ReplyStatus::Complete { .. } => {
                if !truncating {
                    if let (Some(client_id), Some(_)) = (prepare_client_id, tracker.prepare_ok) {
                        if pkt.is_ok_packet() {
                            rewrite_prepare_ok_id(&mut pkt, client_id);
                        }
                    }
                    client_writer.set_seq(seq);
                    client_writer.write_all(&pkt)?;
                    client_writer.end_packet().await?;
                    unflushed += pkt.len();
                    last_seq = seq;
                    // emulate the write-queue high-water mark: awaiting the
                    // flush pauses the backend read side of this task
                    if unflushed >= limits.writeq_high_water {
                        client_writer.flush_all().await?;
                        unflushed = 0;
                    }
                }
                if let ReplyStatus::Complete { ok } = status {
                    if truncating {
                        client_writer.set_seq(last_seq.wrapping_add(1));
                        client_writer.write_all(&tracker.synthesized_eof())?;
                        client_writer.end_packet().await?;
                    }
                    client_writer.flush_all().await?;
                    return Ok(ReplyOutcome {
                        ok,
                        digest: digest.map(|d| d.finish()),
                        prepare_ok: tracker.prepare_ok,
                    });
                }
            }
        }
    }
}

use crate::protocol::mariadb::error_codes::ErrorKind;
use thiserror::Error;

/// Semantic error classes of the proxy core. Every recoverable failure is
/// carried through `Result`; panics are reserved for invariant violations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed packet, wrong sequence number, or a declared length that
    /// disagrees with the bytes on the wire. The connection is closed and
    /// never retried.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("access denied for user '{user}'")]
    AuthFailure { user: String },

    /// The backend socket failed mid-session. The router's failure policy
    /// decides whether the session survives.
    #[error("backend {server} failed: {source}")]
    BackendIo {
        server: String,
        #[source]
        source: std::io::Error,
    },

    /// A replayed session command produced a reply digest different from the
    /// one recorded at original execution.
    #[error("history replay mismatch on {server} at command {command_id}")]
    HistoryMismatch { server: String, command_id: u64 },

    #[error("resource limit exceeded: {0}")]
    ResourceExhausted(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("no backend available for routing target {0}")]
    NoTarget(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether the session can keep running after this error has been
    /// handled. Transient backend failures are survivable; protocol and
    /// client-side failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyError::BackendIo { .. }
                | ProxyError::HistoryMismatch { .. }
                | ProxyError::Timeout(_)
        )
    }

    /// The error number surfaced in the final ERR packet when the failure is
    /// reported to the client.
    pub fn client_error_kind(&self) -> ErrorKind {
        match self {
            ProxyError::AuthFailure { .. } => ErrorKind::ER_ACCESS_DENIED_ERROR,
            ProxyError::ResourceExhausted(_) => ErrorKind::ER_OUT_OF_RESOURCES,
            ProxyError::Timeout(_) => ErrorKind::ER_LOCK_WAIT_TIMEOUT,
            ProxyError::NoTarget(_) => ErrorKind::ER_CON_COUNT_ERROR,
            _ => ErrorKind::ER_UNKNOWN_ERROR,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

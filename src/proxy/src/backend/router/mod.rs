pub mod rw_split;

use crate::classifier::Classification;
use crate::hint::HintTarget;
use crate::protocol::mariadb::constants::CommandCode;
use crate::protocol::mariadb::error_codes::ErrorKind;
use crate::session::TrxState;

use serde::{Deserialize, Serialize};
use strum_macros::EnumString;

/// How a slave is chosen among equally-ranked candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveSelection {
    #[strum(serialize = "least_connections")]
    #[default]
    LeastConnections,
    #[strum(serialize = "adaptive_routing")]
    AdaptiveRouting,
    #[strum(serialize = "lowest_lag")]
    LowestLag,
    #[strum(serialize = "round_robin")]
    RoundRobin,
}

/// What happens to the session when the master is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// A failure that loses an uncommitted write, or master loss during a
    /// write transaction, ends the session immediately.
    #[strum(serialize = "fail_instantly")]
    #[default]
    FailInstantly,
    /// Writes return an error packet; reads keep flowing on slaves.
    #[strum(serialize = "error_on_write")]
    ErrorOnWrite,
    /// Reads keep flowing; the first write after master loss ends the
    /// session.
    #[strum(serialize = "fail_on_write")]
    FailOnWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub slave_selection: SlaveSelection,
    #[serde(default = "default_max_slave_connections")]
    pub max_slave_connections: usize,
    /// Allow transparently re-opening a master connection after loss.
    #[serde(default)]
    pub master_reconnection: bool,
    #[serde(default)]
    pub failure_mode: FailureMode,
}

fn default_max_slave_connections() -> usize {
    2
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            slave_selection: SlaveSelection::default(),
            max_slave_connections: default_max_slave_connections(),
            master_reconnection: false,
            failure_mode: FailureMode::default(),
        }
    }
}

/// Everything the routing decision needs about the current command.
#[derive(Debug)]
pub struct RouteInput<'a> {
    pub command: CommandCode,
    pub classification: Option<&'a Classification>,
    pub hint: Option<&'a HintTarget>,
    pub trx: TrxState,
}

/// The outcome of one routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward to this server (by name).
    Route { server: String },
    /// Return a single ERR packet; the session survives.
    ErrorToClient { kind: ErrorKind, message: String },
    /// Return a single ERR packet, then tear the session down.
    CloseSession { kind: ErrorKind, message: String },
}

/// What the session should do after a backend connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Keep going; reads may continue on the surviving backends.
    Continue,
    /// The failure is unrecoverable for this session.
    KillSession,
}

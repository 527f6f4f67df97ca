use crate::backend::monitor::{ServerDescriptor, ServerSnapshot};
use crate::backend::router::{
    FailureAction, FailureMode, RouteDecision, RouteInput, RouterConfig, SlaveSelection,
};
use crate::hint::HintTarget;
use crate::protocol::mariadb::constants::CommandCode;
use crate::protocol::mariadb::error_codes::ErrorKind;
use crate::session::TrxState;

use tracing::{debug, warn};

/// Per-session read/write-split routing policy. The router holds no I/O;
/// it turns (command, classification, hint, transaction state, snapshot)
/// into a target server name, and tracks which slaves the session is bound
/// to and whether the master has been lost.
pub struct RwSplitRouter {
    config: RouterConfig,
    /// Slaves this session has bound, most recently used last.
    bound_slaves: Vec<String>,
    rr_counter: usize,
    master_lost: bool,
}

impl RwSplitRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            bound_slaves: Vec::new(),
            rr_counter: 0,
            master_lost: false,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn route(&mut self, input: &RouteInput<'_>, snapshot: &ServerSnapshot) -> RouteDecision {
        // 1. commands that are not queries go to any available backend
        if !matches!(
            input.command,
            CommandCode::ComQuery
                | CommandCode::ComStmtPrepare
                | CommandCode::ComStmtExecute
                | CommandCode::ComStmtFetch
                | CommandCode::ComFieldList
        ) {
            return self.route_any(snapshot);
        }

        // 2-3. hints override policy (transaction effects were applied to
        // `input.trx` before we got here)
        if let Some(hint) = input.hint {
            return self.route_by_hint(hint, snapshot);
        }

        // 4. an active write transaction pins the session to the master
        if input.trx == TrxState::Active {
            return self.route_master(snapshot);
        }

        // 5. an explicitly read-only transaction stays on the chosen slave
        if input.trx == TrxState::ReadOnly {
            return match self.pick_slave(snapshot) {
                Some(server) => RouteDecision::Route { server },
                None => self.route_master(snapshot),
            };
        }

        // 6. statements that touch master-only state
        let needs_master = input
            .classification
            .map(|c| c.type_mask.needs_master())
            .unwrap_or(false);
        if needs_master {
            return self.route_master(snapshot);
        }

        // 7. reads prefer a slave, falling back to the master
        match self.pick_slave(snapshot) {
            Some(server) => RouteDecision::Route { server },
            None => self.route_master(snapshot),
        }
    }

    fn route_by_hint(&mut self, hint: &HintTarget, snapshot: &ServerSnapshot) -> RouteDecision {
        match hint {
            HintTarget::Master => self.route_master(snapshot),
            HintTarget::Slave => match self.pick_slave(snapshot) {
                Some(server) => RouteDecision::Route { server },
                None => self.route_master(snapshot),
            },
            HintTarget::Server(name) => match snapshot.by_name(name) {
                Some(s) if s.is_usable() => RouteDecision::Route {
                    server: name.clone(),
                },
                _ => {
                    warn!("hinted server {name:?} is not available");
                    RouteDecision::ErrorToClient {
                        kind: ErrorKind::ER_CON_COUNT_ERROR,
                        message: format!("hinted server '{name}' is not available"),
                    }
                }
            },
        }
    }

    fn route_any(&mut self, snapshot: &ServerSnapshot) -> RouteDecision {
        if let Some(server) = self.bound_slaves.last().cloned() {
            if snapshot.by_name(&server).is_some_and(|s| s.is_usable()) {
                return RouteDecision::Route { server };
            }
        }
        if !self.master_lost {
            if let Some(m) = snapshot.master() {
                return RouteDecision::Route {
                    server: m.name.clone(),
                };
            }
        }
        match self.pick_slave(snapshot) {
            Some(server) => RouteDecision::Route { server },
            None => RouteDecision::CloseSession {
                kind: ErrorKind::ER_CON_COUNT_ERROR,
                message: "no backend available".to_string(),
            },
        }
    }

    fn route_master(&mut self, snapshot: &ServerSnapshot) -> RouteDecision {
        let master = snapshot.master();
        if self.master_lost {
            if self.config.master_reconnection {
                if let Some(m) = master {
                    debug!("re-opening master connection to {}", m.name);
                    self.master_lost = false;
                    return RouteDecision::Route {
                        server: m.name.clone(),
                    };
                }
            }
            return self.master_unavailable();
        }
        match master {
            Some(m) => RouteDecision::Route {
                server: m.name.clone(),
            },
            None => self.master_unavailable(),
        }
    }

    fn master_unavailable(&self) -> RouteDecision {
        let message = "the master server is not available".to_string();
        match self.config.failure_mode {
            FailureMode::ErrorOnWrite => RouteDecision::ErrorToClient {
                kind: ErrorKind::ER_CONNECTION_KILLED,
                message,
            },
            FailureMode::FailOnWrite | FailureMode::FailInstantly => RouteDecision::CloseSession {
                kind: ErrorKind::ER_CONNECTION_KILLED,
                message,
            },
        }
    }

    /// Candidates are usable slaves; strictly lower rank wins, the
    /// configured criterion breaks ties. A slave already bound to the
    /// session is preferred while it stays usable.
    fn pick_slave(&mut self, snapshot: &ServerSnapshot) -> Option<String> {
        // previously bound and still usable
        if let Some(name) = self
            .bound_slaves
            .iter()
            .rev()
            .find(|n| snapshot.by_name(n).is_some_and(|s| s.is_usable()))
            .cloned()
        {
            if self.bound_slaves.len() >= self.config.max_slave_connections {
                return Some(name);
            }
        }

        let candidates: Vec<&ServerDescriptor> = snapshot.usable_slaves().collect();
        if candidates.is_empty() {
            return self
                .bound_slaves
                .iter()
                .rev()
                .find(|n| snapshot.by_name(n).is_some_and(|s| s.is_usable()))
                .cloned();
        }
        let best_rank = candidates.iter().map(|s| s.rank).min()?;
        let ranked: Vec<&ServerDescriptor> = candidates
            .into_iter()
            .filter(|s| s.rank == best_rank)
            .collect();

        let chosen = match self.config.slave_selection {
            SlaveSelection::LeastConnections => ranked
                .iter()
                .min_by_key(|s| s.connections)
                .copied(),
            SlaveSelection::LowestLag => ranked
                .iter()
                .min_by_key(|s| s.lag_secs.unwrap_or(u64::MAX))
                .copied(),
            SlaveSelection::AdaptiveRouting => ranked
                .iter()
                .min_by_key(|s| (s.lag_secs.unwrap_or(u64::MAX), s.connections))
                .copied(),
            SlaveSelection::RoundRobin => {
                let idx = self.rr_counter % ranked.len();
                self.rr_counter = self.rr_counter.wrapping_add(1);
                ranked.get(idx).copied()
            }
        }?;

        let name = chosen.name.clone();
        if !self.bound_slaves.contains(&name) {
            if self.bound_slaves.len() >= self.config.max_slave_connections {
                // session is at its slave cap: reuse the best bound one
                if let Some(bound) = self
                    .bound_slaves
                    .iter()
                    .rev()
                    .find(|n| snapshot.by_name(n).is_some_and(|s| s.is_usable()))
                    .cloned()
                {
                    return Some(bound);
                }
            }
            self.bound_slaves.push(name.clone());
        }
        Some(name)
    }

    /// Invoked when a bound backend connection dies. Decides whether the
    /// session survives per the configured failure mode.
    pub fn on_backend_failure(
        &mut self,
        server: &str,
        was_master: bool,
        in_write_trx: bool,
        lost_uncommitted_write: bool,
    ) -> FailureAction {
        self.bound_slaves.retain(|n| n != server);
        if was_master {
            self.master_lost = true;
        }
        match self.config.failure_mode {
            FailureMode::FailInstantly => {
                if lost_uncommitted_write || (was_master && in_write_trx) {
                    FailureAction::KillSession
                } else if was_master {
                    // idle master loss: the session dies on the next master
                    // bound statement instead
                    FailureAction::Continue
                } else {
                    FailureAction::Continue
                }
            }
            FailureMode::ErrorOnWrite | FailureMode::FailOnWrite => {
                if lost_uncommitted_write {
                    FailureAction::KillSession
                } else {
                    FailureAction::Continue
                }
            }
        }
    }

    pub fn master_lost(&self) -> bool {
        self.master_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::monitor::{test_descriptor, RoleFlags, RANK_PRIMARY, RANK_SECONDARY};
    use crate::classifier::{classify, Classification, ClassifyContext};
    use crate::hint::HintTarget;

    fn snapshot() -> ServerSnapshot {
        ServerSnapshot {
            version: 1,
            servers: vec![
                test_descriptor("s1", RoleFlags::MASTER, RANK_PRIMARY),
                test_descriptor("s2", RoleFlags::SLAVE, RANK_PRIMARY),
                test_descriptor("s3", RoleFlags::SLAVE, RANK_PRIMARY),
            ],
        }
    }

    fn classified(sql: &str) -> Classification {
        classify(sql, &ClassifyContext::default())
    }

    fn query_input<'a>(c: &'a Classification, trx: TrxState) -> RouteInput<'a> {
        RouteInput {
            command: CommandCode::ComQuery,
            classification: Some(c),
            hint: None,
            trx,
        }
    }

    fn routed(d: RouteDecision) -> String {
        match d {
            RouteDecision::Route { server } => server,
            other => panic!("expected a route, got {other:?}"),
        }
    }

    #[test]
    fn write_goes_to_master_read_to_slave() {
        let snap = snapshot();
        let mut router = RwSplitRouter::new(RouterConfig::default());

        let insert = classified("INSERT INTO t1 VALUES (1)");
        let target = routed(router.route(&query_input(&insert, TrxState::None), &snap));
        assert_eq!(target, "s1");

        let select = classified("SELECT @@server_id");
        let target = routed(router.route(&query_input(&select, TrxState::None), &snap));
        assert!(target == "s2" || target == "s3");
    }

    #[test]
    fn hint_overrides_policy() {
        let snap = snapshot();
        let mut router = RwSplitRouter::new(RouterConfig::default());
        let select = classified("SELECT @@server_id");
        let hint = HintTarget::Server("s3".to_string());
        let input = RouteInput {
            command: CommandCode::ComQuery,
            classification: Some(&select),
            hint: Some(&hint),
            trx: TrxState::None,
        };
        assert_eq!(routed(router.route(&input, &snap)), "s3");

        let hint = HintTarget::Master;
        let input = RouteInput {
            command: CommandCode::ComQuery,
            classification: Some(&select),
            hint: Some(&hint),
            trx: TrxState::None,
        };
        assert_eq!(routed(router.route(&input, &snap)), "s1");
    }

    #[test]
    fn hinted_unknown_server_is_an_error() {
        let snap = snapshot();
        let mut router = RwSplitRouter::new(RouterConfig::default());
        let select = classified("SELECT 1");
        let hint = HintTarget::Server("nope".to_string());
        let input = RouteInput {
            command: CommandCode::ComQuery,
            classification: Some(&select),
            hint: Some(&hint),
            trx: TrxState::None,
        };
        assert!(matches!(
            router.route(&input, &snap),
            RouteDecision::ErrorToClient { .. }
        ));
    }

    #[test]
    fn write_transaction_pins_to_master() {
        let snap = snapshot();
        let mut router = RwSplitRouter::new(RouterConfig::default());
        let select = classified("SELECT 1");
        // inside an open transaction even pure reads follow the master
        let target = routed(router.route(&query_input(&select, TrxState::Active), &snap));
        assert_eq!(target, "s1");
        // after commit the same read is free to hit a slave
        let target = routed(router.route(&query_input(&select, TrxState::None), &snap));
        assert_ne!(target, "s1");
    }

    #[test]
    fn read_only_transaction_stays_on_one_slave() {
        let snap = snapshot();
        let mut router = RwSplitRouter::new(RouterConfig {
            max_slave_connections: 1,
            ..Default::default()
        });
        let select = classified("SELECT 1");
        let first = routed(router.route(&query_input(&select, TrxState::ReadOnly), &snap));
        for _ in 0..5 {
            let next = routed(router.route(&query_input(&select, TrxState::ReadOnly), &snap));
            assert_eq!(next, first);
        }
    }

    #[test]
    fn rank_is_strictly_preferred() {
        let mut snap = ServerSnapshot {
            version: 1,
            servers: vec![
                test_descriptor("s1", RoleFlags::MASTER, RANK_PRIMARY),
                test_descriptor("fast", RoleFlags::SLAVE, RANK_PRIMARY),
                test_descriptor("spare", RoleFlags::SLAVE, RANK_SECONDARY),
            ],
        };
        // degrade the primary-rank slave heavily; it must still win
        snap.servers[1].lag_secs = Some(100);
        snap.servers[1].connections = 1000;
        let mut router = RwSplitRouter::new(RouterConfig {
            slave_selection: SlaveSelection::LowestLag,
            ..Default::default()
        });
        let select = classified("SELECT 1");
        assert_eq!(
            routed(router.route(&query_input(&select, TrxState::None), &snap)),
            "fast"
        );

        // only when every primary is down does the secondary take over
        snap.servers[1].roles.remove(RoleFlags::RUNNING);
        let mut router = RwSplitRouter::new(RouterConfig::default());
        assert_eq!(
            routed(router.route(&query_input(&select, TrxState::None), &snap)),
            "spare"
        );
    }

    #[test]
    fn round_robin_spreads_selection() {
        let snap = snapshot();
        let mut router = RwSplitRouter::new(RouterConfig {
            slave_selection: SlaveSelection::RoundRobin,
            max_slave_connections: 2,
            ..Default::default()
        });
        let select = classified("SELECT 1");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(routed(
                router.route(&query_input(&select, TrxState::None), &snap),
            ));
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn fail_on_write_lets_reads_continue() {
        let snap_no_master = ServerSnapshot {
            version: 2,
            servers: vec![
                test_descriptor("s2", RoleFlags::SLAVE, RANK_PRIMARY),
                test_descriptor("s3", RoleFlags::SLAVE, RANK_PRIMARY),
            ],
        };
        let mut router = RwSplitRouter::new(RouterConfig {
            failure_mode: FailureMode::FailOnWrite,
            ..Default::default()
        });
        let action = router.on_backend_failure("s1", true, false, false);
        assert_eq!(action, FailureAction::Continue);

        let select = classified("SELECT 1");
        assert!(matches!(
            router.route(&query_input(&select, TrxState::None), &snap_no_master),
            RouteDecision::Route { .. }
        ));

        let insert = classified("INSERT INTO t1 VALUES (1)");
        assert!(matches!(
            router.route(&query_input(&insert, TrxState::None), &snap_no_master),
            RouteDecision::CloseSession { .. }
        ));
    }

    #[test]
    fn error_on_write_keeps_session() {
        let snap_no_master = ServerSnapshot {
            version: 2,
            servers: vec![test_descriptor("s2", RoleFlags::SLAVE, RANK_PRIMARY)],
        };
        let mut router = RwSplitRouter::new(RouterConfig {
            failure_mode: FailureMode::ErrorOnWrite,
            ..Default::default()
        });
        router.on_backend_failure("s1", true, false, false);
        let insert = classified("INSERT INTO t1 VALUES (1)");
        assert!(matches!(
            router.route(&query_input(&insert, TrxState::None), &snap_no_master),
            RouteDecision::ErrorToClient { .. }
        ));
        let select = classified("SELECT 1");
        assert!(matches!(
            router.route(&query_input(&select, TrxState::None), &snap_no_master),
            RouteDecision::Route { .. }
        ));
    }

    #[test]
    fn fail_instantly_kills_on_write_trx_master_loss() {
        let mut router = RwSplitRouter::new(RouterConfig {
            failure_mode: FailureMode::FailInstantly,
            ..Default::default()
        });
        assert_eq!(
            router.on_backend_failure("s1", true, true, false),
            FailureAction::KillSession
        );

        let mut router = RwSplitRouter::new(RouterConfig {
            failure_mode: FailureMode::FailInstantly,
            ..Default::default()
        });
        assert_eq!(
            router.on_backend_failure("s2", false, false, false),
            FailureAction::Continue
        );
        assert_eq!(
            router.on_backend_failure("s3", false, false, true),
            FailureAction::KillSession
        );
    }

    #[test]
    fn master_reconnection_recovers_after_loss() {
        let snap = snapshot();
        let mut router = RwSplitRouter::new(RouterConfig {
            failure_mode: FailureMode::ErrorOnWrite,
            master_reconnection: true,
            ..Default::default()
        });
        router.on_backend_failure("s1", true, false, false);
        assert!(router.master_lost());
        let insert = classified("INSERT INTO t1 VALUES (1)");
        // the monitor still lists a usable master: reconnect transparently
        assert_eq!(
            routed(router.route(&query_input(&insert, TrxState::None), &snap)),
            "s1"
        );
        assert!(!router.master_lost());
    }

    #[test]
    fn ping_routes_anywhere() {
        let snap = snapshot();
        let mut router = RwSplitRouter::new(RouterConfig::default());
        let input = RouteInput {
            command: CommandCode::ComPing,
            classification: None,
            hint: None,
            trx: TrxState::None,
        };
        assert!(matches!(
            router.route(&input, &snap),
            RouteDecision::Route { .. }
        ));
    }
}

//! Switch session manager.
//!
//! # Architecture
//!
//! ```text
//!  transport ──► EventHandler ──► registry (DashMap<SwitchId, handle>)
//!                                      │ mpsc, one per switch
//!                                      ▼
//!                               session task ──► FlowTable ──► transport
//! ```
//!
//! Every switch has its own task that owns its [`SwitchSession`] and handles
//! commands strictly in arrival order, finishing each one (barrier included)
//! before taking the next. Different switches run in parallel. The compiled
//! policy is the only shared state and is read-only once published. Session
//! tasks watch it and read the current version when they establish, so a
//! switch that connects during an update never activates on the old one.
//!
//! A disconnect cancels the session's token before it is queued, so a task
//! blocked on a barrier reply gives up the wait and reaches the close
//! command.

use async_trait::async_trait;
use dashmap::DashMap;
use ofguard_orch_common::{EventHandler, HandshakeInfo, PortEvent, RetryPolicy};
use ofguard_policy::{CompiledPolicy, ForwardingRule, PolicyModel};
use ofguard_types::SwitchId;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SessionError};
use crate::flow_table::InstallReport;
use crate::port_monitor::{self, PortOutcome};
use crate::session::{ReconcileReport, SessionSnapshot, SessionState, SwitchSession};
use crate::transport::Transport;

const COMMAND_QUEUE_DEPTH: usize = 256;
const OUTCOME_QUEUE_DEPTH: usize = 1024;

/// Reported after each session command completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Initial install done, session active.
    Established { switch_id: SwitchId, entries: usize },
    /// The session could not be established and is closed.
    Failed { switch_id: SwitchId, error: String },
    Port {
        switch_id: SwitchId,
        outcome: PortOutcome,
    },
    Reconciled {
        switch_id: SwitchId,
        report: ReconcileReport,
    },
    /// A policy update did not fully apply. The session stays active and
    /// the next update removes whatever this one left behind.
    ReconcileFailed {
        switch_id: SwitchId,
        version: u64,
        error: String,
    },
    Closed { switch_id: SwitchId, cleared: usize },
}

impl SessionOutcome {
    pub fn switch_id(&self) -> SwitchId {
        match self {
            SessionOutcome::Established { switch_id, .. }
            | SessionOutcome::Failed { switch_id, .. }
            | SessionOutcome::Port { switch_id, .. }
            | SessionOutcome::Reconciled { switch_id, .. }
            | SessionOutcome::ReconcileFailed { switch_id, .. }
            | SessionOutcome::Closed { switch_id, .. } => *switch_id,
        }
    }
}

/// Result of [`SessionManager::update_policy`].
#[derive(Debug)]
pub struct PolicyUpdate {
    pub policy: Arc<CompiledPolicy>,
    pub results: Vec<(SwitchId, std::result::Result<ReconcileReport, SessionError>)>,
}

type Reply<T> = Option<oneshot::Sender<std::result::Result<T, SessionError>>>;

enum Command {
    Establish {
        reply: Reply<usize>,
    },
    Port {
        event: PortEvent,
        reply: Reply<PortOutcome>,
    },
    Apply {
        policy: Arc<CompiledPolicy>,
        reply: Reply<ReconcileReport>,
    },
    Install {
        rules: Vec<ForwardingRule>,
        reply: Reply<InstallReport>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Close {
        reply: Option<oneshot::Sender<SessionSnapshot>>,
    },
}

#[derive(Clone)]
struct SessionHandle {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Owns every switch session and routes events to them.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    policy: watch::Sender<Arc<CompiledPolicy>>,
    update_lock: Mutex<()>,
    sessions: DashMap<SwitchId, SessionHandle>,
    outcomes: broadcast::Sender<SessionOutcome>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_QUEUE_DEPTH);
        Self {
            transport,
            retry,
            policy: watch::Sender::new(Arc::new(CompiledPolicy::empty())),
            update_lock: Mutex::new(()),
            sessions: DashMap::new(),
            outcomes,
        }
    }

    /// Compiles `model` as version 1 and uses it for new sessions.
    pub fn with_policy(self, model: &PolicyModel) -> Result<Self> {
        let compiled = CompiledPolicy::compile(model, 1)?;
        self.set_policy(compiled);
        Ok(self)
    }

    /// Receives an outcome for every command a session completes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionOutcome> {
        self.outcomes.subscribe()
    }

    /// The cached compiled policy installed on new sessions.
    pub fn compiled_policy(&self) -> Arc<CompiledPolicy> {
        self.policy.borrow().clone()
    }

    fn set_policy(&self, policy: Arc<CompiledPolicy>) {
        self.policy.send_replace(policy);
    }

    pub fn session_state(&self, switch_id: SwitchId) -> Option<SessionState> {
        self.sessions.get(&switch_id).map(|h| h.state())
    }

    pub fn active_switches(&self) -> Vec<SwitchId> {
        let mut ids: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state() == SessionState::Active)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    fn handle(&self, switch_id: SwitchId) -> std::result::Result<SessionHandle, SessionError> {
        self.sessions
            .get(&switch_id)
            .map(|h| h.value().clone())
            .ok_or(SessionError::StaleSession(switch_id))
    }

    async fn send(
        &self,
        switch_id: SwitchId,
        handle: &SessionHandle,
        command: Command,
    ) -> std::result::Result<(), SessionError> {
        handle
            .tx
            .send(command)
            .await
            .map_err(|_| SessionError::StaleSession(switch_id))
    }

    /// Registers a new session and spawns its task.
    ///
    /// A live session for the same switch is closed first.
    fn start_session(&self, switch_id: SwitchId, info: HandshakeInfo) -> SessionHandle {
        let session = SwitchSession::new(switch_id, info, self.transport.clone(), self.retry.clone());
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(session.state());
        let handle = SessionHandle {
            tx,
            cancel: session.cancellation_token(),
            state: state_rx,
        };

        if let Some(previous) = self.sessions.insert(switch_id, handle.clone()) {
            warn!(switch = %switch_id, "switch reconnected, replacing previous session");
            previous.cancel.cancel();
            match previous.tx.try_send(Command::Close { reply: None }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    error!(switch = %switch_id, "previous session queue full, close not delivered");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(switch = %switch_id, "previous session task already finished");
                }
            }
        }

        tokio::spawn(run_session(
            session,
            rx,
            self.policy.subscribe(),
            state_tx,
            self.outcomes.clone(),
        ));
        handle
    }

    /// Creates a session, installs the current policy and activates it.
    ///
    /// Returns the number of installed entries.
    #[instrument(skip(self, info))]
    pub async fn connect(
        &self,
        switch_id: SwitchId,
        info: HandshakeInfo,
    ) -> std::result::Result<usize, SessionError> {
        let handle = self.start_session(switch_id, info);
        let (tx, rx) = oneshot::channel();
        self.send(switch_id, &handle, Command::Establish { reply: Some(tx) })
            .await?;
        rx.await.map_err(|_| SessionError::StaleSession(switch_id))?
    }

    /// Closes and drops the session. Returns its final snapshot.
    #[instrument(skip(self))]
    pub async fn disconnect(
        &self,
        switch_id: SwitchId,
    ) -> std::result::Result<SessionSnapshot, SessionError> {
        let (_, handle) = self
            .sessions
            .remove(&switch_id)
            .ok_or(SessionError::StaleSession(switch_id))?;
        handle.cancel.cancel();

        let (tx, rx) = oneshot::channel();
        self.send(switch_id, &handle, Command::Close { reply: Some(tx) })
            .await?;
        rx.await.map_err(|_| SessionError::StaleSession(switch_id))
    }

    /// Routes a port event to its session and waits for the result.
    pub async fn port_status(
        &self,
        event: PortEvent,
    ) -> std::result::Result<PortOutcome, SessionError> {
        let switch_id = event.switch_id;
        let handle = self.handle(switch_id)?;
        let (tx, rx) = oneshot::channel();
        self.send(
            switch_id,
            &handle,
            Command::Port {
                event,
                reply: Some(tx),
            },
        )
        .await?;
        rx.await.map_err(|_| SessionError::StaleSession(switch_id))?
    }

    /// Installs rules outside the compiled policy on one switch.
    pub async fn install_rules(
        &self,
        switch_id: SwitchId,
        rules: Vec<ForwardingRule>,
    ) -> std::result::Result<InstallReport, SessionError> {
        let handle = self.handle(switch_id)?;
        let (tx, rx) = oneshot::channel();
        self.send(
            switch_id,
            &handle,
            Command::Install {
                rules,
                reply: Some(tx),
            },
        )
        .await?;
        rx.await.map_err(|_| SessionError::StaleSession(switch_id))?
    }

    pub async fn snapshot(
        &self,
        switch_id: SwitchId,
    ) -> std::result::Result<SessionSnapshot, SessionError> {
        let handle = self.handle(switch_id)?;
        let (tx, rx) = oneshot::channel();
        self.send(switch_id, &handle, Command::Snapshot { reply: tx })
            .await?;
        rx.await.map_err(|_| SessionError::StaleSession(switch_id))
    }

    /// Compiles `model`, publishes it and reconciles every open session.
    ///
    /// Nothing reaches a switch if compilation fails. Sessions reconcile
    /// concurrently; this waits for all of them.
    #[instrument(skip(self, model))]
    pub async fn update_policy(&self, model: &PolicyModel) -> Result<PolicyUpdate> {
        let _guard = self.update_lock.lock().await;

        let previous = self.compiled_policy();
        let version = previous.version() + 1;
        let policy = CompiledPolicy::compile(model, version)?;
        let diff = previous.diff(&policy);
        self.set_policy(policy.clone());
        info!(
            version,
            rules = policy.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "policy updated"
        );

        let targets: Vec<(SwitchId, SessionHandle)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state() != SessionState::Closed)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut pending = Vec::with_capacity(targets.len());
        for (switch_id, handle) in targets {
            let (tx, rx) = oneshot::channel();
            let sent = self
                .send(
                    switch_id,
                    &handle,
                    Command::Apply {
                        policy: policy.clone(),
                        reply: Some(tx),
                    },
                )
                .await;
            pending.push((switch_id, sent.map(|()| rx)));
        }

        let mut results = Vec::with_capacity(pending.len());
        for (switch_id, rx) in pending {
            let result = match rx {
                Ok(rx) => rx
                    .await
                    .unwrap_or(Err(SessionError::StaleSession(switch_id))),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!(switch = %switch_id, error = %e, "policy not applied");
            }
            results.push((switch_id, result));
        }
        results.sort_by_key(|(id, _)| *id);

        Ok(PolicyUpdate { policy, results })
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SwitchId> = self.sessions.iter().map(|e| *e.key()).collect();
        for switch_id in ids {
            if let Err(e) = self.disconnect(switch_id).await {
                debug!(switch = %switch_id, error = %e, "session already gone");
            }
        }
    }
}

#[async_trait]
impl EventHandler for SessionManager {
    fn name(&self) -> &str {
        "SessionManager"
    }

    async fn on_switch_connected(&self, switch_id: SwitchId, info: HandshakeInfo) {
        info!(switch = %switch_id, n_ports = info.n_ports, "switch connected");
        let handle = self.start_session(switch_id, info);
        let command = Command::Establish { reply: None };
        if let Err(e) = self.send(switch_id, &handle, command).await {
            warn!(switch = %switch_id, error = %e, "dropping connect");
        }
    }

    async fn on_switch_disconnected(&self, switch_id: SwitchId) {
        info!(switch = %switch_id, "switch disconnected");
        let Some((_, handle)) = self.sessions.remove(&switch_id) else {
            warn!(switch = %switch_id, "disconnect for unknown switch, ignoring");
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = self
            .send(switch_id, &handle, Command::Close { reply: None })
            .await
        {
            debug!(switch = %switch_id, error = %e, "session task already finished");
        }
    }

    async fn on_port_status(&self, event: PortEvent) {
        let switch_id = event.switch_id;
        let result = match self.handle(switch_id) {
            Ok(handle) => {
                self.send(switch_id, &handle, Command::Port { event, reply: None })
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(%event, error = %e, "discarding port event");
        }
    }
}

fn reply<T>(reply: Reply<T>, result: std::result::Result<T, SessionError>) {
    if let Some(tx) = reply {
        let _ = tx.send(result);
    }
}

async fn run_session(
    mut session: SwitchSession,
    mut rx: mpsc::Receiver<Command>,
    policy: watch::Receiver<Arc<CompiledPolicy>>,
    state: watch::Sender<SessionState>,
    outcomes: broadcast::Sender<SessionOutcome>,
) {
    let switch_id = session.switch_id();
    debug!(switch = %switch_id, "session task started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Establish { reply: tx } => {
                let current = policy.borrow().clone();
                let result = session.establish(current).await;
                match &result {
                    Ok(entries) => {
                        let _ = outcomes.send(SessionOutcome::Established {
                            switch_id,
                            entries: *entries,
                        });
                    }
                    Err(e) if e.is_stale() => {
                        debug!(switch = %switch_id, "connect abandoned");
                    }
                    Err(e) => {
                        error!(switch = %switch_id, error = %e, "failed to establish session");
                        let _ = outcomes.send(SessionOutcome::Failed {
                            switch_id,
                            error: e.to_string(),
                        });
                    }
                }
                state.send_replace(session.state());
                reply(tx, result);
            }
            Command::Port { event, reply: tx } => {
                let result = port_monitor::on_port_event(&mut session, &event).await;
                match &result {
                    Ok(outcome) => {
                        let _ = outcomes.send(SessionOutcome::Port {
                            switch_id,
                            outcome: *outcome,
                        });
                    }
                    Err(e) => warn!(%event, error = %e, "port event not handled"),
                }
                state.send_replace(session.state());
                reply(tx, result);
            }
            Command::Apply { policy, reply: tx } => {
                let version = policy.version();
                let result = session.apply_policy(policy).await;
                match &result {
                    Ok(report) => {
                        let _ = outcomes.send(SessionOutcome::Reconciled {
                            switch_id,
                            report: *report,
                        });
                    }
                    Err(e) if e.is_stale() => {
                        debug!(switch = %switch_id, version, "policy skipped, session not active");
                    }
                    Err(e) => {
                        error!(switch = %switch_id, version, error = %e, "policy reconciliation failed");
                        let _ = outcomes.send(SessionOutcome::ReconcileFailed {
                            switch_id,
                            version,
                            error: e.to_string(),
                        });
                    }
                }
                state.send_replace(session.state());
                reply(tx, result);
            }
            Command::Install { rules, reply: tx } => {
                let result = session.install_rules(&rules).await;
                if let Err(e) = &result {
                    warn!(switch = %switch_id, error = %e, "rules not installed");
                }
                state.send_replace(session.state());
                reply(tx, result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(session.snapshot());
            }
            Command::Close { reply } => {
                let cleared = session.close();
                state.send_replace(session.state());
                let _ = outcomes.send(SessionOutcome::Closed { switch_id, cleared });
                if let Some(tx) = reply {
                    let _ = tx.send(session.snapshot());
                }
                debug!(switch = %switch_id, "session task finished");
                return;
            }
        }
    }

    // Every handle was dropped without a close command reaching the task.
    let cleared = session.close();
    state.send_replace(session.state());
    let _ = outcomes.send(SessionOutcome::Closed { switch_id, cleared });
    debug!(switch = %switch_id, "session task finished without close command");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use ofguard_policy::{Protocol, ServiceRule};
    use ofguard_types::{PortNo, PortReason, PortState};
    use pretty_assertions::assert_eq;

    fn manager(transport: &Arc<MemoryTransport>) -> SessionManager {
        SessionManager::new(transport.clone(), RetryPolicy::no_retry())
            .with_policy(&PolicyModel::reference())
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_query() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        let id = SwitchId::new(1);

        let entries = manager.connect(id, HandshakeInfo::new(254, 4)).await.unwrap();
        assert_eq!(entries, manager.compiled_policy().len());
        assert_eq!(manager.session_state(id), Some(SessionState::Active));
        assert_eq!(manager.active_switches(), vec![id]);

        let snapshot = manager.snapshot(id).await.unwrap();
        assert_eq!(snapshot.entry_count(), entries);
        assert_eq!(snapshot.policy_version, 1);
    }

    #[tokio::test]
    async fn test_unknown_switch_is_stale() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        let id = SwitchId::new(7);

        let event = PortEvent::new(id, PortNo::new(1), PortState::LINK_DOWN, PortReason::Modified);
        assert!(manager.port_status(event).await.unwrap_err().is_stale());
        assert!(manager.snapshot(id).await.unwrap_err().is_stale());
        assert!(manager.disconnect(id).await.unwrap_err().is_stale());
        assert!(manager.session_state(id).is_none());
    }

    #[tokio::test]
    async fn test_establish_uses_policy_published_while_queued() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        let id = SwitchId::new(1);

        // The update reaches the registered session before its establish.
        let handle = manager.start_session(id, HandshakeInfo::new(254, 4));
        let updated = PolicyModel::reference().with_service(
            ServiceRule::deny("iot-to-admin", Protocol::Ipv4)
                .from_group("iot")
                .to_group("admin"),
        );
        let update = manager.update_policy(&updated).await.unwrap();
        assert!(update.results[0].1.as_ref().unwrap_err().is_stale());

        let (tx, rx) = oneshot::channel();
        manager
            .send(id, &handle, Command::Establish { reply: Some(tx) })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), update.policy.len());

        let snapshot = manager.snapshot(id).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.policy_version, 2);
        assert_eq!(transport.switch_rules(id).len(), update.policy.len());
    }

    #[tokio::test]
    async fn test_dropped_session_reports_closed() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        let mut outcomes = manager.subscribe();
        let id = SwitchId::new(5);
        manager.connect(id, HandshakeInfo::new(254, 4)).await.unwrap();
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            SessionOutcome::Established { .. }
        ));

        let (_, handle) = manager.sessions.remove(&id).unwrap();
        drop(handle);
        assert_eq!(
            outcomes.recv().await.unwrap(),
            SessionOutcome::Closed {
                switch_id: id,
                cleared: manager.compiled_policy().len()
            }
        );
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        let id = SwitchId::new(1);

        manager.connect(id, HandshakeInfo::new(254, 4)).await.unwrap();
        let mut outcomes = manager.subscribe();
        let entries = manager.connect(id, HandshakeInfo::new(254, 8)).await.unwrap();
        assert_eq!(entries, manager.compiled_policy().len());
        assert_eq!(manager.active_switches(), vec![id]);

        let mut seen = vec![outcomes.recv().await.unwrap(), outcomes.recv().await.unwrap()];
        seen.sort_by_key(|o| matches!(o, SessionOutcome::Established { .. }));
        assert_eq!(
            seen[0],
            SessionOutcome::Closed {
                switch_id: id,
                cleared: entries
            }
        );
    }

    #[tokio::test]
    async fn test_failed_policy_update_touches_nothing() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        let id = SwitchId::new(1);
        manager.connect(id, HandshakeInfo::new(254, 4)).await.unwrap();
        transport.clear_messages();

        let broken = PolicyModel::reference().with_group("iot", []);
        assert!(manager.update_policy(&broken).await.is_err());
        assert_eq!(manager.compiled_policy().version(), 1);
        assert!(transport.messages().is_empty());
    }

    #[tokio::test]
    async fn test_event_handler_path() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(&transport);
        let mut outcomes = manager.subscribe();
        let id = SwitchId::new(3);

        manager.on_switch_connected(id, HandshakeInfo::new(254, 4)).await;
        assert_eq!(
            outcomes.recv().await.unwrap(),
            SessionOutcome::Established {
                switch_id: id,
                entries: manager.compiled_policy().len()
            }
        );

        manager
            .on_port_status(PortEvent::new(id, PortNo::new(2), PortState::LIVE, PortReason::Modified))
            .await;
        assert_eq!(
            outcomes.recv().await.unwrap(),
            SessionOutcome::Port {
                switch_id: id,
                outcome: PortOutcome::NoAction
            }
        );

        manager.on_switch_disconnected(id).await;
        assert_eq!(
            outcomes.recv().await.unwrap(),
            SessionOutcome::Closed {
                switch_id: id,
                cleared: manager.compiled_policy().len()
            }
        );
        assert!(manager.session_state(id).is_none());
        assert_eq!(manager.name(), "SessionManager");
    }
}

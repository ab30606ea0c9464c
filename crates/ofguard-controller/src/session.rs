//! Switch session: lifecycle and flow table of one connected switch.

use ofguard_orch_common::{HandshakeInfo, RetryPolicy};
use ofguard_policy::{CompiledPolicy, ForwardingRule};
use ofguard_types::SwitchId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{SessionError, TransportError};
use crate::flow_table::{FlowTable, FlowTableEntry, InstallReport, RuleOrigin};
use crate::transport::Transport;

/// Connection state of a switch session.
///
/// `Connecting -> Active -> Closed`. `Closed` is terminal and reachable from
/// either earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Active)
                | (SessionState::Connecting, SessionState::Closed)
                | (SessionState::Active, SessionState::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// How a barrier wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    Acknowledged,
    /// The session closed while waiting.
    Cancelled,
}

/// Result of reconciling a session with a new compiled policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub version: u64,
    pub removed: usize,
    pub installed: usize,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub switch_id: SwitchId,
    pub state: SessionState,
    pub policy_version: u64,
    pub entries: Vec<FlowTableEntry>,
}

impl SessionSnapshot {
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// One connected switch.
pub struct SwitchSession {
    switch_id: SwitchId,
    info: HandshakeInfo,
    state: SessionState,
    table: FlowTable,
    policy: Arc<CompiledPolicy>,
    cancel: CancellationToken,
}

impl SwitchSession {
    pub fn new(
        switch_id: SwitchId,
        info: HandshakeInfo,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            switch_id,
            info,
            state: SessionState::Connecting,
            table: FlowTable::new(switch_id, transport, retry),
            policy: Arc::new(CompiledPolicy::empty()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn switch_id(&self) -> SwitchId {
        self.switch_id
    }

    pub fn info(&self) -> &HandshakeInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut FlowTable {
        &mut self.table
    }

    pub fn policy(&self) -> &Arc<CompiledPolicy> {
        &self.policy
    }

    /// Token cancelled when the session closes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                switch_id: self.switch_id,
                from: self.state,
                to: next,
            });
        }
        debug!(switch = %self.switch_id, from = %self.state, to = %next, "session transition");
        self.state = next;
        Ok(())
    }

    pub(crate) fn ensure_active(&self) -> Result<(), SessionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SessionError::StaleSession(self.switch_id))
        }
    }

    /// Sends a barrier and waits for the reply or for the session to close.
    pub async fn barrier(&self) -> Result<BarrierOutcome, TransportError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(BarrierOutcome::Cancelled),
            result = self.table.barrier() => result.map(|()| BarrierOutcome::Acknowledged),
        }
    }

    /// Installs `policy` on a fresh connection and activates the session.
    ///
    /// On install failure the session is closed and the failure returned.
    #[instrument(skip(self, policy), fields(switch = %self.switch_id, version = policy.version()))]
    pub async fn establish(&mut self, policy: Arc<CompiledPolicy>) -> Result<usize, SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::InvalidTransition {
                switch_id: self.switch_id,
                from: self.state,
                to: SessionState::Active,
            });
        }

        let report = match self.table.install(policy.rules(), RuleOrigin::Policy).await {
            Ok(report) => report,
            Err(source) => {
                warn!(error = %source, "initial install failed, closing session");
                self.close();
                return Err(SessionError::InstallFailed {
                    switch_id: self.switch_id,
                    source,
                });
            }
        };

        match self.barrier().await {
            Ok(BarrierOutcome::Acknowledged) => {}
            Ok(BarrierOutcome::Cancelled) => return Err(SessionError::StaleSession(self.switch_id)),
            Err(source) => {
                self.close();
                return Err(SessionError::transport(self.switch_id, source));
            }
        }

        self.policy = policy;
        self.transition(SessionState::Active)?;
        info!(
            installed = report.installed,
            entries = self.table.len(),
            "switch session active"
        );
        Ok(self.table.len())
    }

    /// Moves an active session to `policy`.
    ///
    /// Strictly deletes every policy-owned table entry the new policy no
    /// longer has, installs the new rules and sends a barrier. Unchanged
    /// rules and learned rules are not touched. Rules a failed earlier update
    /// left in the table are removed as well.
    ///
    /// On failure the session stays active. The table keeps whatever was
    /// deleted or installed before the error and `policy_version` keeps the
    /// last fully applied version.
    #[instrument(skip(self, policy), fields(switch = %self.switch_id, version = policy.version()))]
    pub async fn apply_policy(
        &mut self,
        policy: Arc<CompiledPolicy>,
    ) -> Result<ReconcileReport, SessionError> {
        self.ensure_active()?;
        let switch_id = self.switch_id;
        let stale = self.table.stale_policy_rules(&policy);

        let removed = self
            .table
            .delete_rules(&stale)
            .await
            .map_err(|e| SessionError::transport(switch_id, e))?;
        let installed = self
            .table
            .install(policy.rules(), RuleOrigin::Policy)
            .await
            .map_err(|e| SessionError::transport(switch_id, e))?
            .installed;

        if self.barrier().await.map_err(|e| SessionError::transport(switch_id, e))?
            == BarrierOutcome::Cancelled
        {
            return Err(SessionError::StaleSession(switch_id));
        }

        self.policy = policy;
        let report = ReconcileReport {
            version: self.policy.version(),
            removed,
            installed,
        };
        info!(removed, installed, "policy reconciled");
        Ok(report)
    }

    /// Installs rules outside the compiled policy, such as learned forwarding
    /// entries, and waits for the barrier.
    #[instrument(skip(self, rules), fields(switch = %self.switch_id, count = rules.len()))]
    pub async fn install_rules(
        &mut self,
        rules: &[ForwardingRule],
    ) -> Result<InstallReport, SessionError> {
        self.ensure_active()?;
        let switch_id = self.switch_id;
        let report = self
            .table
            .install(rules, RuleOrigin::Learned)
            .await
            .map_err(|e| SessionError::transport(switch_id, e))?;
        if self.barrier().await.map_err(|e| SessionError::transport(switch_id, e))?
            == BarrierOutcome::Cancelled
        {
            return Err(SessionError::StaleSession(switch_id));
        }
        Ok(report)
    }

    /// Cancels pending barrier waits, closes the session and forgets its rules.
    ///
    /// Returns the number of table entries discarded.
    pub fn close(&mut self) -> usize {
        self.cancel.cancel();
        self.state = SessionState::Closed;
        let cleared = self.table.clear();
        info!(switch = %self.switch_id, cleared, "switch session closed");
        cleared
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            switch_id: self.switch_id,
            state: self.state,
            policy_version: self.policy.version(),
            entries: self.table.entries(),
        }
    }
}

//! Transport adapter contract and an in-memory implementation.
//!
//! The controller never encodes wire messages itself. A [`Transport`] turns
//! rule, delete and barrier requests into messages for one switch and
//! reports when they are done.
//!
//! [`MemoryTransport`] keeps a per-switch rule table and a log of every
//! request. It backs the daemon's simulation mode and the test suite, and
//! can inject install failures or hold barrier replies.

use async_trait::async_trait;
use ofguard_policy::ForwardingRule;
use ofguard_types::{OutputTarget, SwitchId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::TransportError;

/// Requests the controller sends towards a switch.
///
/// Install and strict delete are idempotent on the switch. A barrier
/// resolves once every earlier request to the same switch has taken effect.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn install_rule(
        &self,
        switch_id: SwitchId,
        rule: &ForwardingRule,
    ) -> Result<(), TransportError>;

    /// Deletes the rule with exactly this match and priority.
    async fn delete_rule(
        &self,
        switch_id: SwitchId,
        rule: &ForwardingRule,
    ) -> Result<(), TransportError>;

    /// Deletes every rule that outputs to `target`, at any priority.
    ///
    /// Returns the number of rules the switch removed, if it reports one.
    async fn delete_rules_by_output(
        &self,
        switch_id: SwitchId,
        target: OutputTarget,
    ) -> Result<usize, TransportError>;

    async fn send_barrier(&self, switch_id: SwitchId) -> Result<(), TransportError>;
}

/// A request as recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    FlowAdd {
        switch_id: SwitchId,
        rule: ForwardingRule,
    },
    FlowDeleteStrict {
        switch_id: SwitchId,
        rule: ForwardingRule,
    },
    FlowDeleteByOutput {
        switch_id: SwitchId,
        target: OutputTarget,
    },
    BarrierRequest {
        switch_id: SwitchId,
    },
}

impl WireMessage {
    pub fn switch_id(&self) -> SwitchId {
        match self {
            WireMessage::FlowAdd { switch_id, .. }
            | WireMessage::FlowDeleteStrict { switch_id, .. }
            | WireMessage::FlowDeleteByOutput { switch_id, .. }
            | WireMessage::BarrierRequest { switch_id } => *switch_id,
        }
    }

    pub fn is_flow_add(&self) -> bool {
        matches!(self, WireMessage::FlowAdd { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            WireMessage::FlowDeleteStrict { .. } | WireMessage::FlowDeleteByOutput { .. }
        )
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, WireMessage::BarrierRequest { .. })
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMessage::FlowAdd { switch_id, rule } => write!(f, "dp={} ADD {}", switch_id, rule),
            WireMessage::FlowDeleteStrict { switch_id, rule } => {
                write!(f, "dp={} DELETE_STRICT {}", switch_id, rule)
            }
            WireMessage::FlowDeleteByOutput { switch_id, target } => {
                write!(f, "dp={} DELETE out_port={}", switch_id, target)
            }
            WireMessage::BarrierRequest { switch_id } => write!(f, "dp={} BARRIER", switch_id),
        }
    }
}

#[derive(Default)]
struct State {
    log: Vec<WireMessage>,
    tables: HashMap<SwitchId, HashSet<ForwardingRule>>,
    failing_installs: HashMap<SwitchId, u32>,
    rejected_services: HashSet<(SwitchId, String)>,
    disconnected: HashSet<SwitchId>,
}

/// In-memory transport that records every request.
pub struct MemoryTransport {
    state: Mutex<State>,
    barriers_held: watch::Sender<bool>,
    barriers_sent: watch::Sender<usize>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            barriers_held: watch::Sender::new(false),
            barriers_sent: watch::Sender::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `count` installs to `switch_id` fail.
    pub fn fail_installs(&self, switch_id: SwitchId, count: u32) {
        self.lock().failing_installs.insert(switch_id, count);
    }

    /// Rejects every install to `switch_id` of rules generated for `service`.
    pub fn reject_service(&self, switch_id: SwitchId, service: impl Into<String>) {
        self.lock()
            .rejected_services
            .insert((switch_id, service.into()));
    }

    /// Makes every request to `switch_id` fail as disconnected.
    pub fn disconnect(&self, switch_id: SwitchId) {
        self.lock().disconnected.insert(switch_id);
    }

    /// While held, barrier requests are recorded but not answered.
    pub fn hold_barriers(&self) {
        self.barriers_held.send_replace(true);
    }

    pub fn release_barriers(&self) {
        self.barriers_held.send_replace(false);
    }

    /// Waits until at least `count` barrier requests have been sent in total.
    pub async fn barriers_requested(&self, count: usize) {
        let mut rx = self.barriers_sent.subscribe();
        // The sender lives as long as self, so this only ends on success.
        let _ = rx.wait_for(|sent| *sent >= count).await;
    }

    pub fn messages(&self) -> Vec<WireMessage> {
        self.lock().log.clone()
    }

    pub fn messages_for(&self, switch_id: SwitchId) -> Vec<WireMessage> {
        self.lock()
            .log
            .iter()
            .filter(|m| m.switch_id() == switch_id)
            .cloned()
            .collect()
    }

    pub fn clear_messages(&self) {
        self.lock().log.clear();
    }

    /// Rules the simulated switch currently holds.
    pub fn switch_rules(&self, switch_id: SwitchId) -> Vec<ForwardingRule> {
        let state = self.lock();
        let mut rules: Vec<_> = state
            .tables
            .get(&switch_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key().cmp(&b.key())));
        rules
    }

    fn check_connected(state: &State, switch_id: SwitchId) -> Result<(), TransportError> {
        if state.disconnected.contains(&switch_id) {
            return Err(TransportError::Disconnected(switch_id));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn install_rule(
        &self,
        switch_id: SwitchId,
        rule: &ForwardingRule,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::check_connected(&state, switch_id)?;
        state.log.push(WireMessage::FlowAdd {
            switch_id,
            rule: rule.clone(),
        });

        if state
            .rejected_services
            .contains(&(switch_id, rule.note.clone()))
        {
            return Err(TransportError::rejected(
                switch_id,
                "flow_mod",
                format!("service '{}' rejected", rule.note),
            ));
        }

        if let Some(remaining) = state.failing_installs.get_mut(&switch_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::rejected(
                    switch_id,
                    "flow_mod",
                    "injected failure",
                ));
            }
        }

        trace!(switch = %switch_id, %rule, "installed");
        state.tables.entry(switch_id).or_default().insert(rule.clone());
        Ok(())
    }

    async fn delete_rule(
        &self,
        switch_id: SwitchId,
        rule: &ForwardingRule,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::check_connected(&state, switch_id)?;
        state.log.push(WireMessage::FlowDeleteStrict {
            switch_id,
            rule: rule.clone(),
        });
        if let Some(table) = state.tables.get_mut(&switch_id) {
            table.remove(rule);
        }
        Ok(())
    }

    async fn delete_rules_by_output(
        &self,
        switch_id: SwitchId,
        target: OutputTarget,
    ) -> Result<usize, TransportError> {
        let mut state = self.lock();
        Self::check_connected(&state, switch_id)?;
        state
            .log
            .push(WireMessage::FlowDeleteByOutput { switch_id, target });

        let removed = match state.tables.get_mut(&switch_id) {
            Some(table) => {
                let before = table.len();
                table.retain(|rule| !rule.outputs_to(target));
                before - table.len()
            }
            None => 0,
        };
        debug!(switch = %switch_id, %target, removed, "deleted rules by output");
        Ok(removed)
    }

    async fn send_barrier(&self, switch_id: SwitchId) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            Self::check_connected(&state, switch_id)?;
            state.log.push(WireMessage::BarrierRequest { switch_id });
        }
        self.barriers_sent.send_modify(|sent| *sent += 1);

        let mut held = self.barriers_held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofguard_policy::FlowMatch;
    use ofguard_types::Ipv4Address;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn rule(last: u8, target: OutputTarget) -> ForwardingRule {
        ForwardingRule::new(FlowMatch::any_ipv4().with_ipv4_dst(Ipv4Address::new(10, 0, 0, last)))
            .with_priority(100)
            .with_output(target)
    }

    #[tokio::test]
    async fn test_records_messages() {
        let transport = MemoryTransport::new();
        let id = SwitchId::new(1);

        transport.install_rule(id, &rule(1, OutputTarget::port(3))).await.unwrap();
        transport.send_barrier(id).await.unwrap();

        let messages = transport.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_flow_add());
        assert!(messages[1].is_barrier());
        assert_eq!(transport.switch_rules(id).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_output() {
        let transport = MemoryTransport::new();
        let id = SwitchId::new(1);
        transport.install_rule(id, &rule(1, OutputTarget::port(3))).await.unwrap();
        transport.install_rule(id, &rule(2, OutputTarget::port(3))).await.unwrap();
        transport.install_rule(id, &rule(3, OutputTarget::port(4))).await.unwrap();

        let removed = transport
            .delete_rules_by_output(id, OutputTarget::port(3))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(transport.switch_rules(id), vec![rule(3, OutputTarget::port(4))]);

        let removed = transport
            .delete_rules_by_output(SwitchId::new(9), OutputTarget::port(3))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_injected_install_failures() {
        let transport = MemoryTransport::new();
        let id = SwitchId::new(5);
        transport.fail_installs(id, 1);

        let r = rule(1, OutputTarget::Normal);
        assert!(transport.install_rule(id, &r).await.is_err());
        assert!(transport.install_rule(id, &r).await.is_ok());
        assert_eq!(transport.messages_for(id).len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_service() {
        let transport = MemoryTransport::new();
        let id = SwitchId::new(5);
        transport.reject_service(id, "iot-to-admin");

        let rejected = rule(1, OutputTarget::Normal).with_note("iot-to-admin");
        let accepted = rule(2, OutputTarget::Normal).with_note("arp");
        assert!(matches!(
            transport.install_rule(id, &rejected).await,
            Err(TransportError::Rejected { .. })
        ));
        assert!(transport.install_rule(id, &accepted).await.is_ok());
        assert!(transport.install_rule(SwitchId::new(6), &rejected).await.is_ok());
        assert_eq!(transport.switch_rules(id), vec![accepted]);
    }

    #[tokio::test]
    async fn test_disconnected_switch() {
        let transport = MemoryTransport::new();
        let id = SwitchId::new(5);
        transport.disconnect(id);
        assert_eq!(
            transport.send_barrier(id).await,
            Err(TransportError::Disconnected(id))
        );
        assert!(transport.messages().is_empty());
    }

    #[tokio::test]
    async fn test_held_barrier_waits_for_release() {
        let transport = Arc::new(MemoryTransport::new());
        let id = SwitchId::new(1);
        transport.hold_barriers();

        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_barrier(id).await }
        });

        transport.barriers_requested(1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        transport.release_barriers();
        assert!(pending.await.unwrap().is_ok());
    }
}

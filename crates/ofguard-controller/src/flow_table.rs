//! Per-switch mirror of installed forwarding rules.
//!
//! The flow table records what the controller believes is installed on one
//! switch and drives the transport for every change. Callers must send a
//! barrier after a mutation before assuming the switch matches the table.

use ofguard_orch_common::RetryPolicy;
use ofguard_policy::{CompiledPolicy, ForwardingRule, RuleKey};
use ofguard_types::{OutputTarget, SwitchId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::TransportError;
use crate::transport::Transport;

/// Why a rule was installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOrigin {
    /// Generated from a compiled policy. Removed by reconciliation once no
    /// newer policy contains it.
    Policy,
    /// Installed outside the policy, e.g. a learned forwarding entry.
    Learned,
}

/// An installed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTableEntry {
    pub switch_id: SwitchId,
    pub rule: ForwardingRule,
    pub origin: RuleOrigin,
    /// Installation order on this switch, starting at 1.
    pub seq: u64,
}

/// Result of [`FlowTable::install`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Rules sent to the switch.
    pub installed: usize,
    /// Rules already present and skipped.
    pub skipped: usize,
}

/// Installed rules of one switch.
pub struct FlowTable {
    switch_id: SwitchId,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    entries: HashMap<RuleKey, FlowTableEntry>,
    next_seq: u64,
}

impl FlowTable {
    pub fn new(switch_id: SwitchId, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            switch_id,
            transport,
            retry,
            entries: HashMap::new(),
            next_seq: 1,
        }
    }

    pub fn switch_id(&self) -> SwitchId {
        self.switch_id
    }

    /// Installs every rule not already present, recording `origin`.
    ///
    /// Each install is retried per the retry policy. On failure the rules
    /// installed so far stay recorded and the error is returned. A learned
    /// entry that a policy also generates becomes policy-owned.
    #[instrument(skip(self, rules), fields(switch = %self.switch_id, count = rules.len(), ?origin))]
    pub async fn install(
        &mut self,
        rules: &[ForwardingRule],
        origin: RuleOrigin,
    ) -> Result<InstallReport, TransportError> {
        let mut report = InstallReport::default();

        for rule in rules {
            let key = rule.key();
            if let Some(entry) = self.entries.get_mut(&key) {
                if origin == RuleOrigin::Policy {
                    entry.origin = RuleOrigin::Policy;
                }
                report.skipped += 1;
                continue;
            }

            let transport = &self.transport;
            let switch_id = self.switch_id;
            self.retry
                .run("install_rule", || transport.install_rule(switch_id, rule))
                .await?;

            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.insert(
                key,
                FlowTableEntry {
                    switch_id,
                    rule: rule.clone(),
                    origin,
                    seq,
                },
            );
            report.installed += 1;
        }

        debug!(
            installed = report.installed,
            skipped = report.skipped,
            "install complete"
        );
        Ok(report)
    }

    /// Removes every entry that forwards to `target`.
    ///
    /// Sends one delete-by-output request even when no entry matches, so
    /// rules the table never saw are purged too. Returns the number of table
    /// entries removed.
    #[instrument(skip(self), fields(switch = %self.switch_id))]
    pub async fn delete_by_output(&mut self, target: OutputTarget) -> Result<usize, TransportError> {
        let transport = &self.transport;
        let switch_id = self.switch_id;
        let switch_removed = self
            .retry
            .run("delete_rules_by_output", || {
                transport.delete_rules_by_output(switch_id, target)
            })
            .await?;

        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.rule.outputs_to(target));
        let removed = before - self.entries.len();

        if switch_removed != removed {
            debug!(removed, switch_removed, "switch and table disagree on deleted count");
        }
        Ok(removed)
    }

    /// Strictly deletes the given rules. Rules not in the table are skipped.
    #[instrument(skip(self, rules), fields(switch = %self.switch_id, count = rules.len()))]
    pub async fn delete_rules(&mut self, rules: &[ForwardingRule]) -> Result<usize, TransportError> {
        let mut removed = 0;
        for rule in rules {
            let key = rule.key();
            if !self.entries.contains_key(&key) {
                continue;
            }

            let transport = &self.transport;
            let switch_id = self.switch_id;
            self.retry
                .run("delete_rule", || transport.delete_rule(switch_id, rule))
                .await?;
            self.entries.remove(&key);
            removed += 1;
        }
        Ok(removed)
    }

    /// Asks the switch to confirm every earlier request.
    pub async fn barrier(&self) -> Result<(), TransportError> {
        self.transport.send_barrier(self.switch_id).await
    }

    /// Forgets every entry without telling the switch.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, rule: &ForwardingRule) -> bool {
        self.entries.contains_key(&rule.key())
    }

    /// Entries in installation order.
    pub fn entries(&self) -> Vec<FlowTableEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Policy-owned entries that `policy` no longer generates, in
    /// installation order. Learned entries are never included.
    pub fn stale_policy_rules(&self, policy: &CompiledPolicy) -> Vec<ForwardingRule> {
        let keep: HashSet<RuleKey> = policy.rules().iter().map(ForwardingRule::key).collect();
        let mut stale: Vec<&FlowTableEntry> = self
            .entries
            .iter()
            .filter(|(key, e)| e.origin == RuleOrigin::Policy && !keep.contains(*key))
            .map(|(_, e)| e)
            .collect();
        stale.sort_by_key(|e| e.seq);
        stale.into_iter().map(|e| e.rule.clone()).collect()
    }

    pub fn count_by_output(&self, target: OutputTarget) -> usize {
        self.entries
            .values()
            .filter(|e| e.rule.outputs_to(target))
            .count()
    }
}

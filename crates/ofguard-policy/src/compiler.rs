//! Policy compiler.
//!
//! [`compile`] expands every service rule over the addresses of its groups
//! and places the results in priority bands. Each service takes one slot of
//! its band, counted down from the band ceiling in declaration order, and
//! every rule expanded from that service shares the slot. Appending a
//! service or adding an address to a group therefore leaves the priorities
//! of all existing rules untouched.

use ofguard_types::{Ipv4Address, OutputTarget};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ConflictError, PolicyError, PolicyResult};
use crate::model::{PolicyModel, ServiceRule};
use crate::rule::{FlowAction, FlowMatch, ForwardingRule, RuleKey};
use crate::types::{PriorityBand, Verdict};

const DEFAULT_NOTE: &str = "default";

/// Compiles a policy into forwarding rules sorted by descending priority.
///
/// The result is a pure function of the policy, including rule order.
/// Nothing is returned unless the whole policy compiles.
pub fn compile(policy: &PolicyModel) -> PolicyResult<Vec<ForwardingRule>> {
    policy.validate_groups()?;

    let mut rules = Vec::new();
    let mut deny_slots = 0usize;
    let mut allow_slots = 0usize;

    for service in &policy.services {
        service.validate()?;

        let band = service.verdict.band();
        let used = match service.verdict {
            Verdict::Deny => &mut deny_slots,
            Verdict::Allow => &mut allow_slots,
        };
        let priority = band.slot(*used).ok_or(PolicyError::BandExhausted {
            band,
            allocated: *used,
        })?;
        *used += 1;

        let actions = actions_for(service.verdict, policy.forward_to);
        for matches in expand(policy, service)? {
            rules.push(ForwardingRule {
                matches,
                priority,
                actions: actions.clone(),
                note: service.name.clone(),
            });
        }
    }

    rules.push(ForwardingRule {
        matches: FlowMatch::any_ipv4(),
        priority: PriorityBand::DEFAULT_PRIORITY,
        actions: actions_for(policy.default_action, policy.forward_to),
        note: DEFAULT_NOTE.to_string(),
    });

    check_conflicts(&rules)?;

    // Stable sort keeps generation order within a priority.
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));

    for rule in &rules {
        debug!(note = %rule.note, "{}", rule);
    }
    info!(
        services = policy.services.len(),
        rules = rules.len(),
        default = %policy.default_action,
        "Compiled policy"
    );

    Ok(rules)
}

fn actions_for(verdict: Verdict, forward_to: OutputTarget) -> Vec<FlowAction> {
    match verdict {
        Verdict::Allow => vec![FlowAction::Output(forward_to)],
        Verdict::Deny => Vec::new(),
    }
}

fn endpoints(
    policy: &PolicyModel,
    service: &ServiceRule,
    group: Option<&str>,
) -> PolicyResult<Vec<Option<Ipv4Address>>> {
    match group {
        None => Ok(vec![None]),
        Some(name) => policy
            .group(name)
            .map(|g| g.addresses.iter().copied().map(Some).collect())
            .ok_or_else(|| PolicyError::UnknownGroup {
                service: service.name.clone(),
                group: name.to_string(),
            }),
    }
}

/// Builds the match predicates of one service.
///
/// Order: source address, then destination address, forward before return.
fn expand(policy: &PolicyModel, service: &ServiceRule) -> PolicyResult<Vec<FlowMatch>> {
    let sources = endpoints(policy, service, service.src_group.as_deref())?;
    let destinations = endpoints(policy, service, service.dst_group.as_deref())?;

    let mut base = FlowMatch::new().with_eth_type(service.protocol.ether_type());
    if let Some(proto) = service.protocol.ip_proto() {
        base = base.with_ip_proto(proto);
    }
    if let Some(icmp_type) = service.icmp_type {
        base = base.with_icmp_type(icmp_type);
    }

    let mut matches = Vec::new();
    for src in &sources {
        for dst in &destinations {
            let forward = directed(base.clone(), *src, *dst, service.port.map(Port::Dst));
            if service.bidirectional {
                let reverse = directed(base.clone(), *dst, *src, service.port.map(Port::Src));
                let symmetric = reverse == forward;
                matches.push(forward);
                if !symmetric {
                    matches.push(reverse);
                }
            } else {
                matches.push(forward);
            }
        }
    }
    Ok(matches)
}

enum Port {
    Src(u16),
    Dst(u16),
}

fn directed(
    mut m: FlowMatch,
    src: Option<Ipv4Address>,
    dst: Option<Ipv4Address>,
    port: Option<Port>,
) -> FlowMatch {
    if let Some(src) = src {
        m = m.with_ipv4_src(src);
    }
    if let Some(dst) = dst {
        m = m.with_ipv4_dst(dst);
    }
    match port {
        Some(Port::Src(p)) => m.with_tp_src(p),
        Some(Port::Dst(p)) => m.with_tp_dst(p),
        None => m,
    }
}

fn check_conflicts(rules: &[ForwardingRule]) -> Result<(), ConflictError> {
    let mut owners: HashMap<&FlowMatch, &str> = HashMap::with_capacity(rules.len());
    for rule in rules {
        if let Some(first) = owners.insert(&rule.matches, rule.note.as_str()) {
            return Err(ConflictError::DuplicateMatch {
                first: first.to_string(),
                second: rule.note.clone(),
                predicate: rule.matches.to_string(),
            });
        }
    }
    Ok(())
}

/// Rules to remove and to add when moving from one compiled policy to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDiff {
    pub removed: Vec<ForwardingRule>,
    pub added: Vec<ForwardingRule>,
}

impl PolicyDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// A versioned compilation result, shared read-only between sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPolicy {
    version: u64,
    rules: Vec<ForwardingRule>,
}

impl CompiledPolicy {
    pub fn new(version: u64, rules: Vec<ForwardingRule>) -> Self {
        Self { version, rules }
    }

    /// Compiles `policy` and tags the result with `version`.
    pub fn compile(policy: &PolicyModel, version: u64) -> PolicyResult<Arc<Self>> {
        Ok(Arc::new(Self::new(version, compile(policy)?)))
    }

    /// Version 0, no rules. Installed before any policy is loaded.
    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[ForwardingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains(&self, rule: &ForwardingRule) -> bool {
        self.rules.iter().any(|r| r == rule)
    }

    /// Rules present only in `self` (removed) and only in `newer` (added).
    pub fn diff(&self, newer: &CompiledPolicy) -> PolicyDiff {
        let old: HashSet<RuleKey> = self.rules.iter().map(ForwardingRule::key).collect();
        let new: HashSet<RuleKey> = newer.rules.iter().map(ForwardingRule::key).collect();

        PolicyDiff {
            removed: self
                .rules
                .iter()
                .filter(|r| !new.contains(&r.key()))
                .cloned()
                .collect(),
            added: newer
                .rules
                .iter()
                .filter(|r| !old.contains(&r.key()))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use ofguard_types::{EtherType, IpProtocol};
    use pretty_assertions::assert_eq;

    fn addr(last: u8) -> Ipv4Address {
        Ipv4Address::new(10, 0, 0, last)
    }

    /// Admin and student hosts with ARP, ICMP and admin SSH allowed and
    /// student echo requests to admins denied.
    fn ssh_policy() -> PolicyModel {
        PolicyModel::new()
            .with_group("admin", [addr(1), addr(2)])
            .with_group("student", [addr(3), addr(4)])
            .with_service(ServiceRule::allow("arp", Protocol::Arp))
            .with_service(ServiceRule::allow("icmp", Protocol::Icmp))
            .with_service(
                ServiceRule::allow("ssh-admin", Protocol::Tcp)
                    .from_group("admin")
                    .with_port(22)
                    .bidirectional(),
            )
            .with_service(
                ServiceRule::deny("student-ping-admin", Protocol::Icmp)
                    .from_group("student")
                    .to_group("admin")
                    .with_icmp_type(8),
            )
    }

    fn count_note(rules: &[ForwardingRule], note: &str) -> usize {
        rules.iter().filter(|r| r.note == note).count()
    }

    #[test]
    fn test_ssh_policy_counts() {
        let rules = compile(&ssh_policy()).unwrap();

        assert_eq!(rules.len(), 11);
        assert_eq!(count_note(&rules, "arp"), 1);
        assert_eq!(count_note(&rules, "icmp"), 1);
        assert_eq!(count_note(&rules, "ssh-admin"), 4);
        assert_eq!(count_note(&rules, "student-ping-admin"), 4);
        assert_eq!(count_note(&rules, "default"), 1);
    }

    #[test]
    fn test_ssh_policy_bands() {
        let rules = compile(&ssh_policy()).unwrap();

        let deny_min = rules
            .iter()
            .filter(|r| r.note == "student-ping-admin")
            .map(|r| r.priority)
            .min()
            .unwrap();
        let allow_max = rules
            .iter()
            .filter(|r| !r.is_drop())
            .map(|r| r.priority)
            .max()
            .unwrap();
        assert!(deny_min > allow_max);

        for rule in &rules {
            let band = PriorityBand::of(rule.priority).unwrap();
            match rule.note.as_str() {
                "default" => assert_eq!(band, PriorityBand::Default),
                "student-ping-admin" => assert_eq!(band, PriorityBand::Deny),
                _ => assert_eq!(band, PriorityBand::Allow),
            }
        }

        let last = rules.last().unwrap();
        assert_eq!(last.priority, 10);
        assert_eq!(last.matches, FlowMatch::any_ipv4());
        assert!(last.is_drop());
    }

    #[test]
    fn test_output_sorted_by_descending_priority() {
        let rules = compile(&ssh_policy()).unwrap();
        assert!(rules.windows(2).all(|w| w[0].priority >= w[1].priority));
        assert_eq!(rules[0].note, "student-ping-admin");
        assert_eq!(rules[0].priority, 40_000);
    }

    #[test]
    fn test_slots_follow_declaration_order() {
        let rules = compile(&ssh_policy()).unwrap();
        let priority_of = |note: &str| {
            rules
                .iter()
                .find(|r| r.note == note)
                .map(|r| r.priority)
                .unwrap()
        };
        assert_eq!(priority_of("arp"), 30_000);
        assert_eq!(priority_of("icmp"), 29_999);
        assert_eq!(priority_of("ssh-admin"), 29_998);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let a = compile(&ssh_policy()).unwrap();
        let b = compile(&ssh_policy()).unwrap();
        assert_eq!(a, b);
        let notes_a: Vec<_> = a.iter().map(|r| r.note.clone()).collect();
        let notes_b: Vec<_> = b.iter().map(|r| r.note.clone()).collect();
        assert_eq!(notes_a, notes_b);
    }

    #[test]
    fn test_match_predicates_are_unique() {
        let rules = compile(&PolicyModel::reference()).unwrap();
        let unique: HashSet<_> = rules.iter().map(|r| &r.matches).collect();
        assert_eq!(unique.len(), rules.len());
    }

    #[test]
    fn test_ssh_expansion() {
        let rules = compile(&ssh_policy()).unwrap();
        let ssh: Vec<_> = rules
            .iter()
            .filter(|r| r.note == "ssh-admin")
            .map(|r| r.matches.to_string())
            .collect();
        assert_eq!(
            ssh,
            vec![
                "eth_type=0x0800,ip_proto=tcp,ipv4_src=10.0.0.1,tp_dst=22",
                "eth_type=0x0800,ip_proto=tcp,ipv4_dst=10.0.0.1,tp_src=22",
                "eth_type=0x0800,ip_proto=tcp,ipv4_src=10.0.0.2,tp_dst=22",
                "eth_type=0x0800,ip_proto=tcp,ipv4_dst=10.0.0.2,tp_src=22",
            ]
        );
        assert!(rules
            .iter()
            .filter(|r| r.note == "ssh-admin")
            .all(|r| r.outputs_to(OutputTarget::Normal)));
    }

    #[test]
    fn test_deny_beats_overlapping_allow() {
        let rules = compile(&ssh_policy()).unwrap();
        let icmp_allow = rules.iter().find(|r| r.note == "icmp").unwrap();
        for deny in rules.iter().filter(|r| r.note == "student-ping-admin") {
            assert!(deny.matches.overlaps(&icmp_allow.matches));
            assert!(deny.priority > icmp_allow.priority);
            assert_eq!(
                deny.matches.get(crate::types::MatchField::IcmpType),
                Some(&crate::rule::MatchValue::IcmpType(8))
            );
        }
    }

    #[test]
    fn test_default_rule_is_broadest_and_lowest() {
        let rules = compile(&PolicyModel::reference()).unwrap();
        let default = rules.last().unwrap();
        assert_eq!(default.note, "default");
        for rule in &rules[..rules.len() - 1] {
            assert!(rule.priority > default.priority);
            if rule.matches.get(crate::types::MatchField::EthType)
                == Some(&crate::rule::MatchValue::EtherType(EtherType::IPV4))
            {
                assert!(default.matches.covers(&rule.matches));
            }
        }
    }

    #[test]
    fn test_default_allow_forwards() {
        let policy = PolicyModel::new()
            .with_default_action(Verdict::Allow)
            .with_forward_to(OutputTarget::Flood);
        let rules = compile(&policy).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].actions, vec![FlowAction::Output(OutputTarget::Flood)]);
    }

    #[test]
    fn test_reference_policy() {
        let rules = compile(&PolicyModel::reference()).unwrap();
        // 4 echo-request denies, 4 student->iot denies, arp, icmp, 4 ssh, default
        assert_eq!(rules.len(), 15);
        assert_eq!(count_note(&rules, "student-to-iot"), 4);

        let iot_deny = rules.iter().find(|r| r.note == "student-to-iot").unwrap();
        assert_eq!(iot_deny.priority, 39_999);
        assert_eq!(iot_deny.matches.get(crate::types::MatchField::IpProto), None);
        assert!(iot_deny.is_drop());
    }

    #[test]
    fn test_duplicate_match_conflict() {
        let policy = PolicyModel::new()
            .with_group("admin", [addr(1)])
            .with_service(ServiceRule::allow("web", Protocol::Tcp).to_group("admin").with_port(80))
            .with_service(ServiceRule::deny("no-web", Protocol::Tcp).to_group("admin").with_port(80));

        let err = compile(&policy).unwrap_err();
        match err {
            PolicyError::Conflict(ConflictError::DuplicateMatch { first, second, predicate }) => {
                assert_eq!(first, "web");
                assert_eq!(second, "no-web");
                assert_eq!(predicate, "eth_type=0x0800,ip_proto=tcp,ipv4_dst=10.0.0.1,tp_dst=80");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_service_shadowing_default_conflicts() {
        let policy = PolicyModel::new().with_service(ServiceRule::allow("any", Protocol::Ipv4));
        let err = compile(&policy).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::Conflict(ConflictError::DuplicateMatch { ref second, .. }) if second == "default"
        ));
    }

    #[test]
    fn test_overlapping_groups_fail_compile() {
        let policy = ssh_policy().with_group("iot", [addr(4)]);
        assert!(matches!(
            compile(&policy).unwrap_err(),
            PolicyError::Conflict(ConflictError::OverlappingGroups { .. })
        ));
    }

    #[test]
    fn test_unknown_group() {
        let policy = PolicyModel::new()
            .with_service(ServiceRule::allow("ssh", Protocol::Tcp).from_group("ops").with_port(22));
        assert!(matches!(
            compile(&policy).unwrap_err(),
            PolicyError::UnknownGroup { service, group } if service == "ssh" && group == "ops"
        ));
    }

    #[test]
    fn test_invalid_service_fails_compile() {
        let policy = PolicyModel::new().with_service(ServiceRule::allow("bad", Protocol::Icmp).with_port(1));
        assert!(matches!(
            compile(&policy).unwrap_err(),
            PolicyError::InvalidService { .. }
        ));
    }

    #[test]
    fn test_symmetric_bidirectional_emits_once() {
        let policy = PolicyModel::new()
            .with_service(ServiceRule::allow("dns", Protocol::Udp).with_port(53).bidirectional())
            .with_service(ServiceRule::allow("icmp-any", Protocol::Icmp).bidirectional());
        let rules = compile(&policy).unwrap();
        assert_eq!(count_note(&rules, "dns"), 2);
        assert_eq!(count_note(&rules, "icmp-any"), 1);
        assert_eq!(
            rules.iter().find(|r| r.note == "icmp-any").unwrap().matches,
            FlowMatch::any_ipv4().with_ip_proto(IpProtocol::ICMP)
        );
    }

    #[test]
    fn test_band_exhausted() {
        let mut policy = PolicyModel::new();
        for port in 0..=PriorityBand::Allow.capacity() as u16 {
            policy = policy.with_service(ServiceRule::allow(format!("svc-{port}"), Protocol::Tcp).with_port(port));
        }
        assert!(matches!(
            compile(&policy).unwrap_err(),
            PolicyError::BandExhausted { band: PriorityBand::Allow, allocated: 10_000 }
        ));
    }

    #[test]
    fn test_appending_service_keeps_existing_rules() {
        let before = CompiledPolicy::new(1, compile(&ssh_policy()).unwrap());
        let updated = ssh_policy().with_service(
            ServiceRule::deny("student-ssh-admin", Protocol::Tcp)
                .from_group("student")
                .to_group("admin")
                .with_port(22),
        );
        let after = CompiledPolicy::new(2, compile(&updated).unwrap());

        let diff = before.diff(&after);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.added.len(), 4);
        assert!(diff.added.iter().all(|r| r.priority == 39_999));
    }

    #[test]
    fn test_diff_detects_removed() {
        let before = CompiledPolicy::new(1, compile(&ssh_policy()).unwrap());
        let mut reduced = ssh_policy();
        reduced.services.retain(|s| s.name != "student-ping-admin");
        let after = CompiledPolicy::new(2, compile(&reduced).unwrap());

        let diff = before.diff(&after);
        assert_eq!(diff.removed.len(), 4);
        assert!(diff.added.is_empty());
        assert!(!diff.is_empty());
        assert!(before.diff(&before).is_empty());
    }

    #[test]
    fn test_compiled_policy_accessors() {
        let compiled = CompiledPolicy::compile(&ssh_policy(), 3).unwrap();
        assert_eq!(compiled.version(), 3);
        assert_eq!(compiled.len(), 11);
        assert!(compiled.contains(&compiled.rules()[0]));
        assert!(CompiledPolicy::empty().is_empty());
    }
}

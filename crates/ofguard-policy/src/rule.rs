//! Compiled forwarding rules.

use ofguard_types::{EtherType, IpProtocol, Ipv4Address, OutputTarget};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::types::MatchField;

/// Value a match field is constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchValue {
    EtherType(EtherType),
    IpProtocol(IpProtocol),
    Ipv4(Ipv4Address),
    L4Port(u16),
    IcmpType(u8),
}

impl fmt::Display for MatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchValue::EtherType(v) => write!(f, "{}", v),
            MatchValue::IpProtocol(v) => write!(f, "{}", v),
            MatchValue::Ipv4(v) => write!(f, "{}", v),
            MatchValue::L4Port(v) => write!(f, "{}", v),
            MatchValue::IcmpType(v) => write!(f, "{}", v),
        }
    }
}

/// Match predicate: a set of field constraints, at most one per field.
///
/// An empty predicate matches every packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowMatch {
    fields: BTreeMap<MatchField, MatchValue>,
}

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches every IPv4 packet.
    pub fn any_ipv4() -> Self {
        Self::new().with_eth_type(EtherType::IPV4)
    }

    fn with(mut self, field: MatchField, value: MatchValue) -> Self {
        self.fields.insert(field, value);
        self
    }

    pub fn with_eth_type(self, eth_type: EtherType) -> Self {
        self.with(MatchField::EthType, MatchValue::EtherType(eth_type))
    }

    pub fn with_ip_proto(self, proto: IpProtocol) -> Self {
        self.with(MatchField::IpProto, MatchValue::IpProtocol(proto))
    }

    pub fn with_ipv4_src(self, addr: Ipv4Address) -> Self {
        self.with(MatchField::Ipv4Src, MatchValue::Ipv4(addr))
    }

    pub fn with_ipv4_dst(self, addr: Ipv4Address) -> Self {
        self.with(MatchField::Ipv4Dst, MatchValue::Ipv4(addr))
    }

    pub fn with_tp_src(self, port: u16) -> Self {
        self.with(MatchField::TpSrc, MatchValue::L4Port(port))
    }

    pub fn with_tp_dst(self, port: u16) -> Self {
        self.with(MatchField::TpDst, MatchValue::L4Port(port))
    }

    pub fn with_icmp_type(self, icmp_type: u8) -> Self {
        self.with(MatchField::IcmpType, MatchValue::IcmpType(icmp_type))
    }

    pub fn get(&self, field: MatchField) -> Option<&MatchValue> {
        self.fields.get(&field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates constraints in canonical field order.
    pub fn iter(&self) -> impl Iterator<Item = (MatchField, &MatchValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    /// Returns true if some packet can satisfy both predicates.
    pub fn overlaps(&self, other: &FlowMatch) -> bool {
        self.fields
            .iter()
            .all(|(field, value)| other.fields.get(field).map_or(true, |v| v == value))
    }

    /// Returns true if every packet matched by `other` is also matched by `self`.
    pub fn covers(&self, other: &FlowMatch) -> bool {
        self.fields
            .iter()
            .all(|(field, value)| other.fields.get(field) == Some(value))
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            return write!(f, "*");
        }
        let mut first = true;
        for (field, value) in &self.fields {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", field, value)?;
            first = false;
        }
        Ok(())
    }
}

/// Action applied to matching packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowAction {
    Output(OutputTarget),
}

impl FlowAction {
    pub fn output(target: OutputTarget) -> Self {
        FlowAction::Output(target)
    }

    pub fn target(&self) -> OutputTarget {
        match self {
            FlowAction::Output(target) => *target,
        }
    }
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAction::Output(target) => write!(f, "output:{}", target),
        }
    }
}

/// Identity of a forwarding rule on a switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub matches: FlowMatch,
    pub priority: u16,
    pub actions: Vec<FlowAction>,
}

/// A switch-facing rule: match predicate, priority and actions.
///
/// Two rules are the same rule when predicate, priority and action list are
/// equal. The note is informational and does not take part in equality.
#[derive(Debug, Clone)]
pub struct ForwardingRule {
    pub matches: FlowMatch,
    /// Higher wins when predicates overlap.
    pub priority: u16,
    /// Empty means drop.
    pub actions: Vec<FlowAction>,
    /// Name of the service the rule was generated from.
    pub note: String,
}

impl ForwardingRule {
    pub fn new(matches: FlowMatch) -> Self {
        Self {
            matches,
            priority: 0,
            actions: Vec::new(),
            note: String::new(),
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action(mut self, action: FlowAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_output(self, target: OutputTarget) -> Self {
        self.with_action(FlowAction::Output(target))
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn is_drop(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns true if any action forwards to `target`.
    pub fn outputs_to(&self, target: OutputTarget) -> bool {
        self.actions.iter().any(|a| a.target() == target)
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            matches: self.matches.clone(),
            priority: self.priority,
            actions: self.actions.clone(),
        }
    }
}

impl PartialEq for ForwardingRule {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
            && self.matches == other.matches
            && self.actions == other.actions
    }
}

impl Eq for ForwardingRule {}

impl Hash for ForwardingRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.matches.hash(state);
        self.priority.hash(state);
        self.actions.hash(state);
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority={} match=[{}] actions=[", self.priority, self.matches)?;
        if self.actions.is_empty() {
            write!(f, "drop")?;
        }
        for (i, action) in self.actions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", action)?;
        }
        write!(f, "]")
    }
}

//! Policy vocabulary: verdicts, protocols, match fields and priority bands.

use ofguard_types::{EtherType, IpProtocol};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether a service rule permits or blocks its traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    #[default]
    Deny,
}

impl Verdict {
    /// Band a rule with this verdict is placed in.
    pub const fn band(&self) -> PriorityBand {
        match self {
            Verdict::Allow => PriorityBand::Allow,
            Verdict::Deny => PriorityBand::Deny,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "allow"),
            Verdict::Deny => write!(f, "deny"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" | "permit" => Ok(Verdict::Allow),
            "deny" | "drop" => Ok(Verdict::Deny),
            _ => Err(format!("Unknown verdict: {}", s)),
        }
    }
}

/// Traffic class a service rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Address resolution. Never scoped to groups.
    Arp,
    Icmp,
    Tcp,
    Udp,
    /// Any IPv4 traffic.
    Ipv4,
}

impl Protocol {
    pub const fn ether_type(&self) -> EtherType {
        match self {
            Protocol::Arp => EtherType::ARP,
            _ => EtherType::IPV4,
        }
    }

    pub const fn ip_proto(&self) -> Option<IpProtocol> {
        match self {
            Protocol::Icmp => Some(IpProtocol::ICMP),
            Protocol::Tcp => Some(IpProtocol::TCP),
            Protocol::Udp => Some(IpProtocol::UDP),
            Protocol::Arp | Protocol::Ipv4 => None,
        }
    }

    /// Whether rules of this protocol can match on transport ports.
    pub const fn has_ports(&self) -> bool {
        match self.ip_proto() {
            Some(proto) => proto.has_ports(),
            None => false,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Arp => "arp",
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Ipv4 => "ipv4",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "arp" => Ok(Protocol::Arp),
            "icmp" => Ok(Protocol::Icmp),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "ipv4" | "ip" => Ok(Protocol::Ipv4),
            _ => Err(format!("Unknown protocol: {}", s)),
        }
    }
}

/// Packet header fields a forwarding rule can constrain.
///
/// The declaration order is the canonical field order of a match predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchField {
    EthType,
    IpProto,
    Ipv4Src,
    Ipv4Dst,
    TpSrc,
    TpDst,
    IcmpType,
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchField::EthType => "eth_type",
            MatchField::IpProto => "ip_proto",
            MatchField::Ipv4Src => "ipv4_src",
            MatchField::Ipv4Dst => "ipv4_dst",
            MatchField::TpSrc => "tp_src",
            MatchField::TpDst => "tp_dst",
            MatchField::IcmpType => "icmp_type",
        };
        f.write_str(name)
    }
}

/// Reserved priority range for one policy category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriorityBand {
    /// Explicit denies, `30_001..=40_000`.
    Deny,
    /// Explicit allows, `20_001..=30_000`.
    Allow,
    /// The single catch-all rule, priority `10`.
    Default,
}

impl PriorityBand {
    pub const DENY_CEILING: u16 = 40_000;
    pub const ALLOW_CEILING: u16 = 30_000;
    pub const ALLOW_FLOOR: u16 = 20_001;
    pub const DEFAULT_PRIORITY: u16 = 10;

    /// Highest priority in the band.
    pub const fn ceiling(&self) -> u16 {
        match self {
            PriorityBand::Deny => Self::DENY_CEILING,
            PriorityBand::Allow => Self::ALLOW_CEILING,
            PriorityBand::Default => Self::DEFAULT_PRIORITY,
        }
    }

    /// Lowest priority in the band.
    pub const fn floor(&self) -> u16 {
        match self {
            PriorityBand::Deny => Self::ALLOW_CEILING + 1,
            PriorityBand::Allow => Self::ALLOW_FLOOR,
            PriorityBand::Default => Self::DEFAULT_PRIORITY,
        }
    }

    /// Number of distinct priorities in the band.
    pub const fn capacity(&self) -> usize {
        (self.ceiling() - self.floor()) as usize + 1
    }

    pub const fn contains(&self, priority: u16) -> bool {
        priority >= self.floor() && priority <= self.ceiling()
    }

    /// Priority of the `index`-th slot counted down from the ceiling.
    pub fn slot(&self, index: usize) -> Option<u16> {
        if index >= self.capacity() {
            return None;
        }
        Some(self.ceiling() - index as u16)
    }

    /// Band a priority falls in, if any.
    pub fn of(priority: u16) -> Option<Self> {
        [PriorityBand::Deny, PriorityBand::Allow, PriorityBand::Default]
            .into_iter()
            .find(|band| band.contains(priority))
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityBand::Deny => write!(f, "deny"),
            PriorityBand::Allow => write!(f, "allow"),
            PriorityBand::Default => write!(f, "default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_parse() {
        assert_eq!("allow".parse::<Verdict>().unwrap(), Verdict::Allow);
        assert_eq!("DROP".parse::<Verdict>().unwrap(), Verdict::Deny);
        assert!("maybe".parse::<Verdict>().is_err());
        assert_eq!(Verdict::default(), Verdict::Deny);
    }

    #[test]
    fn test_protocol_fields() {
        assert_eq!(Protocol::Arp.ether_type(), EtherType::ARP);
        assert_eq!(Protocol::Tcp.ether_type(), EtherType::IPV4);
        assert_eq!(Protocol::Icmp.ip_proto(), Some(IpProtocol::ICMP));
        assert_eq!(Protocol::Ipv4.ip_proto(), None);
        assert!(Protocol::Udp.has_ports());
        assert!(!Protocol::Icmp.has_ports());
        assert_eq!("ip".parse::<Protocol>().unwrap(), Protocol::Ipv4);
    }

    #[test]
    fn test_bands_are_disjoint_and_ordered() {
        assert!(PriorityBand::Deny.floor() > PriorityBand::Allow.ceiling());
        assert!(PriorityBand::Allow.floor() > PriorityBand::Default.ceiling());
        assert_eq!(PriorityBand::Deny.capacity(), 10_000);
        assert_eq!(PriorityBand::Allow.capacity(), 10_000);
        assert_eq!(PriorityBand::Default.capacity(), 1);
    }

    #[test]
    fn test_band_slots() {
        assert_eq!(PriorityBand::Deny.slot(0), Some(40_000));
        assert_eq!(PriorityBand::Deny.slot(9_999), Some(30_001));
        assert_eq!(PriorityBand::Deny.slot(10_000), None);
        assert_eq!(PriorityBand::Allow.slot(1), Some(29_999));
        assert_eq!(PriorityBand::Default.slot(0), Some(10));
        assert_eq!(PriorityBand::Default.slot(1), None);
    }

    #[test]
    fn test_band_of() {
        assert_eq!(PriorityBand::of(35_000), Some(PriorityBand::Deny));
        assert_eq!(PriorityBand::of(30_000), Some(PriorityBand::Allow));
        assert_eq!(PriorityBand::of(10), Some(PriorityBand::Default));
        assert_eq!(PriorityBand::of(500), None);
    }
}

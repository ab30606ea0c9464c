//! Well-known header field values used in match predicates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ethernet frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EtherType(u16);

impl EtherType {
    pub const IPV4: EtherType = EtherType(0x0800);
    pub const ARP: EtherType = EtherType(0x0806);

    pub const fn new(value: u16) -> Self {
        EtherType(value)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// IPv4 protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpProtocol(u8);

impl IpProtocol {
    pub const ICMP: IpProtocol = IpProtocol(1);
    pub const TCP: IpProtocol = IpProtocol(6);
    pub const UDP: IpProtocol = IpProtocol(17);

    pub const fn new(value: u8) -> Self {
        IpProtocol(value)
    }

    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns true for protocols that carry transport port numbers.
    pub const fn has_ports(&self) -> bool {
        self.0 == Self::TCP.0 || self.0 == Self::UDP.0
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IpProtocol::ICMP => write!(f, "icmp"),
            IpProtocol::TCP => write!(f, "tcp"),
            IpProtocol::UDP => write!(f, "udp"),
            IpProtocol(other) => write!(f, "{}", other),
        }
    }
}

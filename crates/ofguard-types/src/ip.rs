//! IPv4 host addresses.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 host address as it appears in a principal group or a match field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address(Ipv4Addr::new(a, b, c, d))
    }

    /// Whether the address can name a single host.
    ///
    /// 0.0.0.0, 255.255.255.255 and multicast addresses cannot.
    pub fn is_host(&self) -> bool {
        !(self.0.is_unspecified() || self.0.is_broadcast() || self.0.is_multicast())
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv4Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = s
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))?;
        Ok(Ipv4Address(addr))
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(addr: Ipv4Addr) -> Self {
        Ipv4Address(addr)
    }
}

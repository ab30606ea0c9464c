//! Port identity, port status and forwarding output targets.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical or logical port number on a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNo(u32);

impl PortNo {
    /// Highest port number usable for a real port (OpenFlow 1.3 `OFPP_MAX`).
    pub const MAX: u32 = 0xffff_ff00;

    pub const fn new(port: u32) -> Self {
        PortNo(port)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PortNo {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u32>() {
            Ok(port) if port <= Self::MAX => Ok(PortNo(port)),
            _ => Err(ParseError::InvalidPortNo(s.to_string())),
        }
    }
}

impl From<u32> for PortNo {
    fn from(port: u32) -> Self {
        PortNo(port)
    }
}

/// Raw port state flags as reported in a port status message.
///
/// Bit values follow OpenFlow 1.3 `ofp_port_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortState(u32);

impl PortState {
    /// No physical link present.
    pub const LINK_DOWN: PortState = PortState(0x1);
    /// Port is blocked (e.g. by spanning tree).
    pub const BLOCKED: PortState = PortState(0x2);
    /// Live for fast failover groups.
    pub const LIVE: PortState = PortState(0x4);

    pub const fn from_bits(bits: u32) -> Self {
        PortState(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn empty() -> Self {
        PortState(0)
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(&self, other: PortState) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_link_down(&self) -> bool {
        self.contains(Self::LINK_DOWN)
    }

    pub const fn is_blocked(&self) -> bool {
        self.contains(Self::BLOCKED)
    }
}

impl std::ops::BitOr for PortState {
    type Output = PortState;

    fn bitor(self, rhs: Self) -> Self::Output {
        PortState(self.0 | rhs.0)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_link_down() {
            names.push("LINK_DOWN");
        }
        if self.is_blocked() {
            names.push("BLOCKED");
        }
        if self.contains(Self::LIVE) {
            names.push("LIVE");
        }
        if names.is_empty() {
            write!(f, "0x{:x}", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Why a port status message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortReason {
    /// The port was added.
    Added,
    /// The port was removed.
    Removed,
    /// Some attribute of the port changed.
    Modified,
}

impl fmt::Display for PortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortReason::Added => write!(f, "added"),
            PortReason::Removed => write!(f, "removed"),
            PortReason::Modified => write!(f, "modified"),
        }
    }
}

impl FromStr for PortReason {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "added" | "add" => Ok(PortReason::Added),
            "removed" | "delete" => Ok(PortReason::Removed),
            "modified" | "modify" => Ok(PortReason::Modified),
            _ => Err(ParseError::InvalidPortReason(s.to_string())),
        }
    }
}

/// Destination of a forwarding action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputTarget {
    /// A specific switch port.
    Port(PortNo),
    /// Hand the packet to the switch's own L2/L3 pipeline.
    Normal,
    /// Flood out of every port except the ingress port.
    Flood,
    /// Send to the controller.
    Controller,
    /// A group table entry.
    Group(u32),
}

impl OutputTarget {
    pub const fn port(port: u32) -> Self {
        OutputTarget::Port(PortNo::new(port))
    }

    /// Returns the port number if this target is a specific port.
    pub const fn as_port(&self) -> Option<PortNo> {
        match self {
            OutputTarget::Port(p) => Some(*p),
            _ => None,
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::Port(p) => write!(f, "port:{}", p),
            OutputTarget::Normal => write!(f, "normal"),
            OutputTarget::Flood => write!(f, "flood"),
            OutputTarget::Controller => write!(f, "controller"),
            OutputTarget::Group(g) => write!(f, "group:{}", g),
        }
    }
}

impl FromStr for OutputTarget {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "normal" => return Ok(OutputTarget::Normal),
            "flood" => return Ok(OutputTarget::Flood),
            "controller" => return Ok(OutputTarget::Controller),
            _ => {}
        }

        if let Some(port) = lower.strip_prefix("port:") {
            return port
                .parse::<PortNo>()
                .map(OutputTarget::Port)
                .map_err(|_| ParseError::InvalidOutputTarget(s.to_string()));
        }
        if let Some(group) = lower.strip_prefix("group:") {
            return group
                .parse::<u32>()
                .map(OutputTarget::Group)
                .map_err(|_| ParseError::InvalidOutputTarget(s.to_string()));
        }

        lower
            .parse::<PortNo>()
            .map(OutputTarget::Port)
            .map_err(|_| ParseError::InvalidOutputTarget(s.to_string()))
    }
}

impl TryFrom<String> for OutputTarget {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputTarget> for String {
    fn from(target: OutputTarget) -> Self {
        target.to_string()
    }
}

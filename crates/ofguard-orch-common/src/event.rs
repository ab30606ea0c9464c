//! Events delivered by a transport adapter.

use ofguard_types::{PortNo, PortReason, PortState, SwitchId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Information a switch reports when its handshake completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Number of flow tables the switch exposes.
    pub n_tables: u8,
    /// Number of ports reported in the feature reply.
    pub n_ports: u32,
    /// Negotiated protocol version.
    pub version: u8,
}

impl HandshakeInfo {
    /// OpenFlow 1.3 wire version.
    pub const OF13: u8 = 0x04;

    pub fn new(n_tables: u8, n_ports: u32) -> Self {
        Self {
            n_tables,
            n_ports,
            version: Self::OF13,
        }
    }
}

/// A port status change on one switch.
///
/// Port events are consumed exactly once and never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEvent {
    pub switch_id: SwitchId,
    pub port: PortNo,
    pub state: PortState,
    pub reason: PortReason,
}

impl PortEvent {
    pub fn new(switch_id: SwitchId, port: PortNo, state: PortState, reason: PortReason) -> Self {
        Self {
            switch_id,
            port,
            state,
            reason,
        }
    }

    /// Returns true if traffic can no longer leave through this port.
    ///
    /// A port is unusable once it has been removed, or when its state flags
    /// report the link down or the port blocked.
    pub fn is_unusable(&self) -> bool {
        self.reason == PortReason::Removed || self.state.is_link_down() || self.state.is_blocked()
    }
}

impl fmt::Display for PortEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dp={} port={} reason={} state={}",
            self.switch_id, self.port, self.reason, self.state
        )
    }
}

/// Any event a transport adapter can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    Connected {
        switch_id: SwitchId,
        info: HandshakeInfo,
    },
    Disconnected {
        switch_id: SwitchId,
    },
    PortStatus(PortEvent),
}

impl SwitchEvent {
    /// Returns the switch this event belongs to.
    pub fn switch_id(&self) -> SwitchId {
        match self {
            SwitchEvent::Connected { switch_id, .. } => *switch_id,
            SwitchEvent::Disconnected { switch_id } => *switch_id,
            SwitchEvent::PortStatus(event) => event.switch_id,
        }
    }
}

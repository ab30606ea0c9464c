//! ofguard controller.
//!
//! Pushes a compiled access-control policy to every switch that connects
//! and keeps the installed rules consistent with port state.
//!
//! # Architecture
//!
//! ```text
//! PolicyModel ──compile──► CompiledPolicy (Arc, versioned)
//!                                │
//! Transport events ──► SessionManager ──► SwitchSession task (one per switch)
//!                                              │
//!                              FlowTable ◄─────┼───── port_monitor
//!                                  │
//!                                  ▼
//!                              Transport (install / delete / barrier)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ofguard_controller::{MemoryTransport, SessionManager};
//! use ofguard_orch_common::{HandshakeInfo, RetryPolicy};
//! use ofguard_policy::PolicyModel;
//! use ofguard_types::SwitchId;
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let manager = SessionManager::new(transport, RetryPolicy::default())
//!     .with_policy(&PolicyModel::reference())?;
//! manager.connect(SwitchId::new(1), HandshakeInfo::new(254, 4)).await?;
//! ```

pub mod config;
pub mod error;
pub mod flow_table;
pub mod manager;
pub mod port_monitor;
pub mod session;
pub mod transport;

pub use config::{ControllerConfig, SimulationConfig};
pub use error::{ConfigError, ControllerError, Result, SessionError, TransportError};
pub use flow_table::{FlowTable, FlowTableEntry, InstallReport, RuleOrigin};
pub use manager::{PolicyUpdate, SessionManager, SessionOutcome};
pub use port_monitor::{on_port_event, PortOutcome};
pub use session::{BarrierOutcome, ReconcileReport, SessionSnapshot, SessionState, SwitchSession};
pub use transport::{MemoryTransport, Transport, WireMessage};

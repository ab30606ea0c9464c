//! Common orchestration abstractions for ofguard.
//!
//! This crate provides the traits and types shared between the transport
//! side (which produces switch events) and the controller (which consumes
//! them):
//!
//! - [`SwitchEvent`], [`PortEvent`], [`HandshakeInfo`]: events delivered by a transport
//! - [`EventHandler`]: subscription trait with one handler per event kind
//! - [`RetryPolicy`]: bounded exponential backoff for idempotent requests
//!
//! # Architecture
//!
//! The control plane follows an event-driven model:
//!
//! 1. A transport adapter terminates switch connections
//! 2. Each connect, disconnect and port status is turned into a [`SwitchEvent`]
//! 3. The event is dispatched to an [`EventHandler`] implementation
//! 4. The handler routes it to the session that owns the switch
//!
//! # Example
//!
//! ```ignore
//! use ofguard_orch_common::{EventHandler, HandshakeInfo, PortEvent};
//! use ofguard_types::SwitchId;
//!
//! struct Logger;
//!
//! #[async_trait]
//! impl EventHandler for Logger {
//!     fn name(&self) -> &str { "Logger" }
//!     async fn on_switch_connected(&self, id: SwitchId, info: HandshakeInfo) {
//!         tracing::info!(switch = %id, ports = info.n_ports, "connected");
//!     }
//!     async fn on_switch_disconnected(&self, id: SwitchId) {}
//!     async fn on_port_status(&self, event: PortEvent) {}
//! }
//! ```

mod event;
mod handler;
mod retry;

pub use event::{HandshakeInfo, PortEvent, SwitchEvent};
pub use handler::EventHandler;
pub use retry::{RetryPolicy, Retryable};

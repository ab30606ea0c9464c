//! Event subscription trait.

use async_trait::async_trait;
use ofguard_types::SwitchId;

use crate::event::{HandshakeInfo, PortEvent, SwitchEvent};

/// Subscriber for switch events, with one handler per event kind.
///
/// A transport adapter calls these methods as events arrive. Events for the
/// same switch are delivered in the order they were received on that
/// switch's connection; events for different switches may interleave.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` so a single handler can be shared
/// by every connection task of the transport.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns the name of this handler (for logging).
    fn name(&self) -> &str;

    /// Called once per successful connection, after the feature handshake.
    async fn on_switch_connected(&self, switch_id: SwitchId, info: HandshakeInfo);

    /// Called once per connection loss.
    async fn on_switch_disconnected(&self, switch_id: SwitchId);

    /// Called on every port add, remove or modify.
    async fn on_port_status(&self, event: PortEvent);

    /// Routes an event to the handler for its kind.
    async fn dispatch(&self, event: SwitchEvent) {
        match event {
            SwitchEvent::Connected { switch_id, info } => {
                self.on_switch_connected(switch_id, info).await
            }
            SwitchEvent::Disconnected { switch_id } => self.on_switch_disconnected(switch_id).await,
            SwitchEvent::PortStatus(event) => self.on_port_status(event).await,
        }
    }
}

//! Port state monitor.
//!
//! When a port becomes unusable every rule forwarding to it is stale. The
//! monitor deletes those rules from the switch and waits for a barrier, so
//! that the switch falls back to its relearning path. It never computes an
//! alternate route.

use ofguard_orch_common::PortEvent;
use ofguard_types::OutputTarget;
use tracing::{info, instrument};

use crate::error::SessionError;
use crate::session::{BarrierOutcome, SwitchSession};

/// What the monitor did with a port event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOutcome {
    /// The port is still usable.
    NoAction,
    /// Rules forwarding to the port were deleted and the barrier acknowledged.
    Invalidated { removed: usize },
    /// Rules were deleted but the session closed before the barrier reply.
    Abandoned { removed: usize },
}

impl PortOutcome {
    pub fn removed(&self) -> usize {
        match self {
            PortOutcome::NoAction => 0,
            PortOutcome::Invalidated { removed } | PortOutcome::Abandoned { removed } => *removed,
        }
    }
}

/// Handles one port status event for `session`.
///
/// Invalidation is complete only once the barrier is acknowledged.
#[instrument(skip(session, event), fields(switch = %event.switch_id, port = %event.port))]
pub async fn on_port_event(
    session: &mut SwitchSession,
    event: &PortEvent,
) -> Result<PortOutcome, SessionError> {
    session.ensure_active()?;
    let switch_id = session.switch_id();

    if !event.is_unusable() {
        info!(reason = %event.reason, state = %event.state, "No reroute action");
        return Ok(PortOutcome::NoAction);
    }

    let target = OutputTarget::Port(event.port);
    let removed = session
        .table_mut()
        .delete_by_output(target)
        .await
        .map_err(|e| SessionError::transport(switch_id, e))?;

    let outcome = match session
        .barrier()
        .await
        .map_err(|e| SessionError::transport(switch_id, e))?
    {
        BarrierOutcome::Acknowledged => PortOutcome::Invalidated { removed },
        BarrierOutcome::Cancelled => PortOutcome::Abandoned { removed },
    };

    info!(
        reason = %event.reason,
        state = %event.state,
        removed,
        ?outcome,
        "port unusable, invalidated flows"
    );
    Ok(outcome)
}

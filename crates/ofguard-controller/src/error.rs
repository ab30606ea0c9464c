//! Error types for the controller.

use ofguard_orch_common::Retryable;
use ofguard_policy::PolicyError;
use ofguard_types::SwitchId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Failure reported by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The switch answered with an error message.
    #[error("switch {switch_id} rejected {operation}: {reason}")]
    Rejected {
        switch_id: SwitchId,
        operation: &'static str,
        reason: String,
    },

    /// The request could not be delivered in time.
    #[error("{operation} to switch {switch_id} timed out")]
    Timeout {
        switch_id: SwitchId,
        operation: &'static str,
    },

    /// The connection to the switch is gone.
    #[error("switch {0} is not connected")]
    Disconnected(SwitchId),
}

impl TransportError {
    pub fn rejected(switch_id: SwitchId, operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            switch_id,
            operation,
            reason: reason.into(),
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Disconnected(_))
    }
}

/// Errors raised by a switch session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("switch {switch_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        switch_id: SwitchId,
        from: SessionState,
        to: SessionState,
    },

    /// The operation targets a session that is closed or unknown.
    #[error("switch {0}: session is stale")]
    StaleSession(SwitchId),

    /// Initial rule installation failed after retries.
    #[error("switch {switch_id}: rule installation failed: {source}")]
    InstallFailed {
        switch_id: SwitchId,
        #[source]
        source: TransportError,
    },

    #[error("switch {switch_id}: {source}")]
    Transport {
        switch_id: SwitchId,
        #[source]
        source: TransportError,
    },
}

impl SessionError {
    pub fn transport(switch_id: SwitchId, source: TransportError) -> Self {
        Self::Transport { switch_id, source }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, SessionError::StaleSession(_))
    }
}

/// Daemon configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level controller error.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

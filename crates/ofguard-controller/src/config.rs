//! Daemon configuration file.
//!
//! ```toml
//! policy = "/etc/ofguard/policy.toml"
//!
//! [retry]
//! max_attempts = 4
//! initial_backoff_ms = 50
//! max_backoff_ms = 1000
//!
//! [simulation]
//! switches = [1, 2]
//! ports_per_switch = 4
//!
//! [[simulation.port_events]]
//! switch_id = 1
//! port = 3
//! state = 1
//! reason = "modified"
//! ```

use ofguard_orch_common::{PortEvent, RetryPolicy};
use ofguard_types::SwitchId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Switches and port events replayed against the in-memory transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Datapath ids of the simulated switches.
    #[serde(default = "default_switches")]
    pub switches: Vec<SwitchId>,

    /// Ports each switch reports in its handshake.
    #[serde(default = "default_ports_per_switch")]
    pub ports_per_switch: u32,

    /// Port status changes delivered after every switch is connected.
    #[serde(default)]
    pub port_events: Vec<PortEvent>,
}

fn default_switches() -> Vec<SwitchId> {
    vec![SwitchId::new(1)]
}

fn default_ports_per_switch() -> u32 {
    4
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            switches: default_switches(),
            ports_per_switch: default_ports_per_switch(),
            port_events: Vec::new(),
        }
    }
}

/// Complete ofguardd configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Policy file. The built-in campus policy is used when unset.
    #[serde(default)]
    pub policy: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl ControllerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        for event in &self.simulation.port_events {
            if !self.simulation.switches.contains(&event.switch_id) {
                return Err(ConfigError::Invalid(format!(
                    "port event for unknown switch {}",
                    event.switch_id
                )));
            }
        }
        Ok(())
    }
}

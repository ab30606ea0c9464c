//! Error types for policy loading and compilation.

use ofguard_types::Ipv4Address;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::PriorityBand;

/// Result type alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// The policy is ambiguous and must be corrected before it can be compiled.
///
/// No partial rule set is ever produced when this error is raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// Two generated rules would carry the same match predicate.
    #[error("services '{first}' and '{second}' both generate match [{predicate}]")]
    DuplicateMatch {
        first: String,
        second: String,
        predicate: String,
    },

    /// An address belongs to more than one principal group.
    #[error("address {address} is a member of both '{first}' and '{second}'")]
    OverlappingGroups {
        address: Ipv4Address,
        first: String,
        second: String,
    },

    /// An address is listed twice in the same group.
    #[error("address {address} is listed twice in group '{group}'")]
    DuplicateAddress { group: String, address: Ipv4Address },
}

/// Errors that can occur while loading or compiling a policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// A service refers to a group that is not defined.
    #[error("service '{service}' refers to unknown group '{group}'")]
    UnknownGroup { service: String, group: String },

    /// A group member is not a single host address.
    #[error("group '{group}' lists {address}, which is not a host address")]
    NotAHost { group: String, address: Ipv4Address },

    /// Two groups share the same name.
    #[error("group '{0}' is defined more than once")]
    DuplicateGroup(String),

    /// A service combines fields that make no sense for its protocol.
    #[error("invalid service '{service}': {reason}")]
    InvalidService { service: String, reason: String },

    /// A band has no priorities left.
    #[error("{band} band exhausted after {allocated} services")]
    BandExhausted { band: PriorityBand, allocated: usize },

    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),
}

impl PolicyError {
    pub(crate) fn invalid_service(service: &str, reason: impl Into<String>) -> Self {
        Self::InvalidService {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error is a conflict that the policy author must resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PolicyError::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let err = ConflictError::OverlappingGroups {
            address: Ipv4Address::new(10, 0, 0, 3),
            first: "student".to_string(),
            second: "iot".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "address 10.0.0.3 is a member of both 'student' and 'iot'"
        );
    }

    #[test]
    fn test_conflict_wraps() {
        let err: PolicyError = ConflictError::DuplicateAddress {
            group: "admin".to_string(),
            address: Ipv4Address::new(10, 0, 0, 1),
        }
        .into();
        assert!(err.is_conflict());
        assert!(err.to_string().starts_with("policy conflict:"));
    }

    #[test]
    fn test_band_exhausted_display() {
        let err = PolicyError::BandExhausted {
            band: PriorityBand::Deny,
            allocated: 10000,
        };
        assert_eq!(err.to_string(), "deny band exhausted after 10000 services");
        assert!(!err.is_conflict());
    }
}

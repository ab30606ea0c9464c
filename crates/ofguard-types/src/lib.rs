//! Common types for the ofguard control plane.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the policy compiler and the switch controller:
//!
//! - [`Ipv4Address`]: IPv4 host addresses used in principal groups
//! - [`SwitchId`]: 64-bit datapath identifier of a switching element
//! - [`PortNo`], [`PortState`], [`PortReason`]: port identity and status
//! - [`OutputTarget`]: where a forwarding action sends a packet
//! - [`EtherType`], [`IpProtocol`]: well-known header field values

mod ip;
mod port;
mod proto;
mod switch;

pub use ip::Ipv4Address;
pub use port::{OutputTarget, PortNo, PortReason, PortState};
pub use proto::{EtherType, IpProtocol};
pub use switch::SwitchId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IPv4 address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid switch id: {0}")]
    InvalidSwitchId(String),

    #[error("invalid port number: {0}")]
    InvalidPortNo(String),

    #[error("invalid output target: {0}")]
    InvalidOutputTarget(String),

    #[error("invalid port reason: {0}")]
    InvalidPortReason(String),
}

//! Access-control policy model and rule compiler.
//!
//! This crate turns a declarative policy (principal groups, service rules,
//! a default verdict) into the ordered list of forwarding rules pushed to
//! every switch.
//!
//! # Priority Bands
//!
//! The compiler never takes priorities from the policy. Every rule lands in
//! one of three named bands:
//!
//! ```text
//! 40000 ┬ deny band     explicit denies (blocked pairs)
//! 30001 ┴
//! 30000 ┬ allow band    explicit allows (ARP, ICMP, management access)
//! 20001 ┴
//!    10 ─ default band  exactly one rule: any IPv4, allow or deny
//! ```
//!
//! Each service rule takes the next priority of its band in declaration
//! order, so recompiling an unchanged policy yields identical priorities.
//!
//! # Key Components
//!
//! - [`PolicyModel`]: groups, services and default verdict, loadable from TOML
//! - [`ForwardingRule`]: compiled match predicate, priority and action list
//! - [`compile`]: pure, deterministic compiler
//! - [`CompiledPolicy`]: versioned, shareable compilation result

mod compiler;
mod error;
mod model;
mod rule;
mod types;

pub use compiler::{compile, CompiledPolicy, PolicyDiff};
pub use error::{ConflictError, PolicyError, PolicyResult};
pub use model::{PolicyModel, PrincipalGroup, ServiceRule};
pub use rule::{FlowAction, FlowMatch, ForwardingRule, MatchValue, RuleKey};
pub use types::{MatchField, PriorityBand, Protocol, Verdict};

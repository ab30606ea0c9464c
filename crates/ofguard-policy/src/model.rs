//! Declarative policy model.
//!
//! A policy names principal groups, lists the services allowed or denied
//! between them, and sets the verdict for everything else.
//!
//! # File Format
//!
//! ```toml
//! default_action = "deny"
//! forward_to = "normal"
//!
//! [[groups]]
//! name = "admin"
//! addresses = ["10.0.0.1", "10.0.0.2"]
//!
//! [[services]]
//! name = "ssh-admin"
//! protocol = "tcp"
//! src_group = "admin"
//! port = 22
//! bidirectional = true
//! verdict = "allow"
//! ```

use ofguard_types::{Ipv4Address, OutputTarget};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{ConflictError, PolicyError, PolicyResult};
use crate::types::{Protocol, Verdict};

/// Named set of addresses sharing an access-control role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalGroup {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<Ipv4Address>,
}

impl PrincipalGroup {
    pub fn new(name: impl Into<String>, addresses: impl IntoIterator<Item = Ipv4Address>) -> Self {
        Self {
            name: name.into(),
            addresses: addresses.into_iter().collect(),
        }
    }
}

/// Template for a traffic class to allow or deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRule {
    pub name: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_group: Option<String>,
    /// Transport port (TCP and UDP only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// ICMP type (ICMP only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<u8>,
    /// Also emit the return-direction rule.
    #[serde(default)]
    pub bidirectional: bool,
    pub verdict: Verdict,
}

impl ServiceRule {
    pub fn new(name: impl Into<String>, protocol: Protocol, verdict: Verdict) -> Self {
        Self {
            name: name.into(),
            protocol,
            src_group: None,
            dst_group: None,
            port: None,
            icmp_type: None,
            bidirectional: false,
            verdict,
        }
    }

    pub fn allow(name: impl Into<String>, protocol: Protocol) -> Self {
        Self::new(name, protocol, Verdict::Allow)
    }

    pub fn deny(name: impl Into<String>, protocol: Protocol) -> Self {
        Self::new(name, protocol, Verdict::Deny)
    }

    pub fn from_group(mut self, group: impl Into<String>) -> Self {
        self.src_group = Some(group.into());
        self
    }

    pub fn to_group(mut self, group: impl Into<String>) -> Self {
        self.dst_group = Some(group.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_icmp_type(mut self, icmp_type: u8) -> Self {
        self.icmp_type = Some(icmp_type);
        self
    }

    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    /// Rejects field combinations that make no sense for the protocol.
    pub fn validate(&self) -> PolicyResult<()> {
        if self.protocol == Protocol::Arp && (self.src_group.is_some() || self.dst_group.is_some())
        {
            return Err(PolicyError::invalid_service(
                &self.name,
                "arp rules cannot be scoped to groups",
            ));
        }
        if self.port.is_some() && !self.protocol.has_ports() {
            return Err(PolicyError::invalid_service(
                &self.name,
                format!("{} rules take no port", self.protocol),
            ));
        }
        if self.icmp_type.is_some() && self.protocol != Protocol::Icmp {
            return Err(PolicyError::invalid_service(
                &self.name,
                format!("{} rules take no icmp_type", self.protocol),
            ));
        }
        Ok(())
    }
}

fn default_forward_to() -> OutputTarget {
    OutputTarget::Normal
}

/// Complete access-control policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyModel {
    #[serde(default)]
    pub groups: Vec<PrincipalGroup>,

    #[serde(default)]
    pub services: Vec<ServiceRule>,

    /// Verdict for IPv4 traffic no service matches.
    #[serde(default)]
    pub default_action: Verdict,

    /// Where allowed traffic is sent.
    #[serde(default = "default_forward_to")]
    pub forward_to: OutputTarget,
}

impl Default for PolicyModel {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            services: Vec::new(),
            default_action: Verdict::Deny,
            forward_to: default_forward_to(),
        }
    }
}

impl PolicyModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(
        mut self,
        name: impl Into<String>,
        addresses: impl IntoIterator<Item = Ipv4Address>,
    ) -> Self {
        self.groups.push(PrincipalGroup::new(name, addresses));
        self
    }

    pub fn with_service(mut self, service: ServiceRule) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_default_action(mut self, verdict: Verdict) -> Self {
        self.default_action = verdict;
        self
    }

    pub fn with_forward_to(mut self, target: OutputTarget) -> Self {
        self.forward_to = target;
        self
    }

    /// Parses a policy from TOML text.
    pub fn from_toml_str(s: &str) -> PolicyResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a policy file.
    pub fn load(path: impl AsRef<Path>) -> PolicyResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Campus policy with admin, student and IoT principals.
    ///
    /// Allows ARP, ICMP and SSH to and from the admin hosts. Denies student
    /// echo requests towards admins and all student traffic towards IoT
    /// devices. Everything else is dropped.
    pub fn reference() -> Self {
        Self::new()
            .with_group(
                "admin",
                [Ipv4Address::new(10, 0, 0, 1), Ipv4Address::new(10, 0, 0, 2)],
            )
            .with_group(
                "student",
                [Ipv4Address::new(10, 0, 0, 3), Ipv4Address::new(10, 0, 0, 4)],
            )
            .with_group(
                "iot",
                [Ipv4Address::new(10, 0, 0, 5), Ipv4Address::new(10, 0, 0, 6)],
            )
            .with_service(
                ServiceRule::deny("student-ping-admin", Protocol::Icmp)
                    .from_group("student")
                    .to_group("admin")
                    .with_icmp_type(8),
            )
            .with_service(
                ServiceRule::deny("student-to-iot", Protocol::Ipv4)
                    .from_group("student")
                    .to_group("iot"),
            )
            .with_service(ServiceRule::allow("arp", Protocol::Arp))
            .with_service(ServiceRule::allow("icmp", Protocol::Icmp))
            .with_service(
                ServiceRule::allow("ssh-admin", Protocol::Tcp)
                    .from_group("admin")
                    .with_port(22)
                    .bidirectional(),
            )
            .with_default_action(Verdict::Deny)
    }

    pub fn group(&self, name: &str) -> Option<&PrincipalGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Checks that group names are unique, members are host addresses and
    /// groups are pairwise disjoint.
    pub fn validate_groups(&self) -> PolicyResult<()> {
        let mut names = HashSet::new();
        let mut owner: HashMap<Ipv4Address, &str> = HashMap::new();

        for group in &self.groups {
            if !names.insert(group.name.as_str()) {
                return Err(PolicyError::DuplicateGroup(group.name.clone()));
            }

            let mut seen = HashSet::new();
            for &address in &group.addresses {
                if !address.is_host() {
                    return Err(PolicyError::NotAHost {
                        group: group.name.clone(),
                        address,
                    });
                }
                if !seen.insert(address) {
                    return Err(ConflictError::DuplicateAddress {
                        group: group.name.clone(),
                        address,
                    }
                    .into());
                }
                if let Some(first) = owner.insert(address, group.name.as_str()) {
                    return Err(ConflictError::OverlappingGroups {
                        address,
                        first: first.to_string(),
                        second: group.name.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

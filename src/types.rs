//! Data structures used throughout the control plane.
//!
//! Roles are addressed by a [`QualifiedName`] of the form
//! `container.node.role`; routing only ever needs the container prefix.
//! Operations are an open set: the heartbeat family's operations are named
//! variants, anything else travels as [`Operation::Other`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Well-known parameter keys carried in a message's parameter map.
pub mod params {
    /// Target host of a seed connection request.
    pub const HOST: &str = "host";
    /// Target port of a seed connection request.
    pub const PORT: &str = "port";
    /// Alias of the local credential used to dial a seed.
    pub const CERTIFICATE_ALIAS: &str = "certificate_alias";
    /// Operation that a `MessageNotUnderstoodInfo` or
    /// `OperationNotPermittedInfo` refers to.
    pub const OPERATION: &str = "operation";
    /// Human readable explanation attached to refusals.
    pub const REASON: &str = "reason";
}

/// `container.node.role` address of a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QualifiedName(String);

impl QualifiedName {
    pub fn parse(value: impl Into<String>) -> Result<Self, MessageError> {
        let value = value.into();
        let mut parts = value.split('.');
        let well_formed = (0..3).all(|_| parts.next().is_some_and(|p| !p.is_empty()))
            && parts.next().is_none();
        if !well_formed {
            return Err(MessageError::InvalidQualifiedName(value));
        }
        Ok(Self(value))
    }

    /// Builds a name from its three components.
    pub fn new(container: &str, node: &str, role: &str) -> Result<Self, MessageError> {
        Self::parse(format!("{container}.{node}.{role}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The container prefix, used for routing.
    #[must_use]
    pub fn container(&self) -> &str {
        self.segment(0)
    }

    #[must_use]
    pub fn node(&self) -> &str {
        self.segment(1)
    }

    #[must_use]
    pub fn role(&self) -> &str {
        self.segment(2)
    }

    #[must_use]
    pub fn is_in_container(&self, container: &str) -> bool {
        self.container() == container
    }

    fn segment(&self, index: usize) -> &str {
        // Validated at construction, the segment always exists.
        self.0.split('.').nth(index).unwrap_or_default()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QualifiedName {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for QualifiedName {
    type Error = MessageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<QualifiedName> for String {
    fn from(name: QualifiedName) -> Self {
        name.0
    }
}

/// The operation a message asks its recipient to perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    InitializeTask,
    JoinAcknowledgedTask,
    PerformMissionTask,
    KeepAliveInfo,
    KeepAliveAcknowledgedTask,
    JoinNetworkSingletonAgentInfo,
    MessageNotUnderstoodInfo,
    OperationNotPermittedInfo,
    /// The one bootstrap operation allowed to open a brand-new link.
    SeedConnectionRequestInfo,
    Other(String),
}

impl Operation {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::InitializeTask => "InitializeTask",
            Self::JoinAcknowledgedTask => "JoinAcknowledgedTask",
            Self::PerformMissionTask => "PerformMissionTask",
            Self::KeepAliveInfo => "KeepAliveInfo",
            Self::KeepAliveAcknowledgedTask => "KeepAliveAcknowledgedTask",
            Self::JoinNetworkSingletonAgentInfo => "JoinNetworkSingletonAgentInfo",
            Self::MessageNotUnderstoodInfo => "MessageNotUnderstoodInfo",
            Self::OperationNotPermittedInfo => "OperationNotPermittedInfo",
            Self::SeedConnectionRequestInfo => "SeedConnectionRequestInfo",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Operation {
    fn from(value: String) -> Self {
        match value.as_str() {
            "InitializeTask" => Self::InitializeTask,
            "JoinAcknowledgedTask" => Self::JoinAcknowledgedTask,
            "PerformMissionTask" => Self::PerformMissionTask,
            "KeepAliveInfo" => Self::KeepAliveInfo,
            "KeepAliveAcknowledgedTask" => Self::KeepAliveAcknowledgedTask,
            "JoinNetworkSingletonAgentInfo" => Self::JoinNetworkSingletonAgentInfo,
            "MessageNotUnderstoodInfo" => Self::MessageNotUnderstoodInfo,
            "OperationNotPermittedInfo" => Self::OperationNotPermittedInfo,
            "SeedConnectionRequestInfo" => Self::SeedConnectionRequestInfo,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Operation {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomposes_qualified_name() {
        let name: QualifiedName = "alpha.node1.heartbeat".parse().unwrap();
        assert_eq!(name.container(), "alpha");
        assert_eq!(name.node(), "node1");
        assert_eq!(name.role(), "heartbeat");
        assert!(name.is_in_container("alpha"));
        assert!(!name.is_in_container("alp"));
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["", "alpha", "alpha.node", "alpha..role", "a.b.c.d", ".b.c"] {
            assert!(QualifiedName::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn qualified_name_serde_validates() {
        let ok: QualifiedName = serde_json::from_str("\"x.y.z\"").unwrap();
        assert_eq!(ok.as_str(), "x.y.z");
        assert!(serde_json::from_str::<QualifiedName>("\"x.y\"").is_err());
    }

    #[test]
    fn unknown_operations_stay_open_ended() {
        let op: Operation = serde_json::from_str("\"TransferFileTask\"").unwrap();
        assert_eq!(op, Operation::Other("TransferFileTask".into()));
        assert_eq!(
            serde_json::to_string(&Operation::KeepAliveInfo).unwrap(),
            "\"KeepAliveInfo\""
        );
        assert_eq!(Operation::from("KeepAliveInfo"), Operation::KeepAliveInfo);
    }
}

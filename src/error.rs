//! Error taxonomy for the control plane.
//!
//! Transport problems surface as [`NetworkError`], trust and role
//! resolution problems as [`DispatchError`].  Liveness timeouts and
//! unknown operations are deliberately absent: the former are recorded in
//! the liveness registry, the latter are answered with a
//! `MessageNotUnderstoodInfo` reply.

use std::io;

use thiserror::Error;

use crate::types::QualifiedName;

/// Errors raised while building, encoding or checking a [`Message`](crate::message::Message).
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid qualified name `{0}`: expected container.node.role")]
    InvalidQualifiedName(String),

    #[error("message is not signed")]
    Unsigned,

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("canonical encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors raised by the message router and its channels.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("private key error: {0}")]
    PrivateKey(String),

    #[error("TLS handshake error: {0}")]
    Handshake(String),

    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("port {0} is reserved")]
    ReservedPort(u16),

    #[error("no route to container `{container}`")]
    NoRoute { container: String },

    #[error("invalid seed connection request: {0}")]
    InvalidSeed(String),

    #[error("unknown credential alias `{0}`")]
    UnknownCredential(String),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("certificate for {subject} unavailable")]
    CertificateUnavailable { subject: QualifiedName },

    #[error("router is shut down")]
    ShutDown,
}

impl NetworkError {
    /// Returns true for the benign transport conditions ("connection
    /// refused", "no route to host") that are logged but never evict a
    /// channel.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(e) if is_transient_io(e))
    }
}

/// Classifies an I/O error as transient.
#[must_use]
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

/// Errors raised by the role dispatch core.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unverified message from {sender}: {reason}")]
    UnverifiedMessage {
        sender: QualifiedName,
        reason: String,
    },

    #[error("role not found: {0}")]
    RoleNotFound(QualifiedName),

    #[error("no signing key for local role {0}")]
    MissingSigningKey(QualifiedName),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Message(#[from] MessageError),
}

impl DispatchError {
    /// Authentication failures are never downgraded to retries.
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::UnverifiedMessage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_and_unreachable_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::HostUnreachable,
            io::ErrorKind::NetworkUnreachable,
        ] {
            assert!(NetworkError::Io(io::Error::from(kind)).is_transient());
        }
    }

    #[test]
    fn reset_is_fatal() {
        let err = NetworkError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!err.is_transient());
        assert!(!NetworkError::NoRoute {
            container: "alpha".into()
        }
        .is_transient());
    }
}

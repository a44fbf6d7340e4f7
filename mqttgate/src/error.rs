//! Error types for mqttgate.

use std::io;

/// Result type alias for mqttgate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttgate operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS handshake did not complete (untrusted chain, expired, I/O).
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer certificate is listed in the active revocation snapshot.
    #[error("certificate revoked: issuer={issuer} serial={serial}")]
    CertificateRevoked { issuer: String, serial: String },

    /// A CRL source could not be parsed.
    #[error("malformed revocation data: {0}")]
    MalformedRevocationData(String),

    /// A trusted issuer has no CRL.
    #[error("no revocation data for issuer {0}")]
    MissingRevocationData(String),

    /// Username/password rejected by the directory.
    #[error("bad credentials")]
    BadCredentials,

    /// Authenticated principal holds no roles.
    #[error("no roles assigned to {0}")]
    NoRolesAssigned(String),

    /// ACL pattern rejected at configuration time.
    #[error("malformed pattern {pattern:?}: {reason}")]
    MalformedPattern { pattern: String, reason: String },

    /// Peer broke the session protocol (e.g. frame before CONNECT).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Wire-level decode/encode error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Gate is already running.
    #[error("gate already running")]
    AlreadyRunning,
}

impl Error {
    pub(crate) fn malformed_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Error::MalformedPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Why the admission gate refused a connection.
///
/// Returned by [`crate::TlsAdmissionGate::admit`]; the connection is already
/// closed when a caller sees one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// The TLS stack refused the chain, or the handshake broke down.
    #[error("handshake failed: {cause}")]
    HandshakeFailed { cause: String },

    /// The leaf certificate is revoked.
    #[error("certificate revoked: issuer={issuer} serial={serial}")]
    CertificateRevoked { issuer: String, serial: String },
}

impl Rejection {
    /// Short reason label used in audit events.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::HandshakeFailed { .. } => "HandshakeFailed",
            Rejection::CertificateRevoked { .. } => "CertificateRevoked",
        }
    }
}

impl From<Rejection> for Error {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::HandshakeFailed { cause } => Error::HandshakeFailed(cause),
            Rejection::CertificateRevoked { issuer, serial } => {
                Error::CertificateRevoked { issuer, serial }
            }
        }
    }
}

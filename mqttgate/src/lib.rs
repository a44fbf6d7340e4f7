//! MQTT admission and authorization gate.
//!
//! Sits in front of a broker's routing fabric and decides, for every
//! connection and every topic action, whether it may proceed:
//!
//! - **Admission**: TLS handshake with client certificate validation and
//!   CRL revocation checks; revoked clients never reach MQTT
//! - **Connect**: Authenticate credentials (or the certificate subject) and
//!   resolve the session's roles
//! - **Subscribe**: Check each filter against the role ACLs
//! - **Publish**: Check the topic before it is routed
//!
//! ## Components
//!
//! - [`TlsAdmissionGate`]: handshake plus [`RevocationStore`] lookups
//! - [`CredentialAuthenticator`]: principal to [`RoleSet`] via a [`Directory`]
//! - [`AclEngine`]: wildcard topic rules per role
//! - [`SessionGatekeeper`]: per-connection MQTT 3.1.1/5.0 state machine
//! - [`Gate`]: TCP listener wiring all of the above
//!
//! ## Example
//!
//! ```no_run
//! use mqttgate::{Action, Gate, GateConfig, RoleConfig, StaticDirectory, TlsSettings};
//!
//! #[tokio::main]
//! async fn main() -> mqttgate::Result<()> {
//!     let directory = StaticDirectory::new();
//!     directory.add_user("user", "pass");
//!     directory.add_role("user", "full");
//!
//!     let roles = vec![
//!         RoleConfig::new("full")
//!             .allow(Action::Publish, "#")
//!             .allow(Action::Subscribe, "#"),
//!     ];
//!
//!     let gate = Gate::builder(GateConfig::new("0.0.0.0:8883"))
//!         .tls(TlsSettings::from_pem_files("server.pem", "server.key", "ca.pem")?)
//!         .crl_source("crl/")
//!         .directory(directory)
//!         .roles(roles)
//!         .build()?;
//!
//!     gate.serve().await
//! }
//! ```

mod acl;
mod admission;
mod audit;
mod auth;
mod error;
mod fabric;
mod gate;
pub mod protocol;
mod revocation;
mod session;
pub mod trie;
mod types;

pub use acl::{AclEngine, AclRule, AclTable, PublishDenial, RoleConfig, RolePolicy, RuleConfig, TopicPattern};
pub use admission::{
    AdmittedTransport, RevocationCheckingVerifier, TlsAdmissionGate, TlsSettings, load_certs,
    load_private_key,
};
pub use audit::{AuditEvent, AuditSink, ChannelAudit, TracingAudit};
pub use auth::{CredentialAuthenticator, Directory, StaticDirectory};
pub use error::{Error, Rejection, Result};
pub use fabric::{LocalFabric, RoutingFabric, SubscriberHandle, parse_shared_topic};
pub use gate::{Gate, GateBuilder, GateConfig};
pub use revocation::{RevocationEntry, RevocationSnapshot, RevocationStore};
pub use session::{Session, SessionGatekeeper, SessionState};
pub use types::{
    Action, AuthMode, CertificateIdentity, Decision, Effect, Message, ProtocolVersion, QoS, RoleSet,
};

#[cfg(test)]
mod testutil;

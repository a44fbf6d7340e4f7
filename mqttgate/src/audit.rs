//! Audit events for admission, authentication and authorization.
//!
//! Sinks are called inline on the connection task and must return promptly;
//! a slow or failing sink never fails the protocol path.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::types::Action;

/// Structured audit event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// TLS admission succeeded.
    Admitted {
        peer: SocketAddr,
        subject: Option<String>,
        serial: Option<String>,
    },
    /// TLS admission failed; `reason` is `HandshakeFailed` or `CertificateRevoked`.
    Rejected {
        peer: SocketAddr,
        reason: String,
        detail: String,
    },
    /// CONNECT accepted.
    Authenticated {
        session_id: String,
        client_id: String,
        principal: String,
        roles: Vec<String>,
    },
    /// CONNECT refused; `reason` is `BadCredentials` or `NoRolesAssigned`.
    AuthenticationFailed {
        client_id: String,
        principal: String,
        reason: String,
    },
    /// A publish or subscribe was denied by the ACL.
    Denied {
        session_id: String,
        principal: String,
        action: Action,
        topic: String,
    },
    /// Session ended.
    SessionClosed { session_id: String, reason: String },
    /// A revocation or ACL reload took effect.
    Reloaded { target: String, generation: u64 },
    /// A revocation or ACL reload failed; the previous data stays active.
    ReloadFailed { target: String, error: String },
}

/// Receiver of audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Function-based sink.
impl<F> AuditSink for F
where
    F: Fn(&AuditEvent) + Send + Sync,
{
    fn record(&self, event: &AuditEvent) {
        self(event)
    }
}

/// Logs every event as JSON through `tracing` (default sink).
#[derive(Debug, Default, Clone)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &AuditEvent) {
        let json = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "mqttgate::audit", "Failed to serialize audit event: {}", e);
                return;
            }
        };
        match event {
            AuditEvent::Rejected { .. }
            | AuditEvent::AuthenticationFailed { .. }
            | AuditEvent::Denied { .. }
            | AuditEvent::ReloadFailed { .. } => warn!(target: "mqttgate::audit", "{}", json),
            _ => info!(target: "mqttgate::audit", "{}", json),
        }
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelAudit {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAudit {
    /// Create a sink and the receiving end.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAudit {
    fn record(&self, event: &AuditEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            trace!("Audit event dropped: {}", e);
        }
    }
}

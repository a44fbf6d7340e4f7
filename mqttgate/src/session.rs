//! Per-connection session state machine.
//!
//! The gatekeeper owns one admitted connection: it waits for CONNECT,
//! authenticates, then checks every SUBSCRIBE filter and PUBLISH topic
//! against the ACL engine before anything reaches the routing fabric.
//!
//! ```text
//! Connecting -> Authenticating -> Active -> Closing -> Closed
//!                     |                        ^
//!                     +------------------------+
//! ```
//!
//! Every state may go straight to `Closed`; nothing leaves `Closed`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acl::{AclEngine, PublishDenial};
use crate::audit::{AuditEvent, AuditSink, TracingAudit};
use crate::auth::CredentialAuthenticator;
use crate::error::{Error, Result};
use crate::fabric::{RoutingFabric, SubscriberHandle, parse_shared_topic};
use crate::protocol::{
    ConnAckCode, ConnectFrame, Frame, FrameCodec, MAX_PACKET_SIZE, Reply, read_protocol_version,
};
use crate::types::{
    Action, AuthMode, CertificateIdentity, Message, ProtocolVersion, QoS, RoleSet,
};

/// Default time allowed between accept and CONNECT.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending deliveries per session before the fabric starts dropping.
const DELIVERY_QUEUE: usize = 100;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Authenticating)
            | (Authenticating, Active)
            | (Authenticating, Closing)
            | (Active, Closing) => true,
            _ => false,
        }
    }

    /// Move to `next` or fail with `ProtocolViolation`.
    pub fn transition(self, next: SessionState) -> Result<SessionState> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(Error::ProtocolViolation(format!(
                "illegal session transition {self} -> {next}"
            )))
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "Connecting",
            SessionState::Authenticating => "Authenticating",
            SessionState::Active => "Active",
            SessionState::Closing => "Closing",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub client_id: String,
    pub principal: String,
    pub roles: RoleSet,
    pub clean_session: bool,
    pub protocol: ProtocolVersion,
    pub keep_alive: u16,
    state: SessionState,
}

impl Session {
    /// Build the session for an accepted CONNECT, continuing from the
    /// connection's current `state`.
    fn new(
        connect: &ConnectFrame,
        principal: String,
        roles: RoleSet,
        protocol: ProtocolVersion,
        state: SessionState,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let client_id = if connect.client_id.is_empty() {
            id.clone()
        } else {
            connect.client_id.clone()
        };
        Self {
            id,
            client_id,
            principal,
            roles,
            clean_session: connect.clean_session,
            protocol,
            keep_alive: connect.keep_alive,
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    /// Inbound silence tolerated before closing: 1.5 x keep-alive.
    fn keep_alive_window(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_millis(u64::from(self.keep_alive) * 1500))
    }
}

/// What the active loop does after a frame.
enum Flow {
    Continue,
    Disconnect,
}

/// Runs the session protocol on an admitted transport.
#[derive(Clone)]
pub struct SessionGatekeeper {
    authenticator: CredentialAuthenticator,
    acl: Arc<AclEngine>,
    fabric: Arc<dyn RoutingFabric>,
    audit: Arc<dyn AuditSink>,
    auth_mode: AuthMode,
    connect_timeout: Duration,
    max_packet_size: usize,
}

impl SessionGatekeeper {
    pub fn new(
        authenticator: CredentialAuthenticator,
        acl: Arc<AclEngine>,
        fabric: Arc<dyn RoutingFabric>,
    ) -> Self {
        Self {
            authenticator,
            acl,
            fabric,
            audit: Arc::new(TracingAudit),
            auth_mode: AuthMode::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Drive one connection until it closes.
    ///
    /// `identity` is the client certificate from admission, if any. Returns
    /// `Ok(())` after a clean DISCONNECT, otherwise the reason the session
    /// ended. The stream is shut down in every case.
    pub async fn run<S>(&self, stream: S, identity: Option<&CertificateIdentity>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = BytesMut::with_capacity(4096);

        let result = self
            .serve(&mut reader, &mut writer, &mut buf, identity)
            .await;
        let _ = writer.shutdown().await;
        result
    }

    async fn serve<S>(
        &self,
        reader: &mut ReadHalf<S>,
        writer: &mut WriteHalf<S>,
        buf: &mut BytesMut,
        identity: Option<&CertificateIdentity>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let state = SessionState::Connecting;

        let (codec, connect) = match tokio::time::timeout(
            self.connect_timeout,
            self.read_connect(reader, buf),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!("No CONNECT within {:?}", self.connect_timeout);
                return Err(Error::Timeout("waiting for CONNECT".to_string()));
            }
        };
        let state = state.transition(SessionState::Authenticating)?;

        let mut session = match self
            .authenticate(&connect, identity, codec.version, state)
            .await
        {
            Ok(session) => session,
            Err((principal, e)) => {
                let code = match e {
                    Error::BadCredentials => ConnAckCode::BadUserNamePassword,
                    _ => ConnAckCode::NotAuthorized,
                };
                self.audit.record(&AuditEvent::AuthenticationFailed {
                    client_id: connect.client_id.clone(),
                    principal,
                    reason: match e {
                        Error::BadCredentials => "BadCredentials".to_string(),
                        Error::NoRolesAssigned(_) => "NoRolesAssigned".to_string(),
                        ref other => other.to_string(),
                    },
                });
                codec.write_reply(writer, Reply::ConnAck(code)).await?;
                state
                    .transition(SessionState::Closing)?
                    .transition(SessionState::Closed)?;
                return Err(e);
            }
        };

        codec.write_reply(writer, Reply::ConnAck(ConnAckCode::Accepted)).await?;
        session.transition(SessionState::Active)?;
        info!(
            "Session {} active: client={} principal={} roles=[{}] ({})",
            session.id, session.client_id, session.principal, session.roles, session.protocol
        );
        self.audit.record(&AuditEvent::Authenticated {
            session_id: session.id.clone(),
            client_id: session.client_id.clone(),
            principal: session.principal.clone(),
            roles: session.roles.iter().map(str::to_string).collect(),
        });

        let result = self.active_loop(&session, codec, reader, writer, buf).await;
        session.transition(SessionState::Closing)?;
        session.transition(SessionState::Closed)?;

        let reason = match &result {
            Ok(()) => "disconnect".to_string(),
            Err(e) => e.to_string(),
        };
        debug!("Session {} closed: {}", session.id, reason);
        self.audit.record(&AuditEvent::SessionClosed {
            session_id: session.id.clone(),
            reason,
        });
        result
    }

    async fn read_connect<S>(
        &self,
        reader: &mut ReadHalf<S>,
        buf: &mut BytesMut,
    ) -> Result<(FrameCodec, ConnectFrame)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let version = read_protocol_version(reader, buf).await?;
        let codec = FrameCodec::new(version, self.max_packet_size);
        match codec.read_frame(reader, buf).await? {
            Frame::Connect(connect) => {
                debug!(
                    "CONNECT from {:?} ({}), keep_alive={}s",
                    connect.client_id, version, connect.keep_alive
                );
                Ok((codec, connect))
            }
            other => Err(Error::ProtocolViolation(format!(
                "expected CONNECT, got {}",
                other.name()
            ))),
        }
    }

    /// Resolve the principal and roles. The error carries the principal for audit.
    async fn authenticate(
        &self,
        connect: &ConnectFrame,
        identity: Option<&CertificateIdentity>,
        protocol: ProtocolVersion,
        state: SessionState,
    ) -> std::result::Result<Session, (String, Error)> {
        let (principal, roles) = match self.auth_mode {
            AuthMode::Password => {
                let username = connect.username.clone().unwrap_or_default();
                match self.authenticator.authenticate(&username, &connect.password).await {
                    Ok(roles) => (username, roles),
                    Err(e) => return Err((username, e)),
                }
            }
            AuthMode::Certificate => {
                let Some(identity) = identity else {
                    warn!("Certificate authentication without a client certificate");
                    return Err((String::new(), Error::BadCredentials));
                };
                let principal = identity.common_name.clone().unwrap_or_default();
                match self.authenticator.authenticate_certificate(identity).await {
                    Ok(roles) => (principal, roles),
                    Err(e) => return Err((principal, e)),
                }
            }
        };
        Ok(Session::new(connect, principal, roles, protocol, state))
    }

    /// Serve an authenticated session. Its subscriptions are dropped on exit.
    async fn active_loop<S>(
        &self,
        session: &Session,
        codec: FrameCodec,
        reader: &mut ReadHalf<S>,
        writer: &mut WriteHalf<S>,
        buf: &mut BytesMut,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<Message>(DELIVERY_QUEUE);
        let handle = SubscriberHandle::new(session.id.as_str(), tx);
        let window = session.keep_alive_window();
        let mut deadline = window.map(|w| Instant::now() + w);

        let result: Result<()> = async {
            loop {
                tokio::select! {
                    frame = read_before(deadline, codec.read_frame(reader, buf)) => {
                        let frame = match frame {
                            Ok(frame) => frame,
                            Err(Error::Timeout(_)) => {
                                warn!("Session {} keep-alive timeout ({}s)", session.id, session.keep_alive);
                                return Err(Error::Timeout("keep-alive".to_string()));
                            }
                            Err(e) => return Err(e),
                        };
                        deadline = window.map(|w| Instant::now() + w);

                        match self.handle_frame(session, &handle, codec, writer, frame).await? {
                            Flow::Continue => {}
                            Flow::Disconnect => return Ok(()),
                        }
                    }

                    Some(msg) = rx.recv() => {
                        codec.write_reply(writer, Reply::Publish(msg)).await?;
                    }
                }
            }
        }
        .await;

        self.fabric.disconnect(&handle).await;
        result
    }

    async fn handle_frame<W>(
        &self,
        session: &Session,
        handle: &SubscriberHandle,
        codec: FrameCodec,
        writer: &mut W,
        frame: Frame,
    ) -> Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        match frame {
            Frame::Publish {
                topic,
                qos,
                pkid,
                retain,
                payload,
            } => {
                let msg = Message::new(topic, payload).with_retain(retain);
                self.handle_publish(session, codec, writer, msg, qos, pkid).await?;
            }
            Frame::PubRel { pkid } => {
                codec.write_reply(writer, Reply::PubComp { pkid }).await?;
            }
            Frame::Subscribe { pkid, filters } => {
                let mut granted = Vec::with_capacity(filters.len());
                for filter in &filters {
                    granted.push(self.handle_subscribe(session, handle, filter).await);
                }
                codec.write_reply(writer, Reply::SubAck { pkid, granted }).await?;
            }
            Frame::Unsubscribe { pkid, filters } => {
                for filter in &filters {
                    self.fabric.unsubscribe(handle, filter).await;
                }
                debug!("Session {} unsubscribed from {:?}", session.id, filters);
                codec
                    .write_reply(
                        writer,
                        Reply::UnsubAck {
                            pkid,
                            count: filters.len(),
                        },
                    )
                    .await?;
            }
            Frame::PingReq => {
                codec.write_reply(writer, Reply::PingResp).await?;
            }
            Frame::Disconnect => {
                debug!("Session {} sent DISCONNECT", session.id);
                return Ok(Flow::Disconnect);
            }
            Frame::Connect(_) => {
                return Err(Error::ProtocolViolation("second CONNECT".to_string()));
            }
            Frame::Other(name) => {
                return Err(Error::ProtocolViolation(format!("unexpected {name} packet")));
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_publish<W>(
        &self,
        session: &Session,
        codec: FrameCodec,
        writer: &mut W,
        msg: Message,
        qos: QoS,
        pkid: u16,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if msg.topic.is_empty() || msg.topic.contains(['+', '#']) {
            return Err(Error::ProtocolViolation(format!(
                "invalid PUBLISH topic {:?}",
                msg.topic
            )));
        }

        let decision = self.acl.authorize(&session.roles, &msg.topic, Action::Publish);
        let authorized = if decision.is_allowed() {
            self.fabric.publish(msg).await;
            true
        } else {
            warn!(
                "ACL denied publish from {} ({}) to {}",
                session.client_id, session.principal, msg.topic
            );
            self.audit.record(&AuditEvent::Denied {
                session_id: session.id.clone(),
                principal: session.principal.clone(),
                action: Action::Publish,
                topic: msg.topic.clone(),
            });

            let policy = self.acl.publish_denial(&session.roles);
            if policy == PublishDenial::Reject
                && qos.requires_ack()
                && codec.version == ProtocolVersion::V4
            {
                return Err(Error::ProtocolViolation(format!(
                    "publish to {} not authorized",
                    msg.topic
                )));
            }
            policy == PublishDenial::Drop
        };

        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                codec
                    .write_reply(writer, Reply::PubAck { pkid, authorized })
                    .await?;
            }
            QoS::ExactlyOnce => {
                codec
                    .write_reply(writer, Reply::PubRec { pkid, authorized })
                    .await?;
            }
        }
        Ok(())
    }

    /// Authorize and register one filter. Returns whether it was granted.
    async fn handle_subscribe(&self, session: &Session, handle: &SubscriberHandle, filter: &str) -> bool {
        let acl_filter = parse_shared_topic(filter).map_or(filter, |(_, inner)| inner);
        if !self
            .acl
            .authorize(&session.roles, acl_filter, Action::Subscribe)
            .is_allowed()
        {
            warn!(
                "ACL denied subscribe from {} ({}) to {}",
                session.client_id, session.principal, filter
            );
            self.audit.record(&AuditEvent::Denied {
                session_id: session.id.clone(),
                principal: session.principal.clone(),
                action: Action::Subscribe,
                topic: filter.to_string(),
            });
            return false;
        }

        match self.fabric.subscribe(handle, filter).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Session {} failed to subscribe to {}: {}", session.id, filter, e);
                false
            }
        }
    }
}

impl fmt::Debug for SessionGatekeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGatekeeper")
            .field("auth_mode", &self.auth_mode)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_packet_size", &self.max_packet_size)
            .finish_non_exhaustive()
    }
}

/// Read one frame, failing with `Timeout` once `deadline` passes.
async fn read_before<F>(deadline: Option<Instant>, read: F) -> Result<Frame>
where
    F: Future<Output = Result<Frame>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, read)
            .await
            .map_err(|_| Error::Timeout("keep-alive".to_string()))?,
        None => read.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition(Authenticating));
        assert!(Authenticating.can_transition(Active));
        assert!(Authenticating.can_transition(Closing));
        assert!(Active.can_transition(Closing));
        assert!(Closing.can_transition(Closed));
        for state in [Connecting, Authenticating, Active, Closing] {
            assert!(state.can_transition(Closed));
        }
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionState::*;
        assert!(!Connecting.can_transition(Active));
        assert!(!Active.can_transition(Authenticating));
        assert!(!Closing.can_transition(Active));
        for state in [Connecting, Authenticating, Active, Closing, Closed] {
            assert!(!Closed.can_transition(state));
        }
        assert!(matches!(
            Connecting.transition(Active),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_keep_alive_window() {
        let connect = ConnectFrame {
            client_id: String::new(),
            username: None,
            password: Vec::new(),
            keep_alive: 10,
            clean_session: true,
        };
        let roles = RoleSet::new(["full"]).unwrap();
        let mut session = Session::new(
            &connect,
            "user".to_string(),
            roles.clone(),
            ProtocolVersion::V4,
            SessionState::Authenticating,
        );
        assert_eq!(session.keep_alive_window(), Some(Duration::from_secs(15)));
        // Empty client id falls back to the session id.
        assert_eq!(session.client_id, session.id);
        assert_eq!(session.state(), SessionState::Authenticating);

        // The session carries on from the state it was handed.
        session.transition(SessionState::Active).unwrap();
        session.transition(SessionState::Closing).unwrap();
        session.transition(SessionState::Closed).unwrap();
        assert!(session.transition(SessionState::Active).is_err());
        assert_eq!(session.state(), SessionState::Closed);

        let idle = ConnectFrame {
            keep_alive: 0,
            ..connect
        };
        let session = Session::new(
            &idle,
            "user".to_string(),
            roles,
            ProtocolVersion::V5,
            SessionState::Authenticating,
        );
        assert_eq!(session.keep_alive_window(), None);
    }
}

//! Gate server: TLS admission followed by the session gatekeeper.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::acl::{AclEngine, RoleConfig};
use crate::admission::{DEFAULT_HANDSHAKE_TIMEOUT, TlsAdmissionGate, TlsSettings};
use crate::audit::{AuditEvent, AuditSink, TracingAudit};
use crate::auth::{CredentialAuthenticator, Directory};
use crate::error::{Error, Result};
use crate::fabric::{LocalFabric, RoutingFabric};
use crate::protocol::MAX_PACKET_SIZE;
use crate::revocation::RevocationStore;
use crate::session::{DEFAULT_CONNECT_TIMEOUT, SessionGatekeeper};
use crate::types::AuthMode;

/// Gate configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Listen address (host:port).
    pub addr: String,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Time allowed for the CONNECT packet after admission.
    pub connect_timeout: Duration,
    /// Time allowed for the TLS handshake.
    pub handshake_timeout: Duration,
    /// How sessions are authenticated.
    pub auth_mode: AuthMode,
}

impl GateConfig {
    /// Create a new gate config.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_packet_size: MAX_PACKET_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            auth_mode: AuthMode::default(),
        }
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::new("0.0.0.0:8883")
    }
}

/// Builder for Gate.
pub struct GateBuilder {
    config: GateConfig,
    tls: Option<TlsSettings>,
    crl_source: Option<PathBuf>,
    revocations: Option<Arc<RevocationStore>>,
    directory: Option<Arc<dyn Directory>>,
    roles: Vec<RoleConfig>,
    fabric: Option<Arc<dyn RoutingFabric>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl GateBuilder {
    /// Create a new gate builder.
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            tls: None,
            crl_source: None,
            revocations: None,
            directory: None,
            roles: Vec::new(),
            fabric: None,
            audit: None,
        }
    }

    /// Server certificate and client trust anchors.
    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.tls = Some(settings);
        self
    }

    /// Load CRLs from a file or directory at build time.
    pub fn crl_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.crl_source = Some(source.into());
        self
    }

    /// Use an existing revocation store instead of `crl_source`.
    pub fn revocations(mut self, store: Arc<RevocationStore>) -> Self {
        self.revocations = Some(store);
        self
    }

    /// Set the user directory.
    pub fn directory<D: Directory + 'static>(mut self, directory: D) -> Self {
        self.directory = Some(Arc::new(directory));
        self
    }

    /// Set the user directory from a shared handle.
    pub fn directory_arc(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the role table.
    pub fn roles(mut self, roles: Vec<RoleConfig>) -> Self {
        self.roles = roles;
        self
    }

    /// Set the routing fabric (defaults to [`LocalFabric`]).
    pub fn fabric(mut self, fabric: Arc<dyn RoutingFabric>) -> Self {
        self.fabric = Some(fabric);
        self
    }

    /// Set the audit sink (defaults to [`TracingAudit`]).
    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Build the gate. Fails on any configuration error before a socket is bound.
    pub fn build(self) -> Result<Gate> {
        let tls = self
            .tls
            .ok_or_else(|| Error::InvalidConfig("TLS settings are required".to_string()))?;
        let directory = self
            .directory
            .ok_or_else(|| Error::InvalidConfig("a user directory is required".to_string()))?;
        let trusted_issuers = tls.trusted_issuers()?;

        let revocations = match (self.revocations, self.crl_source) {
            (Some(store), _) => {
                let snapshot = store.snapshot();
                if let Some(missing) = trusted_issuers.iter().find(|i| !snapshot.covers(i)) {
                    return Err(Error::MissingRevocationData(missing.clone()));
                }
                store
            }
            (None, Some(source)) => Arc::new(RevocationStore::load(source, trusted_issuers)?),
            (None, None) => {
                return Err(Error::InvalidConfig(
                    "revocation data is required (crl_source or revocations)".to_string(),
                ));
            }
        };

        let acl = Arc::new(AclEngine::from_config(&self.roles)?);
        let fabric = self.fabric.unwrap_or_else(|| Arc::new(LocalFabric::new()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAudit));

        let admission = TlsAdmissionGate::new(&tls, Arc::clone(&revocations))?
            .handshake_timeout(self.config.handshake_timeout)
            .audit(Arc::clone(&audit));
        let gatekeeper = SessionGatekeeper::new(
            CredentialAuthenticator::new(directory),
            Arc::clone(&acl),
            Arc::clone(&fabric),
        )
        .audit(Arc::clone(&audit))
        .auth_mode(self.config.auth_mode)
        .connect_timeout(self.config.connect_timeout)
        .max_packet_size(self.config.max_packet_size);

        Ok(Gate {
            config: self.config,
            context: Arc::new(GateContext {
                admission,
                gatekeeper,
            }),
            revocations,
            acl,
            fabric,
            audit,
            acl_generation: AtomicU64::new(1),
            running: AtomicBool::new(false),
        })
    }
}

/// State shared with connection tasks.
struct GateContext {
    admission: TlsAdmissionGate,
    gatekeeper: SessionGatekeeper,
}

impl GateContext {
    async fn handle_connection<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let admitted = self.admission.admit(stream, peer).await?;
        self.gatekeeper
            .run(admitted.stream, admitted.identity.as_ref())
            .await
    }
}

/// MQTT admission and authorization gate.
pub struct Gate {
    config: GateConfig,
    context: Arc<GateContext>,
    revocations: Arc<RevocationStore>,
    acl: Arc<AclEngine>,
    fabric: Arc<dyn RoutingFabric>,
    audit: Arc<dyn AuditSink>,
    acl_generation: AtomicU64,
    running: AtomicBool,
}

impl Gate {
    /// Create a builder for a gate.
    pub fn builder(config: GateConfig) -> GateBuilder {
        GateBuilder::new(config)
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Bind `config.addr` and serve until an accept error.
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        info!("Gate listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Accepted connection from {}", peer);

            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                if let Err(e) = context.handle_connection(stream, peer).await {
                    debug!("Connection {} ended: {}", peer, e);
                }
            });
        }
    }

    /// Run admission and the session on one stream, on the current task.
    pub async fn handle_connection<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.context.handle_connection(stream, peer).await
    }

    /// Re-read the CRL source. The previous snapshot stays active on error.
    pub fn reload_revocations(&self) -> Result<u64> {
        match self.revocations.reload() {
            Ok(snapshot) => {
                self.audit.record(&AuditEvent::Reloaded {
                    target: "revocations".to_string(),
                    generation: snapshot.generation(),
                });
                Ok(snapshot.generation())
            }
            Err(e) => {
                self.audit.record(&AuditEvent::ReloadFailed {
                    target: "revocations".to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Replace the role table. The previous table stays active on error.
    pub fn reload_acl(&self, roles: &[RoleConfig]) -> Result<u64> {
        match self.acl.reload(roles) {
            Ok(()) => {
                let generation = self.acl_generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.audit.record(&AuditEvent::Reloaded {
                    target: "acl".to_string(),
                    generation,
                });
                Ok(generation)
            }
            Err(e) => {
                self.audit.record(&AuditEvent::ReloadFailed {
                    target: "acl".to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn revocations(&self) -> &Arc<RevocationStore> {
        &self.revocations
    }

    pub fn acl(&self) -> &Arc<AclEngine> {
        &self.acl
    }

    pub fn fabric(&self) -> &Arc<dyn RoutingFabric> {
        &self.fabric
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("config", &self.config)
            .field("revocations", &self.revocations)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

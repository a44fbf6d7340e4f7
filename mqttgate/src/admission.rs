//! TLS admission with certificate revocation checks.
//!
//! Chain validation is done by rustls' `WebPkiClientVerifier`. The
//! [`RevocationCheckingVerifier`] wrapping it consults the
//! [`RevocationStore`] for the leaf certificate inside the handshake, so a
//! revoked client is refused with a `certificate_revoked` alert before any
//! MQTT byte is read.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::client::danger::HandshakeSignatureValid;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{
    self, CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink, TracingAudit};
use crate::error::{Error, Rejection, Result};
use crate::revocation::RevocationStore;
use crate::types::CertificateIdentity;

/// Default TLS handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

tokio::task_local! {
    /// Revocation verdict of the handshake running on the current task.
    static VERDICT: RefCell<Option<Rejection>>;
}

/// Server certificate, key and client trust anchors.
#[derive(Debug)]
pub struct TlsSettings {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_ca: Vec<CertificateDer<'static>>,
    require_client_cert: bool,
}

impl TlsSettings {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_ca: Vec<CertificateDer<'static>>,
    ) -> Self {
        Self {
            cert_chain,
            key,
            client_ca,
            require_client_cert: true,
        }
    }

    /// Load everything from PEM files.
    pub fn from_pem_files(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
        client_ca: impl AsRef<Path>,
    ) -> Result<Self> {
        Ok(Self::new(
            load_certs(cert.as_ref())?,
            load_private_key(key.as_ref())?,
            load_certs(client_ca.as_ref())?,
        ))
    }

    /// Whether clients must present a certificate (default true).
    pub fn require_client_cert(mut self, required: bool) -> Self {
        self.require_client_cert = required;
        self
    }

    /// Subjects of the client CAs; the revocation store must cover each.
    pub fn trusted_issuers(&self) -> Result<Vec<String>> {
        self.client_ca
            .iter()
            .map(|ca| {
                CertificateIdentity::from_der(ca)
                    .map(|id| id.subject)
                    .map_err(|e| Error::InvalidConfig(format!("unparsable client CA: {e}")))
            })
            .collect()
    }

    fn server_config(&self, revocations: Arc<RevocationStore>) -> Result<Arc<ServerConfig>> {
        let mut roots = RootCertStore::empty();
        for ca in &self.client_ca {
            roots
                .add(ca.clone())
                .map_err(|e| Error::InvalidConfig(format!("failed to add client CA: {e}")))?;
        }

        let builder = WebPkiClientVerifier::builder(Arc::new(roots));
        let builder = if self.require_client_cert {
            builder
        } else {
            builder.allow_unauthenticated()
        };
        let inner = builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build client verifier: {e}")))?;

        let verifier = Arc::new(RevocationCheckingVerifier::new(inner, revocations));
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| Error::InvalidConfig(format!("server cert/key mismatch: {e}")))?;

        Ok(Arc::new(config))
    }
}

/// Load all certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::InvalidConfig(format!("failed to parse certs from {}: {e}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_file(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| {
            Error::InvalidConfig(format!("failed to parse private key from {}: {e}", path.display()))
        })?
        .ok_or_else(|| Error::InvalidConfig(format!("no private key found in {}", path.display())))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::InvalidConfig(format!("cannot read {}: {e}", path.display())))
}

/// Client certificate verifier adding revocation checks to an inner verifier.
#[derive(Debug)]
pub struct RevocationCheckingVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    revocations: Arc<RevocationStore>,
}

impl RevocationCheckingVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>, revocations: Arc<RevocationStore>) -> Self {
        Self { inner, revocations }
    }

    fn check_revocation(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let identity = CertificateIdentity::from_der(end_entity)
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;

        // One snapshot for the whole decision.
        let snapshot = self.revocations.snapshot();
        if !snapshot.covers(&identity.issuer) {
            warn!("No revocation data for issuer {}", identity.issuer);
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownRevocationStatus,
            ));
        }
        if snapshot.is_revoked(&identity.issuer, &identity.serial) {
            let rejection = Rejection::CertificateRevoked {
                issuer: identity.issuer.clone(),
                serial: identity.serial_hex(),
            };
            let _ = VERDICT.try_with(|v| *v.borrow_mut() = Some(rejection));
            return Err(rustls::Error::InvalidCertificate(CertificateError::Revoked));
        }
        Ok(())
    }
}

impl ClientCertVerifier for RevocationCheckingVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
        self.check_revocation(end_entity)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// A TLS stream that passed admission.
pub struct AdmittedTransport<S> {
    pub stream: TlsStream<S>,
    /// Leaf certificate identity; `None` only when client certificates are optional.
    pub identity: Option<CertificateIdentity>,
    pub peer: SocketAddr,
}

impl<S> std::fmt::Debug for AdmittedTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmittedTransport")
            .field("identity", &self.identity)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Runs the TLS handshake and decides admission.
pub struct TlsAdmissionGate {
    acceptor: TlsAcceptor,
    revocations: Arc<RevocationStore>,
    handshake_timeout: Duration,
    audit: Arc<dyn AuditSink>,
}

impl TlsAdmissionGate {
    pub fn new(settings: &TlsSettings, revocations: Arc<RevocationStore>) -> Result<Self> {
        let config = settings.server_config(Arc::clone(&revocations))?;
        Ok(Self {
            acceptor: TlsAcceptor::from(config),
            revocations,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            audit: Arc::new(TracingAudit),
        })
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn revocations(&self) -> &Arc<RevocationStore> {
        &self.revocations
    }

    /// Handshake with `peer`. On rejection the stream is dropped.
    pub async fn admit<S>(
        &self,
        stream: S,
        peer: SocketAddr,
    ) -> std::result::Result<AdmittedTransport<S>, Rejection>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = VERDICT.scope(RefCell::new(None), async {
            let result = self.acceptor.accept(stream).await;
            let verdict = VERDICT.with(|v| v.borrow_mut().take());
            (result, verdict)
        });

        let rejection = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok((Ok(stream), _)) => match peer_identity(&stream) {
                Ok(identity) => {
                    let admitted = AdmittedTransport {
                        stream,
                        identity,
                        peer,
                    };
                    self.record_admitted(&admitted);
                    return Ok(admitted);
                }
                Err(cause) => Rejection::HandshakeFailed { cause },
            },
            Ok((Err(e), verdict)) => classify(e, verdict),
            Err(_) => Rejection::HandshakeFailed {
                cause: format!("handshake timed out after {:?}", self.handshake_timeout),
            },
        };

        warn!("Rejected {}: {}", peer, rejection);
        self.audit.record(&AuditEvent::Rejected {
            peer,
            reason: rejection.reason().to_string(),
            detail: rejection.to_string(),
        });
        Err(rejection)
    }

    fn record_admitted<S>(&self, admitted: &AdmittedTransport<S>) {
        let (subject, serial) = match &admitted.identity {
            Some(id) => (Some(id.subject.clone()), Some(id.serial_hex())),
            None => (None, None),
        };
        info!(
            "Admitted {} (subject: {})",
            admitted.peer,
            subject.as_deref().unwrap_or("-")
        );
        self.audit.record(&AuditEvent::Admitted {
            peer: admitted.peer,
            subject,
            serial,
        });
    }
}

impl std::fmt::Debug for TlsAdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAdmissionGate")
            .field("revocations", &self.revocations)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

fn peer_identity<S>(stream: &TlsStream<S>) -> std::result::Result<Option<CertificateIdentity>, String> {
    let (_, conn) = stream.get_ref();
    match conn.peer_certificates().and_then(|chain| chain.first()) {
        Some(leaf) => CertificateIdentity::from_der(leaf)
            .map(Some)
            .map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

fn classify(err: io::Error, verdict: Option<Rejection>) -> Rejection {
    if let Some(rejection) = verdict {
        return rejection;
    }
    debug!("Handshake error: {:?}", err);
    match err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        Some(rustls::Error::InvalidCertificate(CertificateError::Revoked)) => {
            Rejection::CertificateRevoked {
                issuer: String::new(),
                serial: String::new(),
            }
        }
        Some(tls) => Rejection::HandshakeFailed {
            cause: tls.to_string(),
        },
        None => Rejection::HandshakeFailed {
            cause: err.to_string(),
        },
    }
}

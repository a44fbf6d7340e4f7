//! Certificate revocation store.
//!
//! Holds the set of revoked serial numbers per issuer as an immutable
//! [`RevocationSnapshot`]. Lookups clone the current `Arc` and never observe a
//! half-built list; [`RevocationStore::reload`] parses the configured source
//! into a fresh snapshot and swaps it in only when parsing succeeded and every
//! trusted issuer is still covered.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::error::{Error, Result};

/// File extensions picked up when the source is a directory.
const CRL_EXTENSIONS: &[&str] = &["pem", "crl", "der"];

/// A revoked (issuer, serial) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEntry {
    /// Issuer distinguished name.
    pub issuer: String,
    /// Raw serial number bytes.
    pub serial: Vec<u8>,
    /// Revocation date (unix seconds).
    pub revoked_at: Option<i64>,
    /// CRL reason code (RFC 5280 §5.3.1).
    pub reason: Option<u8>,
}

impl RevocationEntry {
    pub fn new(issuer: impl Into<String>, serial: impl Into<Vec<u8>>) -> Self {
        Self {
            issuer: issuer.into(),
            serial: serial.into(),
            revoked_at: None,
            reason: None,
        }
    }
}

/// Per-issuer revocation list.
#[derive(Debug, Clone, Default)]
struct IssuerList {
    next_update: Option<i64>,
    revoked: HashMap<Vec<u8>, RevocationEntry>,
}

/// Immutable view of all loaded CRLs.
#[derive(Debug, Clone, Default)]
pub struct RevocationSnapshot {
    issuers: HashMap<String, IssuerList>,
    generation: u64,
}

impl RevocationSnapshot {
    /// Build a snapshot from explicit data.
    ///
    /// `issuers` lists the issuers the snapshot is authoritative for; issuers
    /// of `entries` are added implicitly.
    pub fn from_entries<I, S, E>(issuers: I, entries: E) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        E: IntoIterator<Item = RevocationEntry>,
    {
        let mut snapshot = Self::default();
        for issuer in issuers {
            snapshot.issuers.entry(issuer.into()).or_default();
        }
        for entry in entries {
            snapshot.insert(entry);
        }
        snapshot
    }

    fn insert(&mut self, entry: RevocationEntry) {
        self.issuers
            .entry(entry.issuer.clone())
            .or_default()
            .revoked
            .insert(entry.serial.clone(), entry);
    }

    /// Whether `serial` issued by `issuer` is revoked.
    pub fn is_revoked(&self, issuer: &str, serial: &[u8]) -> bool {
        self.entry(issuer, serial).is_some()
    }

    /// The revocation entry for a certificate, if any.
    pub fn entry(&self, issuer: &str, serial: &[u8]) -> Option<&RevocationEntry> {
        self.issuers.get(issuer)?.revoked.get(serial)
    }

    /// Whether a CRL for `issuer` is present.
    pub fn covers(&self, issuer: &str) -> bool {
        self.issuers.contains_key(issuer)
    }

    /// Issuers with revocation data.
    pub fn issuers(&self) -> impl Iterator<Item = &str> {
        self.issuers.keys().map(String::as_str)
    }

    /// `nextUpdate` of the issuer's CRL (unix seconds).
    pub fn next_update(&self, issuer: &str) -> Option<i64> {
        self.issuers.get(issuer)?.next_update
    }

    /// Total number of revoked certificates.
    pub fn len(&self) -> usize {
        self.issuers.values().map(|l| l.revoked.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload counter assigned by the owning store.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Parse a CRL file or a directory of CRL files.
    pub fn parse_source(source: &Path) -> Result<Self> {
        let mut snapshot = Self::default();
        if source.is_dir() {
            let mut paths: Vec<PathBuf> = fs::read_dir(source)
                .map_err(|e| {
                    Error::MalformedRevocationData(format!("cannot read {}: {e}", source.display()))
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| CRL_EXTENSIONS.contains(&ext))
                })
                .collect();
            paths.sort();
            for path in paths {
                snapshot.parse_file(&path)?;
            }
        } else {
            snapshot.parse_file(source)?;
        }
        Ok(snapshot)
    }

    fn parse_file(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path).map_err(|e| {
            Error::MalformedRevocationData(format!("cannot read {}: {e}", path.display()))
        })?;

        let ders: Vec<Vec<u8>> = if data.starts_with(b"-----BEGIN") {
            rustls_pemfile::crls(&mut data.as_slice())
                .map(|crl| crl.map(|der| der.as_ref().to_vec()))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| {
                    Error::MalformedRevocationData(format!("{}: {e}", path.display()))
                })?
        } else {
            vec![data]
        };

        if ders.is_empty() {
            return Err(Error::MalformedRevocationData(format!(
                "{}: no CRL found",
                path.display()
            )));
        }

        for der in &ders {
            self.parse_der(der)
                .map_err(|e| Error::MalformedRevocationData(format!("{}: {e}", path.display())))?;
        }
        debug!("Loaded {} CRL(s) from {}", ders.len(), path.display());
        Ok(())
    }

    fn parse_der(&mut self, der: &[u8]) -> std::result::Result<(), String> {
        let (_, crl) = CertificateRevocationList::from_der(der).map_err(|e| e.to_string())?;
        let issuer = crl.issuer().to_string();

        let list = self.issuers.entry(issuer.clone()).or_default();
        list.next_update = crl.next_update().map(|t| t.timestamp());

        for revoked in crl.iter_revoked_certificates() {
            let entry = RevocationEntry {
                issuer: issuer.clone(),
                serial: revoked.raw_serial().to_vec(),
                revoked_at: Some(revoked.revocation_date.timestamp()),
                reason: revoked.reason_code().map(|(_, code)| code.0),
            };
            list.revoked.insert(entry.serial.clone(), entry);
        }
        Ok(())
    }

    fn ensure_covers(&self, trusted_issuers: &[String]) -> Result<()> {
        for issuer in trusted_issuers {
            if !self.covers(issuer) {
                return Err(Error::MissingRevocationData(issuer.clone()));
            }
        }
        Ok(())
    }
}

/// Shared, reloadable revocation store.
pub struct RevocationStore {
    source: Option<PathBuf>,
    trusted_issuers: Vec<String>,
    current: RwLock<Arc<RevocationSnapshot>>,
    generation: AtomicU64,
}

impl RevocationStore {
    /// Load CRLs from `source` (file or directory).
    ///
    /// Fails with [`Error::MissingRevocationData`] when any of
    /// `trusted_issuers` has no CRL in the source.
    pub fn load(source: impl Into<PathBuf>, trusted_issuers: Vec<String>) -> Result<Self> {
        let source = source.into();
        let mut snapshot = RevocationSnapshot::parse_source(&source)?;
        snapshot.ensure_covers(&trusted_issuers)?;
        snapshot.generation = 1;

        info!(
            "Revocation store loaded from {}: {} issuer(s), {} revoked",
            source.display(),
            snapshot.issuers.len(),
            snapshot.len()
        );

        Ok(Self {
            source: Some(source),
            trusted_issuers,
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
        })
    }

    /// Create a store serving a fixed snapshot with no file source.
    pub fn from_snapshot(mut snapshot: RevocationSnapshot) -> Self {
        snapshot.generation = 1;
        Self {
            source: None,
            trusted_issuers: Vec::new(),
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
        }
    }

    /// The current snapshot. Hold on to it for a consistent view.
    pub fn snapshot(&self) -> Arc<RevocationSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Check the current snapshot.
    pub fn is_revoked(&self, issuer: &str, serial: &[u8]) -> bool {
        self.snapshot().is_revoked(issuer, serial)
    }

    /// Issuers that must always be covered.
    pub fn trusted_issuers(&self) -> &[String] {
        &self.trusted_issuers
    }

    /// Re-read the configured source and swap the snapshot.
    ///
    /// On error the previous snapshot stays active.
    pub fn reload(&self) -> Result<Arc<RevocationSnapshot>> {
        let source = self.source.as_ref().ok_or_else(|| {
            Error::InvalidConfig("revocation store has no source to reload".to_string())
        })?;

        let snapshot = RevocationSnapshot::parse_source(source)
            .and_then(|s| s.ensure_covers(&self.trusted_issuers).map(|_| s));
        match snapshot {
            Ok(snapshot) => Ok(self.publish(snapshot)),
            Err(e) => {
                warn!("Revocation reload from {} failed, keeping previous snapshot: {}", source.display(), e);
                Err(e)
            }
        }
    }

    /// Swap in an externally built snapshot.
    pub fn replace(&self, snapshot: RevocationSnapshot) -> Result<Arc<RevocationSnapshot>> {
        snapshot.ensure_covers(&self.trusted_issuers)?;
        Ok(self.publish(snapshot))
    }

    fn publish(&self, mut snapshot: RevocationSnapshot) -> Arc<RevocationSnapshot> {
        snapshot.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(snapshot);
        *self.current.write() = Arc::clone(&snapshot);
        info!(
            "Revocation snapshot {} active: {} revoked",
            snapshot.generation,
            snapshot.len()
        );
        snapshot
    }
}

impl std::fmt::Debug for RevocationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationStore")
            .field("source", &self.source)
            .field("trusted_issuers", &self.trusted_issuers)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestPki;

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = RevocationSnapshot::from_entries(
            ["CN=Other CA"],
            [RevocationEntry::new("CN=Test CA", vec![0x10, 0x02])],
        );

        assert!(snapshot.is_revoked("CN=Test CA", &[0x10, 0x02]));
        assert!(!snapshot.is_revoked("CN=Test CA", &[0x10, 0x01]));
        // Same serial under another issuer is a different certificate.
        assert!(!snapshot.is_revoked("CN=Other CA", &[0x10, 0x02]));
        assert!(snapshot.covers("CN=Other CA"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_load_pem_crl() {
        let pki = TestPki::new("Test CA");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        fs::write(&path, pki.crl_pem(&[&[0x10, 0x02]])).unwrap();

        let store = RevocationStore::load(&path, vec![pki.ca_name.clone()]).unwrap();
        assert!(store.is_revoked(&pki.ca_name, &[0x10, 0x02]));
        assert!(!store.is_revoked(&pki.ca_name, &[0x10, 0x01]));

        let snapshot = store.snapshot();
        let entry = snapshot.entry(&pki.ca_name, &[0x10, 0x02]).unwrap();
        assert!(entry.revoked_at.is_some());
        assert_eq!(entry.reason, Some(1)); // keyCompromise
        assert!(snapshot.next_update(&pki.ca_name).is_some());
    }

    #[test]
    fn test_load_directory_one_crl_per_issuer() {
        let a = TestPki::new("Issuer A");
        let b = TestPki::new("Issuer B");
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pem"), a.crl_pem(&[&[0x01]])).unwrap();
        fs::write(dir.path().join("b.der"), b.crl_der(&[&[0x02]])).unwrap();
        fs::write(dir.path().join("README"), "not a crl").unwrap();

        let store =
            RevocationStore::load(dir.path(), vec![a.ca_name.clone(), b.ca_name.clone()]).unwrap();
        assert!(store.is_revoked(&a.ca_name, &[0x01]));
        assert!(store.is_revoked(&b.ca_name, &[0x02]));
        assert!(!store.is_revoked(&a.ca_name, &[0x02]));
    }

    #[test]
    fn test_missing_issuer_is_fatal() {
        let pki = TestPki::new("Test CA");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        fs::write(&path, pki.crl_pem(&[])).unwrap();

        let err = RevocationStore::load(&path, vec!["CN=Unknown CA".to_string()]).unwrap_err();
        assert!(matches!(err, Error::MissingRevocationData(ref issuer) if issuer == "CN=Unknown CA"));
    }

    #[test]
    fn test_malformed_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.crl");
        fs::write(&path, b"\x30\x03garbage").unwrap();

        let err = RevocationStore::load(&path, vec![]).unwrap_err();
        assert!(matches!(err, Error::MalformedRevocationData(_)));
    }

    #[test]
    fn test_reload_swaps_and_keeps_last_good() {
        let pki = TestPki::new("Test CA");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        fs::write(&path, pki.crl_pem(&[&[0x10, 0x02]])).unwrap();

        let store = RevocationStore::load(&path, vec![pki.ca_name.clone()]).unwrap();
        let before = store.snapshot();
        assert_eq!(before.generation(), 1);

        // A new revocation becomes visible after a successful reload.
        fs::write(&path, pki.crl_pem(&[&[0x10, 0x02], &[0x10, 0x03]])).unwrap();
        let after = store.reload().unwrap();
        assert_eq!(after.generation(), 2);
        assert!(store.is_revoked(&pki.ca_name, &[0x10, 0x03]));

        // The old snapshot is untouched by the swap.
        assert!(!before.is_revoked(&pki.ca_name, &[0x10, 0x03]));

        // A broken file leaves the last good snapshot serving.
        fs::write(&path, "-----BEGIN X509 CRL-----\nnot base64\n-----END X509 CRL-----\n").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().generation(), 2);
        assert!(store.is_revoked(&pki.ca_name, &[0x10, 0x03]));
    }

    #[test]
    fn test_concurrent_lookups_see_whole_snapshots() {
        let store = Arc::new(RevocationStore::from_snapshot(RevocationSnapshot::from_entries(
            ["CN=Test CA"],
            [
                RevocationEntry::new("CN=Test CA", vec![0x01]),
                RevocationEntry::new("CN=Test CA", vec![0x02]),
            ],
        )));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let snapshot = store.snapshot();
                        // Each snapshot revokes either {1,2} or {3,4}, never a mix.
                        let old = snapshot.is_revoked("CN=Test CA", &[0x01])
                            && snapshot.is_revoked("CN=Test CA", &[0x02]);
                        let new = snapshot.is_revoked("CN=Test CA", &[0x03])
                            && snapshot.is_revoked("CN=Test CA", &[0x04]);
                        assert!(old ^ new, "observed a partial snapshot");
                        assert_eq!(snapshot.len(), 2);
                    }
                })
            })
            .collect();

        for i in 0..200u8 {
            let serials = if i % 2 == 0 { [0x03, 0x04] } else { [0x01, 0x02] };
            store
                .replace(RevocationSnapshot::from_entries(
                    ["CN=Test CA"],
                    serials.map(|s| RevocationEntry::new("CN=Test CA", vec![s])),
                ))
                .unwrap();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}

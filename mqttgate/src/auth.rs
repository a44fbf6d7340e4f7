//! Credential authentication against a pluggable directory.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{CertificateIdentity, RoleSet};

/// User/role directory consulted by the authenticator.
///
/// Implementations may do I/O; they only suspend the calling connection.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Check a username/password pair.
    async fn verify_password(&self, username: &str, password: &[u8]) -> bool;

    /// Role names held by `username`.
    async fn roles_of(&self, username: &str) -> BTreeSet<String>;
}

/// In-memory directory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
}

#[derive(Debug, Default, Clone)]
struct UserRecord {
    password: Vec<u8>,
    roles: BTreeSet<String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user's password.
    pub fn add_user(&self, username: impl Into<String>, password: impl Into<Vec<u8>>) {
        self.users.write().entry(username.into()).or_default().password = password.into();
    }

    /// Grant a role. The user is created without a password if missing.
    pub fn add_role(&self, username: impl Into<String>, role: impl Into<String>) {
        self.users
            .write()
            .entry(username.into())
            .or_default()
            .roles
            .insert(role.into());
    }

    pub fn remove_user(&self, username: &str) {
        self.users.write().remove(username);
    }

    /// Swap in every user of `other` at once.
    pub fn replace(&self, other: StaticDirectory) {
        *self.users.write() = other.users.into_inner();
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn verify_password(&self, username: &str, password: &[u8]) -> bool {
        // Constant-time comparison of the password bytes.
        self.users.read().get(username).is_some_and(|u| {
            !u.password.is_empty() && bool::from(u.password.as_slice().ct_eq(password))
        })
    }

    async fn roles_of(&self, username: &str) -> BTreeSet<String> {
        self.users
            .read()
            .get(username)
            .map(|u| u.roles.clone())
            .unwrap_or_default()
    }
}

/// Resolves a principal to its roles.
#[derive(Clone)]
pub struct CredentialAuthenticator {
    directory: Arc<dyn Directory>,
}

impl CredentialAuthenticator {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Verify `username`/`password` and resolve roles.
    ///
    /// A failed attempt is reported once; there is no retry here.
    pub async fn authenticate(&self, username: &str, password: &[u8]) -> Result<RoleSet> {
        if username.is_empty() || !self.directory.verify_password(username, password).await {
            warn!("Bad credentials for user {:?}", username);
            return Err(Error::BadCredentials);
        }
        self.resolve_roles(username).await
    }

    /// Resolve roles for the subject common name of a verified certificate.
    pub async fn authenticate_certificate(&self, identity: &CertificateIdentity) -> Result<RoleSet> {
        let Some(name) = identity.common_name.as_deref() else {
            warn!("Certificate {} has no common name", identity.subject);
            return Err(Error::BadCredentials);
        };
        self.resolve_roles(name).await
    }

    async fn resolve_roles(&self, principal: &str) -> Result<RoleSet> {
        let roles = self.directory.roles_of(principal).await;
        match RoleSet::new(roles) {
            Some(roles) => {
                debug!("User {} authenticated with roles [{}]", principal, roles);
                Ok(roles)
            }
            None => {
                warn!("User {} authenticated but holds no roles", principal);
                Err(Error::NoRolesAssigned(principal.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for CredentialAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialAuthenticator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Arc<StaticDirectory> {
        let dir = StaticDirectory::new();
        dir.add_user("noprivs", "noprivs");
        dir.add_user("browser", "browser");
        dir.add_role("browser", "browser");
        dir.add_user("user", "pass");
        dir.add_role("user", "full");
        dir.add_role("user", "guest");
        dir.add_role("device-7", "guest");
        Arc::new(dir)
    }

    #[tokio::test]
    async fn test_authenticate_resolves_roles() {
        let auth = CredentialAuthenticator::new(directory());
        let roles = auth.authenticate("user", b"pass").await.unwrap();
        assert!(roles.contains("full"));
        assert!(roles.contains("guest"));
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let auth = CredentialAuthenticator::new(directory());
        assert!(matches!(auth.authenticate("user", b"wrong").await, Err(Error::BadCredentials)));
        assert!(matches!(auth.authenticate("nobody", b"pass").await, Err(Error::BadCredentials)));
        assert!(matches!(auth.authenticate("", b"").await, Err(Error::BadCredentials)));
        // Users created only through add_role have no password.
        assert!(matches!(auth.authenticate("device-7", b"").await, Err(Error::BadCredentials)));
    }

    #[tokio::test]
    async fn test_verify_password_exact_bytes() {
        let dir = directory();
        assert!(dir.verify_password("user", b"pass").await);
        assert!(!dir.verify_password("user", b"pas").await);
        assert!(!dir.verify_password("user", b"pass!").await);
        assert!(!dir.verify_password("user", b"PASS").await);
        assert!(!dir.verify_password("device-7", b"").await);
    }

    #[tokio::test]
    async fn test_no_roles_assigned() {
        let auth = CredentialAuthenticator::new(directory());
        let err = auth.authenticate("noprivs", b"noprivs").await.unwrap_err();
        assert!(matches!(err, Error::NoRolesAssigned(ref user) if user == "noprivs"));
    }

    #[tokio::test]
    async fn test_certificate_identity() {
        let auth = CredentialAuthenticator::new(directory());
        let mut identity = CertificateIdentity {
            issuer: "CN=Test CA".to_string(),
            serial: vec![0x01],
            subject: "CN=device-7".to_string(),
            common_name: Some("device-7".to_string()),
            not_before: 0,
            not_after: i64::MAX,
        };
        let roles = auth.authenticate_certificate(&identity).await.unwrap();
        assert!(roles.contains("guest"));

        identity.common_name = None;
        assert!(matches!(
            auth.authenticate_certificate(&identity).await,
            Err(Error::BadCredentials)
        ));
    }

    #[tokio::test]
    async fn test_replace_directory() {
        let dir = directory();
        let auth = CredentialAuthenticator::new(dir.clone());

        let next = StaticDirectory::new();
        next.add_user("user", "rotated");
        next.add_role("user", "browser");
        dir.replace(next);

        assert!(matches!(auth.authenticate("user", b"pass").await, Err(Error::BadCredentials)));
        let roles = auth.authenticate("user", b"rotated").await.unwrap();
        assert!(roles.contains("browser"));
        assert!(!roles.contains("full"));
        assert!(matches!(auth.authenticate("browser", b"browser").await, Err(Error::BadCredentials)));
    }
}

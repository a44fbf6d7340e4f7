//! Users and roles loaded from a YAML policy file.
//!
//! ```yaml
//! users:
//!   - username: user
//!     password: pass
//!     roles: [full]
//!   - username: device-7   # certificate-only, no password
//!     roles: [guest]
//! roles:
//!   - name: full
//!     rules:
//!       - { pattern: "#", action: publish }
//!       - { pattern: "#", action: subscribe }
//!   - name: guest
//!     publish_denial: reject
//!     rules:
//!       - { pattern: "test/#", action: subscribe }
//!       - { pattern: "test/guest/#", action: publish }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use mqttgate::{RoleConfig, StaticDirectory};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub username: String,
    /// Omit for users that only authenticate by certificate.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Policy {
    /// Read and parse a policy file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid policy {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let policy: Policy = serde_yaml::from_str(text)?;

        let known: HashSet<&str> = policy.roles.iter().map(|r| r.name.as_str()).collect();
        for user in &policy.users {
            for role in user.roles.iter().filter(|r| !known.contains(r.as_str())) {
                warn!("User {} holds undefined role {}", user.username, role);
            }
        }
        Ok(policy)
    }

    /// Build the user directory described by this policy.
    pub fn directory(&self) -> StaticDirectory {
        let directory = StaticDirectory::new();
        for user in &self.users {
            if let Some(password) = &user.password {
                directory.add_user(user.username.as_str(), password.as_str());
            }
            for role in &user.roles {
                directory.add_role(user.username.as_str(), role.as_str());
            }
        }
        directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqttgate::{Action, AclEngine, Decision, Directory, Effect, PublishDenial, RoleSet};

    const POLICY: &str = r##"
users:
  - username: user
    password: pass
    roles: [full]
  - username: device-7
    roles: [guest]
roles:
  - name: full
    rules:
      - { pattern: "#", action: publish }
      - { pattern: "#", action: subscribe }
  - name: guest
    publish_denial: reject
    rules:
      - { pattern: "test/secret/#", action: subscribe, effect: deny }
      - { pattern: "test/#", action: subscribe }
"##;

    #[test]
    fn test_parse_policy() {
        let policy = Policy::parse(POLICY).unwrap();
        assert_eq!(policy.users.len(), 2);
        assert_eq!(policy.users[1].password, None);

        let guest = &policy.roles[1];
        assert_eq!(guest.publish_denial, PublishDenial::Reject);
        assert_eq!(guest.rules[0].effect, Effect::Deny);
        assert_eq!(guest.rules[1].action, Action::Subscribe);
        assert_eq!(guest.rules[1].effect, Effect::Allow);
    }

    #[test]
    fn test_guest_secret_filters_denied() {
        let policy = Policy::parse(POLICY).unwrap();
        let engine = AclEngine::from_config(&policy.roles).unwrap();
        let guest = RoleSet::new(["guest"]).unwrap();

        for filter in ["test/secret/#", "test/#", "test/+/x"] {
            assert_eq!(engine.authorize(&guest, filter, Action::Subscribe), Decision::Deny);
        }
        assert_eq!(
            engine.authorize(&guest, "test/public/#", Action::Subscribe),
            Decision::Allow
        );
    }

    #[tokio::test]
    async fn test_policy_directory() {
        let directory = Policy::parse(POLICY).unwrap().directory();
        assert!(directory.verify_password("user", b"pass").await);
        assert!(!directory.verify_password("device-7", b"").await);
        assert!(directory.roles_of("device-7").await.contains("guest"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, POLICY).unwrap();
        assert_eq!(Policy::load(&path).unwrap().roles.len(), 2);

        std::fs::write(&path, "roles: [[[").unwrap();
        assert!(Policy::load(&path).is_err());
        assert!(Policy::load(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_empty_policy() {
        let policy = Policy::parse("{}").unwrap();
        assert!(policy.users.is_empty());
        assert!(policy.roles.is_empty());
    }
}

//! Topic ACL engine.
//!
//! Each role owns an ordered rule list. A role's verdict for `(topic, action)`
//! is the effect of the first rule that applies, or deny when nothing does.
//! A role set is allowed when any of its roles allows.
//!
//! For subscription filters an allow rule applies only when its pattern covers
//! the whole filter, while a deny rule applies as soon as the two overlap.
//! `deny test/secret/#` therefore also refuses `test/#` and `test/+/x`.
//!
//! Patterns use MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches the remaining levels, including none (must be last)
//!
//! Patterns are validated when the table is built, never during evaluation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::types::{Action, Decision, Effect, RoleSet};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// Validated topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse and validate a pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::malformed_pattern(pattern, "empty pattern"));
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.into_iter().enumerate() {
            let segment = match part {
                "#" if i != last => {
                    return Err(Error::malformed_pattern(pattern, "# must be the last segment"));
                }
                "#" => Segment::MultiLevel,
                "+" => Segment::SingleLevel,
                p if p.contains(['#', '+']) => {
                    return Err(Error::malformed_pattern(
                        pattern,
                        "wildcards must occupy a whole segment",
                    ));
                }
                p => Segment::Literal(p.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a topic name or subscription filter.
    ///
    /// Matching is case-sensitive and segment-wise. A `+` in the pattern does
    /// not cover a `#` level of a subscription filter.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');

        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => match levels.next() {
                    None | Some("#") => return false,
                    Some(_) => {}
                },
                Segment::Literal(literal) => {
                    if levels.next() != Some(literal.as_str()) {
                        return false;
                    }
                }
            }
        }

        levels.next().is_none()
    }

    /// Whether some topic name matches both this pattern and `filter`.
    pub fn overlaps(&self, filter: &str) -> bool {
        let mut levels = filter.split('/');

        for segment in &self.segments {
            let level = match levels.next() {
                Some(level) => level,
                // `a/#` also matches `a`.
                None => return *segment == Segment::MultiLevel,
            };
            match (segment, level) {
                (Segment::MultiLevel, _) | (_, "#") => return true,
                (Segment::SingleLevel, _) | (_, "+") => {}
                (Segment::Literal(literal), level) => {
                    if literal != level {
                        return false;
                    }
                }
            }
        }

        matches!(levels.next(), None | Some("#"))
    }
}

impl FromStr for TopicPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One ACL rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub pattern: TopicPattern,
    pub action: Action,
    pub effect: Effect,
}

impl AclRule {
    pub fn new(pattern: &str, action: Action, effect: Effect) -> Result<Self> {
        Ok(Self {
            pattern: TopicPattern::parse(pattern)?,
            action,
            effect,
        })
    }

    /// Allow rules must cover `topic`; deny rules only need to overlap it.
    fn applies(&self, topic: &str, action: Action) -> bool {
        if self.action != action {
            return false;
        }
        match self.effect {
            Effect::Allow => self.pattern.matches(topic),
            Effect::Deny => self.pattern.overlaps(topic),
        }
    }
}

/// What happens to a PUBLISH the ACL denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishDenial {
    /// Discard; QoS 1/2 publishes are still acknowledged.
    #[default]
    Drop,
    /// Answer with a negative acknowledgement where the protocol has one.
    Reject,
}

/// Rule as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub action: Action,
    #[serde(default)]
    pub effect: Effect,
}

/// Role as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub publish_denial: PublishDenial,
}

impl RoleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            publish_denial: PublishDenial::default(),
        }
    }

    /// Append an allow rule.
    pub fn allow(self, action: Action, pattern: impl Into<String>) -> Self {
        self.rule(action, pattern, Effect::Allow)
    }

    /// Append a deny rule.
    pub fn deny(self, action: Action, pattern: impl Into<String>) -> Self {
        self.rule(action, pattern, Effect::Deny)
    }

    fn rule(mut self, action: Action, pattern: impl Into<String>, effect: Effect) -> Self {
        self.rules.push(RuleConfig {
            pattern: pattern.into(),
            action,
            effect,
        });
        self
    }

    pub fn publish_denial(mut self, policy: PublishDenial) -> Self {
        self.publish_denial = policy;
        self
    }
}

/// Compiled rules of one role.
#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    rules: Vec<AclRule>,
    publish_denial: PublishDenial,
}

impl RolePolicy {
    /// First matching rule decides; no match is deny.
    pub fn verdict(&self, topic: &str, action: Action) -> Decision {
        self.rules
            .iter()
            .find(|rule| rule.applies(topic, action))
            .map(|rule| Decision::from(rule.effect))
            .unwrap_or(Decision::Deny)
    }

    pub fn rules(&self) -> &[AclRule] {
        &self.rules
    }
}

/// Immutable role → policy table.
#[derive(Debug, Clone, Default)]
pub struct AclTable {
    roles: HashMap<String, RolePolicy>,
}

impl AclTable {
    /// Compile role configuration, rejecting malformed patterns.
    pub fn from_config(roles: &[RoleConfig]) -> Result<Self> {
        let mut table = HashMap::with_capacity(roles.len());
        for role in roles {
            let rules = role
                .rules
                .iter()
                .map(|r| AclRule::new(&r.pattern, r.action, r.effect))
                .collect::<Result<Vec<_>>>()?;

            let policy = RolePolicy {
                rules,
                publish_denial: role.publish_denial,
            };
            if table.insert(role.name.clone(), policy).is_some() {
                return Err(Error::InvalidConfig(format!("duplicate role {}", role.name)));
            }
        }
        Ok(Self { roles: table })
    }

    pub fn role(&self, name: &str) -> Option<&RolePolicy> {
        self.roles.get(name)
    }

    /// Most permissive role wins; unknown roles deny.
    pub fn authorize(&self, roles: &RoleSet, topic: &str, action: Action) -> Decision {
        let allowed = roles.iter().any(|name| {
            let verdict = self
                .roles
                .get(name)
                .map(|policy| policy.verdict(topic, action))
                .unwrap_or(Decision::Deny);
            trace!("Role {} {} {} -> {:?}", name, action, topic, verdict);
            verdict.is_allowed()
        });

        if allowed { Decision::Allow } else { Decision::Deny }
    }

    /// `Reject` if any held role asks for it.
    pub fn publish_denial(&self, roles: &RoleSet) -> PublishDenial {
        let reject = roles.iter().any(|name| {
            self.roles
                .get(name)
                .is_some_and(|p| p.publish_denial == PublishDenial::Reject)
        });
        if reject { PublishDenial::Reject } else { PublishDenial::Drop }
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// Shared ACL engine with hot reload.
#[derive(Debug, Default)]
pub struct AclEngine {
    table: RwLock<Arc<AclTable>>,
}

impl AclEngine {
    pub fn new(table: AclTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Compile and wrap role configuration.
    pub fn from_config(roles: &[RoleConfig]) -> Result<Self> {
        Ok(Self::new(AclTable::from_config(roles)?))
    }

    /// The active table.
    pub fn table(&self) -> Arc<AclTable> {
        Arc::clone(&self.table.read())
    }

    pub fn authorize(&self, roles: &RoleSet, topic: &str, action: Action) -> Decision {
        let decision = self.table().authorize(roles, topic, action);
        debug!("ACL {} {} for [{}]: {:?}", action, topic, roles, decision);
        decision
    }

    pub fn publish_denial(&self, roles: &RoleSet) -> PublishDenial {
        self.table().publish_denial(roles)
    }

    /// Replace the table; a malformed configuration keeps the current one.
    pub fn reload(&self, roles: &[RoleConfig]) -> Result<()> {
        let table = AclTable::from_config(roles)?;
        info!("ACL table reloaded: {} role(s)", table.len());
        *self.table.write() = Arc::new(table);
        Ok(())
    }
}

//! Message routing between admitted sessions.
//!
//! The gatekeeper only hands authorized traffic to a [`RoutingFabric`]; the
//! fabric itself never checks permissions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::trie::Trie;
use crate::types::Message;

/// Delivery endpoint of one session.
///
/// Uses `Arc<str>` and `Arc<Sender>` so clones are cheap and cleanup can
/// compare sender identity.
#[derive(Clone)]
pub struct SubscriberHandle {
    session_id: Arc<str>,
    tx: Arc<mpsc::Sender<Message>>,
}

impl SubscriberHandle {
    pub fn new(session_id: impl Into<Arc<str>>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            tx: Arc::new(tx),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn same_sender(&self, other: &SubscriberHandle) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Non-blocking delivery; a full or closed queue drops the message.
    fn deliver(&self, msg: &Message) -> bool {
        match self.tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to deliver {} to {}: {}", msg.topic, self.session_id, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Pub/sub backend used by admitted sessions.
#[async_trait]
pub trait RoutingFabric: Send + Sync {
    /// Route a message to every matching subscription. Returns the number
    /// of sessions it was handed to.
    async fn publish(&self, msg: Message) -> usize;

    /// Register `handle` for `filter`.
    async fn subscribe(&self, handle: &SubscriberHandle, filter: &str) -> Result<()>;

    /// Drop one filter of a session. Returns whether it existed.
    async fn unsubscribe(&self, handle: &SubscriberHandle, filter: &str) -> bool;

    /// Drop every subscription held by `handle`.
    async fn disconnect(&self, handle: &SubscriberHandle);
}

/// Shared subscription group for load balancing.
#[derive(Clone)]
struct SharedGroup {
    name: String,
    subscribers: Vec<SubscriberHandle>,
    next_index: Arc<AtomicUsize>,
}

impl SharedGroup {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: Vec::new(),
            next_index: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn add(&mut self, handle: SubscriberHandle) {
        if !self.subscribers.iter().any(|h| h.same_sender(&handle)) {
            self.subscribers.push(handle);
        }
    }

    /// Get next subscriber using round-robin.
    fn next_subscriber(&self) -> Option<&SubscriberHandle> {
        if self.subscribers.is_empty() {
            return None;
        }
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % self.subscribers.len();
        self.subscribers.get(idx)
    }
}

/// Parse shared subscription topic.
/// Format: $share/{group}/{filter}
/// Returns: Some((group, filter)) or None
pub fn parse_shared_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix("$share/")?;
    let (group, filter) = rest.split_once('/')?;
    if group.is_empty() || filter.is_empty() {
        return None;
    }
    Some((group, filter))
}

/// In-process fabric backed by subscription tries.
#[derive(Default)]
pub struct LocalFabric {
    subscriptions: Trie<SubscriberHandle>,
    shared: Trie<SharedGroup>,
    /// Filters per session, for cleanup on disconnect.
    by_session: RwLock<HashMap<String, Vec<String>>>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions holding at least one subscription.
    pub fn session_count(&self) -> usize {
        self.by_session.read().len()
    }

    fn remove_filter(&self, handle: &SubscriberHandle, filter: &str) -> bool {
        match parse_shared_topic(filter) {
            Some((group, inner)) => self.shared.with_mut(|root| {
                root.update(inner, |groups| {
                    let mut removed = false;
                    if let Some(g) = groups.iter_mut().find(|g| g.name == group) {
                        let before = g.subscribers.len();
                        g.subscribers.retain(|h| !h.same_sender(handle));
                        removed = g.subscribers.len() < before;
                    }
                    groups.retain(|g| !g.subscribers.is_empty());
                    removed
                })
            }),
            None => self.subscriptions.remove(filter, |h| h.same_sender(handle)),
        }
    }
}

#[async_trait]
impl RoutingFabric for LocalFabric {
    async fn publish(&self, msg: Message) -> usize {
        let mut delivered = 0;

        for handle in self.subscriptions.get(&msg.topic) {
            if handle.deliver(&msg) {
                delivered += 1;
            }
        }

        let targets: Vec<SubscriberHandle> = self
            .shared
            .get(&msg.topic)
            .iter()
            .filter_map(|group| group.next_subscriber().cloned())
            .collect();
        for handle in targets {
            if handle.deliver(&msg) {
                delivered += 1;
            }
        }

        debug!("Routed {} to {} session(s)", msg.topic, delivered);
        delivered
    }

    async fn subscribe(&self, handle: &SubscriberHandle, filter: &str) -> Result<()> {
        let already = self
            .by_session
            .read()
            .get(handle.session_id())
            .is_some_and(|filters| filters.iter().any(|f| f == filter));
        if already {
            return Ok(());
        }

        match parse_shared_topic(filter) {
            Some((group, inner)) => self.shared.with_mut(|root| {
                root.set(inner, |node| {
                    let groups = node.values_mut();
                    match groups.iter_mut().find(|g| g.name == group) {
                        Some(g) => g.add(handle.clone()),
                        None => {
                            let mut g = SharedGroup::new(group);
                            g.add(handle.clone());
                            groups.push(g);
                        }
                    }
                })
            })?,
            None if filter.starts_with("$share/") => {
                return Err(Error::ProtocolViolation(format!(
                    "invalid shared subscription {filter:?}"
                )));
            }
            None => self.subscriptions.insert(filter, handle.clone())?,
        }

        self.by_session
            .write()
            .entry(handle.session_id().to_string())
            .or_default()
            .push(filter.to_string());
        debug!("Session {} subscribed to {}", handle.session_id(), filter);
        Ok(())
    }

    async fn unsubscribe(&self, handle: &SubscriberHandle, filter: &str) -> bool {
        let held = {
            let mut by_session = self.by_session.write();
            let Some(filters) = by_session.get_mut(handle.session_id()) else {
                return false;
            };
            let before = filters.len();
            filters.retain(|f| f != filter);
            let held = filters.len() < before;
            if filters.is_empty() {
                by_session.remove(handle.session_id());
            }
            held
        };
        if !held {
            return false;
        }
        self.remove_filter(handle, filter)
    }

    async fn disconnect(&self, handle: &SubscriberHandle) {
        let filters = self.by_session.write().remove(handle.session_id());
        if let Some(filters) = filters {
            for filter in &filters {
                self.remove_filter(handle, filter);
            }
            debug!(
                "Cleaned up {} subscriptions for session {}",
                filters.len(),
                handle.session_id()
            );
        }
    }
}

impl std::fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFabric")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

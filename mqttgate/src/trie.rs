//! Trie data structure for MQTT subscription lookup.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels, including none (must be last)

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Trie node for MQTT topic pattern matching.
pub struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    match_any: Option<Box<TrieNode<T>>>, // + wildcard
    match_all: Option<Box<TrieNode<T>>>, // # wildcard
    values: Vec<T>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TrieNode<T> {
    /// Create a new empty trie node.
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            match_any: None,
            match_all: None,
            values: Vec::new(),
        }
    }

    /// Insert a value at the given filter.
    pub fn insert(&mut self, filter: &str, value: T) -> Result<()> {
        self.set(filter, |node| node.values.push(value))
    }

    /// Run `f` on the node for `filter`, creating the path if needed.
    pub fn set<F>(&mut self, filter: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut TrieNode<T>),
    {
        if filter.is_empty() {
            return Err(Error::ProtocolViolation("empty topic filter".to_string()));
        }

        let mut node = self;
        let mut levels = filter.split('/').peekable();
        while let Some(level) = levels.next() {
            node = match level {
                "+" => &mut **node.match_any.get_or_insert_with(Default::default),
                "#" => {
                    if levels.peek().is_some() {
                        return Err(Error::ProtocolViolation(format!(
                            "'#' must be the last level in {filter:?}"
                        )));
                    }
                    &mut **node.match_all.get_or_insert_with(Default::default)
                }
                _ if level.contains(['+', '#']) => {
                    return Err(Error::ProtocolViolation(format!(
                        "wildcard must occupy a whole level in {filter:?}"
                    )));
                }
                _ => node.children.entry(level.to_string()).or_default(),
            };
        }
        f(node);
        Ok(())
    }

    /// Collect values of every filter matching `topic`.
    pub fn get(&self, topic: &str) -> Vec<&T> {
        let mut out = Vec::new();
        let levels: Vec<&str> = topic.split('/').collect();
        self.collect(&levels, true, &mut out);
        out
    }

    fn collect<'a>(&'a self, levels: &[&str], at_root: bool, out: &mut Vec<&'a T>) {
        // Wildcards at the root never match topics starting with '$'.
        let wildcards_allowed = !(at_root && levels.first().is_some_and(|l| l.starts_with('$')));

        if wildcards_allowed {
            if let Some(ref match_all) = self.match_all {
                out.extend(match_all.values.iter());
            }
        }

        let Some((first, rest)) = levels.split_first() else {
            out.extend(self.values.iter());
            return;
        };

        if let Some(child) = self.children.get(*first) {
            child.collect(rest, false, out);
        }
        if wildcards_allowed {
            if let Some(ref match_any) = self.match_any {
                match_any.collect(rest, false, out);
            }
        }
    }

    /// Remove values matching `predicate` at the given filter.
    pub fn remove<F>(&mut self, filter: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.update(filter, |values| {
            let len_before = values.len();
            values.retain(|v| !predicate(v));
            values.len() < len_before
        })
    }

    /// Run `f` on the values at `filter` if that node exists, then prune
    /// nodes left empty on the path. Never creates nodes.
    pub fn update<F>(&mut self, filter: &str, f: F) -> bool
    where
        F: FnOnce(&mut Vec<T>) -> bool,
    {
        let levels: Vec<&str> = filter.split('/').collect();
        self.update_at(&levels, f)
    }

    fn update_at<F>(&mut self, levels: &[&str], f: F) -> bool
    where
        F: FnOnce(&mut Vec<T>) -> bool,
    {
        let Some((first, rest)) = levels.split_first() else {
            return f(&mut self.values);
        };

        match *first {
            "+" => {
                let Some(child) = self.match_any.as_deref_mut() else {
                    return false;
                };
                let changed = child.update_at(rest, f);
                if child.is_empty() {
                    self.match_any = None;
                }
                changed
            }
            "#" => {
                let Some(child) = self.match_all.as_deref_mut() else {
                    return false;
                };
                let changed = child.update_at(rest, f);
                if child.is_empty() {
                    self.match_all = None;
                }
                changed
            }
            level => {
                let Some(child) = self.children.get_mut(level) else {
                    return false;
                };
                let changed = child.update_at(rest, f);
                if child.is_empty() {
                    self.children.remove(level);
                }
                changed
            }
        }
    }

    /// True when the node holds no values and no children.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.children.is_empty()
            && self.match_any.is_none()
            && self.match_all.is_none()
    }

    /// Get mutable access to all values at this node.
    pub fn values_mut(&mut self) -> &mut Vec<T> {
        &mut self.values
    }
}

impl<T: fmt::Debug> fmt::Debug for TrieNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieNode")
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("match_any", &self.match_any.is_some())
            .field("match_all", &self.match_all.is_some())
            .field("values", &self.values.len())
            .finish()
    }
}

/// Thread-safe Trie for MQTT subscription lookup.
pub struct Trie<T> {
    root: RwLock<TrieNode<T>>,
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Trie<T> {
    /// Create a new empty trie.
    pub fn new() -> Self {
        Self {
            root: RwLock::new(TrieNode::new()),
        }
    }

    /// Insert a value at the given filter.
    pub fn insert(&self, filter: &str, value: T) -> Result<()> {
        self.root.write().insert(filter, value)
    }

    /// Get values matching the given topic.
    pub fn get(&self, topic: &str) -> Vec<T>
    where
        T: Clone,
    {
        self.root.read().get(topic).into_iter().cloned().collect()
    }

    /// Remove values matching the predicate from the given filter.
    pub fn remove<F>(&self, filter: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.root.write().remove(filter, predicate)
    }

    /// True when no filter holds a value.
    pub fn is_empty(&self) -> bool {
        self.root.read().is_empty()
    }

    /// Execute a function with mutable access to the root node.
    pub fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TrieNode<T>) -> R,
    {
        f(&mut self.root.write())
    }
}

impl<T: fmt::Debug> fmt::Debug for Trie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.root.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let trie: Trie<String> = Trie::new();
        trie.insert("device/gear-001/state", "handler1".to_string())
            .unwrap();

        let values = trie.get("device/gear-001/state");
        assert_eq!(values, vec!["handler1".to_string()]);

        assert!(trie.get("device/gear-002/state").is_empty());
        assert!(trie.get("device/gear-001").is_empty());
    }

    #[test]
    fn test_single_level_wildcard() {
        let trie: Trie<String> = Trie::new();
        trie.insert("test/+/some/#", "s1".to_string()).unwrap();

        assert!(!trie.get("test/1/some/la").is_empty());
        assert!(!trie.get("test/abc/some").is_empty());

        assert!(trie.get("test/some/la").is_empty());
        assert!(trie.get("test/1/2/some/la").is_empty());
    }

    #[test]
    fn test_multi_level_wildcard_matches_parent() {
        let trie: Trie<String> = Trie::new();
        trie.insert("device/#", "multi".to_string()).unwrap();

        assert!(!trie.get("device").is_empty());
        assert!(!trie.get("device/gear-001/state/value").is_empty());
        assert!(trie.get("other/gear-001").is_empty());
    }

    #[test]
    fn test_union_of_overlapping_filters() {
        let trie: Trie<&str> = Trie::new();
        trie.insert("test/1/some/la", "exact").unwrap();
        trie.insert("test/+/some/#", "plus").unwrap();
        trie.insert("test/#", "hash").unwrap();
        trie.insert("#", "all").unwrap();

        let mut values = trie.get("test/1/some/la");
        values.sort();
        assert_eq!(values, vec!["all", "exact", "hash", "plus"]);
    }

    #[test]
    fn test_dollar_topics_skip_root_wildcards() {
        let trie: Trie<&str> = Trie::new();
        trie.insert("#", "all").unwrap();
        trie.insert("+/monitor", "plus").unwrap();
        trie.insert("$SYS/#", "sys").unwrap();

        assert_eq!(trie.get("$SYS/monitor"), vec!["sys"]);
    }

    #[test]
    fn test_invalid_filters() {
        let trie: Trie<String> = Trie::new();
        assert!(trie.insert("device/#/state", "x".to_string()).is_err());
        assert!(trie.insert("device/ab+", "x".to_string()).is_err());
        assert!(trie.insert("", "x".to_string()).is_err());
    }

    #[test]
    fn test_remove() {
        let trie: Trie<String> = Trie::new();
        trie.insert("device/+/state", "handler1".to_string())
            .unwrap();
        trie.insert("device/+/state", "handler2".to_string())
            .unwrap();

        assert_eq!(trie.get("device/gear-001/state").len(), 2);

        assert!(trie.remove("device/+/state", |v| v == "handler1"));
        assert_eq!(trie.get("device/gear-001/state"), vec!["handler2".to_string()]);
        assert!(!trie.remove("device/unknown", |_| true));
    }

    #[test]
    fn test_remove_prunes_empty_nodes() {
        let trie: Trie<&str> = Trie::new();
        trie.insert("device/+/state", "a").unwrap();
        trie.insert("device/#", "b").unwrap();

        assert!(trie.remove("device/+/state", |v| *v == "a"));
        assert!(!trie.is_empty());
        assert!(trie.remove("device/#", |v| *v == "b"));
        assert!(trie.is_empty());

        // Missing paths are not created.
        assert!(!trie.remove("nobody/+/here/#", |_| true));
        assert!(trie.is_empty());
    }
}

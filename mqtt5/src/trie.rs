//! Trie data structure for MQTT topic filter matching.
//!
//! Each node keeps literal children in a map plus two sentinel children:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)
//!
//! Insertion, removal and matching are iterative.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, ProtocolError, Result};
use crate::topic;
use crate::types::ReasonCode;

/// Trie node for MQTT topic filter matching.
pub struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    match_any: Option<Box<TrieNode<T>>>, // + wildcard
    match_all: Option<Box<TrieNode<T>>>, // # wildcard
    values: Vec<T>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            match_any: None,
            match_all: None,
            values: Vec::new(),
        }
    }
}

impl<T> TrieNode<T> {
    fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.children.is_empty()
            && self.match_any.is_none()
            && self.match_all.is_none()
    }

    fn child(&self, level: &str) -> Option<&TrieNode<T>> {
        match level {
            topic::SINGLE_LEVEL => self.match_any.as_deref(),
            topic::MULTI_LEVEL => self.match_all.as_deref(),
            _ => self.children.get(level),
        }
    }

    fn child_mut(&mut self, level: &str) -> Option<&mut TrieNode<T>> {
        match level {
            topic::SINGLE_LEVEL => self.match_any.as_deref_mut(),
            topic::MULTI_LEVEL => self.match_all.as_deref_mut(),
            _ => self.children.get_mut(level),
        }
    }

    fn child_or_insert(&mut self, level: &str) -> &mut TrieNode<T> {
        match level {
            topic::SINGLE_LEVEL => &mut **self.match_any.get_or_insert_with(Default::default),
            topic::MULTI_LEVEL => &mut **self.match_all.get_or_insert_with(Default::default),
            _ => self.children.entry(level.to_string()).or_default(),
        }
    }

    fn remove_child(&mut self, level: &str) {
        match level {
            topic::SINGLE_LEVEL => self.match_any = None,
            topic::MULTI_LEVEL => self.match_all = None,
            _ => {
                self.children.remove(level);
            }
        }
    }
}

/// Topic filter trie.
///
/// Not synchronized; owners wrap it in a lock.
pub struct Trie<T> {
    root: TrieNode<T>,
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
            root: TrieNode::default(),
        }
    }

    /// Insert a value at the given filter.
    pub fn insert(&mut self, filter: &str, value: T) -> Result<()> {
        self.update(filter, |values| values.push(value))
    }

    /// Update the values stored at `filter`, creating the path if needed.
    pub fn update<F>(&mut self, filter: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<T>),
    {
        if !topic::is_valid_filter(filter) {
            return Err(Error::Protocol(ProtocolError::new(
                ReasonCode::TOPIC_FILTER_INVALID,
                format!("invalid topic filter {:?}", filter),
            )));
        }

        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.child_or_insert(level);
        }
        f(&mut node.values);

        if node.values.is_empty() {
            self.prune(filter);
        }
        Ok(())
    }

    /// Values stored at exactly `filter`.
    pub fn get(&self, filter: &str) -> &[T] {
        let mut node = &self.root;
        for level in filter.split('/') {
            match node.child(level) {
                Some(child) => node = child,
                None => return &[],
            }
        }
        &node.values
    }

    /// Remove values matching the predicate from the given filter.
    ///
    /// Nodes left without values or children are pruned.
    pub fn remove<F>(&mut self, filter: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            match node.child_mut(level) {
                Some(child) => node = child,
                None => return false,
            }
        }

        let before = node.values.len();
        node.values.retain(|v| !predicate(v));
        let removed = node.values.len() < before;

        if node.values.is_empty() {
            self.prune(filter);
        }
        removed
    }

    /// Drop empty nodes along `filter`, deepest first.
    fn prune(&mut self, filter: &str) {
        let levels: Vec<&str> = filter.split('/').collect();

        for depth in (1..=levels.len()).rev() {
            let mut parent = &mut self.root;
            for level in &levels[..depth - 1] {
                match parent.child_mut(level) {
                    Some(child) => parent = child,
                    None => return,
                }
            }

            let last = levels[depth - 1];
            let empty = matches!(parent.child(last), Some(child) if child.is_empty());
            if !empty {
                return;
            }
            parent.remove_child(last);
        }
    }

    /// Collect every value whose filter matches `topic`.
    ///
    /// A value is returned once per matching filter; a topic starting with `$`
    /// is not matched by a wildcard in the first level.
    pub fn matches(&self, topic: &str) -> Vec<&T> {
        let levels: Vec<&str> = topic.split('/').collect();
        let system = topic.starts_with('$');

        let mut out = Vec::new();
        let mut stack = vec![(&self.root, 0usize)];

        while let Some((node, depth)) = stack.pop() {
            let guarded = system && depth == 0;

            // `#` also matches the parent level itself.
            if !guarded && let Some(all) = &node.match_all {
                out.extend(all.values.iter());
            }

            if depth == levels.len() {
                out.extend(node.values.iter());
                continue;
            }

            if let Some(child) = node.children.get(levels[depth]) {
                stack.push((child, depth + 1));
            }
            if !guarded && let Some(any) = &node.match_any {
                stack.push((any, depth + 1));
            }
        }

        out
    }

    /// True if no filter holds any value.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<T> fmt::Debug for TrieNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieNode")
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("match_any", &self.match_any.is_some())
            .field("match_all", &self.match_all.is_some())
            .field("values", &self.values.len())
            .finish()
    }
}

impl<T> fmt::Debug for Trie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted<'a>(values: Vec<&&'a str>) -> Vec<&'a str> {
        let mut v: Vec<&'a str> = values.into_iter().copied().collect();
        v.sort();
        v
    }

    #[test]
    fn test_exact_match() {
        let mut trie: Trie<&str> = Trie::new();
        trie.insert("device/gear-001/state", "handler1").unwrap();

        assert_eq!(sorted(trie.matches("device/gear-001/state")), vec!["handler1"]);
        assert!(trie.matches("device/gear-002/state").is_empty());
        assert!(trie.matches("device/gear-001").is_empty());
    }

    #[test]
    fn test_single_level_wildcard() {
        let mut trie: Trie<&str> = Trie::new();
        trie.insert("device/+/state", "wildcard").unwrap();

        assert!(!trie.matches("device/gear-001/state").is_empty());
        assert!(!trie.matches("device/abc/state").is_empty());
        assert!(trie.matches("device/state").is_empty());
        assert!(trie.matches("device/a/b/state").is_empty());
    }

    #[test]
    fn test_multi_level_wildcard() {
        let mut trie: Trie<&str> = Trie::new();
        trie.insert("sport/#", "multi").unwrap();

        for topic in ["sport", "sport/", "sport/tennis", "sport/tennis/player1"] {
            assert_eq!(trie.matches(topic).len(), 1, "{topic}");
        }
        assert!(trie.matches("other/sport").is_empty());
    }

    #[test]
    fn test_collects_all_overlapping_filters() {
        let mut trie: Trie<&str> = Trie::new();
        trie.insert("home/kitchen/temp", "exact").unwrap();
        trie.insert("home/+/temp", "plus").unwrap();
        trie.insert("home/#", "hash").unwrap();
        trie.insert("#", "all").unwrap();
        trie.insert("home/+/humidity", "other").unwrap();

        assert_eq!(
            sorted(trie.matches("home/kitchen/temp")),
            vec!["all", "exact", "hash", "plus"]
        );
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let mut trie: Trie<&str> = Trie::new();
        assert!(trie.insert("device/#/state", "invalid").is_err());
        assert!(trie.insert("device/a+", "invalid").is_err());
        assert!(trie.is_empty());
    }

    #[test]
    fn test_system_topics_skip_root_wildcards() {
        let mut trie: Trie<&str> = Trie::new();
        trie.insert("#", "all").unwrap();
        trie.insert("+/broker", "plus").unwrap();
        trie.insert("$SYS/#", "sys").unwrap();

        assert_eq!(sorted(trie.matches("$SYS/broker")), vec!["sys"]);
    }

    #[test]
    fn test_remove_prunes() {
        let mut trie: Trie<&str> = Trie::new();
        trie.insert("device/+/state", "handler1").unwrap();
        trie.insert("device/+/state", "handler2").unwrap();
        trie.insert("device/#", "handler3").unwrap();

        assert!(trie.remove("device/+/state", |v| *v == "handler1"));
        assert_eq!(trie.get("device/+/state"), &["handler2"]);
        assert!(!trie.remove("device/+/state", |v| *v == "handler1"));

        assert!(trie.remove("device/+/state", |_| true));
        assert!(trie.remove("device/#", |_| true));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_update_replaces() {
        let mut trie: Trie<(&str, u8)> = Trie::new();
        trie.insert("a/b", ("c1", 0)).unwrap();
        trie.update("a/b", |values| {
            values.retain(|(id, _)| *id != "c1");
            values.push(("c1", 1));
        })
        .unwrap();
        assert_eq!(trie.get("a/b"), &[("c1", 1)]);
    }
}

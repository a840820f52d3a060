//! External store and pub/sub bus used by the distributed manager.
//!
//! The contract mirrors what Redis offers: keys with optional TTL, glob
//! pattern subscriptions (`PSUBSCRIBE`) and key-expiry notifications.
//! [`MemoryStore`] implements it in-process so several simulated broker
//! nodes can share one store in tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::Result;

/// Event delivered by a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A message published on a channel matched one of our patterns.
    Message {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    /// A key expired.
    Expired { key: String },
}

/// Shared key-value store with glob pattern pub/sub.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Get a value by key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Set a TTL on an existing key. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to channels matching a glob pattern.
    async fn psubscribe(&self, pattern: &str) -> Result<()>;

    async fn punsubscribe(&self, pattern: &str) -> Result<()>;

    /// Take the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BusEvent>>;
}

impl fmt::Debug for dyn Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus {{ ... }}")
    }
}

/// Escape glob metacharacters so `s` matches only itself.
pub fn glob_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Redis-style glob matching: `*`, `?`, `[set]`, `[^set]`, `[a-z]` and `\`
/// escapes.
pub fn glob_match(pattern: &str, s: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = s.chars().collect();

    let (mut pi, mut si) = (0, 0);
    // Position after the last `*` and the input position it resumed from.
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi + 1, si));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    si += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&p, pi, s[si])
                        && matched
                    {
                        pi = next;
                        si += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == s[si] {
                        pi += 2;
                        si += 1;
                        continue;
                    }
                }
                c => {
                    if c == s[si] {
                        pi += 1;
                        si += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((resume, from)) => {
                pi = resume;
                si = from + 1;
                star = Some((resume, from + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Match `c` against the class starting at `p[start] == '['`.
///
/// Returns whether it matched and the index after the closing `]`, or `None`
/// for an unterminated class.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = p.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] { (p[i], p[i + 2]) } else { (p[i + 2], p[i]) };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }
    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

struct Entry {
    value: Vec<u8>,
    generation: u64,
}

struct Subscriber {
    patterns: HashSet<String>,
    tx: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    subscribers: HashMap<u64, Subscriber>,
    generation: u64,
    next_bus: u64,
}

/// In-memory store shared by any number of [`MemoryBus`] connections.
///
/// Key expiry runs on tokio timers; every connected bus receives
/// [`BusEvent::Expired`] for every expired key, like a Redis client subscribed
/// to expired keyevent notifications.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new bus connection to this store.
    pub fn connect(&self) -> MemoryBus {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            inner.next_bus += 1;
            let id = inner.next_bus;
            inner.subscribers.insert(
                id,
                Subscriber {
                    patterns: HashSet::new(),
                    tx,
                },
            );
            id
        };
        MemoryBus {
            id,
            store: self.clone(),
            events: Mutex::new(Some(rx)),
        }
    }

    fn schedule_expiry(&self, key: &str, generation: u64, ttl: Duration) {
        let store = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut inner = store.inner.lock();
            let current = inner.entries.get(&key).map(|e| e.generation);
            if current != Some(generation) {
                return;
            }
            inner.entries.remove(&key);
            trace!("memory store: key {} expired", key);
            for subscriber in inner.subscribers.values() {
                let _ = subscriber.tx.send(BusEvent::Expired { key: key.clone() });
            }
        });
    }
}

/// One connection to a [`MemoryStore`].
pub struct MemoryBus {
    id: u64,
    store: MemoryStore,
    events: Mutex<Option<mpsc::UnboundedReceiver<BusEvent>>>,
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        self.store.inner.lock().subscribers.remove(&self.id);
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.inner.lock().entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let generation = {
            let mut inner = self.store.inner.lock();
            inner.generation += 1;
            let generation = inner.generation;
            inner.entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    generation,
                },
            );
            generation
        };
        if let Some(ttl) = ttl {
            self.store.schedule_expiry(key, generation, ttl);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let generation = {
            let mut inner = self.store.inner.lock();
            inner.generation += 1;
            let generation = inner.generation;
            match inner.entries.get_mut(key) {
                Some(entry) => entry.generation = generation,
                None => return Ok(false),
            }
            generation
        };
        self.store.schedule_expiry(key, generation, ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.store.inner.lock().entries.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let inner = self.store.inner.lock();
        Ok(inner
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let payload = Bytes::copy_from_slice(payload);
        let inner = self.store.inner.lock();
        for subscriber in inner.subscribers.values() {
            for pattern in &subscriber.patterns {
                if glob_match(pattern, channel) {
                    let _ = subscriber.tx.send(BusEvent::Message {
                        pattern: pattern.clone(),
                        channel: channel.to_string(),
                        payload: payload.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        if let Some(subscriber) = self.store.inner.lock().subscribers.get_mut(&self.id) {
            subscriber.patterns.insert(pattern.to_string());
        }
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        if let Some(subscriber) = self.store.inner.lock().subscribers.get_mut(&self.id) {
            subscriber.patterns.remove(pattern);
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BusEvent>> {
        self.events.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything/at/all"));
        assert!(glob_match("mqtt:pub:a/*", "mqtt:pub:a/"));
        assert!(glob_match("mqtt:pub:a/*", "mqtt:pub:a/b/c"));
        assert!(!glob_match("mqtt:pub:a/*", "mqtt:pub:a"));
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[a-c]llo", "hbllo"));
        assert!(glob_match("a*b*c", "a-x-b-y-c"));
        assert!(!glob_match("a*b*c", "a-x-c-y-b"));
    }

    #[test]
    fn test_glob_escape() {
        let literal = "weird*[topic]?\\";
        assert!(glob_match(&glob_escape(literal), literal));
        assert!(!glob_match(&glob_escape("a*"), "abc"));
        assert!(glob_match(&format!("{}*", glob_escape("a?/")), "a?/b"));
        assert!(!glob_match(&format!("{}*", glob_escape("a?/")), "ab/b"));
    }

    #[tokio::test]
    async fn test_pattern_pubsub() {
        let store = MemoryStore::new();
        let a = store.connect();
        let b = store.connect();
        let mut events = a.take_events().unwrap();
        assert!(a.take_events().is_none());

        a.psubscribe("chan:*").await.unwrap();
        b.publish("chan:1", b"x").await.unwrap();
        b.publish("other", b"y").await.unwrap();

        match events.try_recv().unwrap() {
            BusEvent::Message { pattern, channel, payload } => {
                assert_eq!(pattern, "chan:*");
                assert_eq!(channel, "chan:1");
                assert_eq!(&payload[..], b"x");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.try_recv().is_err());

        a.punsubscribe("chan:*").await.unwrap();
        b.publish("chan:2", b"z").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_expiry_notification() {
        let store = MemoryStore::new();
        let bus = store.connect();
        let mut events = bus.take_events().unwrap();

        bus.set("k", b"v", Some(Duration::from_secs(5))).await.unwrap();
        bus.set("keep", b"v", None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(bus.expire("k", Duration::from_secs(5)).await.unwrap());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(bus.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(bus.get("k").await.unwrap(), None);
        assert_eq!(events.recv().await.unwrap(), BusEvent::Expired { key: "k".into() });

        let mut keys = bus.keys("*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["keep"]);
    }
}

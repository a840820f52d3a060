//! In-process manager backed by a topic trie.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::{Manager, RetainVisitor, Subscription, TopicPredicate, fan_out};
use crate::error::Result;
use crate::protocol::{Connect, Publish};
use crate::registry::{Registry, SessionHandle};
use crate::trie::Trie;

#[derive(Default)]
struct Subscriptions {
    trie: Trie<(Arc<str>, Subscription)>,
    by_client: HashMap<Arc<str>, HashSet<String>>,
}

impl Subscriptions {
    fn remove_client(&mut self, client_id: &str) -> usize {
        let Some(filters) = self.by_client.remove(client_id) else {
            return 0;
        };
        for filter in &filters {
            self.trie.remove(filter, |(id, _)| id.as_ref() == client_id);
        }
        filters.len()
    }
}

struct Retained {
    packet: Publish,
    expires_at: Option<Instant>,
}

impl Retained {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Single-process manager.
///
/// Subscriptions live in a [`Trie`] guarded by a read-write lock, so matching
/// during publish runs concurrently while subscribe and unsubscribe are
/// exclusive. Retained messages expire lazily on access.
#[derive(Default)]
pub struct LocalManager {
    registry: Registry,
    subscriptions: RwLock<Subscriptions>,
    retained: RwLock<HashMap<String, Retained>>,
}

impl LocalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained messages currently held, expired ones excluded.
    pub fn retained_count(&self) -> usize {
        let now = Instant::now();
        self.retained.read().values().filter(|r| !r.is_expired(now)).count()
    }

    /// Drop the retained message for `topic` if it is still expired at `now`.
    ///
    /// Re-checked under the write lock: the entry may have been replaced
    /// since it was seen expired.
    fn evict_expired(&self, topic: &str, now: Instant) -> bool {
        let mut retained = self.retained.write();
        if retained.get(topic).is_some_and(|entry| entry.is_expired(now)) {
            retained.remove(topic);
            return true;
        }
        false
    }
}

#[async_trait]
impl Manager for LocalManager {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn connect(&self, _connect: &Connect, handle: &SessionHandle) -> Result<Option<SessionHandle>> {
        Ok(self.registry.register(handle.clone()))
    }

    async fn clear_connect(&self, handle: &SessionHandle) -> Result<()> {
        let current = self.registry.is_current(handle);
        if !self.registry.unregister(handle) || !current {
            return Ok(());
        }
        let removed = self.subscriptions.write().remove_client(&handle.client_id);
        debug!("{}: session cleared, {} subscriptions released", handle.client_id, removed);
        Ok(())
    }

    async fn clear_subscriptions(&self, client_id: &str) -> Result<()> {
        self.subscriptions.write().remove_client(client_id);
        Ok(())
    }

    async fn subscribe(&self, client_id: &str, filter: &str, subscription: Subscription) -> Result<bool> {
        let client: Arc<str> = client_id.into();
        let mut existed = false;

        let mut subs = self.subscriptions.write();
        subs.trie.update(filter, |values| {
            let before = values.len();
            values.retain(|(id, _)| id.as_ref() != client_id);
            existed = values.len() < before;
            values.push((client.clone(), subscription));
        })?;
        subs.by_client.entry(client).or_default().insert(filter.to_string());

        Ok(existed)
    }

    async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool> {
        let mut subs = self.subscriptions.write();
        let removed = subs.trie.remove(filter, |(id, _)| id.as_ref() == client_id);
        if let Some(filters) = subs.by_client.get_mut(client_id) {
            filters.remove(filter);
            if filters.is_empty() {
                subs.by_client.remove(client_id);
            }
        }
        Ok(removed)
    }

    async fn is_subscribed(&self, topic: &str) -> Result<bool> {
        Ok(!self.subscriptions.read().trie.matches(topic).is_empty())
    }

    async fn publish(&self, from: &str, topic: &str, packet: &Publish) -> Result<()> {
        let subs = self.subscriptions.read();
        let matches = subs.trie.matches(topic);
        fan_out(
            &self.registry,
            from,
            packet,
            matches.into_iter().map(|(id, sub)| (id.as_ref(), sub)),
        );
        Ok(())
    }

    async fn add_retain_message(&self, topic: &str, packet: &Publish, ttl: Option<Duration>) -> Result<()> {
        let entry = Retained {
            packet: packet.clone(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.retained.write().insert(topic.to_string(), entry);
        Ok(())
    }

    async fn delete_retain_message(&self, topic: &str) -> Result<()> {
        self.retained.write().remove(topic);
        Ok(())
    }

    async fn get_retain_message(&self, topic: &str) -> Result<Option<Publish>> {
        let now = Instant::now();
        {
            let retained = self.retained.read();
            match retained.get(topic) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.packet.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.evict_expired(topic, now);
        Ok(None)
    }

    async fn for_each_retain_message(&self, predicate: TopicPredicate<'_>, visit: RetainVisitor<'_>) -> Result<()> {
        let now = Instant::now();
        let matched: Vec<Publish> = {
            let mut retained = self.retained.write();
            retained.retain(|_, entry| !entry.is_expired(now));
            retained
                .iter()
                .filter(|(topic, _)| predicate(topic.as_str()))
                .map(|(_, entry)| entry.packet.clone())
                .collect()
        };
        for packet in matched {
            visit(packet);
        }
        Ok(())
    }

    async fn ping(&self, _client_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Delivery;
    use crate::types::{QoS, SubscriptionOptions};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn connect(manager: &LocalManager, client_id: &str) -> (SessionHandle, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(manager.registry().next_session_id(), client_id.into(), tx);
        manager.registry().register(handle.clone());
        (handle, rx)
    }

    fn sub(qos: QoS) -> Subscription {
        Subscription::new(SubscriptionOptions::new(qos), None)
    }

    #[tokio::test]
    async fn test_subscribe_overwrites() {
        let manager = LocalManager::new();
        let (_h, mut rx) = connect(&manager, "a");

        assert!(!manager.subscribe("a", "x/+", sub(QoS::AtMostOnce)).await.unwrap());
        assert!(manager.subscribe("a", "x/+", sub(QoS::AtLeastOnce)).await.unwrap());

        let packet = Publish::new("x/y", Bytes::from_static(b"1"), QoS::ExactlyOnce);
        manager.publish("p", "x/y", &packet).await.unwrap();

        match rx.try_recv().unwrap() {
            Delivery::Publish(p) => assert_eq!(p.qos, QoS::AtLeastOnce),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_clear() {
        let manager = LocalManager::new();
        let (handle, _rx) = connect(&manager, "a");

        manager.subscribe("a", "x/#", sub(QoS::AtMostOnce)).await.unwrap();
        manager.subscribe("a", "y", sub(QoS::AtMostOnce)).await.unwrap();
        assert!(manager.is_subscribed("x/1/2").await.unwrap());

        assert!(manager.unsubscribe("a", "x/#").await.unwrap());
        assert!(!manager.unsubscribe("a", "x/#").await.unwrap());
        assert!(!manager.is_subscribed("x/1/2").await.unwrap());

        manager.clear_connect(&handle).await.unwrap();
        manager.clear_connect(&handle).await.unwrap();
        assert!(!manager.is_subscribed("y").await.unwrap());
        assert!(manager.registry().lookup("a").is_none());
    }

    #[tokio::test]
    async fn test_taken_over_session_keeps_subscriptions() {
        let manager = LocalManager::new();
        let (old, _old_rx) = connect(&manager, "a");
        manager.subscribe("a", "t", sub(QoS::AtMostOnce)).await.unwrap();

        let (_new, _new_rx) = connect(&manager, "a");
        manager.clear_connect(&old).await.unwrap();
        assert!(manager.is_subscribed("t").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retained_expiry() {
        let manager = LocalManager::new();
        let packet = Publish::new("r", Bytes::from_static(b"v"), QoS::AtMostOnce);

        manager
            .add_retain_message("r", &packet, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(manager.get_retain_message("r").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(manager.get_retain_message("r").await.unwrap().is_none());
        assert_eq!(manager.retained_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lookup_keeps_replacement() {
        let manager = LocalManager::new();
        let old = Publish::new("r", Bytes::from_static(b"old"), QoS::AtMostOnce);
        manager
            .add_retain_message("r", &old, Some(Duration::from_secs(1)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let seen_expired_at = Instant::now();

        // A new retained message lands between the expired read and the eviction.
        let new = Publish::new("r", Bytes::from_static(b"new"), QoS::AtMostOnce);
        manager.add_retain_message("r", &new, None).await.unwrap();

        assert!(!manager.evict_expired("r", seen_expired_at));
        let kept = manager.get_retain_message("r").await.unwrap().unwrap();
        assert_eq!(&kept.payload[..], b"new");
    }

    #[tokio::test]
    async fn test_for_each_retain_message() {
        let manager = LocalManager::new();
        for topic in ["a/1", "a/2", "b/1"] {
            let packet = Publish::new(topic, Bytes::from_static(b"v"), QoS::AtMostOnce);
            manager.add_retain_message(topic, &packet, None).await.unwrap();
        }

        let mut topics = Vec::new();
        manager
            .for_each_retain_message(&|t: &str| t.starts_with("a/"), &mut |p: Publish| topics.push(p.topic))
            .await
            .unwrap();
        topics.sort();
        assert_eq!(topics, vec!["a/1", "a/2"]);
    }
}

//! Manager that shares subscriptions and retained messages across broker
//! processes through a [`Bus`].
//!
//! Key layout (`{p}` is the configured prefix):
//! - `{p}:retain:{topic}` retained PUBLISH as JSON, with TTL from message expiry
//! - `{p}:alive:{client}` liveness record, TTL 1.5 x keep-alive
//! - channel `{p}:pub:{topic}` JSON [`Envelope`] for every publish
//!
//! Each process pattern-subscribes to the minimal set of channel globs that
//! cover its local subscriptions. Glob patterns are coarser than MQTT
//! wildcards (`a/+/c` is subscribed as `a/*`), so every received envelope is
//! re-checked against the compiled filters before fan-out.
//!
//! While the glob set changes, old and new globs briefly overlap and one
//! publish can arrive twice. Envelopes carry a per-node sequence number and
//! recently seen `(node, seq)` pairs are dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::bus::{Bus, BusEvent, glob_escape};
use super::{Manager, RetainVisitor, Subscription, TopicPredicate, fan_out};
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Connect, Publish};
use crate::registry::{Delivery, Registry, SessionHandle};
use crate::topic::{self, Matcher};
use crate::types::ReasonCode;

/// Publish relayed between processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub packet: Publish,
    pub topic: String,
    pub publisher_id: String,
    pub node_id: String,
    /// Sequence number, unique per `node_id`.
    pub seq: u64,
}

/// Envelopes remembered for duplicate suppression.
const RECENT_ENVELOPES: usize = 1024;

/// Bounded set of recently delivered `(node, seq)` pairs.
#[derive(Default)]
struct RecentEnvelopes {
    order: VecDeque<(String, u64)>,
    seen: HashSet<(String, u64)>,
}

impl RecentEnvelopes {
    /// Record `(node_id, seq)`. Returns false if it was already seen.
    fn insert(&mut self, node_id: &str, seq: u64) -> bool {
        let key = (node_id.to_string(), seq);
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > RECENT_ENVELOPES
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        true
    }
}

/// Channel set needed by one topic filter, before glob translation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum ChannelPattern {
    /// Exactly one topic.
    Exact(String),
    /// Every topic starting with this prefix (empty or ending in `/`).
    Prefix(String),
}

impl ChannelPattern {
    fn for_filter(filter: &str) -> Vec<ChannelPattern> {
        if !topic::is_wildcard(filter) {
            return vec![ChannelPattern::Exact(filter.to_string())];
        }

        let levels: Vec<&str> = filter.split('/').collect();
        let first_wild = levels
            .iter()
            .position(|l| *l == topic::SINGLE_LEVEL || *l == topic::MULTI_LEVEL)
            .unwrap_or(levels.len());
        if first_wild == 0 {
            return vec![ChannelPattern::Prefix(String::new())];
        }

        let literal = levels[..first_wild].join("/");
        let prefix = ChannelPattern::Prefix(format!("{}/", literal));
        if levels[first_wild] == topic::MULTI_LEVEL {
            // `a/#` also matches `a`.
            vec![ChannelPattern::Exact(literal), prefix]
        } else {
            vec![prefix]
        }
    }

    fn covers(&self, other: &ChannelPattern) -> bool {
        match (self, other) {
            (ChannelPattern::Prefix(p), ChannelPattern::Prefix(q)) => q.starts_with(p.as_str()),
            (ChannelPattern::Prefix(p), ChannelPattern::Exact(t)) => t.starts_with(p.as_str()),
            (ChannelPattern::Exact(a), ChannelPattern::Exact(b)) => a == b,
            (ChannelPattern::Exact(_), ChannelPattern::Prefix(_)) => false,
        }
    }
}

/// Smallest subset of `patterns` matching the same channels.
///
/// Prefixes always end at a level boundary, so the result never has two
/// patterns matching the same channel.
fn minimal_cover<'a>(patterns: impl Iterator<Item = &'a ChannelPattern>) -> Vec<ChannelPattern> {
    let mut sorted: Vec<&ChannelPattern> = patterns.collect();
    // Prefixes first, shortest first.
    sorted.sort_by_key(|p| match p {
        ChannelPattern::Prefix(s) => (0, s.len()),
        ChannelPattern::Exact(s) => (1, s.len()),
    });

    let mut cover: Vec<ChannelPattern> = Vec::new();
    for pattern in sorted {
        if !cover.iter().any(|kept| kept.covers(pattern)) {
            cover.push(pattern.clone());
        }
    }
    cover
}

struct LocalFilter {
    matcher: Matcher,
    clients: HashMap<Arc<str>, Subscription>,
}

#[derive(Default)]
struct FilterTable {
    filters: HashMap<String, LocalFilter>,
    by_client: HashMap<Arc<str>, HashSet<String>>,
}

#[derive(Default)]
struct ChannelTable {
    refs: HashMap<ChannelPattern, usize>,
    subscribed: HashSet<String>,
}

/// Multi-process manager over a shared [`Bus`].
pub struct DistributedManager<B: Bus> {
    bus: Arc<B>,
    prefix: String,
    node_id: String,
    registry: Registry,
    table: RwLock<FilterTable>,
    channels: Mutex<ChannelTable>,
    next_seq: AtomicU64,
    recent: SyncMutex<RecentEnvelopes>,
    keep_alives: RwLock<HashMap<Arc<str>, Duration>>,
}

impl<B: Bus> DistributedManager<B> {
    /// Create the manager and start its bus listener.
    ///
    /// Must be called within a tokio runtime. The listener stops once the
    /// manager is dropped.
    pub fn new(bus: B, prefix: impl Into<String>) -> Result<Arc<Self>> {
        let mut events = bus
            .take_events()
            .ok_or_else(|| Error::Backend("bus event stream already taken".into()))?;

        let manager = Arc::new(Self {
            bus: Arc::new(bus),
            prefix: prefix.into(),
            node_id: uuid::Uuid::new_v4().to_string(),
            registry: Registry::new(),
            table: RwLock::new(FilterTable::default()),
            channels: Mutex::new(ChannelTable::default()),
            next_seq: AtomicU64::new(0),
            recent: SyncMutex::new(RecentEnvelopes::default()),
            keep_alives: RwLock::new(HashMap::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.handle_event(event);
            }
            trace!("distributed manager listener stopped");
        });

        debug!("distributed manager {} started", manager.node_id);
        Ok(manager)
    }

    /// Identifier of this process in relayed envelopes.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn retain_key(&self, topic: &str) -> String {
        format!("{}:retain:{}", self.prefix, topic)
    }

    fn alive_key(&self, client_id: &str) -> String {
        format!("{}:alive:{}", self.prefix, client_id)
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}:pub:{}", self.prefix, topic)
    }

    fn glob(&self, pattern: &ChannelPattern) -> String {
        let base = glob_escape(&self.channel(""));
        match pattern {
            ChannelPattern::Exact(t) => format!("{}{}", base, glob_escape(t)),
            ChannelPattern::Prefix(p) => format!("{}{}*", base, glob_escape(p)),
        }
    }

    fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Message { payload, .. } => {
                let envelope: Envelope = match serde_json::from_slice(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("dropping malformed envelope: {}", e);
                        return;
                    }
                };
                if !self.recent.lock().insert(&envelope.node_id, envelope.seq) {
                    trace!("duplicate envelope {}/{}", envelope.node_id, envelope.seq);
                    return;
                }
                self.deliver(&envelope);
            }
            BusEvent::Expired { key } => {
                let Some(client_id) = key.strip_prefix(&format!("{}:alive:", self.prefix)) else {
                    return;
                };
                if let Some(handle) = self.registry.lookup(client_id) {
                    debug!("{}: liveness record expired, closing", client_id);
                    handle.send(Delivery::Close(ReasonCode::KEEP_ALIVE_TIMEOUT));
                }
            }
        }
    }

    fn deliver(&self, envelope: &Envelope) {
        let matched: Vec<(Arc<str>, Subscription)> = {
            let table = self.table.read();
            table
                .filters
                .values()
                .filter(|f| f.matcher.matches(&envelope.topic))
                .flat_map(|f| f.clients.iter().map(|(c, s)| (c.clone(), s.clone())))
                .collect()
        };
        if matched.is_empty() {
            return;
        }
        fan_out(
            &self.registry,
            &envelope.publisher_id,
            &envelope.packet,
            matched.iter().map(|(c, s)| (c.as_ref(), s)),
        );
    }

    /// Bring bus subscriptions in line with the reference counts.
    ///
    /// New globs are subscribed before stale ones are dropped, so every
    /// wanted channel stays covered throughout. Stale globs are kept if any
    /// subscribe fails; `channels.subscribed` always reflects the bus.
    async fn sync_channels(&self, channels: &mut ChannelTable) -> Result<()> {
        let wanted: HashSet<String> = minimal_cover(channels.refs.keys())
            .iter()
            .map(|p| self.glob(p))
            .collect();

        let added: Vec<String> = wanted.difference(&channels.subscribed).cloned().collect();
        let stale: Vec<String> = channels.subscribed.difference(&wanted).cloned().collect();

        for glob in &added {
            self.bus.psubscribe(glob).await?;
            channels.subscribed.insert(glob.clone());
            trace!("psubscribe {}", glob);
        }
        for glob in &stale {
            self.bus.punsubscribe(glob).await?;
            channels.subscribed.remove(glob);
            trace!("punsubscribe {}", glob);
        }
        Ok(())
    }

    /// Undo a subscribe whose bus subscription failed.
    async fn rollback_subscribe(&self, channels: &mut ChannelTable, client_id: &str, filter: &str) {
        Self::remove_local(&mut self.table.write(), client_id, filter);
        Self::release(channels, filter);
        if let Err(e) = self.sync_channels(channels).await {
            warn!("{}: resync after failed subscribe to {:?}: {}", client_id, filter, e);
        }
    }

    fn acquire(channels: &mut ChannelTable, filter: &str) {
        for pattern in ChannelPattern::for_filter(filter) {
            *channels.refs.entry(pattern).or_default() += 1;
        }
    }

    fn release(channels: &mut ChannelTable, filter: &str) {
        for pattern in ChannelPattern::for_filter(filter) {
            if let Some(count) = channels.refs.get_mut(&pattern) {
                *count -= 1;
                if *count == 0 {
                    channels.refs.remove(&pattern);
                }
            }
        }
    }

    /// Remove `client_id` from `filter`. Returns (existed, filter now unused).
    fn remove_local(table: &mut FilterTable, client_id: &str, filter: &str) -> (bool, bool) {
        let Some(local) = table.filters.get_mut(filter) else {
            return (false, false);
        };
        let existed = local.clients.remove(client_id).is_some();
        let unused = local.clients.is_empty();
        if unused {
            table.filters.remove(filter);
        }
        if let Some(filters) = table.by_client.get_mut(client_id) {
            filters.remove(filter);
            if filters.is_empty() {
                table.by_client.remove(client_id);
            }
        }
        (existed, unused)
    }

    async fn drop_client_subscriptions(&self, client_id: &str) -> Result<usize> {
        let mut channels = self.channels.lock().await;
        let unused: Vec<String> = {
            let mut table = self.table.write();
            let filters = table.by_client.get(client_id).cloned().unwrap_or_default();
            filters
                .iter()
                .filter(|filter| Self::remove_local(&mut table, client_id, filter).1)
                .cloned()
                .collect()
        };
        for filter in &unused {
            Self::release(&mut channels, filter);
        }
        self.sync_channels(&mut channels).await?;
        Ok(unused.len())
    }
}

#[async_trait]
impl<B: Bus> Manager for DistributedManager<B> {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn connect(&self, connect: &Connect, handle: &SessionHandle) -> Result<Option<SessionHandle>> {
        let previous = self.registry.register(handle.clone());

        let ttl = (connect.keep_alive > 0).then(|| Duration::from_millis(connect.keep_alive as u64 * 1500));
        if let Some(ttl) = ttl {
            self.keep_alives.write().insert(handle.client_id.clone(), ttl);
        }
        self.bus
            .set(&self.alive_key(&handle.client_id), self.node_id.as_bytes(), ttl)
            .await?;
        Ok(previous)
    }

    async fn clear_connect(&self, handle: &SessionHandle) -> Result<()> {
        let current = self.registry.is_current(handle);
        if !self.registry.unregister(handle) || !current {
            return Ok(());
        }
        self.keep_alives.write().remove(&handle.client_id);
        let dropped = self.drop_client_subscriptions(&handle.client_id).await?;
        self.bus.delete(&self.alive_key(&handle.client_id)).await?;
        debug!("{}: session cleared, {} channel filters released", handle.client_id, dropped);
        Ok(())
    }

    async fn clear_subscriptions(&self, client_id: &str) -> Result<()> {
        self.drop_client_subscriptions(client_id).await?;
        Ok(())
    }

    async fn subscribe(&self, client_id: &str, filter: &str, subscription: Subscription) -> Result<bool> {
        let matcher = Matcher::compile(filter).ok_or_else(|| {
            Error::Protocol(ProtocolError::new(
                ReasonCode::TOPIC_FILTER_INVALID,
                format!("invalid topic filter {:?}", filter),
            ))
        })?;
        let client: Arc<str> = client_id.into();

        let mut channels = self.channels.lock().await;
        let (existed, created) = {
            let mut table = self.table.write();
            let created = !table.filters.contains_key(filter);
            let local = table.filters.entry(filter.to_string()).or_insert_with(|| LocalFilter {
                matcher,
                clients: HashMap::new(),
            });
            let existed = local.clients.insert(client.clone(), subscription).is_some();
            table.by_client.entry(client).or_default().insert(filter.to_string());
            (existed, created)
        };

        if created {
            Self::acquire(&mut channels, filter);
            if let Err(e) = self.sync_channels(&mut channels).await {
                self.rollback_subscribe(&mut channels, client_id, filter).await;
                return Err(e);
            }
        }
        Ok(existed)
    }

    async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool> {
        let mut channels = self.channels.lock().await;
        let (existed, unused) = Self::remove_local(&mut self.table.write(), client_id, filter);
        if unused {
            Self::release(&mut channels, filter);
            self.sync_channels(&mut channels).await?;
        }
        Ok(existed)
    }

    async fn is_subscribed(&self, topic: &str) -> Result<bool> {
        Ok(self.table.read().filters.values().any(|f| f.matcher.matches(topic)))
    }

    async fn publish(&self, from: &str, topic: &str, packet: &Publish) -> Result<()> {
        let envelope = Envelope {
            packet: packet.clone(),
            topic: topic.to_string(),
            publisher_id: from.to_string(),
            node_id: self.node_id.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let payload = serde_json::to_vec(&envelope)?;
        self.bus.publish(&self.channel(topic), &payload).await
    }

    async fn add_retain_message(&self, topic: &str, packet: &Publish, ttl: Option<Duration>) -> Result<()> {
        let value = serde_json::to_vec(packet)?;
        self.bus.set(&self.retain_key(topic), &value, ttl).await
    }

    async fn delete_retain_message(&self, topic: &str) -> Result<()> {
        self.bus.delete(&self.retain_key(topic)).await?;
        Ok(())
    }

    async fn get_retain_message(&self, topic: &str) -> Result<Option<Publish>> {
        match self.bus.get(&self.retain_key(topic)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn for_each_retain_message(&self, predicate: TopicPredicate<'_>, visit: RetainVisitor<'_>) -> Result<()> {
        let key_prefix = self.retain_key("");
        let keys = self.bus.keys(&format!("{}*", glob_escape(&key_prefix))).await?;

        for key in keys {
            let Some(topic) = key.strip_prefix(&key_prefix) else {
                continue;
            };
            if !predicate(topic) {
                continue;
            }
            // The key may have expired or been deleted since listing.
            if let Some(raw) = self.bus.get(&key).await? {
                visit(serde_json::from_slice(&raw)?);
            }
        }
        Ok(())
    }

    async fn ping(&self, client_id: &str) -> Result<()> {
        let ttl = self.keep_alives.read().get(client_id).copied();
        if let Some(ttl) = ttl {
            self.bus.expire(&self.alive_key(client_id), ttl).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemoryBus;
    use crate::manager::bus::{MemoryStore, glob_match};
    use std::sync::atomic::AtomicBool;
    use crate::types::{QoS, SubscriptionOptions};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn session<B: Bus>(
        manager: &DistributedManager<B>,
        client_id: &str,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(manager.registry().next_session_id(), client_id.into(), tx);
        (handle, rx)
    }

    fn sub(qos: QoS) -> Subscription {
        Subscription::new(SubscriptionOptions::new(qos), None)
    }

    async fn next_publish(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Publish {
        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed");
        match delivery {
            Delivery::Publish(p) => p,
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Every channel a filter can match must be matched by one of its globs,
    /// and the regex re-check must agree with the trie used by the local
    /// manager.
    #[test]
    fn test_glob_cover_conformance() {
        let filters = [
            "#", "+", "a", "a/#", "a/+", "+/b", "a/+/c", "a/b/#", "+/+", "a/+/#", "$SYS/#", "a*b/+", "q?/#",
        ];
        let topics = [
            "a", "a/", "a/b", "a/b/c", "a/x/c", "b", "x/b", "a/b/c/d", "$SYS/x", "", "/", "/b", "a*b/z",
            "q?/1", "qx/1", "ab",
        ];

        for filter in filters {
            let matcher = Matcher::compile(filter).unwrap();
            let mut trie = crate::trie::Trie::new();
            trie.insert(filter, ()).unwrap();
            let globs: Vec<String> = ChannelPattern::for_filter(filter)
                .iter()
                .map(|p| match p {
                    ChannelPattern::Exact(t) => glob_escape(t),
                    ChannelPattern::Prefix(p) => format!("{}*", glob_escape(p)),
                })
                .collect();

            for topic in topics {
                let wanted = matcher.matches(topic);
                let delivered = globs.iter().any(|g| glob_match(g, topic));
                if wanted {
                    assert!(delivered, "{filter} matches {topic:?} but no glob in {globs:?} does");
                }
                assert_eq!(wanted, !trie.matches(topic).is_empty(), "{filter} vs {topic:?}");
            }
        }
    }

    #[test]
    fn test_minimal_cover() {
        let patterns = [
            ChannelPattern::Exact("a/b".into()),
            ChannelPattern::Prefix("a/".into()),
            ChannelPattern::Prefix("a/b/".into()),
            ChannelPattern::Exact("a".into()),
            ChannelPattern::Exact("c".into()),
        ];
        let mut cover = minimal_cover(patterns.iter());
        cover.sort();
        assert_eq!(
            cover,
            vec![
                ChannelPattern::Exact("a".into()),
                ChannelPattern::Exact("c".into()),
                ChannelPattern::Prefix("a/".into()),
            ]
        );

        let all = [ChannelPattern::Prefix(String::new()), ChannelPattern::Exact("x".into())];
        assert_eq!(minimal_cover(all.iter()), vec![ChannelPattern::Prefix(String::new())]);
    }

    #[tokio::test]
    async fn test_cross_node_delivery() {
        let store = MemoryStore::new();
        let node_a = DistributedManager::new(store.connect(), "mqtt").unwrap();
        let node_b = DistributedManager::new(store.connect(), "mqtt").unwrap();

        let (handle_a, mut rx_a) = session(&node_a, "A");
        node_a.connect(&Connect::new("A", 0), &handle_a).await.unwrap();
        node_a.subscribe("A", "home/+/temp", sub(QoS::AtLeastOnce)).await.unwrap();

        let (handle_b, _rx_b) = session(&node_b, "B");
        node_b.connect(&Connect::new("B", 0), &handle_b).await.unwrap();

        let mut packet = Publish::new("home/kitchen/temp", Bytes::from_static(b"21.5"), QoS::AtLeastOnce);
        packet.packet_id = 9;
        node_b.publish("B", "home/kitchen/temp", &packet).await.unwrap();
        // Coarse glob match, rejected by the exact re-check.
        node_b.publish("B", "home/kitchen/temp/x", &packet).await.unwrap();

        let got = next_publish(&mut rx_a).await;
        assert_eq!(got.topic, "home/kitchen/temp");
        assert_eq!(&got.payload[..], b"21.5");
        assert_eq!(got.qos, QoS::AtLeastOnce);
        assert_ne!(got.packet_id, 0);
        assert!(node_a.registry().has("A", got.packet_id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overlapping_filters_deliver_once() {
        let store = MemoryStore::new();
        let node = DistributedManager::new(store.connect(), "mqtt").unwrap();
        let (handle, mut rx) = session(&node, "A");
        node.connect(&Connect::new("A", 0), &handle).await.unwrap();

        node.subscribe("A", "a/#", sub(QoS::AtMostOnce)).await.unwrap();
        node.subscribe("A", "a/b", sub(QoS::AtMostOnce)).await.unwrap();
        assert_eq!(subscribed(&node).await, vec!["mqtt:pub:a", "mqtt:pub:a/*"]);

        let packet = Publish::new("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce);
        node.publish("P", "a/b", &packet).await.unwrap();

        next_publish(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        assert!(node.unsubscribe("A", "a/#").await.unwrap());
        assert_eq!(subscribed(&node).await, vec!["mqtt:pub:a/b"]);
    }

    async fn subscribed<B: Bus>(node: &DistributedManager<B>) -> Vec<String> {
        let mut globs: Vec<String> = node.channels.lock().await.subscribed.iter().cloned().collect();
        globs.sort();
        globs
    }

    fn envelope_event(node_id: &str, seq: u64, pattern: &str) -> BusEvent {
        let envelope = Envelope {
            packet: Publish::new("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce),
            topic: "a/b".into(),
            publisher_id: "P".into(),
            node_id: node_id.into(),
            seq,
        };
        BusEvent::Message {
            pattern: pattern.into(),
            channel: "mqtt:pub:a/b".into(),
            payload: Bytes::from(serde_json::to_vec(&envelope).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_envelope_on_two_globs_delivered_once() {
        let store = MemoryStore::new();
        let node = DistributedManager::new(store.connect(), "mqtt").unwrap();
        let (handle, mut rx) = session(&node, "A");
        node.connect(&Connect::new("A", 0), &handle).await.unwrap();
        node.subscribe("A", "a/#", sub(QoS::AtMostOnce)).await.unwrap();

        // The same publish seen on the old and the new glob while they overlap.
        node.handle_event(envelope_event("n1", 7, "mqtt:pub:a/b"));
        node.handle_event(envelope_event("n1", 7, "mqtt:pub:a/*"));
        // Same sequence from another node is a different publish.
        node.handle_event(envelope_event("n2", 7, "mqtt:pub:a/*"));
        // A glob that is no longer subscribed still delivers its last messages.
        node.handle_event(envelope_event("n1", 8, "mqtt:pub:a/b"));

        for _ in 0..3 {
            next_publish(&mut rx).await;
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_recent_envelopes_bounded() {
        let mut recent = RecentEnvelopes::default();
        for seq in 0..(RECENT_ENVELOPES as u64 + 10) {
            assert!(recent.insert("n", seq));
        }
        assert!(!recent.insert("n", RECENT_ENVELOPES as u64));
        assert_eq!(recent.seen.len(), RECENT_ENVELOPES);
        assert!(recent.insert("n", 0));
    }

    /// [`MemoryBus`] whose pattern subscriptions can be made to fail.
    struct FlakyBus {
        inner: MemoryBus,
        fail_psubscribe: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Bus for FlakyBus {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
            self.inner.keys(pattern).await
        }

        async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
            self.inner.publish(channel, payload).await
        }

        async fn psubscribe(&self, pattern: &str) -> Result<()> {
            if self.fail_psubscribe.load(Ordering::SeqCst) {
                return Err(Error::Backend("psubscribe refused".into()));
            }
            self.inner.psubscribe(pattern).await
        }

        async fn punsubscribe(&self, pattern: &str) -> Result<()> {
            self.inner.punsubscribe(pattern).await
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BusEvent>> {
            self.inner.take_events()
        }
    }

    #[tokio::test]
    async fn test_failed_psubscribe_rolls_back() {
        let store = MemoryStore::new();
        let fail = Arc::new(AtomicBool::new(false));
        let bus = FlakyBus {
            inner: store.connect(),
            fail_psubscribe: fail.clone(),
        };
        let node = DistributedManager::new(bus, "mqtt").unwrap();
        let (handle, mut rx) = session(&node, "A");
        node.connect(&Connect::new("A", 0), &handle).await.unwrap();
        node.subscribe("A", "a/b", sub(QoS::AtMostOnce)).await.unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(node.subscribe("A", "a/#", sub(QoS::AtMostOnce)).await.is_err());

        // The old glob is still subscribed and nothing references the failed filter.
        assert_eq!(subscribed(&node).await, vec!["mqtt:pub:a/b"]);
        assert!(!node.channels.lock().await.refs.contains_key(&ChannelPattern::Prefix("a/".into())));
        assert!(!node.is_subscribed("a/c").await.unwrap());

        let packet = Publish::new("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce);
        node.publish("P", "a/b", &packet).await.unwrap();
        next_publish(&mut rx).await;

        fail.store(false, Ordering::SeqCst);
        node.subscribe("A", "a/#", sub(QoS::AtMostOnce)).await.unwrap();
        assert_eq!(subscribed(&node).await, vec!["mqtt:pub:a", "mqtt:pub:a/*"]);
    }

    #[tokio::test]
    async fn test_retained_shared_between_nodes() {
        let store = MemoryStore::new();
        let node_a = DistributedManager::new(store.connect(), "mqtt").unwrap();
        let node_b = DistributedManager::new(store.connect(), "mqtt").unwrap();

        let mut packet = Publish::new("status/1", Bytes::from_static(b"on"), QoS::AtMostOnce);
        packet.retain = true;
        node_a.add_retain_message("status/1", &packet, None).await.unwrap();

        let got = node_b.get_retain_message("status/1").await.unwrap().unwrap();
        assert_eq!(got.payload, packet.payload);

        let mut seen = Vec::new();
        node_b
            .for_each_retain_message(&|t: &str| topic::matches("status/+", t), &mut |p: Publish| {
                seen.push(p.topic)
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["status/1"]);

        node_b.delete_retain_message("status/1").await.unwrap();
        assert!(node_a.get_retain_message("status/1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_expiry_closes_session() {
        let store = MemoryStore::new();
        let node = DistributedManager::new(store.connect(), "mqtt").unwrap();
        let (handle, mut rx) = session(&node, "A");
        node.connect(&Connect::new("A", 10), &handle).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        node.ping("A").await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(6)).await;
        match rx.recv().await.unwrap() {
            Delivery::Close(code) => assert_eq!(code, ReasonCode::KEEP_ALIVE_TIMEOUT),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clear_connect_releases_channels() {
        let store = MemoryStore::new();
        let node = DistributedManager::new(store.connect(), "mqtt").unwrap();
        let (handle, _rx) = session(&node, "A");
        node.connect(&Connect::new("A", 30), &handle).await.unwrap();
        node.subscribe("A", "x/+", sub(QoS::AtMostOnce)).await.unwrap();

        node.clear_connect(&handle).await.unwrap();
        node.clear_connect(&handle).await.unwrap();
        assert!(subscribed(&node).await.is_empty());
        assert!(!node.is_subscribed("x/1").await.unwrap());
        assert!(store.connect().get("mqtt:alive:A").await.unwrap().is_none());
    }
}

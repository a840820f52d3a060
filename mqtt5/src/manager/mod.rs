//! Backend abstraction: subscriptions, retained messages and publish fan-out.
//!
//! Two implementations share the [`Manager`] contract:
//! - [`LocalManager`] keeps everything in-process and matches with a topic trie.
//! - [`DistributedManager`] relays publishes through a shared [`Bus`] so that
//!   several broker processes serve one topic space.

pub mod bus;
pub mod distributed;
pub mod local;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::Result;
use crate::protocol::{Connect, Publish};
use crate::registry::{Delivery, Registry, SessionHandle};
use crate::types::{QoS, SubscriptionOptions};

pub use bus::{Bus, BusEvent, MemoryBus, MemoryStore};
pub use distributed::DistributedManager;
pub use local::LocalManager;
#[cfg(feature = "redis")]
pub use self::redis::RedisBus;

/// One client's subscription to one topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub options: SubscriptionOptions,
    pub subscription_identifier: Option<u32>,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Subscription {
    pub fn new(options: SubscriptionOptions, subscription_identifier: Option<u32>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            options,
            subscription_identifier,
            created_at,
        }
    }
}

/// Predicate over retained topic names.
pub type TopicPredicate<'a> = &'a (dyn Fn(&str) -> bool + Sync);

/// Visitor receiving retained messages.
pub type RetainVisitor<'a> = &'a mut (dyn FnMut(Publish) + Send);

/// Subscription, retained-message and fan-out backend.
///
/// Implementations are shared by all connections and must tolerate
/// concurrent calls.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Session registry, including per-client packet identifier pools.
    fn registry(&self) -> &Registry;

    /// Register a connected session.
    ///
    /// Returns the handle of a session that held the same client id and has
    /// now been taken over.
    async fn connect(&self, connect: &Connect, handle: &SessionHandle) -> Result<Option<SessionHandle>>;

    /// Release subscriptions and liveness state of a session.
    ///
    /// Safe to call more than once; a session that has been taken over leaves
    /// the newer session's state alone.
    async fn clear_connect(&self, handle: &SessionHandle) -> Result<()>;

    /// Drop every subscription of `client_id` (clean start).
    async fn clear_subscriptions(&self, client_id: &str) -> Result<()>;

    /// Add or replace a subscription. Returns true if it already existed.
    async fn subscribe(&self, client_id: &str, filter: &str, subscription: Subscription) -> Result<bool>;

    /// Remove a subscription. Returns true if it existed.
    async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool>;

    /// True if any subscription served by this manager matches `topic`.
    async fn is_subscribed(&self, topic: &str) -> Result<bool>;

    /// Fan `packet` out to every session subscribed to `topic`.
    async fn publish(&self, from: &str, topic: &str, packet: &Publish) -> Result<()>;

    /// Store the retained message for `topic`, replacing any previous one.
    async fn add_retain_message(&self, topic: &str, packet: &Publish, ttl: Option<Duration>) -> Result<()>;

    async fn delete_retain_message(&self, topic: &str) -> Result<()>;

    async fn get_retain_message(&self, topic: &str) -> Result<Option<Publish>>;

    /// Visit every retained message whose topic satisfies `predicate`.
    async fn for_each_retain_message(&self, predicate: TopicPredicate<'_>, visit: RetainVisitor<'_>) -> Result<()>;

    /// Refresh keep-alive liveness of `client_id`.
    async fn ping(&self, client_id: &str) -> Result<()>;
}

impl fmt::Debug for dyn Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Manager {{ sessions: {} }}", self.registry().len())
    }
}

/// Per-client aggregate of all subscriptions matching one publish.
#[derive(Default)]
struct Target {
    qos: Option<QoS>,
    retain_as_published: bool,
    identifiers: Vec<u32>,
}

/// Deliver `packet` to every matching subscription.
///
/// Each client receives at most one copy, at the highest QoS among its
/// matching subscriptions and carrying all their identifiers. Returns the
/// number of sessions the packet was queued for.
pub(crate) fn fan_out<'a, I>(registry: &Registry, from: &str, packet: &Publish, matches: I) -> usize
where
    I: IntoIterator<Item = (&'a str, &'a Subscription)>,
{
    let mut targets: HashMap<&str, Target> = HashMap::new();
    for (client_id, subscription) in matches {
        let options = &subscription.options;
        if options.no_local && client_id == from {
            continue;
        }
        let target = targets.entry(client_id).or_default();
        target.qos = Some(target.qos.map_or(options.qos, |q| q.max(options.qos)));
        target.retain_as_published |= options.retain_as_published;
        if let Some(id) = subscription.subscription_identifier {
            target.identifiers.push(id);
        }
    }

    let mut delivered = 0;
    for (client_id, target) in targets {
        let Some(handle) = registry.lookup(client_id) else {
            continue;
        };

        let mut out = packet.clone();
        out.qos = packet.qos.min(target.qos.unwrap_or(QoS::AtMostOnce));
        out.dup = false;
        out.retain = packet.retain && target.retain_as_published;
        out.properties.topic_alias = None;
        out.properties.subscription_identifiers = target.identifiers;
        out.packet_id = 0;

        if out.qos > QoS::AtMostOnce {
            match registry.allocate(handle.session_id) {
                Some(id) => out.packet_id = id,
                None => {
                    warn!("{}: no free packet identifier, dropping publish to {}", client_id, out.topic);
                    continue;
                }
            }
        }

        let packet_id = out.packet_id;
        if handle.send(Delivery::Publish(out)) {
            delivered += 1;
        } else if packet_id != 0 {
            registry.release(handle.session_id, packet_id);
        }
    }

    trace!("fan out {} from {}: {} recipients", packet.topic, from, delivered);
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn session(registry: &Registry, client_id: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(SessionHandle::new(registry.next_session_id(), client_id.into(), tx));
        rx
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<Publish> {
        let mut out = Vec::new();
        while let Ok(Delivery::Publish(p)) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[test]
    fn test_qos_downgrade_allocates_fresh_id() {
        let registry = Registry::new();
        let mut rx = session(&registry, "sub");
        let session_id = registry.lookup("sub").unwrap().session_id;
        assert_eq!(registry.allocate(session_id), Some(1));

        let sub = Subscription::new(SubscriptionOptions::new(QoS::AtLeastOnce), None);
        let mut packet = Publish::new("t", Bytes::from_static(b"x"), QoS::ExactlyOnce);
        packet.packet_id = 1;
        packet.dup = true;

        assert_eq!(fan_out(&registry, "pub", &packet, [("sub", &sub)]), 1);
        let got = received(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].qos, QoS::AtLeastOnce);
        assert_eq!(got[0].packet_id, 2);
        assert!(!got[0].dup);
        assert!(registry.has("sub", 1) && registry.has("sub", 2));
    }

    #[test]
    fn test_no_local_and_retain_flag() {
        let registry = Registry::new();
        let mut me = session(&registry, "me");
        let mut other = session(&registry, "other");

        let no_local = Subscription::new(SubscriptionOptions::new(QoS::AtMostOnce).with_no_local(true), None);
        let rap = Subscription::new(
            SubscriptionOptions::new(QoS::AtMostOnce).with_retain_as_published(true),
            None,
        );
        let mut packet = Publish::new("t", Bytes::from_static(b"x"), QoS::AtMostOnce);
        packet.retain = true;

        fan_out(&registry, "me", &packet, [("me", &no_local), ("other", &rap)]);
        assert!(received(&mut me).is_empty());
        let got = received(&mut other);
        assert_eq!(got.len(), 1);
        assert!(got[0].retain);
    }

    #[test]
    fn test_overlapping_subscriptions_deliver_once() {
        let registry = Registry::new();
        let mut rx = session(&registry, "c");

        let low = Subscription::new(SubscriptionOptions::new(QoS::AtMostOnce), Some(3));
        let high = Subscription::new(SubscriptionOptions::new(QoS::ExactlyOnce), Some(8));
        let packet = Publish::new("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce);

        fan_out(&registry, "p", &packet, [("c", &low), ("c", &high)]);
        let got = received(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].qos, QoS::AtLeastOnce);
        assert!(!got[0].retain);
        let mut ids = got[0].properties.subscription_identifiers.clone();
        ids.sort();
        assert_eq!(ids, vec![3, 8]);
    }

    #[test]
    fn test_closed_session_releases_id() {
        let registry = Registry::new();
        let rx = session(&registry, "gone");
        drop(rx);

        let sub = Subscription::new(SubscriptionOptions::new(QoS::AtLeastOnce), None);
        let packet = Publish::new("t", Bytes::new(), QoS::AtLeastOnce);
        assert_eq!(fan_out(&registry, "p", &packet, [("gone", &sub)]), 0);
        assert!(!registry.has("gone", 1));
    }
}

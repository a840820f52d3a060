//! Broker event hooks.
//!
//! Each hook sees the decoded packet before the broker acts on it. Returning
//! `false` skips the built-in handling for that packet:
//!
//! | Hook | Effect of `false` |
//! |------|-------------------|
//! | `on_connect` | CONNACK `Not authorized`, connection closed |
//! | `on_publish` | not routed, QoS 1/2 acknowledged with `Not authorized` |
//! | `on_subscribe`, `on_unsubscribe` | every filter answered with `Not authorized` |
//! | `on_ping` | no PINGRESP |
//! | `on_puback`, `on_pubcomp` | none; the packet identifier is released first |
//! | `on_pubrec` | no PUBREL, the packet identifier is released |
//! | `on_pubrel` | no PUBCOMP |
//! | `on_auth` | AUTH ignored, authentication stays pending |
//!
//! `on_disconnect` is a notification; its result is ignored.

use async_trait::async_trait;

use crate::manager::Manager;
use crate::protocol::{Auth, Connect, Disconnect, PubAck, Publish, Subscribe, Unsubscribe};
use crate::registry::SessionHandle;

/// What a hook knows about the connection that triggered it.
pub struct HookContext<'a> {
    pub handle: &'a SessionHandle,
    pub manager: &'a dyn Manager,
}

impl HookContext<'_> {
    pub fn client_id(&self) -> &str {
        &self.handle.client_id
    }
}

/// Broker event hooks. Every method defaults to allowing the event.
#[async_trait]
pub trait Hooks: Send + Sync {
    async fn on_connect(&self, _ctx: &HookContext<'_>, _packet: &Connect) -> bool {
        true
    }

    /// Called once per session teardown. `packet` is the client's DISCONNECT,
    /// if it sent one.
    async fn on_disconnect(&self, _ctx: &HookContext<'_>, _packet: Option<&Disconnect>) -> bool {
        true
    }

    async fn on_publish(&self, _ctx: &HookContext<'_>, _packet: &Publish) -> bool {
        true
    }

    async fn on_subscribe(&self, _ctx: &HookContext<'_>, _packet: &Subscribe) -> bool {
        true
    }

    async fn on_unsubscribe(&self, _ctx: &HookContext<'_>, _packet: &Unsubscribe) -> bool {
        true
    }

    async fn on_ping(&self, _ctx: &HookContext<'_>) -> bool {
        true
    }

    async fn on_puback(&self, _ctx: &HookContext<'_>, _packet: &PubAck) -> bool {
        true
    }

    async fn on_pubrec(&self, _ctx: &HookContext<'_>, _packet: &PubAck) -> bool {
        true
    }

    async fn on_pubrel(&self, _ctx: &HookContext<'_>, _packet: &PubAck) -> bool {
        true
    }

    async fn on_pubcomp(&self, _ctx: &HookContext<'_>, _packet: &PubAck) -> bool {
        true
    }

    async fn on_auth(&self, _ctx: &HookContext<'_>, _packet: &Auth) -> bool {
        true
    }
}

/// Hooks that allow everything.
#[derive(Debug, Default, Clone)]
pub struct NoHooks;

impl Hooks for NoHooks {}

//! MQTT 5.0 broker with pluggable backends.
//!
//! The broker speaks MQTT 5.0 only and supports QoS 0, 1 and 2, retained
//! messages, topic aliases, will messages and subscription identifiers.
//!
//! ## Components
//!
//! - [`protocol`]: packet codec, pure decode/encode of every control packet
//! - [`Connection`]: per-connection protocol state machine
//! - [`Manager`]: subscription, retained-message and fan-out backend, with an
//!   in-process [`LocalManager`] and a bus-backed [`DistributedManager`] for
//!   running several brokers over one topic space
//! - [`Broker`]: TCP accept loop and stream driver
//!
//! ## Example
//!
//! ```no_run
//! use mqtt5::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> mqtt5::Result<()> {
//!     let broker = Broker::new(BrokerConfig::new("127.0.0.1:1883"));
//!     broker.serve().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod topic;
pub mod trie;
pub mod types;

pub use broker::{Broker, BrokerBuilder};
pub use config::{BrokerConfig, RedisConfig};
pub use connection::{Connection, State};
pub use error::{Error, ProtocolError, Result};
pub use hooks::{HookContext, Hooks, NoHooks};
pub use manager::{Bus, DistributedManager, LocalManager, Manager, MemoryBus, MemoryStore, Subscription};
#[cfg(feature = "redis")]
pub use manager::RedisBus;
pub use registry::{Delivery, Registry, SessionHandle};
pub use types::{QoS, ReasonCode, RetainHandling, SubscriptionOptions};

//! Broker and backend configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::MAX_PACKET_SIZE;
use crate::types::QoS;

/// Default maximum topic aliases per client.
pub const DEFAULT_TOPIC_ALIAS_MAXIMUM: u16 = 65535;

/// Default number of unacknowledged QoS 1/2 publishes accepted per client.
pub const DEFAULT_RECEIVE_MAXIMUM: u16 = 65535;

/// Broker configuration.
///
/// Every field has a default, so a partial document deserializes into a
/// usable config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address (host:port).
    pub addr: String,
    /// Maximum inbound packet size, advertised in CONNACK.
    pub max_packet_size: usize,
    /// Receive Maximum advertised to clients.
    pub receive_maximum: u16,
    /// Topic Alias Maximum advertised to clients. 0 disables aliases.
    pub topic_alias_maximum: u16,
    /// Highest QoS accepted on PUBLISH and granted on SUBSCRIBE.
    pub maximum_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    /// Generate a client identifier when CONNECT carries an empty one.
    pub assign_client_id: bool,
    /// Replay retained messages on SUBSCRIBE.
    pub retained_replay: bool,
    /// Forward diagnostic reason strings to clients.
    pub forward_reason_strings: bool,
    /// Keep-alive imposed on clients, overriding the one they request.
    pub server_keep_alive: Option<u16>,
    /// Seconds a new connection may take to send CONNECT.
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:1883")
    }
}

impl BrokerConfig {
    /// Create a config listening on `addr` with default limits.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_packet_size: MAX_PACKET_SIZE,
            receive_maximum: DEFAULT_RECEIVE_MAXIMUM,
            topic_alias_maximum: DEFAULT_TOPIC_ALIAS_MAXIMUM,
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            assign_client_id: true,
            retained_replay: true,
            forward_reason_strings: false,
            server_keep_alive: None,
            connect_timeout_secs: 10,
        }
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn receive_maximum(mut self, max: u16) -> Self {
        self.receive_maximum = max;
        self
    }

    /// Set maximum topic aliases per client.
    pub fn topic_alias_maximum(mut self, max: u16) -> Self {
        self.topic_alias_maximum = max;
        self
    }

    pub fn maximum_qos(mut self, qos: QoS) -> Self {
        self.maximum_qos = qos;
        self
    }

    pub fn retain_available(mut self, enabled: bool) -> Self {
        self.retain_available = enabled;
        self
    }

    pub fn wildcard_subscription_available(mut self, enabled: bool) -> Self {
        self.wildcard_subscription_available = enabled;
        self
    }

    pub fn assign_client_id(mut self, enabled: bool) -> Self {
        self.assign_client_id = enabled;
        self
    }

    pub fn retained_replay(mut self, enabled: bool) -> Self {
        self.retained_replay = enabled;
        self
    }

    pub fn forward_reason_strings(mut self, enabled: bool) -> Self {
        self.forward_reason_strings = enabled;
        self
    }

    pub fn server_keep_alive(mut self, seconds: Option<u16>) -> Self {
        self.server_keep_alive = seconds;
        self
    }

    pub fn connect_timeout_secs(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Reject settings the protocol cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.receive_maximum == 0 {
            return Err(Error::InvalidConfig("receive_maximum must be at least 1".into()));
        }
        if self.max_packet_size < 2 || self.max_packet_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_packet_size {} out of range",
                self.max_packet_size
            )));
        }
        Ok(())
    }
}

/// Connection settings for the Redis-backed distributed manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database index.
    pub db: u32,
    /// Key and channel prefix shared by all brokers of one cluster.
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            prefix: "mqtt5".into(),
        }
    }
}

impl RedisConfig {
    /// Connection URL in `redis://[user[:password]@]host:port/db` form.
    pub fn url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (Some(user), None) => format!("{}@", user),
            (None, Some(pass)) => format!(":{}@", pass),
            (None, None) => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
    }
}

//! Redis implementation of [`Bus`].
//!
//! Commands go over one multiplexed connection. Pattern subscriptions and
//! keyevent notifications share a dedicated pub/sub connection driven by a
//! background task.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::bus::{Bus, BusEvent};
use crate::config::RedisConfig;
use crate::error::{Error, Result};

enum Control {
    Subscribe(String, oneshot::Sender<redis::RedisResult<()>>),
    Unsubscribe(String, oneshot::Sender<redis::RedisResult<()>>),
}

/// [`Bus`] backed by a Redis server.
pub struct RedisBus {
    conn: MultiplexedConnection,
    control: mpsc::UnboundedSender<Control>,
    events: Mutex<Option<mpsc::UnboundedReceiver<BusEvent>>>,
}

impl RedisBus {
    /// Connect to Redis and start the pub/sub task.
    ///
    /// Key expiry notifications (`notify-keyspace-events Ex`) are enabled on
    /// the server if the connection is allowed to; otherwise a warning is
    /// logged and liveness expiry relies on each broker's own keep-alive.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let enabled: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await;
        if let Err(e) = enabled {
            warn!("redis: cannot enable keyevent notifications: {}", e);
        }

        let mut pubsub = client.get_async_pubsub().await?;
        let expired = format!("__keyevent@{}__:expired", config.db);
        pubsub.psubscribe(&expired).await?;

        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    control = control_rx.recv() => {
                        match control {
                            Some(Control::Subscribe(pattern, reply)) => {
                                let _ = reply.send(pubsub.psubscribe(&pattern).await);
                            }
                            Some(Control::Unsubscribe(pattern, reply)) => {
                                let _ = reply.send(pubsub.punsubscribe(&pattern).await);
                            }
                            None => break,
                        }
                    }
                    msg = async { pubsub.on_message().next().await } => {
                        let Some(msg) = msg else {
                            warn!("redis: pub/sub connection closed");
                            break;
                        };
                        let pattern: String = msg.get_pattern().unwrap_or_default();
                        let channel = msg.get_channel_name().to_string();
                        let payload = Bytes::copy_from_slice(msg.get_payload_bytes());

                        let event = if pattern == expired {
                            BusEvent::Expired {
                                key: String::from_utf8_lossy(&payload).into_owned(),
                            }
                        } else {
                            BusEvent::Message { pattern, channel, payload }
                        };
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("redis: pub/sub task stopped");
        });

        info!("redis: connected to {}:{} db {}", config.host, config.port, config.db);
        Ok(Self {
            conn,
            control: control_tx,
            events: Mutex::new(Some(event_rx)),
        })
    }

    async fn control(&self, make: impl FnOnce(oneshot::Sender<redis::RedisResult<()>>) -> Control) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(make(tx))
            .map_err(|_| Error::Backend("redis pub/sub task stopped".into()))?;
        rx.await
            .map_err(|_| Error::Backend("redis pub/sub task stopped".into()))??;
        Ok(())
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        let pattern = pattern.to_string();
        self.control(|reply| Control::Subscribe(pattern, reply)).await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        let pattern = pattern.to_string();
        self.control(|reply| Control::Unsubscribe(pattern, reply)).await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BusEvent>> {
        self.events.lock().take()
    }
}

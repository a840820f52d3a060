//! MQTT 5.0 broker.
//!
//! [`Broker::serve`] accepts TCP connections and runs each one in its own
//! task. [`Broker::serve_stream`] runs the same driver over any byte stream,
//! so TLS or bridged transports plug in without touching the protocol code.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::BrokerConfig;
use crate::connection::{self, Connection, State};
use crate::error::{Error, Result};
use crate::hooks::{Hooks, NoHooks};
use crate::manager::{LocalManager, Manager};
use crate::protocol::Publish;
use crate::types::{QoS, ReasonCode};

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    manager: Option<Arc<dyn Manager>>,
    hooks: Option<Arc<dyn Hooks>>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            manager: None,
            hooks: None,
        }
    }

    /// Set the backend. Defaults to a [`LocalManager`].
    pub fn manager(mut self, manager: Arc<dyn Manager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Set the event hooks.
    pub fn hooks<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        Broker {
            config: Arc::new(self.config),
            manager: self.manager.unwrap_or_else(|| Arc::new(LocalManager::new())),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoHooks)),
            running: AtomicBool::new(false),
        }
    }
}

/// MQTT 5.0 broker.
pub struct Broker {
    config: Arc<BrokerConfig>,
    manager: Arc<dyn Manager>,
    hooks: Arc<dyn Hooks>,
    running: AtomicBool,
}

impl Broker {
    /// Create a broker with an in-process backend and no hooks.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<dyn Manager> {
        &self.manager
    }

    /// Accept TCP connections on the configured address until an accept fails.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.addr).await?;
        info!("Broker listening on {}", self.config.addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("Accepted connection from {}", addr);
            if let Err(e) = stream.set_nodelay(true) {
                warn!("{}: set_nodelay failed: {}", addr, e);
            }

            let config = Arc::clone(&self.config);
            let manager = Arc::clone(&self.manager);
            let hooks = Arc::clone(&self.hooks);
            tokio::spawn(async move {
                if let Err(e) = drive(stream, config, manager, hooks).await {
                    debug!("{}: connection error: {}", addr, e);
                }
            });
        }
    }

    /// Run one connection over an already established byte stream.
    pub async fn serve_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        drive(
            stream,
            Arc::clone(&self.config),
            Arc::clone(&self.manager),
            Arc::clone(&self.hooks),
        )
        .await
    }

    /// Publish a message from the broker itself.
    ///
    /// Retained messages are stored or cleared the same way as for a client
    /// publish.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Result<()> {
        let mut packet = Publish::new(topic, payload, qos.min(self.config.maximum_qos));
        packet.retain = retain && self.config.retain_available;
        connection::route(self.manager.as_ref(), "", &packet).await
    }
}

async fn flush<W: AsyncWrite>(writer: &mut WriteHalf<W>, conn: &mut Connection) -> Result<()> {
    let out = conn.take_outbox();
    if !out.is_empty() {
        trace!("write {} bytes", out.len());
        writer.write_all(&out).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Move bytes between a stream and its [`Connection`] until either side closes.
async fn drive<S>(stream: S, config: Arc<BrokerConfig>, manager: Arc<dyn Manager>, hooks: Arc<dyn Hooks>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let connect_deadline = Instant::now() + Duration::from_secs(config.connect_timeout_secs);
    let (mut conn, mut rx) = Connection::new(config, manager, hooks);

    let mut buf = vec![0u8; 4096];
    let mut last_read = Instant::now();

    let result = loop {
        // MQTT: disconnect if no packet arrives within 1.5 × keep-alive.
        let deadline = match conn.state() {
            State::AwaitingConnect => Some(connect_deadline),
            _ => conn.keep_alive().map(|ka| last_read + ka * 3 / 2),
        };
        let timeout = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                last_read = Instant::now();
                let handled = conn.handle_chunk(&buf[..n]).await;
                let flushed = flush(&mut writer, &mut conn).await;
                if let Err(e) = handled.and(flushed) {
                    break Err(e);
                }
            }
            delivery = rx.recv() => {
                // The connection holds a sender, so the channel never closes first.
                if let Some(delivery) = delivery {
                    conn.deliver(delivery).await;
                    if let Err(e) = flush(&mut writer, &mut conn).await {
                        break Err(e);
                    }
                }
            }
            _ = timeout => {
                if conn.state() == State::AwaitingConnect {
                    debug!("no CONNECT within timeout");
                    conn.close().await;
                } else {
                    debug!("{}: keep-alive timeout", conn.client_id().unwrap_or("-"));
                    conn.disconnect(ReasonCode::KEEP_ALIVE_TIMEOUT).await;
                    break flush(&mut writer, &mut conn).await;
                }
                break Ok(());
            }
        }

        if conn.is_closed() {
            break Ok(());
        }
    };

    conn.close().await;
    if let Err(e) = writer.shutdown().await {
        trace!("shutdown: {}", e);
    }
    result
}

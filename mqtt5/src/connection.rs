//! Per-connection MQTT 5.0 protocol state machine.
//!
//! A [`Connection`] consumes raw inbound bytes and produces encoded outbound
//! bytes. It owns no socket: the driver in [`crate::broker`] moves bytes
//! between the transport and the connection, and forwards [`Delivery`]
//! messages routed to this session by the manager.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::BrokerConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::hooks::{HookContext, Hooks};
use crate::manager::{Manager, Subscription};
use crate::protocol::{
    Auth, ConnAck, Connect, Disconnect, Framer, Packet, PacketType, Properties, PubAck, Publish, SubAck,
    Subscribe, UnsubAck, Unsubscribe, Will,
};
use crate::registry::{Delivery, SessionHandle, SessionId};
use crate::topic::{self, Matcher};
use crate::types::{QoS, ReasonCode, RetainHandling, SubscriptionOptions};

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the first packet, which must be CONNECT.
    AwaitingConnect,
    /// CONNECT carried an authentication method; only AUTH is accepted.
    Authenticating,
    Connected,
    Closed,
}

/// Session state scoped to one connection.
struct Session {
    handle: SessionHandle,
    keep_alive: u16,
    /// Inbound topic aliases.
    aliases: HashMap<u16, String>,
    /// Inbound QoS 2 packet ids that have been PUBRECed and await PUBREL.
    awaiting_rel: HashSet<u16>,
    /// Client's Maximum Packet Size, if it declared one.
    max_packet_size: Option<u32>,
    request_problem_info: bool,
    will: Option<Will>,
    last_refresh: Instant,
}

/// One client connection.
pub struct Connection {
    config: Arc<BrokerConfig>,
    manager: Arc<dyn Manager>,
    hooks: Arc<dyn Hooks>,
    framer: Framer,
    state: State,
    session: Option<Session>,
    outbox: BytesMut,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("client_id", &self.client_id())
            .field("buffered", &self.framer.buffered())
            .finish()
    }
}

impl Connection {
    /// Create a connection and the receiver its deliveries arrive on.
    pub fn new(
        config: Arc<BrokerConfig>,
        manager: Arc<dyn Manager>,
        hooks: Arc<dyn Hooks>,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            framer: Framer::new(config.max_packet_size),
            config,
            manager,
            hooks,
            state: State::AwaitingConnect,
            session: None,
            outbox: BytesMut::new(),
            tx,
        };
        (conn, rx)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Client identifier, once CONNECT has been accepted.
    pub fn client_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.handle.client_id.as_ref())
    }

    /// Negotiated keep-alive; `None` before CONNECT or when disabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        self.session
            .as_ref()
            .filter(|s| s.keep_alive > 0)
            .map(|s| Duration::from_secs(s.keep_alive as u64))
    }

    /// Take the bytes queued for the transport.
    pub fn take_outbox(&mut self) -> Bytes {
        self.outbox.split().freeze()
    }

    /// Feed inbound bytes.
    ///
    /// Packets are processed in order. The first protocol error sends the
    /// most specific reply (CONNACK before the handshake, DISCONNECT after),
    /// closes the connection and discards the rest of the chunk.
    pub async fn handle_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.framer.extend(chunk);

        loop {
            let frame = match self.framer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.fail(e).await),
            };

            if self.state == State::AwaitingConnect && frame[0] >> 4 != PacketType::Connect as u8 {
                debug!("first packet is not CONNECT, closing");
                self.shutdown(false, None).await;
                return Err(ProtocolError::protocol("first packet must be CONNECT").into());
            }

            let packet = match Packet::decode(&frame) {
                Ok(packet) => packet,
                Err(e) => return Err(self.fail(e).await),
            };

            if let Err(e) = self.handle_packet(packet).await {
                let e = match e {
                    Error::Protocol(e) => e,
                    other => ProtocolError::new(ReasonCode::UNSPECIFIED_ERROR, other.to_string()),
                };
                return Err(self.fail(e).await);
            }

            if self.is_closed() {
                return Ok(());
            }
        }
    }

    /// Handle a message routed to this session.
    pub async fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Publish(packet) => self.send_publish(packet),
            Delivery::Close(code) => self.disconnect(code).await,
        }
    }

    /// Send DISCONNECT with `code` and close. The will message is published.
    pub async fn disconnect(&mut self, code: ReasonCode) {
        if self.is_closed() {
            return;
        }
        if self.state != State::AwaitingConnect {
            self.send(Packet::Disconnect(Disconnect::new(code)));
        }
        self.shutdown(true, None).await;
    }

    /// Close after the transport went away. Idempotent.
    pub async fn close(&mut self) {
        self.shutdown(true, None).await;
    }

    async fn fail(&mut self, err: ProtocolError) -> Error {
        warn!("{}: {}", self.client_id().unwrap_or("-"), err);

        let reason_string = self.reason_strings_allowed().then(|| err.reason.clone());
        match self.state {
            State::AwaitingConnect => {
                let mut connack = ConnAck::new(err.code);
                connack.properties.reason_string = reason_string;
                self.send(Packet::ConnAck(connack));
            }
            State::Authenticating | State::Connected => {
                let mut disconnect = Disconnect::new(err.code);
                disconnect.properties.reason_string = reason_string;
                self.send(Packet::Disconnect(disconnect));
            }
            State::Closed => {}
        }
        self.shutdown(true, None).await;
        err.into()
    }

    fn reason_strings_allowed(&self) -> bool {
        self.config.forward_reason_strings && self.session.as_ref().is_none_or(|s| s.request_problem_info)
    }

    /// Tear the session down exactly once.
    async fn shutdown(&mut self, publish_will: bool, packet: Option<&Disconnect>) {
        if self.is_closed() {
            return;
        }
        self.state = State::Closed;
        self.framer.clear();

        let Some(mut session) = self.session.take() else {
            return;
        };
        let handle = session.handle.clone();

        if let Some(will) = session.will.take()
            && publish_will
        {
            spawn_will(Arc::clone(&self.manager), handle.client_id.clone(), will);
        }

        if let Err(e) = self.manager.clear_connect(&handle).await {
            warn!("{}: failed to clear session: {}", handle.client_id, e);
        }

        let ctx = HookContext {
            handle: &handle,
            manager: self.manager.as_ref(),
        };
        self.hooks.on_disconnect(&ctx, packet).await;
        info!("{}: disconnected", handle.client_id);
    }

    fn send(&mut self, packet: Packet) {
        trace!("{}: send {:?}", self.client_id().unwrap_or("-"), packet.packet_type());
        if let Err(e) = packet.encode(&mut self.outbox) {
            warn!("failed to encode {:?}: {}", packet.packet_type(), e);
        }
    }

    fn send_publish(&mut self, packet: Publish) {
        let Some(session) = &self.session else {
            return;
        };
        let client_id = session.handle.client_id.clone();
        let session_id = session.handle.session_id;
        let packet_id = packet.packet_id;

        let mut buf = BytesMut::new();
        let encoded = Packet::Publish(packet).encode(&mut buf);
        let too_large = session.max_packet_size.is_some_and(|max| buf.len() > max as usize);

        if let Err(e) = encoded {
            warn!("{}: failed to encode publish: {}", client_id, e);
        } else if too_large || self.is_closed() {
            if too_large {
                warn!("{}: dropping publish of {} bytes, over client maximum", client_id, buf.len());
            }
        } else {
            self.outbox.extend_from_slice(&buf);
            return;
        }

        if packet_id != 0 {
            self.manager.registry().release(session_id, packet_id);
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        trace!("{}: recv {:?}", self.client_id().unwrap_or("-"), packet.packet_type());

        match (self.state, packet) {
            (State::AwaitingConnect, Packet::Connect(connect)) => return self.on_connect(connect).await,
            (State::AwaitingConnect, _) => {
                return Err(ProtocolError::protocol("first packet must be CONNECT").into());
            }
            (State::Closed, _) => return Err(Error::ConnectionClosed),
            (_, Packet::Connect(_)) => return Err(ProtocolError::protocol("duplicate CONNECT").into()),
            (State::Authenticating, Packet::Auth(auth)) => self.on_auth(auth).await?,
            (State::Authenticating, other) => {
                return Err(ProtocolError::new(
                    ReasonCode::NOT_AUTHORIZED,
                    format!("{:?} while authentication is pending", other.packet_type()),
                )
                .into());
            }
            (State::Connected, packet) => self.dispatch(packet).await?,
        }

        self.refresh_liveness(false).await
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(p) => self.on_publish(p).await,
            Packet::PubAck(p) => self.on_puback(p).await,
            Packet::PubRec(p) => self.on_pubrec(p).await,
            Packet::PubRel(p) => self.on_pubrel(p).await,
            Packet::PubComp(p) => self.on_pubcomp(p).await,
            Packet::Subscribe(p) => self.on_subscribe(p).await,
            Packet::Unsubscribe(p) => self.on_unsubscribe(p).await,
            Packet::PingReq => self.on_ping().await,
            Packet::Disconnect(p) => {
                self.on_disconnect(p).await;
                Ok(())
            }
            Packet::Auth(p) => self.on_auth(p).await,
            other => Err(ProtocolError::protocol(format!("unexpected {:?} from client", other.packet_type())).into()),
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(Error::ConnectionClosed)
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Refresh backend liveness, at most once per half keep-alive unless forced.
    async fn refresh_liveness(&mut self, force: bool) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let half = Duration::from_secs(session.keep_alive as u64) / 2;
        if !force && (session.keep_alive == 0 || session.last_refresh.elapsed() < half) {
            return Ok(());
        }
        session.last_refresh = Instant::now();
        let client_id = session.handle.client_id.clone();
        self.manager.ping(&client_id).await
    }

    async fn on_connect(&mut self, connect: Connect) -> Result<()> {
        let mut client_id = connect.client_id.clone();
        let mut assigned = None;
        if client_id.is_empty() {
            if !self.config.assign_client_id {
                return Err(ProtocolError::new(ReasonCode::CLIENT_IDENTIFIER_NOT_VALID, "empty client identifier").into());
            }
            client_id = uuid::Uuid::new_v4().to_string();
            assigned = Some(client_id.clone());
        }
        if let Some(will) = &connect.will
            && !topic::is_valid_topic_name(&will.topic)
        {
            return Err(ProtocolError::new(ReasonCode::TOPIC_NAME_INVALID, "invalid will topic").into());
        }

        let keep_alive = self.config.server_keep_alive.unwrap_or(connect.keep_alive);
        let handle = SessionHandle::new(
            self.manager.registry().next_session_id(),
            client_id.as_str().into(),
            self.tx.clone(),
        );

        let ctx = HookContext {
            handle: &handle,
            manager: self.manager.as_ref(),
        };
        if !self.hooks.on_connect(&ctx, &connect).await {
            return Err(ProtocolError::new(ReasonCode::NOT_AUTHORIZED, "connection refused").into());
        }

        let mut registered = connect.clone();
        registered.client_id = client_id.clone();
        registered.keep_alive = keep_alive;
        let taken_over = self.manager.connect(&registered, &handle).await?;
        if let Some(old) = &taken_over {
            debug!("{}: session taken over", client_id);
            old.send(Delivery::Close(ReasonCode::SESSION_TAKEN_OVER));
        }

        let props = &connect.properties;
        let authenticating = props.authentication_method.is_some();
        self.session = Some(Session {
            handle,
            keep_alive,
            aliases: HashMap::new(),
            awaiting_rel: HashSet::new(),
            max_packet_size: props.maximum_packet_size,
            request_problem_info: props.request_problem_information.unwrap_or(true),
            will: None,
            last_refresh: Instant::now(),
        });
        if connect.clean_start {
            self.manager.clear_subscriptions(&client_id).await?;
        }
        self.session_mut()?.will = connect.will;
        self.state = if authenticating {
            State::Authenticating
        } else {
            State::Connected
        };

        let mut connack = ConnAck::new(ReasonCode::SUCCESS);
        connack.session_present = !connect.clean_start && taken_over.is_some();
        connack.properties = self.connack_properties(assigned);
        connack.properties.authentication_method = props.authentication_method.clone();
        self.send(Packet::ConnAck(connack));

        info!("{}: connected, keep_alive={}s", client_id, keep_alive);
        Ok(())
    }

    fn connack_properties(&self, assigned_client_identifier: Option<String>) -> Properties {
        let config = &self.config;
        Properties {
            receive_maximum: Some(config.receive_maximum),
            maximum_qos: (config.maximum_qos < QoS::ExactlyOnce).then_some(config.maximum_qos as u8),
            retain_available: Some(config.retain_available),
            maximum_packet_size: u32::try_from(config.max_packet_size).ok(),
            topic_alias_maximum: (config.topic_alias_maximum > 0).then_some(config.topic_alias_maximum),
            wildcard_subscription_available: Some(config.wildcard_subscription_available),
            subscription_identifiers_available: Some(true),
            shared_subscription_available: Some(false),
            assigned_client_identifier,
            server_keep_alive: config.server_keep_alive,
            ..Properties::default()
        }
    }

    async fn on_auth(&mut self, auth: Auth) -> Result<()> {
        let handle = self.session()?.handle.clone();
        let ctx = HookContext {
            handle: &handle,
            manager: self.manager.as_ref(),
        };
        if !self.hooks.on_auth(&ctx, &auth).await {
            return Ok(());
        }

        self.state = State::Connected;
        let mut reply = Auth::new(ReasonCode::SUCCESS);
        reply.properties.authentication_method = auth.properties.authentication_method;
        self.send(Packet::Auth(reply));
        Ok(())
    }

    /// Resolve the topic alias and validate the topic name.
    fn resolve_topic(&mut self, packet: &mut Publish) -> Result<()> {
        let alias_max = self.config.topic_alias_maximum;
        let session = self.session_mut()?;

        if let Some(alias) = packet.properties.topic_alias.take() {
            if alias == 0 || alias > alias_max {
                return Err(ProtocolError::new(ReasonCode::TOPIC_ALIAS_INVALID, format!("topic alias {}", alias)).into());
            }
            if packet.topic.is_empty() {
                packet.topic = session
                    .aliases
                    .get(&alias)
                    .cloned()
                    .ok_or_else(|| ProtocolError::protocol(format!("unknown topic alias {}", alias)))?;
            } else {
                session.aliases.insert(alias, packet.topic.clone());
            }
        }

        if !topic::is_valid_topic_name(&packet.topic) {
            return Err(ProtocolError::new(ReasonCode::TOPIC_NAME_INVALID, format!("topic {:?}", packet.topic)).into());
        }
        Ok(())
    }

    async fn on_publish(&mut self, mut packet: Publish) -> Result<()> {
        if packet.qos > self.config.maximum_qos {
            return Err(ProtocolError::new(ReasonCode::QOS_NOT_SUPPORTED, format!("{:?}", packet.qos)).into());
        }
        if packet.retain && !self.config.retain_available {
            return Err(ProtocolError::new(ReasonCode::RETAIN_NOT_SUPPORTED, "retain is disabled").into());
        }
        self.resolve_topic(&mut packet)?;

        let receive_maximum = self.config.receive_maximum as usize;
        let (handle, duplicate, in_flight) = {
            let session = self.session()?;
            (
                session.handle.clone(),
                packet.qos == QoS::ExactlyOnce && session.awaiting_rel.contains(&packet.packet_id),
                session.awaiting_rel.len(),
            )
        };
        if duplicate {
            // Re-sent before PUBREL: acknowledge again without routing.
            self.send(Packet::PubRec(PubAck::new(packet.packet_id)));
            return Ok(());
        }
        if packet.qos > QoS::AtMostOnce && in_flight >= receive_maximum {
            return Err(ProtocolError::new(
                ReasonCode::RECEIVE_MAXIMUM_EXCEEDED,
                format!("more than {} unacknowledged publishes", receive_maximum),
            )
            .into());
        }

        let ctx = HookContext {
            handle: &handle,
            manager: self.manager.as_ref(),
        };
        let allowed = self.hooks.on_publish(&ctx, &packet).await;

        let code = if allowed {
            route(self.manager.as_ref(), &handle.client_id, &packet).await?;
            ReasonCode::SUCCESS
        } else {
            debug!("{}: publish to {} rejected by hook", handle.client_id, packet.topic);
            ReasonCode::NOT_AUTHORIZED
        };

        match packet.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => self.send(Packet::PubAck(PubAck::with_reason(packet.packet_id, code))),
            QoS::ExactlyOnce => {
                if !code.is_error() {
                    self.session_mut()?.awaiting_rel.insert(packet.packet_id);
                }
                self.send(Packet::PubRec(PubAck::with_reason(packet.packet_id, code)));
            }
        }
        Ok(())
    }

    /// Check that an acknowledgement refers to an identifier this session issued.
    fn outstanding(&self, packet: &PubAck, kind: &str) -> Result<SessionId> {
        let session_id = self.session()?.handle.session_id;
        if !self.manager.registry().contains(session_id, packet.packet_id) {
            return Err(ProtocolError::protocol(format!("{} for unknown packet id {}", kind, packet.packet_id)).into());
        }
        Ok(session_id)
    }

    async fn ack_hook(&self, packet: &PubAck, kind: PacketType) -> Result<bool> {
        let handle = &self.session()?.handle;
        let ctx = HookContext {
            handle,
            manager: self.manager.as_ref(),
        };
        Ok(match kind {
            PacketType::PubAck => self.hooks.on_puback(&ctx, packet).await,
            PacketType::PubRec => self.hooks.on_pubrec(&ctx, packet).await,
            PacketType::PubRel => self.hooks.on_pubrel(&ctx, packet).await,
            _ => self.hooks.on_pubcomp(&ctx, packet).await,
        })
    }

    async fn on_puback(&mut self, packet: PubAck) -> Result<()> {
        let session_id = self.outstanding(&packet, "PUBACK")?;
        self.manager.registry().release(session_id, packet.packet_id);
        self.ack_hook(&packet, PacketType::PubAck).await?;
        Ok(())
    }

    async fn on_pubrec(&mut self, packet: PubAck) -> Result<()> {
        let session_id = self.outstanding(&packet, "PUBREC")?;
        // A refused or failed PUBREC ends the flow here.
        if !self.ack_hook(&packet, PacketType::PubRec).await? || packet.reason_code.is_error() {
            self.manager.registry().release(session_id, packet.packet_id);
            return Ok(());
        }
        self.send(Packet::PubRel(PubAck::new(packet.packet_id)));
        Ok(())
    }

    async fn on_pubrel(&mut self, packet: PubAck) -> Result<()> {
        if !self.ack_hook(&packet, PacketType::PubRel).await? {
            return Ok(());
        }
        let code = if self.session_mut()?.awaiting_rel.remove(&packet.packet_id) {
            ReasonCode::SUCCESS
        } else {
            ReasonCode::PACKET_IDENTIFIER_NOT_FOUND
        };
        self.send(Packet::PubComp(PubAck::with_reason(packet.packet_id, code)));
        Ok(())
    }

    async fn on_pubcomp(&mut self, packet: PubAck) -> Result<()> {
        let session_id = self.outstanding(&packet, "PUBCOMP")?;
        self.manager.registry().release(session_id, packet.packet_id);
        self.ack_hook(&packet, PacketType::PubComp).await?;
        Ok(())
    }

    async fn on_subscribe(&mut self, packet: Subscribe) -> Result<()> {
        let handle = self.session()?.handle.clone();
        let ctx = HookContext {
            handle: &handle,
            manager: self.manager.as_ref(),
        };
        if !self.hooks.on_subscribe(&ctx, &packet).await {
            let reason_codes = vec![ReasonCode::NOT_AUTHORIZED; packet.filters.len()];
            self.send(Packet::SubAck(SubAck {
                packet_id: packet.packet_id,
                properties: Properties::default(),
                reason_codes,
            }));
            return Ok(());
        }

        let identifier = packet.properties.subscription_identifiers.first().copied();
        let mut reason_codes = Vec::with_capacity(packet.filters.len());
        for (filter, options) in &packet.filters {
            let code = if topic::is_shared(filter) {
                ReasonCode::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED
            } else if !topic::is_valid_filter(filter) {
                ReasonCode::TOPIC_FILTER_INVALID
            } else if topic::is_wildcard(filter) && !self.config.wildcard_subscription_available {
                ReasonCode::WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED
            } else {
                let mut options = *options;
                options.qos = options.qos.min(self.config.maximum_qos);
                let existed = self
                    .manager
                    .subscribe(&handle.client_id, filter, Subscription::new(options, identifier))
                    .await?;
                debug!("{}: subscribed to {} ({:?})", handle.client_id, filter, options.qos);
                if self.config.retained_replay {
                    self.replay_retained(filter, options, identifier, existed).await?;
                }
                ReasonCode::granted(options.qos)
            };
            reason_codes.push(code);
        }

        self.send(Packet::SubAck(SubAck {
            packet_id: packet.packet_id,
            properties: Properties::default(),
            reason_codes,
        }));
        Ok(())
    }

    /// Send retained messages matching a filter that was just stored.
    ///
    /// Runs after the subscription is registered, so `existed` reflects the
    /// state before this SUBSCRIBE, and before the SUBACK is queued. The
    /// retain flag is kept only when the subscription asks for
    /// retain-as-published, the same as live fan-out.
    async fn replay_retained(
        &mut self,
        filter: &str,
        options: SubscriptionOptions,
        identifier: Option<u32>,
        existed: bool,
    ) -> Result<()> {
        match options.retain_handling {
            RetainHandling::DoNotSend => return Ok(()),
            RetainHandling::SendOnSubscribeIfNew if existed => return Ok(()),
            _ => {}
        }

        let retained: Vec<Publish> = if topic::is_wildcard(filter) {
            let Some(matcher) = Matcher::compile(filter) else {
                return Ok(());
            };
            let mut found = Vec::new();
            self.manager
                .for_each_retain_message(&|t: &str| matcher.matches(t), &mut |p: Publish| found.push(p))
                .await?;
            found
        } else {
            self.manager.get_retain_message(filter).await?.into_iter().collect()
        };

        let handle = self.session()?.handle.clone();
        let client_id = handle.client_id.clone();
        for mut packet in retained {
            packet.qos = packet.qos.min(options.qos);
            packet.retain = options.retain_as_published;
            packet.dup = false;
            packet.packet_id = 0;
            packet.properties.topic_alias = None;
            packet.properties.subscription_identifiers = identifier.into_iter().collect();
            if packet.qos > QoS::AtMostOnce {
                let Some(id) = self.manager.registry().allocate(handle.session_id) else {
                    warn!("{}: no free packet identifier for retained {}", client_id, packet.topic);
                    continue;
                };
                packet.packet_id = id;
            }
            trace!("{}: replay retained {}", client_id, packet.topic);
            self.send_publish(packet);
        }
        Ok(())
    }

    async fn on_unsubscribe(&mut self, packet: Unsubscribe) -> Result<()> {
        let handle = self.session()?.handle.clone();
        let ctx = HookContext {
            handle: &handle,
            manager: self.manager.as_ref(),
        };
        let allowed = self.hooks.on_unsubscribe(&ctx, &packet).await;

        let mut reason_codes = Vec::with_capacity(packet.filters.len());
        for filter in &packet.filters {
            let code = if !allowed {
                ReasonCode::NOT_AUTHORIZED
            } else if !topic::is_valid_filter(filter) {
                ReasonCode::TOPIC_FILTER_INVALID
            } else if self.manager.unsubscribe(&handle.client_id, filter).await? {
                debug!("{}: unsubscribed from {}", handle.client_id, filter);
                ReasonCode::SUCCESS
            } else {
                ReasonCode::NO_SUBSCRIPTION_EXISTED
            };
            reason_codes.push(code);
        }

        self.send(Packet::UnsubAck(UnsubAck {
            packet_id: packet.packet_id,
            properties: Properties::default(),
            reason_codes,
        }));
        Ok(())
    }

    async fn on_ping(&mut self) -> Result<()> {
        let handle = self.session()?.handle.clone();
        let ctx = HookContext {
            handle: &handle,
            manager: self.manager.as_ref(),
        };
        if !self.hooks.on_ping(&ctx).await {
            return Ok(());
        }
        self.refresh_liveness(true).await?;
        self.send(Packet::PingResp);
        Ok(())
    }

    async fn on_disconnect(&mut self, packet: Disconnect) {
        // Normal disconnection discards the will; every other reason keeps it.
        let publish_will = packet.reason_code != ReasonCode::NORMAL_DISCONNECTION;
        debug!(
            "{}: DISCONNECT {}",
            self.client_id().unwrap_or("-"),
            packet.reason_code
        );
        self.shutdown(publish_will, Some(&packet)).await;
    }
}

/// Store or clear the retained message carried by `packet`, then fan it out.
pub(crate) async fn route(manager: &dyn Manager, from: &str, packet: &Publish) -> Result<()> {
    if packet.retain {
        if packet.payload.is_empty() {
            manager.delete_retain_message(&packet.topic).await?;
        } else {
            let ttl = packet
                .properties
                .message_expiry_interval
                .map(|secs| Duration::from_secs(secs as u64));
            manager.add_retain_message(&packet.topic, packet, ttl).await?;
        }
    }
    manager.publish(from, &packet.topic, packet).await
}

fn will_packet(will: Will) -> Publish {
    let props = will.properties;
    let mut packet = Publish::new(will.topic, will.payload, will.qos);
    packet.retain = will.retain;
    packet.properties = Properties {
        payload_format_indicator: props.payload_format_indicator,
        message_expiry_interval: props.message_expiry_interval,
        content_type: props.content_type,
        response_topic: props.response_topic,
        correlation_data: props.correlation_data,
        user_properties: props.user_properties,
        ..Properties::default()
    };
    packet
}

/// Publish a will message in the background, after its delay interval.
fn spawn_will(manager: Arc<dyn Manager>, client_id: Arc<str>, will: Will) {
    let delay = will.properties.will_delay_interval.unwrap_or(0);
    let packet = will_packet(will);
    tokio::spawn(async move {
        if delay > 0 {
            tokio::time::sleep(Duration::from_secs(delay as u64)).await;
            if manager.registry().lookup(&client_id).is_some() {
                debug!("{}: reconnected within will delay, will discarded", client_id);
                return;
            }
        }
        debug!("{}: publishing will to {}", client_id, packet.topic);
        if let Err(e) = route(manager.as_ref(), &client_id, &packet).await {
            warn!("{}: failed to publish will: {}", client_id, e);
        }
    });
}

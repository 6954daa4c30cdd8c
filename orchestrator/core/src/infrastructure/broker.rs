// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Message Broker
//!
//! Owns one transport connection, the topic→callback dispatch table and
//! envelope marshaling.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Connection lifecycle, publish/subscribe, inbound dispatch
//! - **States:** `Disconnected → Connecting → Connected → Disconnected`
//!
//! # Dispatch
//!
//! Callbacks are keyed by the routable part of a topic: `event/` followed by
//! everything after the sender segment (`connect/` topics are keyed whole).
//! A subscription to `event/+/a/-/ag1` therefore receives a message published
//! on `event/h1/a/-/ag1`, and the delivered [`BrokerMessage`] still carries the
//! wire topic so `sender_id()` reports `h1`.
//!
//! Every callback runs on its own task; the read loop never awaits one.
//!
//! Several callbacks may share one filter (agents on a host listening on the
//! same `connect/{name}` channel). [`Broker::subscribe`] returns a
//! [`Subscription`] handle; unsubscribing removes only that callback and
//! releases the transport filter once no callback still uses it.
//!
//! # Clock
//!
//! `connect` attempts one clock sync and then keeps the clock disciplined in
//! the background: a failed first sync is retried with backoff, and a synced
//! clock is refreshed every resync interval until `disconnect`.

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::{ControlEvent, EventError};
use crate::domain::message::{BrokerMessage, BrokerMessageType, MessageError};
use crate::domain::node_config::NodeConfigSpec;
use crate::domain::topic::{TopicAddress, EVENT_PREFIX};
use crate::infrastructure::clock::{Clock, ClockError};
use crate::infrastructure::transport::{Transport, TransportError, TransportMessage, MESSAGE_TYPE_PROPERTY};

pub type MessageCallback = Arc<dyn Fn(BrokerMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageCallback`].
pub fn callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One registered callback on one topic filter.
#[derive(Clone)]
pub struct Subscription {
    filter: String,
    callback: MessageCallback,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    fn is(&self, other: &Subscription) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("filter", &self.filter).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker is not connected")]
    NotConnected,

    #[error("Invalid topic: '{0}'")]
    InvalidTopic(String),

    #[error("No connection acknowledgment within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] MessageError),

    #[error("Event encoding error: {0}")]
    Event(#[from] EventError),

    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),
}

/// Dispatch key for a wire topic or subscription filter.
pub fn routing_key(topic: &str) -> String {
    match topic.strip_prefix(EVENT_PREFIX).and_then(|body| body.split_once('/')) {
        Some((_, routable)) => format!("{EVENT_PREFIX}{routable}"),
        None => topic.to_string(),
    }
}

type CallbackTable = Arc<RwLock<HashMap<String, Vec<Subscription>>>>;

pub struct Broker {
    transport: Arc<dyn Transport>,
    clock: Arc<Clock>,
    client_id: String,
    connect_timeout: Duration,
    resync_interval: Duration,
    state: Arc<RwLock<BrokerState>>,
    callbacks: CallbackTable,
    reader: Mutex<Option<JoinHandle<()>>>,
    clock_sync: Mutex<Option<CancellationToken>>,
}

impl Broker {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<Clock>,
        client_id: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            clock,
            client_id: client_id.into(),
            connect_timeout,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            state: Arc::new(RwLock::new(BrokerState::Disconnected)),
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            reader: Mutex::new(None),
            clock_sync: Mutex::new(None),
        }
    }

    /// Broker tuned by `spec.broker` and `spec.clock`.
    pub fn from_config(
        transport: Arc<dyn Transport>,
        clock: Arc<Clock>,
        client_id: impl Into<String>,
        spec: &NodeConfigSpec,
    ) -> Self {
        Self::new(transport, clock, client_id, spec.broker.connect_timeout())
            .with_resync_interval(spec.clock.resync_interval())
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn resync_interval(&self) -> Duration {
        self.resync_interval
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn state(&self) -> BrokerState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BrokerState::Connected
    }

    /// Clock timestamp for outgoing events.
    pub fn timestamp(&self) -> Result<String, BrokerError> {
        Ok(self.clock.timestamp()?)
    }

    /// Open the transport. Clock sync is attempted first but a failure does
    /// not block the connection; it is retried in the background.
    pub async fn connect(&self, token: &str, endpoint: &str) -> Result<(), BrokerError> {
        if self.is_connected() {
            debug!(client_id = %self.client_id, "Broker already connected");
            return Ok(());
        }
        *self.state.write() = BrokerState::Connecting;

        if let Err(e) = self.clock.try_sync_once().await {
            warn!(error = %e, "Clock sync failed; retrying in the background");
        }
        self.start_clock_sync();

        let inbox = match tokio::time::timeout(
            self.connect_timeout,
            self.transport.connect(endpoint, &self.client_id, token),
        )
        .await
        {
            Ok(Ok(inbox)) => inbox,
            Ok(Err(e)) => {
                *self.state.write() = BrokerState::Disconnected;
                return Err(e.into());
            }
            Err(_) => {
                *self.state.write() = BrokerState::Disconnected;
                return Err(BrokerError::ConnectionTimeout(self.connect_timeout));
            }
        };

        let reader = tokio::spawn(read_loop(
            inbox,
            Arc::clone(&self.callbacks),
            Arc::clone(&self.state),
            self.client_id.clone(),
        ));
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }
        *self.state.write() = BrokerState::Connected;
        info!(client_id = %self.client_id, endpoint = %endpoint, "Broker connected");
        Ok(())
    }

    fn start_clock_sync(&self) {
        let mut clock_sync = self.clock_sync.lock();
        if clock_sync.is_none() {
            let cancel = CancellationToken::new();
            self.clock.spawn_resync(self.resync_interval, cancel.clone());
            *clock_sync = Some(cancel);
        }
    }

    fn stop_clock_sync(&self) {
        if let Some(cancel) = self.clock_sync.lock().take() {
            cancel.cancel();
        }
    }

    pub async fn subscribe(&self, topic: &str, callback: MessageCallback) -> Result<Subscription, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if topic.trim().is_empty() {
            return Err(BrokerError::InvalidTopic(topic.to_string()));
        }

        let subscription = Subscription {
            filter: topic.to_string(),
            callback,
        };
        self.callbacks
            .write()
            .entry(routing_key(topic))
            .or_default()
            .push(subscription.clone());

        if let Err(e) = self.transport.subscribe(topic).await {
            self.remove_callback(&subscription);
            return Err(e.into());
        }
        debug!(topic = %topic, "Subscribed");
        Ok(subscription)
    }

    /// Remove one callback. The transport filter is released only when no
    /// other callback still uses it.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if self.remove_callback(subscription) {
            debug!(topic = %subscription.filter, "Callback removed; filter still in use");
            return Ok(());
        }
        self.transport.unsubscribe(&subscription.filter).await?;
        debug!(topic = %subscription.filter, "Unsubscribed");
        Ok(())
    }

    /// Returns whether the subscription's filter is still used by another callback.
    fn remove_callback(&self, subscription: &Subscription) -> bool {
        let key = routing_key(&subscription.filter);
        let mut callbacks = self.callbacks.write();
        if let Some(list) = callbacks.get_mut(&key) {
            list.retain(|existing| !existing.is(subscription));
            if list.is_empty() {
                callbacks.remove(&key);
            }
        }
        callbacks
            .values()
            .flatten()
            .any(|existing| existing.filter == subscription.filter)
    }

    /// At-most-once publish.
    pub async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if message.topic.trim().is_empty() {
            return Err(BrokerError::InvalidTopic(message.topic.clone()));
        }

        let outbound = TransportMessage::new(message.topic.clone(), message.encode_payload()?)
            .with_property(MESSAGE_TYPE_PROPERTY, message.message_type.as_str());
        self.transport.publish(outbound).await?;
        metrics::counter!("agora_broker_messages_total", "direction" => "outbound").increment(1);
        debug!(topic = %message.topic, message_type = %message.message_type, "Published");
        Ok(())
    }

    pub async fn publish_event(&self, topic: &TopicAddress, event: &ControlEvent) -> Result<(), BrokerError> {
        self.publish(&BrokerMessage::control(topic, event)?).await
    }

    /// Drop every callback, stop clock maintenance and close the transport.
    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        *self.state.write() = BrokerState::Disconnected;
        self.stop_clock_sync();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.callbacks.write().clear();
        self.transport.disconnect().await?;
        info!(client_id = %self.client_id, "Broker disconnected");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        if let Some(cancel) = self.clock_sync.get_mut().take() {
            cancel.cancel();
        }
    }
}

async fn read_loop(
    mut inbox: mpsc::Receiver<TransportMessage>,
    callbacks: CallbackTable,
    state: Arc<RwLock<BrokerState>>,
    client_id: String,
) {
    while let Some(inbound) = inbox.recv().await {
        metrics::counter!("agora_broker_messages_total", "direction" => "inbound").increment(1);
        dispatch(&callbacks, inbound);
    }
    warn!(client_id = %client_id, "Transport closed the connection");
    *state.write() = BrokerState::Disconnected;
}

fn dispatch(callbacks: &CallbackTable, inbound: TransportMessage) {
    let message_type = BrokerMessageType::from_property(inbound.property(MESSAGE_TYPE_PROPERTY));
    let key = routing_key(&inbound.topic);
    let message = match BrokerMessage::decode(inbound.topic, message_type, inbound.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Dropping undecodable message");
            return;
        }
    };

    let handlers = callbacks.read().get(&key).cloned().unwrap_or_default();
    if handlers.is_empty() {
        debug!(topic = %message.topic, "No callback for message");
    }
    for handler in handlers {
        tokio::spawn((handler.callback)(message.clone()));
    }
}

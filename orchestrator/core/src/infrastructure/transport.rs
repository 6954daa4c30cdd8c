// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pub/Sub Transport
//!
//! The capability the [`Broker`](super::broker::Broker) drives: connect with a
//! bearer token, subscribe/unsubscribe to topic filters, publish at-most-once,
//! disconnect. Inbound traffic arrives on the receiver returned by `connect`.
//!
//! [`InMemoryBus`] is a process-local implementation with MQTT filter
//! semantics (`+` single level, `#` tail). When built with an
//! [`AccessPolicy`] it authorizes like a broker running the ACL hook:
//!
//! - unknown tokens are rejected at connect
//! - denied publishes are dropped without an error
//! - denied subscriptions are never recorded
//! - each delivery is checked against the recipient's READ access
//!
//! [`InMemoryBus::trace`] observes every publish that passed authorization.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Transport seam and in-memory broker for tests and embedding

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::domain::acl::{AccessPolicy, AccessType, Claims};

/// Transport property carrying the envelope type.
pub const MESSAGE_TYPE_PROPERTY: &str = "message.type";

const DEFAULT_INBOX_CAPACITY: usize = 1024;
const TRACE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Transport I/O error: {0}")]
    Io(String),

    #[error("Transport is not connected")]
    NotConnected,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        client_id: &str,
        token: &str,
    ) -> Result<mpsc::Receiver<TransportMessage>, TransportError>;

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// MQTT topic filter match.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

struct Session {
    claims: Option<Claims>,
    filters: HashSet<String>,
    inbox: mpsc::Sender<TransportMessage>,
}

struct BusInner {
    sessions: RwLock<HashMap<String, Session>>,
    tokens: RwLock<HashMap<String, Claims>>,
    policy: Option<Arc<dyn AccessPolicy>>,
    inbox_capacity: usize,
    trace: broadcast::Sender<TransportMessage>,
}

/// Process-local broker shared by any number of [`InMemoryTransport`]s.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    /// Bus without authorization; any token is accepted.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Bus that authenticates tokens against registered claims and
    /// authorizes every action through `policy`.
    pub fn with_policy(policy: Arc<dyn AccessPolicy>) -> Self {
        Self::build(Some(policy))
    }

    fn build(policy: Option<Arc<dyn AccessPolicy>>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sessions: RwLock::new(HashMap::new()),
                tokens: RwLock::new(HashMap::new()),
                policy,
                inbox_capacity: DEFAULT_INBOX_CAPACITY,
                trace: broadcast::channel(TRACE_CAPACITY).0,
            }),
        }
    }

    pub fn register_token(&self, token: impl Into<String>, claims: Claims) {
        self.inner.tokens.write().insert(token.into(), claims);
    }

    pub fn transport(&self) -> InMemoryTransport {
        InMemoryTransport {
            bus: self.clone(),
            client_id: Mutex::new(None),
        }
    }

    /// Authorized publishes from now on, in bus order.
    pub fn trace(&self) -> broadcast::Receiver<TransportMessage> {
        self.inner.trace.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        let sessions = self.inner.sessions.read();
        let mut filters: Vec<String> = sessions
            .get(client_id)
            .map(|s| s.filters.iter().cloned().collect())
            .unwrap_or_default();
        filters.sort();
        filters
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.sessions.read().contains_key(client_id)
    }

    async fn permits(&self, claims: Option<&Claims>, topic: &str, access: AccessType) -> bool {
        match (&self.inner.policy, claims) {
            (None, _) => true,
            (Some(policy), Some(claims)) => policy.permits(topic, access.code(), claims).await,
            (Some(_), None) => false,
        }
    }

    fn open(&self, client_id: &str, token: &str) -> Result<mpsc::Receiver<TransportMessage>, TransportError> {
        let claims = match &self.inner.policy {
            Some(_) => Some(
                self.inner
                    .tokens
                    .read()
                    .get(token)
                    .cloned()
                    .ok_or_else(|| TransportError::Rejected("unknown token".to_string()))?,
            ),
            None => None,
        };

        let (inbox, receiver) = mpsc::channel(self.inner.inbox_capacity);
        let previous = self.inner.sessions.write().insert(
            client_id.to_string(),
            Session {
                claims,
                filters: HashSet::new(),
                inbox,
            },
        );
        if previous.is_some() {
            debug!(client_id = %client_id, "Session taken over by new connection");
        }
        Ok(receiver)
    }

    fn claims_of(&self, client_id: &str) -> Result<Option<Claims>, TransportError> {
        self.inner
            .sessions
            .read()
            .get(client_id)
            .map(|s| s.claims.clone())
            .ok_or(TransportError::NotConnected)
    }

    async fn subscribe(&self, client_id: &str, filter: &str) -> Result<(), TransportError> {
        let claims = self.claims_of(client_id)?;
        if !self.permits(claims.as_ref(), filter, AccessType::Subscribe).await {
            warn!(client_id = %client_id, "Subscription denied");
            return Ok(());
        }
        let mut sessions = self.inner.sessions.write();
        let session = sessions.get_mut(client_id).ok_or(TransportError::NotConnected)?;
        session.filters.insert(filter.to_string());
        Ok(())
    }

    fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<(), TransportError> {
        let mut sessions = self.inner.sessions.write();
        let session = sessions.get_mut(client_id).ok_or(TransportError::NotConnected)?;
        session.filters.remove(filter);
        Ok(())
    }

    async fn publish(&self, client_id: &str, message: TransportMessage) -> Result<(), TransportError> {
        let claims = self.claims_of(client_id)?;
        if !self.permits(claims.as_ref(), &message.topic, AccessType::Write).await {
            warn!(client_id = %client_id, "Publish denied");
            return Ok(());
        }
        let _ = self.inner.trace.send(message.clone());

        // Snapshot recipients so no lock is held across the READ checks.
        let recipients: Vec<(String, Option<Claims>, mpsc::Sender<TransportMessage>)> = self
            .inner
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.filters.iter().any(|f| filter_matches(f, &message.topic)))
            .map(|(id, s)| (id.clone(), s.claims.clone(), s.inbox.clone()))
            .collect();

        for (recipient, claims, inbox) in recipients {
            if !self.permits(claims.as_ref(), &message.topic, AccessType::Read).await {
                debug!(client_id = %recipient, "Delivery suppressed by READ check");
                continue;
            }
            if let Err(e) = inbox.try_send(message.clone()) {
                debug!(client_id = %recipient, error = %e, "Delivery dropped");
            }
        }
        Ok(())
    }

    fn close(&self, client_id: &str) {
        self.inner.sessions.write().remove(client_id);
    }
}

/// One client's handle on an [`InMemoryBus`].
pub struct InMemoryTransport {
    bus: InMemoryBus,
    client_id: Mutex<Option<String>>,
}

impl InMemoryTransport {
    fn current_client(&self) -> Result<String, TransportError> {
        self.client_id.lock().clone().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(
        &self,
        _endpoint: &str,
        client_id: &str,
        token: &str,
    ) -> Result<mpsc::Receiver<TransportMessage>, TransportError> {
        let receiver = self.bus.open(client_id, token)?;
        *self.client_id.lock() = Some(client_id.to_string());
        Ok(receiver)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let client_id = self.current_client()?;
        self.bus.subscribe(&client_id, filter).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let client_id = self.current_client()?;
        self.bus.unsubscribe(&client_id, filter)
    }

    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        let client_id = self.current_client()?;
        self.bus.publish(&client_id, message).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(client_id) = self.client_id.lock().take() {
            self.bus.close(&client_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::acl_evaluator::AclEvaluator;
    use crate::domain::repository::{RelationshipVerifier, RepositoryError};

    struct DenyRelationships;

    #[async_trait]
    impl RelationshipVerifier for DenyRelationships {
        async fn verify_host_source_target(
            &self,
            _host_id: &str,
            _source: Option<&str>,
            _target: Option<&str>,
        ) -> Result<bool, RepositoryError> {
            Ok(false)
        }
    }

    fn message(topic: &str) -> TransportMessage {
        TransportMessage::new(topic, b"{}".to_vec()).with_property(MESSAGE_TYPE_PROPERTY, "EVENT")
    }

    #[test]
    fn test_filter_matches() {
        assert!(filter_matches("event/+/a/h1/-", "event/x/a/h1/-"));
        assert!(!filter_matches("event/+/a/h1/-", "event/x/a/h2/-"));
        assert!(!filter_matches("event/+/a/h1/-", "event/x/a/h1/-/extra"));
        assert!(filter_matches("event/#", "event/x/a/h1/-"));
        assert!(filter_matches("connect/chat", "connect/chat"));
        assert!(!filter_matches("connect/chat", "connect/chatter"));
    }

    #[tokio::test]
    async fn test_open_bus_routes_by_filter() {
        let bus = InMemoryBus::new();
        let publisher = bus.transport();
        let subscriber = bus.transport();
        publisher.connect("mem", "p", "t").await.unwrap();
        let mut inbox = subscriber.connect("mem", "s", "t").await.unwrap();
        subscriber.subscribe("event/+/a/h1/-").await.unwrap();

        publisher.publish(message("event/-/a/h1/-")).await.unwrap();
        publisher.publish(message("event/-/a/h2/-")).await.unwrap();

        let received = inbox.recv().await.unwrap();
        assert_eq!(received.topic, "event/-/a/h1/-");
        assert_eq!(received.property(MESSAGE_TYPE_PROPERTY), Some("EVENT"));
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let bus = InMemoryBus::new();
        let transport = bus.transport();
        assert_eq!(
            transport.publish(message("event/-/a/-/-")).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.subscribe("event/#").await, Err(TransportError::NotConnected));

        transport.connect("mem", "c", "t").await.unwrap();
        assert!(bus.is_connected("c"));
        transport.disconnect().await.unwrap();
        assert!(!bus.is_connected("c"));
    }

    #[tokio::test]
    async fn test_policy_rejects_unknown_token() {
        let bus = InMemoryBus::with_policy(Arc::new(AclEvaluator::new(Arc::new(DenyRelationships))));
        let transport = bus.transport();
        assert!(matches!(
            transport.connect("mem", "h1", "bogus").await,
            Err(TransportError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_policy_filters_publish_and_subscribe() {
        let bus = InMemoryBus::with_policy(Arc::new(AclEvaluator::new(Arc::new(DenyRelationships))));
        bus.register_token("tok-a", Claims::authority("a"));
        bus.register_token("tok-h1", Claims::host("a", "h1"));
        bus.register_token("tok-h2", Claims::host("a", "h2"));

        let authority = bus.transport();
        let host1 = bus.transport();
        let host2 = bus.transport();
        let mut authority_inbox = authority.connect("mem", "a", "tok-a").await.unwrap();
        let mut host1_inbox = host1.connect("mem", "h1", "tok-h1").await.unwrap();
        host2.connect("mem", "h2", "tok-h2").await.unwrap();

        authority.subscribe("event/+/a/-/-").await.unwrap();
        host1.subscribe("event/+/a/h1/-").await.unwrap();
        // h2 may not subscribe to h1's topic.
        host2.subscribe("event/+/a/h1/-").await.unwrap();
        assert!(bus.subscriptions("h2").is_empty());

        let mut trace = bus.trace();

        // Spoofed sender is dropped.
        host2.publish(message("event/h1/a/-/-")).await.unwrap();
        assert!(authority_inbox.try_recv().is_err());
        assert!(trace.try_recv().is_err());

        host1.publish(message("event/h1/a/-/-")).await.unwrap();
        assert_eq!(authority_inbox.recv().await.unwrap().topic, "event/h1/a/-/-");
        assert_eq!(trace.try_recv().unwrap().topic, "event/h1/a/-/-");

        authority.publish(message("event/-/a/h1/-")).await.unwrap();
        assert_eq!(host1_inbox.recv().await.unwrap().topic, "event/-/a/h1/-");
    }
}

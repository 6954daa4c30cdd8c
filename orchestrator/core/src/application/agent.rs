// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent Runtime
//!
//! A connected agent inside a host process. Shares the host's broker
//! connection, owns an ephemeral credential keypair and listens on:
//!
//! - `event/+/{authority}/-/{agent_id}` for control traffic and agent messages
//! - `connect/{name}` for each topic named in its record
//!
//! `credential_response` events from the Authority (sender `-`) feed the
//! [`CredentialRelay`]; responses from any other sender are dropped. Every
//! other message is forwarded to [`Agent::subscribe_events`].
//!
//! # Architecture
//!
//! - **Layer:** Application
//! - **Purpose:** Agent connect/disconnect, announcements, credential access

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::application::credential_relay::{CredentialError, CredentialRelay};
use crate::application::error::ConnectionError;
use crate::domain::agent::AgentRecord;
use crate::domain::credential::PublicJwk;
use crate::domain::data::Data;
use crate::domain::events::ControlEvent;
use crate::domain::message::BrokerMessage;
use crate::domain::plugin::FunctionConnection;
use crate::domain::topic::{TopicGenerator, NONE_SEGMENT};
use crate::infrastructure::broker::{callback, Broker, Subscription};
use crate::infrastructure::crypto::CredentialKeypair;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Agent {
    record: AgentRecord,
    host_id: String,
    broker: Arc<Broker>,
    topics: TopicGenerator,
    relay: CredentialRelay,
    events: broadcast::Sender<BrokerMessage>,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.record.id)
            .field("host_id", &self.host_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Build an agent with a fresh keypair. Not yet subscribed.
    pub async fn create(
        record: AgentRecord,
        host_id: impl Into<String>,
        broker: Arc<Broker>,
        authority_id: &str,
        credential_timeout: Duration,
    ) -> Result<Arc<Self>, ConnectionError> {
        let topics = TopicGenerator::new(authority_id, record.id.clone())?;
        let keypair = Arc::new(CredentialKeypair::generate_async().await?);
        let relay = CredentialRelay::new(keypair, broker.clone(), topics.clone(), credential_timeout);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            record,
            host_id: host_id.into(),
            broker,
            topics,
            relay,
            events,
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn key_id(&self) -> String {
        self.relay.key_id()
    }

    pub fn public_jwk(&self) -> &PublicJwk {
        self.relay.public_jwk()
    }

    /// Messages for this agent other than credential responses.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerMessage> {
        self.events.subscribe()
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }

        let mut filters = vec![self.topics.subscribe_as_agent()?.render()];
        filters.extend(self.record.topics.iter().map(|t| self.topics.connect_to(&t.name)));

        for filter in &filters {
            let agent: Weak<Agent> = Arc::downgrade(self);
            let subscription = self
                .broker
                .subscribe(
                    filter,
                    callback(move |message| {
                        let agent = agent.clone();
                        async move {
                            if let Some(agent) = agent.upgrade() {
                                agent.handle_message(message);
                            }
                        }
                    }),
                )
                .await?;
            self.subscriptions.lock().push(subscription);
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(agent_id = %self.record.id, host_id = %self.host_id, "Agent connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        if self.broker.is_connected() {
            for subscription in &subscriptions {
                self.broker.unsubscribe(subscription).await?;
            }
        }
        info!(agent_id = %self.record.id, "Agent disconnected");
        Ok(())
    }

    /// Tell the Authority this agent joined outside of a host welcome.
    pub async fn announce_connect(&self) -> Result<(), ConnectionError> {
        let event = ControlEvent::AgentConnect {
            timestamp: self.broker.timestamp()?,
            agent: self.record.clone(),
        };
        self.broker
            .publish_event(&self.topics.publish_to_authority()?, &event)
            .await?;
        Ok(())
    }

    pub async fn announce_disconnect(&self) -> Result<(), ConnectionError> {
        let event = ControlEvent::AgentDisconnect {
            timestamp: self.broker.timestamp()?,
            agent_id: self.record.id.clone(),
        };
        self.broker
            .publish_event(&self.topics.publish_to_authority()?, &event)
            .await?;
        Ok(())
    }

    /// Send `data` to another agent under the same authority.
    pub async fn send_to_agent(&self, agent_id: &str, data: Data) -> Result<(), ConnectionError> {
        let message = BrokerMessage::event(&self.topics.publish_to_agent(agent_id)?, data);
        self.broker.publish(&message).await?;
        Ok(())
    }

    pub async fn get_credential(&self, name: &str) -> Result<String, CredentialError> {
        self.relay.get_credential(name).await
    }

    pub async fn get_credential_for(
        &self,
        capability: &FunctionConnection,
        name: &str,
    ) -> Result<String, CredentialError> {
        self.relay.get_credential_for(capability, name).await
    }

    fn handle_message(&self, message: BrokerMessage) {
        match message.control_event() {
            Some(Ok(Some(ControlEvent::CredentialResponse {
                credential_name,
                encrypted_credential,
                key_id,
            }))) => {
                if message.sender_id() != Some(NONE_SEGMENT) {
                    warn!(
                        agent_id = %self.record.id,
                        sender = message.sender_id().unwrap_or_default(),
                        "Credential response not sent by the authority"
                    );
                    return;
                }
                if let Err(e) =
                    self.relay
                        .receive_response(&credential_name, &encrypted_credential, key_id.as_deref())
                {
                    warn!(agent_id = %self.record.id, error = %e, "Credential response rejected");
                }
            }
            Some(Err(e)) => {
                warn!(agent_id = %self.record.id, topic = %message.topic, error = %e, "Malformed control event");
            }
            _ => {
                if self.events.send(message).is_err() {
                    debug!(agent_id = %self.record.id, "No listener for agent message");
                }
            }
        }
    }
}

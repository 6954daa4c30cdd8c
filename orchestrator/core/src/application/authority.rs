// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Authority Protocol Handlers
//!
//! The Authority listens on `event/+/{authority}/-/-` and answers:
//!
//! | Event | Admission | Reply |
//! |-------|-----------|-------|
//! | `host_connect` | `host.id` equals the sender | `host_welcome` to the host |
//! | `agent_connect` | `agent.id` equals the sender | `agent_connect` to the owning host |
//! | `agent_disconnect` | `agent_id` equals the sender | `agent_disconnect` to the owning host |
//! | `credential_request` | `agent_id` equals the sender | `credential_response` to the agent, or nothing |
//!
//! A request that fails admission or names unknown records is logged and
//! dropped. No reply is ever sent for a missing credential.
//!
//! # Architecture
//!
//! - **Layer:** Application
//! - **Purpose:** Host admission, agent propagation, credential sealing
//! - **Collaborators:** [`AuthorityRepository`], [`Broker`]

use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::application::error::ConnectionError;
use crate::domain::agent::AgentRecord;
use crate::domain::credential::PublicJwk;
use crate::domain::events::ControlEvent;
use crate::domain::host::HostDescriptor;
use crate::domain::message::BrokerMessage;
use crate::domain::repository::AuthorityRepository;
use crate::domain::topic::TopicGenerator;
use crate::infrastructure::broker::{callback, Broker};
use crate::infrastructure::crypto::encrypt_for;

pub struct Authority {
    repository: Arc<dyn AuthorityRepository>,
    broker: Arc<Broker>,
    topics: TopicGenerator,
    this: Weak<Authority>,
}

impl Authority {
    pub fn new(
        authority_id: &str,
        repository: Arc<dyn AuthorityRepository>,
        broker: Arc<Broker>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let topics = TopicGenerator::for_authority(authority_id)?;
        Ok(Arc::new_cyclic(|this| Self {
            repository,
            broker,
            topics,
            this: this.clone(),
        }))
    }

    pub fn authority_id(&self) -> &str {
        self.topics.authority_id()
    }

    pub async fn connect(&self, token: &str, endpoint: &str) -> Result<(), ConnectionError> {
        self.broker.connect(token, endpoint).await?;
        let authority = self.this.clone();
        self.broker
            .subscribe(
                &self.topics.subscribe_as_authority()?.render(),
                callback(move |message| {
                    let authority = authority.clone();
                    async move {
                        if let Some(authority) = authority.upgrade() {
                            authority.handle_message(message).await;
                        }
                    }
                }),
            )
            .await?;
        info!(authority_id = %self.authority_id(), "Authority listening");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.broker.disconnect().await?;
        Ok(())
    }

    async fn handle_message(&self, message: BrokerMessage) {
        let event = match message.control_event() {
            Some(Ok(Some(event))) => event,
            Some(Err(e)) => {
                warn!(topic = %message.topic, error = %e, "Malformed control event");
                return;
            }
            _ => {
                debug!(topic = %message.topic, "Ignoring non-control message");
                return;
            }
        };
        let sender = message.sender_id().unwrap_or_default().to_string();
        let kind = event.kind();

        let result = match event {
            ControlEvent::HostConnect { host, .. } => {
                if host.id != sender {
                    warn!(sender = %sender, claimed = %host.id, "host_connect from another principal");
                    return;
                }
                self.on_host_connect(host).await
            }
            ControlEvent::AgentConnect { agent, .. } => {
                if agent.id != sender {
                    warn!(sender = %sender, claimed = %agent.id, "agent_connect from another principal");
                    return;
                }
                self.on_agent_connect(&agent.id).await
            }
            ControlEvent::AgentDisconnect { agent_id, .. } => {
                if agent_id != sender {
                    warn!(sender = %sender, claimed = %agent_id, "agent_disconnect from another principal");
                    return;
                }
                self.on_agent_disconnect(&agent_id).await
            }
            ControlEvent::CredentialRequest {
                agent_id,
                credential_name,
                jwk,
            } => {
                if agent_id != sender {
                    warn!(sender = %sender, claimed = %agent_id, "credential_request from another principal");
                    return;
                }
                self.on_credential_request(&agent_id, &credential_name, &jwk).await
            }
            ControlEvent::HostWelcome { .. } | ControlEvent::CredentialResponse { .. } => {
                debug!(kind = kind, "Ignoring authority-bound reply event");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(kind = kind, sender = %sender, error = %e, "Control event handling failed");
        }
    }

    async fn on_host_connect(&self, declared: HostDescriptor) -> Result<(), ConnectionError> {
        let Some(host) = self.repository.get_host_by_id(&declared.id).await? else {
            warn!(host_id = %declared.id, "host_connect from unknown host");
            return Ok(());
        };
        let plugins = self
            .repository
            .sync_plugins_for_host_by_id(&host.id, &declared.plugins)
            .await?;
        let agents: Vec<AgentRecord> = self
            .repository
            .get_agents_for_host_by_id(&host.id)
            .await?
            .into_iter()
            .filter(|a| a.is_enabled)
            .collect();

        let host_id = host.id.clone();
        let agent_count = agents.len();
        let welcome = ControlEvent::HostWelcome {
            timestamp: self.broker.timestamp()?,
            host,
            plugins,
            agents,
        };
        self.broker
            .publish_event(&self.topics.publish_to_host(&host_id)?, &welcome)
            .await?;
        info!(host_id = %host_id, agents = agent_count, "Host welcomed");
        Ok(())
    }

    async fn on_agent_connect(&self, agent_id: &str) -> Result<(), ConnectionError> {
        let Some(host_id) = self.repository.get_host_id_for_agent_by_id(agent_id).await? else {
            warn!(agent_id = %agent_id, "agent_connect for agent without host");
            return Ok(());
        };
        let record = self
            .repository
            .get_agents_for_host_by_id(&host_id)
            .await?
            .into_iter()
            .find(|a| a.id == agent_id);
        match record {
            Some(record) => self.send_agent_connect(&host_id, record).await,
            None => {
                warn!(agent_id = %agent_id, host_id = %host_id, "Agent record missing");
                Ok(())
            }
        }
    }

    async fn on_agent_disconnect(&self, agent_id: &str) -> Result<(), ConnectionError> {
        let Some(host_id) = self.repository.get_host_id_for_agent_by_id(agent_id).await? else {
            warn!(agent_id = %agent_id, "agent_disconnect for agent without host");
            return Ok(());
        };
        self.send_agent_disconnect(&host_id, agent_id).await
    }

    async fn on_credential_request(
        &self,
        agent_id: &str,
        credential_name: &str,
        jwk: &PublicJwk,
    ) -> Result<(), ConnectionError> {
        let Some(value) = self
            .repository
            .get_credential_for_agent_by_name(agent_id, credential_name)
            .await?
        else {
            info!(agent_id = %agent_id, credential = %credential_name, "No credential stored; request dropped");
            return Ok(());
        };

        let response = ControlEvent::CredentialResponse {
            credential_name: credential_name.to_string(),
            encrypted_credential: encrypt_for(jwk, &value)?,
            key_id: Some(jwk.kid.clone()),
        };
        self.broker
            .publish_event(&self.topics.publish_to_agent(agent_id)?, &response)
            .await?;
        debug!(agent_id = %agent_id, credential = %credential_name, "Credential sealed and sent");
        Ok(())
    }

    async fn send_agent_connect(&self, host_id: &str, agent: AgentRecord) -> Result<(), ConnectionError> {
        let agent_id = agent.id.clone();
        let event = ControlEvent::AgentConnect {
            timestamp: self.broker.timestamp()?,
            agent,
        };
        self.broker
            .publish_event(&self.topics.publish_to_host(host_id)?, &event)
            .await?;
        debug!(agent_id = %agent_id, host_id = %host_id, "agent_connect forwarded");
        Ok(())
    }

    async fn send_agent_disconnect(&self, host_id: &str, agent_id: &str) -> Result<(), ConnectionError> {
        let event = ControlEvent::AgentDisconnect {
            timestamp: self.broker.timestamp()?,
            agent_id: agent_id.to_string(),
        };
        self.broker
            .publish_event(&self.topics.publish_to_host(host_id)?, &event)
            .await?;
        debug!(agent_id = %agent_id, host_id = %host_id, "agent_disconnect forwarded");
        Ok(())
    }

    async fn owning_host(&self, agent: &AgentRecord) -> Result<Option<String>, ConnectionError> {
        match &agent.host_id {
            Some(host_id) => Ok(Some(host_id.clone())),
            None => Ok(self.repository.get_host_id_for_agent_by_id(&agent.id).await?),
        }
    }

    /// A newly stored agent. Disabled agents are not connected.
    pub async fn agent_created(&self, agent: &AgentRecord) -> Result<(), ConnectionError> {
        if !agent.is_enabled {
            debug!(agent_id = %agent.id, "Created agent is disabled");
            return Ok(());
        }
        match self.owning_host(agent).await? {
            Some(host_id) => self.send_agent_connect(&host_id, agent.clone()).await,
            None => {
                warn!(agent_id = %agent.id, "Created agent has no host");
                Ok(())
            }
        }
    }

    /// Restart the agent on its host with the new record.
    pub async fn agent_updated(&self, agent: &AgentRecord) -> Result<(), ConnectionError> {
        self.agent_deleted(agent).await?;
        self.agent_created(agent).await
    }

    pub async fn agent_deleted(&self, agent: &AgentRecord) -> Result<(), ConnectionError> {
        match self.owning_host(agent).await? {
            Some(host_id) => self.send_agent_disconnect(&host_id, &agent.id).await,
            None => {
                warn!(agent_id = %agent.id, "Deleted agent has no host");
                Ok(())
            }
        }
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host Connection Protocol
//!
//! Joins a host process to the mesh and keeps its agent table in step with
//! the Authority.
//!
//! # States
//!
//! `Disconnected → FetchingToken → ConnectingBroker → AwaitingWelcome → Connected`
//!
//! # Connect sequence
//!
//! 1. Authority discovery with backoff (no-op once discovered)
//! 2. Client-credentials token for `host_id:secret`
//! 3. Broker connect, subscribe to the host topic and the all-hosts broadcast
//! 4. Publish `host_connect{timestamp, host}` to the Authority
//!
//! `host_welcome` reconciles plugin ids and connects the listed agents one at
//! a time. `agent_connect` / `agent_disconnect` from the Authority add or
//! remove single agents. [`Host::run`] retries the whole sequence at a fixed
//! delay until it succeeds or is cancelled.
//!
//! Teardown is the reverse: agents, then subscriptions, then the broker.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::agent::Agent;
use crate::application::error::ConnectionError;
use crate::domain::agent::AgentRecord;
use crate::domain::events::ControlEvent;
use crate::domain::host::HostDescriptor;
use crate::domain::message::BrokerMessage;
use crate::domain::node_config::NodeConfig;
use crate::domain::plugin::{reconcile_plugins, Plugin};
use crate::domain::topic::{TopicGenerator, NONE_SEGMENT};
use crate::infrastructure::broker::{callback, Broker, Subscription};
use crate::infrastructure::clock::Clock;
use crate::infrastructure::discovery::{AuthorityDiscovery, TokenClient};
use crate::infrastructure::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Disconnected,
    FetchingToken,
    ConnectingBroker,
    AwaitingWelcome,
    Connected,
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub connect_retry_delay: Duration,
    pub credential_timeout: Duration,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            connect_retry_delay: Duration::from_secs(10),
            credential_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&NodeConfig> for HostSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            connect_retry_delay: config.spec.retry.connect_retry_delay(),
            credential_timeout: config.spec.credentials.request_timeout(),
        }
    }
}

pub struct Host {
    descriptor: RwLock<HostDescriptor>,
    secret: String,
    discovery: Arc<AuthorityDiscovery>,
    tokens: TokenClient,
    broker: Arc<Broker>,
    topics: TopicGenerator,
    settings: HostSettings,
    agents: Mutex<HashMap<String, Arc<Agent>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    state: watch::Sender<HostState>,
    this: Weak<Host>,
}

impl Host {
    pub fn new(
        descriptor: HostDescriptor,
        secret: impl Into<String>,
        discovery: Arc<AuthorityDiscovery>,
        broker: Arc<Broker>,
        settings: HostSettings,
    ) -> Result<Arc<Self>, ConnectionError> {
        let topics = TopicGenerator::new(discovery.authority_id(), descriptor.id.clone())?;
        let (state, _) = watch::channel(HostState::Disconnected);
        Ok(Arc::new_cyclic(|this| Self {
            descriptor: RwLock::new(descriptor),
            secret: secret.into(),
            discovery,
            tokens: TokenClient::new(),
            broker,
            topics,
            settings,
            agents: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            state,
            this: this.clone(),
        }))
    }

    /// Host wired from `spec.host`, `spec.authority`, `spec.clock`,
    /// `spec.broker`, `spec.retry` and `spec.credentials`, with an SNTP clock.
    pub fn from_config(
        config: &NodeConfig,
        plugins: Vec<Plugin>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let host = config
            .spec
            .host
            .as_ref()
            .ok_or_else(|| ConnectionError::Configuration("spec.host is required".to_string()))?;
        let secret = host
            .resolve_secret()
            .map_err(|e| ConnectionError::Configuration(e.to_string()))?;

        let discovery = AuthorityDiscovery::from_config(&config.spec.authority, &config.spec.retry)?;
        let clock = Arc::new(Clock::from_config(&config.spec.clock)?);
        let broker = Broker::from_config(transport, clock, host.id.clone(), &config.spec);
        let descriptor = HostDescriptor {
            id: host.id.clone(),
            name: host.name.clone(),
            description: host.description.clone(),
            plugins,
        };
        Self::new(
            descriptor,
            secret,
            Arc::new(discovery),
            Arc::new(broker),
            HostSettings::from(config),
        )
    }

    pub fn id(&self) -> String {
        self.descriptor.read().id.clone()
    }

    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn plugins(&self) -> Vec<Plugin> {
        self.descriptor.read().plugins.clone()
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.lock().get(agent_id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn set_state(&self, state: HostState) {
        self.state.send_replace(state);
    }

    /// Spawn [`Host::run`] on the runtime.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let host = Arc::clone(self);
        tokio::spawn(async move { host.run(cancel).await })
    }

    /// Retry the connect sequence at a fixed delay until it succeeds or
    /// `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect(&cancel).await {
                Ok(()) => return,
                Err(ConnectionError::Cancelled) => return,
                Err(e) => {
                    error!(
                        host_id = %self.id(),
                        error = %e,
                        retry_secs = self.settings.connect_retry_delay.as_secs(),
                        "Host connect failed"
                    );
                    self.abandon_attempt().await;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.settings.connect_retry_delay) => {}
            }
        }
    }

    /// One pass of the connect sequence, ending after `host_connect` is sent.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        let host_id = self.id();

        self.set_state(HostState::FetchingToken);
        let document = self
            .discovery
            .initialize_with_backoff(cancel)
            .await
            .map_err(|e| if cancel.is_cancelled() { ConnectionError::Cancelled } else { e.into() })?;
        let token = self
            .tokens
            .client_credentials(&document.token_endpoint, &host_id, &self.secret)
            .await?;

        self.set_state(HostState::ConnectingBroker);
        self.broker.connect(&token.access_token, &document.broker_uri).await?;
        for filter in [
            self.topics.subscribe_as_host()?.render(),
            self.topics.subscribe_as_all_hosts()?.render(),
        ] {
            let host = self.this.clone();
            let subscription = self
                .broker
                .subscribe(
                    &filter,
                    callback(move |message| {
                        let host = host.clone();
                        async move {
                            if let Some(host) = host.upgrade() {
                                host.handle_message(message).await;
                            }
                        }
                    }),
                )
                .await?;
            self.subscriptions.lock().push(subscription);
        }

        self.set_state(HostState::AwaitingWelcome);
        let event = ControlEvent::HostConnect {
            timestamp: self.broker.timestamp()?,
            host: self.descriptor.read().clone(),
        };
        self.broker
            .publish_event(&self.topics.publish_to_authority()?, &event)
            .await?;
        info!(host_id = %host_id, "Host connect sent, awaiting welcome");
        Ok(())
    }

    async fn abandon_attempt(&self) {
        self.subscriptions.lock().clear();
        if self.broker.is_connected() {
            if let Err(e) = self.broker.disconnect().await {
                debug!(error = %e, "Broker disconnect after failed attempt");
            }
        }
        self.set_state(HostState::Disconnected);
    }

    async fn handle_message(&self, message: BrokerMessage) {
        let event = match message.control_event() {
            Some(Ok(Some(event))) => event,
            Some(Ok(None)) | None => {
                debug!(topic = %message.topic, "Ignoring non-control message");
                return;
            }
            Some(Err(e)) => {
                warn!(topic = %message.topic, error = %e, "Malformed control event");
                return;
            }
        };
        if message.sender_id() != Some(NONE_SEGMENT) {
            warn!(topic = %message.topic, kind = event.kind(), "Control event not sent by the authority");
            return;
        }

        match event {
            ControlEvent::HostWelcome { plugins, agents, .. } => self.on_welcome(plugins, agents).await,
            ControlEvent::AgentConnect { agent, .. } => {
                if let Err(e) = self.add_agent(agent).await {
                    warn!(error = %e, "Failed to connect agent");
                }
            }
            ControlEvent::AgentDisconnect { agent_id, .. } => {
                if let Err(e) = self.remove_agent(&agent_id).await {
                    warn!(agent_id = %agent_id, error = %e, "Failed to disconnect agent");
                }
            }
            other => debug!(kind = other.kind(), "Ignoring control event"),
        }
    }

    async fn on_welcome(&self, plugins: Vec<Plugin>, agents: Vec<AgentRecord>) {
        {
            let mut descriptor = self.descriptor.write();
            reconcile_plugins(&mut descriptor.plugins, plugins);
        }
        info!(host_id = %self.id(), agents = agents.len(), "Host welcomed");
        for record in agents {
            let agent_id = record.id.clone();
            if let Err(e) = self.add_agent(record).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to connect agent");
            }
        }
        self.set_state(HostState::Connected);
    }

    /// Create and connect an agent unless one with the same id is present.
    /// Returns whether a new agent was connected.
    pub async fn add_agent(&self, record: AgentRecord) -> Result<bool, ConnectionError> {
        if self.agents.lock().contains_key(&record.id) {
            debug!(agent_id = %record.id, "Agent already present");
            return Ok(false);
        }

        let agent = Agent::create(
            record,
            self.id(),
            self.broker.clone(),
            self.topics.authority_id(),
            self.settings.credential_timeout,
        )
        .await?;
        agent.connect().await?;

        let duplicate = {
            let mut agents = self.agents.lock();
            if agents.contains_key(agent.id()) {
                true
            } else {
                agents.insert(agent.id().to_string(), agent.clone());
                false
            }
        };
        if duplicate {
            agent.disconnect().await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<bool, ConnectionError> {
        let removed = self.agents.lock().remove(agent_id);
        match removed {
            Some(agent) => {
                agent.disconnect().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Connect an agent locally and announce it to the Authority.
    pub async fn start_agent(&self, record: AgentRecord) -> Result<(), ConnectionError> {
        let agent_id = record.id.clone();
        self.add_agent(record).await?;
        if let Some(agent) = self.agent(&agent_id) {
            agent.announce_connect().await?;
        }
        Ok(())
    }

    /// Announce an agent's departure, then disconnect it locally.
    pub async fn stop_agent(&self, agent_id: &str) -> Result<(), ConnectionError> {
        if let Some(agent) = self.agent(agent_id) {
            agent.announce_disconnect().await?;
        }
        self.remove_agent(agent_id).await?;
        Ok(())
    }

    /// Agents first, then subscriptions, then the broker connection.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let agents: Vec<Arc<Agent>> = self.agents.lock().drain().map(|(_, agent)| agent).collect();
        for agent in agents {
            if let Err(e) = agent.disconnect().await {
                warn!(agent_id = %agent.id(), error = %e, "Agent disconnect failed");
            }
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        if self.broker.is_connected() {
            for subscription in &subscriptions {
                self.broker.unsubscribe(subscription).await?;
            }
            self.broker.disconnect().await?;
        }
        self.set_state(HostState::Disconnected);
        info!(host_id = %self.id(), "Host disconnected");
        Ok(())
    }
}

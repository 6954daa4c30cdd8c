// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credential Relay (agent side)
//!
//! Moves named secrets from the Authority to one agent without the plaintext
//! ever crossing the bus:
//!
//! 1. `get_credential(name)` answers from the cache when possible.
//! 2. Otherwise the caller registers a one-shot waiter under `name`. The first
//!    waiter publishes `credential_request{agent_id, credential_name, jwk}` to
//!    the Authority; later waiters share that request.
//! 3. The dispatch path hands `credential_response` to [`CredentialRelay::receive_response`],
//!    which decrypts with the agent's private key, caches on success and
//!    resolves every waiter for that name with the same result.
//! 4. A waiter that sees no response within the timeout is removed and fails
//!    with [`CredentialError::Timeout`].
//!
//! An Authority that has no such credential never answers, so "not found" and
//! "timed out" are indistinguishable to the requester.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::domain::credential::PublicJwk;
use crate::domain::events::ControlEvent;
use crate::domain::plugin::FunctionConnection;
use crate::domain::topic::TopicGenerator;
use crate::infrastructure::broker::Broker;
use crate::infrastructure::crypto::CredentialKeypair;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Timed out waiting for credential '{0}'")]
    Timeout(String),

    #[error("Failed to decrypt credential '{name}': {reason}")]
    Decryption { name: String, reason: String },

    #[error("Function '{function_id}' may not request credential '{requested}'")]
    AccessDenied { function_id: String, requested: String },

    #[error("Credential request could not be sent: {0}")]
    Broker(String),
}

type Waiter = oneshot::Sender<Result<String, CredentialError>>;

pub struct CredentialRelay {
    agent_id: String,
    keypair: Arc<CredentialKeypair>,
    broker: Arc<Broker>,
    topics: TopicGenerator,
    timeout: Duration,
    cache: RwLock<HashMap<String, String>>,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl CredentialRelay {
    pub fn new(
        keypair: Arc<CredentialKeypair>,
        broker: Arc<Broker>,
        topics: TopicGenerator,
        timeout: Duration,
    ) -> Self {
        Self {
            agent_id: topics.sender_id().to_string(),
            keypair,
            broker,
            topics,
            timeout,
            cache: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_id(&self) -> String {
        self.keypair.key_id().to_string()
    }

    pub fn public_jwk(&self) -> &PublicJwk {
        self.keypair.public_jwk()
    }

    pub fn cached(&self, name: &str) -> Option<String> {
        self.cache.read().get(name).cloned()
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().values().map(Vec::len).sum()
    }

    pub async fn get_credential(&self, name: &str) -> Result<String, CredentialError> {
        if let Some(value) = self.cached(name) {
            return Ok(value);
        }

        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = self.waiters.lock();
            let list = waiters.entry(name.to_string()).or_default();
            list.push(tx);
            list.len() == 1
        };

        if first {
            if let Err(e) = self.send_request(name).await {
                let failed = CredentialError::Broker(e);
                for waiter in self.waiters.lock().remove(name).unwrap_or_default() {
                    let _ = waiter.send(Err(failed.clone()));
                }
                return Err(failed);
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => {
                self.prune_closed(name);
                warn!(agent_id = %self.agent_id, credential = %name, "Credential request timed out");
                Err(CredentialError::Timeout(name.to_string()))
            }
        }
    }

    /// Credential request on behalf of a plugin function, limited to the
    /// connection its registration declares.
    pub async fn get_credential_for(
        &self,
        capability: &FunctionConnection,
        name: &str,
    ) -> Result<String, CredentialError> {
        if capability.required_connection_name != name {
            warn!(
                agent_id = %self.agent_id,
                function_id = %capability.function_id,
                "Function requested a credential outside its capability"
            );
            return Err(CredentialError::AccessDenied {
                function_id: capability.function_id.clone(),
                requested: name.to_string(),
            });
        }
        self.get_credential(name).await
    }

    /// Resolve waiters for `name` with the decrypted value. A `key_id` that
    /// is not this agent's current key fails without attempting decryption.
    pub fn receive_response(
        &self,
        name: &str,
        encrypted: &str,
        key_id: Option<&str>,
    ) -> Result<(), CredentialError> {
        let current = self.key_id();
        let result = match key_id {
            Some(key_id) if key_id != current => Err(CredentialError::Decryption {
                name: name.to_string(),
                reason: format!("response sealed for key '{key_id}'"),
            }),
            _ => self.keypair.decrypt(encrypted).map_err(|e| CredentialError::Decryption {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        };

        if let Ok(value) = &result {
            self.cache.write().insert(name.to_string(), value.clone());
            info!(agent_id = %self.agent_id, credential = %name, "Credential received");
        }

        let waiters = self.waiters.lock().remove(name).unwrap_or_default();
        if waiters.is_empty() {
            debug!(agent_id = %self.agent_id, credential = %name, "Credential response without waiter");
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result.map(|_| ())
    }

    async fn send_request(&self, name: &str) -> Result<(), String> {
        let event = ControlEvent::CredentialRequest {
            agent_id: self.agent_id.clone(),
            credential_name: name.to_string(),
            jwk: self.keypair.public_jwk().clone(),
        };
        let topic = self.topics.publish_to_authority().map_err(|e| e.to_string())?;
        self.broker
            .publish_event(&topic, &event)
            .await
            .map_err(|e| e.to_string())?;
        debug!(agent_id = %self.agent_id, credential = %name, "Credential requested");
        Ok(())
    }

    fn prune_closed(&self, name: &str) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(name) {
            list.retain(|waiter| !waiter.is_closed());
            if list.is_empty() {
                waiters.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::BrokerMessage;
    use crate::infrastructure::broker::callback;
    use crate::infrastructure::clock::{Clock, SystemTimeSource};
    use crate::infrastructure::crypto::encrypt_for;
    use crate::infrastructure::crypto::tests::shared_keypairs;
    use crate::infrastructure::transport::InMemoryBus;
    use tokio::sync::mpsc;

    struct Fixture {
        relay: Arc<CredentialRelay>,
        requests: mpsc::UnboundedReceiver<BrokerMessage>,
        _authority: Arc<Broker>,
    }

    async fn fixture(timeout: Duration) -> Fixture {
        let bus = InMemoryBus::new();
        let clock = Arc::new(Clock::new(None, Arc::new(SystemTimeSource), Duration::from_secs(32)).unwrap());

        let authority = Arc::new(Broker::new(Arc::new(bus.transport()), clock.clone(), "a", Duration::from_secs(5)));
        authority.connect("t", "mem").await.unwrap();
        let (tx, requests) = mpsc::unbounded_channel();
        authority
            .subscribe(
                "event/+/a/-/-",
                callback(move |message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                    }
                }),
            )
            .await
            .unwrap();

        let host = Arc::new(Broker::new(Arc::new(bus.transport()), clock, "h1", Duration::from_secs(5)));
        host.connect("t", "mem").await.unwrap();

        let (keys, _) = shared_keypairs();
        let topics = TopicGenerator::new("a", "ag1").unwrap();
        Fixture {
            relay: Arc::new(CredentialRelay::new(keys, host, topics, timeout)),
            requests,
            _authority: authority,
        }
    }

    fn sealed_for(relay: &CredentialRelay, value: &str) -> String {
        encrypt_for(relay.keypair.public_jwk(), value).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_one_request() {
        let mut fx = fixture(Duration::from_secs(30)).await;

        let first = tokio::spawn({
            let relay = fx.relay.clone();
            async move { relay.get_credential("OpenAI").await }
        });
        let second = tokio::spawn({
            let relay = fx.relay.clone();
            async move { relay.get_credential("OpenAI").await }
        });

        let request = fx.requests.recv().await.unwrap();
        assert_eq!(request.topic, "event/ag1/a/-/-");
        match request.control_event() {
            Some(Ok(Some(ControlEvent::CredentialRequest {
                agent_id,
                credential_name,
                jwk,
            }))) => {
                assert_eq!(agent_id, "ag1");
                assert_eq!(credential_name, "OpenAI");
                assert_eq!(jwk.kid, fx.relay.key_id());
            }
            other => panic!("unexpected message: {other:?}"),
        }

        while fx.relay.pending() < 2 {
            tokio::task::yield_now().await;
        }
        let sealed = sealed_for(&fx.relay, "sk-123");
        fx.relay
            .receive_response("OpenAI", &sealed, Some(fx.relay.key_id().as_str()))
            .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), "sk-123");
        assert_eq!(second.await.unwrap().unwrap(), "sk-123");
        assert!(fx.requests.try_recv().is_err());
        assert_eq!(fx.relay.pending(), 0);
    }

    #[tokio::test]
    async fn test_cached_value_skips_request() {
        let mut fx = fixture(Duration::from_secs(30)).await;
        let sealed = sealed_for(&fx.relay, "cached");
        fx.relay.receive_response("Search", &sealed, None).unwrap();

        assert_eq!(fx.relay.get_credential("Search").await.unwrap(), "cached");
        tokio::task::yield_now().await;
        assert!(fx.requests.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let fx = fixture(Duration::from_secs(30)).await;
        assert_eq!(
            fx.relay.get_credential("OpenAI").await,
            Err(CredentialError::Timeout("OpenAI".to_string()))
        );
        assert_eq!(fx.relay.pending(), 0);
        assert_eq!(fx.relay.cached("OpenAI"), None);
    }

    #[tokio::test]
    async fn test_foreign_key_id_fails_without_caching() {
        let fx = fixture(Duration::from_secs(30)).await;
        let waiter = tokio::spawn({
            let relay = fx.relay.clone();
            async move { relay.get_credential("OpenAI").await }
        });
        while fx.relay.pending() < 1 {
            tokio::task::yield_now().await;
        }

        let sealed = sealed_for(&fx.relay, "sk-123");
        let result = fx.relay.receive_response("OpenAI", &sealed, Some("some-other-key"));
        assert!(matches!(result, Err(CredentialError::Decryption { .. })));
        assert!(matches!(waiter.await.unwrap(), Err(CredentialError::Decryption { .. })));
        assert_eq!(fx.relay.cached("OpenAI"), None);
    }

    #[tokio::test]
    async fn test_ciphertext_for_other_key_fails() {
        let fx = fixture(Duration::from_secs(30)).await;
        let (_, other) = shared_keypairs();
        let sealed = encrypt_for(other.public_jwk(), "sk-123").unwrap();
        assert!(matches!(
            fx.relay.receive_response("OpenAI", &sealed, None),
            Err(CredentialError::Decryption { .. })
        ));
        assert_eq!(fx.relay.cached("OpenAI"), None);
    }

    #[tokio::test]
    async fn test_capability_limits_credential_name() {
        let fx = fixture(Duration::from_secs(30)).await;
        let capability = FunctionConnection {
            function_id: "fn-1".to_string(),
            required_connection_name: "Search".to_string(),
        };
        assert!(matches!(
            fx.relay.get_credential_for(&capability, "OpenAI").await,
            Err(CredentialError::AccessDenied { .. })
        ));

        let sealed = sealed_for(&fx.relay, "bing-key");
        fx.relay.receive_response("Search", &sealed, None).unwrap();
        assert_eq!(fx.relay.get_credential_for(&capability, "Search").await.unwrap(), "bing-key");
    }
}

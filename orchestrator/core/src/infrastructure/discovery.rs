// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Authority Discovery and Token Client
//!
//! Resolves the broker and token endpoints from the authority's well-known
//! configuration document and exchanges host credentials for a bearer token.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** HTTP bootstrap of a node's connection to the authority
//! - **Integration:** `{authority}/.well-known/openid-configuration` and the
//!   token endpoint (client-credentials grant)
//!
//! Discovery retries with exponential backoff (1s, doubling, capped) and is a
//! no-op once a document has been loaded. Token acquisition is a single
//! attempt; the caller's connect loop owns retries.

use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::node_config::{AuthorityConfig, RetryConfig};

pub const WELL_KNOWN_PATH: &str = ".well-known/openid-configuration";
pub const CONNECT_SCOPE: &str = "connect";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid authority configuration: {0}")]
    Configuration(String),

    #[error("Discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authority discovery has not completed")]
    NotInitialized,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token request rejected with status {0}")]
    Auth(StatusCode),

    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub broker_uri: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_uri: Option<String>,
}

impl DiscoveryDocument {
    fn from_json(value: serde_json::Value) -> Result<Self, DiscoveryError> {
        let document: Self =
            serde_json::from_value(value).map_err(|e| DiscoveryError::Configuration(e.to_string()))?;
        for (field, value) in [("broker_uri", &document.broker_uri), ("token_endpoint", &document.token_endpoint)] {
            if value.trim().is_empty() {
                return Err(DiscoveryError::Configuration(format!("empty field '{field}'")));
            }
        }
        Ok(document)
    }
}

pub struct AuthorityDiscovery {
    authority_uri: Url,
    internal_uri: Option<Url>,
    broker_override: Option<String>,
    max_backoff: Duration,
    http: Client,
    document: RwLock<Option<DiscoveryDocument>>,
}

impl AuthorityDiscovery {
    pub fn new(
        authority_uri: &str,
        internal_uri: Option<&str>,
        broker_override: Option<&str>,
        max_backoff: Duration,
    ) -> Result<Self, DiscoveryError> {
        let parse = |raw: &str| {
            Url::parse(raw).map_err(|e| DiscoveryError::Configuration(format!("invalid URI '{raw}': {e}")))
        };
        let authority_uri = parse(authority_uri)?;
        if authority_uri.host_str().is_none() {
            return Err(DiscoveryError::Configuration(format!(
                "authority URI '{authority_uri}' has no host"
            )));
        }
        Ok(Self {
            authority_uri,
            internal_uri: internal_uri.map(parse).transpose()?,
            broker_override: broker_override.map(str::to_string),
            max_backoff,
            http: Client::new(),
            document: RwLock::new(None),
        })
    }

    pub fn from_config(authority: &AuthorityConfig, retry: &RetryConfig) -> Result<Self, DiscoveryError> {
        Self::new(
            &authority.uri,
            authority.internal_uri.as_deref(),
            authority.broker_uri.as_deref(),
            retry.discovery_max_backoff(),
        )
    }

    /// Hostname of the public authority URI.
    pub fn authority_id(&self) -> &str {
        self.authority_uri.host_str().unwrap_or_default()
    }

    pub fn is_initialized(&self) -> bool {
        self.document.read().is_some()
    }

    fn document_url(&self) -> String {
        let base = self.internal_uri.as_ref().unwrap_or(&self.authority_uri);
        format!("{}/{WELL_KNOWN_PATH}", base.as_str().trim_end_matches('/'))
    }

    /// Single discovery attempt.
    pub async fn initialize(&self) -> Result<DiscoveryDocument, DiscoveryError> {
        let url = self.document_url();
        debug!(url = %url, "Fetching authority configuration");
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut document = DiscoveryDocument::from_json(body)?;

        if let Some(internal) = &self.internal_uri {
            document.token_endpoint = rewrite_origin(&document.token_endpoint, internal)?;
        }
        if let Some(broker_uri) = &self.broker_override {
            document.broker_uri = broker_uri.clone();
        }

        info!(
            authority_id = %self.authority_id(),
            broker_uri = %document.broker_uri,
            "Authority discovery complete"
        );
        *self.document.write() = Some(document.clone());
        Ok(document)
    }

    /// Discover until success or cancellation. Returns the cached document
    /// without network I/O when already initialized.
    pub async fn initialize_with_backoff(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryDocument, DiscoveryError> {
        let cached = self.document.read().clone();
        if let Some(document) = cached {
            return Ok(document);
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            match self.initialize().await {
                Ok(document) => return Ok(document),
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "Authority discovery failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }

    fn loaded<T>(&self, f: impl FnOnce(&DiscoveryDocument) -> T) -> Result<T, DiscoveryError> {
        self.document.read().as_ref().map(f).ok_or(DiscoveryError::NotInitialized)
    }

    pub fn broker_uri(&self) -> Result<String, DiscoveryError> {
        self.loaded(|d| d.broker_uri.clone())
    }

    pub fn token_endpoint(&self) -> Result<String, DiscoveryError> {
        self.loaded(|d| d.token_endpoint.clone())
    }

    pub fn files_uri(&self) -> Option<String> {
        self.document.read().as_ref().and_then(|d| d.files_uri.clone())
    }
}

/// Replace host and port of `endpoint` with those of `origin`.
fn rewrite_origin(endpoint: &str, origin: &Url) -> Result<String, DiscoveryError> {
    let invalid = |reason: &str| DiscoveryError::Configuration(format!("cannot rewrite '{endpoint}': {reason}"));
    let mut url = Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
    url.set_host(origin.host_str()).map_err(|e| invalid(&e.to_string()))?;
    url.set_port(origin.port()).map_err(|_| invalid("port not allowed"))?;
    Ok(url.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Clone, Default)]
pub struct TokenClient {
    http: Client,
}

impl TokenClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client-credentials grant with HTTP Basic auth.
    pub async fn client_credentials(
        &self,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<AccessToken, TokenError> {
        let response = self
            .http
            .post(token_endpoint)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials"), ("scope", CONNECT_SCOPE)])
            .send()
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            warn!(client_id = %client_id, status = %status, "Token request rejected");
            return Err(TokenError::Auth(status));
        }

        let token: AccessToken = response.error_for_status()?.json().await?;
        debug!(client_id = %client_id, expires_in = ?token.expires_in, "Token acquired");
        Ok(token)
    }
}

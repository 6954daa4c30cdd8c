// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Broker ACL Hook
//!
//! HTTP endpoints called by an external broker's auth plugin:
//!
//! | Route | Body | 200 when |
//! |-------|------|----------|
//! | `POST /broker/connect/check` | none | bearer token verifies |
//! | `POST /broker/acl/check` | `{acc, clientid, topic}` | token verifies and [`AclEvaluator`] permits |
//!
//! Every other outcome is 401 with an empty body. Claims come only from the
//! RS256 bearer token, never from the request body.

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::application::acl_evaluator::AclEvaluator;
use crate::domain::acl::Claims;
use crate::domain::node_config::AclHookConfig;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("Invalid hook configuration: {0}")]
    Configuration(String),

    #[error("Invalid bearer token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Missing bearer token")]
    MissingToken,
}

/// Claims carried by a broker bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    pub authority_id: String,
    pub iss: String,
    pub aud: String,
    pub exp: u64,
}

impl From<BrokerTokenClaims> for Claims {
    fn from(token: BrokerTokenClaims) -> Self {
        Claims {
            principal_id: token.sub,
            roles: token.roles.into_iter().collect::<BTreeSet<_>>(),
            authority_id: token.authority_id,
            host_id: token.host_id,
        }
    }
}

pub struct BrokerTokenVerifier {
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
}

impl BrokerTokenVerifier {
    pub fn new(pem: &str, issuer: &str, audience: &str) -> Result<Self, HookError> {
        if issuer.is_empty() || audience.is_empty() {
            return Err(HookError::Configuration("issuer and audience must not be empty".to_string()));
        }
        let decoding_key =
            DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| HookError::Configuration(e.to_string()))?;
        Ok(Self {
            decoding_key,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        })
    }

    pub fn from_config(config: &AclHookConfig) -> Result<Self, HookError> {
        Self::new(&config.token_public_key_pem, &config.issuer, &config.audience)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, HookError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        let data = decode::<BrokerTokenClaims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims.into())
    }

    fn verify_headers(&self, headers: &HeaderMap) -> Result<Claims, HookError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(HookError::MissingToken)?;
        self.verify(token.trim())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclCheckRequest {
    pub acc: u8,
    pub clientid: String,
    pub topic: String,
}

struct HookState {
    verifier: BrokerTokenVerifier,
    evaluator: AclEvaluator,
}

pub fn router(verifier: BrokerTokenVerifier, evaluator: AclEvaluator) -> Router {
    Router::new()
        .route("/broker/connect/check", post(connect_check))
        .route("/broker/acl/check", post(acl_check))
        .with_state(Arc::new(HookState { verifier, evaluator }))
}

async fn connect_check(State(state): State<Arc<HookState>>, headers: HeaderMap) -> StatusCode {
    match state.verifier.verify_headers(&headers) {
        Ok(claims) => {
            debug!(principal_id = %claims.principal_id, "Broker connect allowed");
            StatusCode::OK
        }
        Err(e) => {
            debug!(error = %e, "Broker connect refused");
            StatusCode::UNAUTHORIZED
        }
    }
}

async fn acl_check(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    Json(request): Json<AclCheckRequest>,
) -> StatusCode {
    let claims = match state.verifier.verify_headers(&headers) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(client_id = %request.clientid, error = %e, "ACL check without valid token");
            return StatusCode::UNAUTHORIZED;
        }
    };
    if state.evaluator.check(&request.topic, request.acc, &claims).await {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

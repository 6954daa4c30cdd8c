// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! ACL Evaluator
//!
//! Decides whether a principal may READ, WRITE or SUBSCRIBE to a topic. Runs
//! broker-side for every publish and subscribe, trusting only the
//! authenticated [`Claims`], never the topic content.
//!
//! # Algorithm
//!
//! 1. `connect/` topics are always permitted.
//! 2. The `event/` prefix is stripped; blank topics and access code 0 are denied.
//! 3. READ_WRITE is always denied.
//! 4. Topics with a literal `?` segment or the wrong arity are denied.
//! 5. Candidate masks come from the principal's roles.
//! 6. Each mask is tried literally, then (if it has `?` segments) as a query
//!    resolved by the [`RelationshipVerifier`].
//! 7. First match permits; a structurally impossible query rules out only
//!    that mask. No match denies.
//!
//! Denials carry no reason back to the caller; they are logged with the
//! principal and access type only.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::acl::{AccessMask, AccessPolicy, AccessType, Claims, QueryMatch};
use crate::domain::repository::RelationshipVerifier;
use crate::domain::topic::{CONNECT_PREFIX, EVENT_PREFIX, QUERY_SEGMENT, SENDER_WILDCARD};

#[derive(Clone)]
pub struct AclEvaluator {
    verifier: Arc<dyn RelationshipVerifier>,
}

impl AclEvaluator {
    pub fn new(verifier: Arc<dyn RelationshipVerifier>) -> Self {
        Self { verifier }
    }

    /// Evaluate a raw broker request. `access_code` follows the broker's
    /// numbering (1 read, 2 write, 3 read-write, 4 subscribe).
    pub async fn check(&self, topic: &str, access_code: u8, claims: &Claims) -> bool {
        let permitted = self.evaluate(topic, access_code, claims).await;
        let result = if permitted { "allow" } else { "deny" };
        metrics::counter!("agora_acl_decisions_total", "result" => result).increment(1);
        if !permitted {
            warn!(
                principal_id = %claims.principal_id,
                access = access_code,
                "ACL denied"
            );
        }
        permitted
    }

    pub async fn check_access(&self, topic: &str, access: AccessType, claims: &Claims) -> bool {
        self.check(topic, access.code(), claims).await
    }

    async fn evaluate(&self, topic: &str, access_code: u8, claims: &Claims) -> bool {
        if topic.starts_with(CONNECT_PREFIX) {
            return true;
        }

        let body = topic.strip_prefix(EVENT_PREFIX).unwrap_or(topic);
        if body.trim().is_empty() || access_code == 0 {
            return false;
        }

        let access = match AccessType::from_code(access_code) {
            Some(AccessType::ReadWrite) | None => return false,
            Some(access) => access,
        };

        let segments: Vec<&str> = body.split('/').collect();
        let segments: [&str; 4] = match segments.as_slice() {
            [a, b, c, d] => [*a, *b, *c, *d],
            _ => return false,
        };
        if segments.iter().any(|s| *s == QUERY_SEGMENT) {
            debug!(topic = %topic, "Literal '?' segment in topic");
            return false;
        }
        if access == AccessType::Subscribe && segments[0] != SENDER_WILDCARD {
            return false;
        }

        let masks = AccessMask::for_principal(access, claims);
        self.match_masks(&masks, &segments, access, claims).await
    }

    async fn match_masks(
        &self,
        masks: &[AccessMask],
        segments: &[&str; 4],
        access: AccessType,
        claims: &Claims,
    ) -> bool {
        let host_id = claims.host_id.as_deref().unwrap_or_default();
        for mask in masks {
            if mask.matches_literal(segments, access) {
                debug!(principal_id = %claims.principal_id, mask = %mask, "ACL literal match");
                return true;
            }

            match mask.match_query(segments, access) {
                QueryMatch::NoMatch | QueryMatch::Deny => continue,
                QueryMatch::Verify { source, target } => {
                    match self
                        .verifier
                        .verify_host_source_target(host_id, source.as_deref(), target.as_deref())
                        .await
                    {
                        Ok(true) => {
                            debug!(principal_id = %claims.principal_id, mask = %mask, "ACL query match");
                            return true;
                        }
                        Ok(false) => continue,
                        Err(e) => {
                            warn!(principal_id = %claims.principal_id, error = %e, "Relationship check failed");
                            continue;
                        }
                    }
                }
            }
        }

        false
    }
}

#[async_trait]
impl AccessPolicy for AclEvaluator {
    async fn permits(&self, topic: &str, access_code: u8, claims: &Claims) -> bool {
        self.check(topic, access_code, claims).await
    }
}

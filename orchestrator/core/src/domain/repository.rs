// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts the control plane depends on. Storage itself is an
//! external collaborator; the traits are defined here and implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Used by | Implementations |
//! |-------|---------|----------------|
//! | `AuthorityRepository` | `Authority` | `InMemoryAuthorityRepository` |
//! | `RelationshipVerifier` | `AclEvaluator` | `InMemoryAuthorityRepository` |

use async_trait::async_trait;

use crate::domain::agent::AgentRecord;
use crate::domain::host::HostDescriptor;
use crate::domain::plugin::Plugin;

/// Records the Authority loads while admitting hosts and serving credentials.
#[async_trait]
pub trait AuthorityRepository: Send + Sync {
    async fn get_host_by_id(&self, host_id: &str) -> Result<Option<HostDescriptor>, RepositoryError>;

    async fn get_agents_for_host_by_id(&self, host_id: &str) -> Result<Vec<AgentRecord>, RepositoryError>;

    async fn get_host_id_for_agent_by_id(&self, agent_id: &str) -> Result<Option<String>, RepositoryError>;

    /// Persist the plugins a host declared and return them with
    /// Authority-issued plugin and function ids.
    async fn sync_plugins_for_host_by_id(
        &self,
        host_id: &str,
        plugins: &[Plugin],
    ) -> Result<Vec<Plugin>, RepositoryError>;

    /// Plaintext credential value, if the agent has one under `name`.
    async fn get_credential_for_agent_by_name(
        &self,
        agent_id: &str,
        name: &str,
    ) -> Result<Option<String>, RepositoryError>;
}

/// Relationship check backing the `?` segments of access masks.
#[async_trait]
pub trait RelationshipVerifier: Send + Sync {
    /// Whether `source` (a sender) and `target` (a destination agent) are
    /// both reachable from `host_id`. A `None` side is not checked.
    async fn verify_host_source_target(
        &self,
        host_id: &str,
        source: Option<&str>,
        target: Option<&str>,
    ) -> Result<bool, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_yaml::Error> for RepositoryError {
    fn from(err: serde_yaml::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        RepositoryError::Storage(err.to_string())
    }
}

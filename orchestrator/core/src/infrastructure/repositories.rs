// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory Authority repository.
//!
//! Backs both [`AuthorityRepository`] and [`RelationshipVerifier`] from a
//! single set of host, agent and credential records. Records can be built
//! programmatically or loaded from a YAML file:
//!
//! ```yaml
//! hosts:
//!   - id: h1
//!     name: Worker One
//! agents:
//!   - id: ag1
//!     name: Researcher
//!     host_id: h1
//! credentials:
//!   - agent_id: ag1
//!     name: OpenAI
//!     value: env:OPENAI_API_KEY
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::agent::AgentRecord;
use crate::domain::credential::CredentialStatus;
use crate::domain::host::HostDescriptor;
use crate::domain::node_config::resolve_env_reference;
use crate::domain::plugin::Plugin;
use crate::domain::repository::{AuthorityRepository, RelationshipVerifier, RepositoryError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub agent_id: String,
    pub name: String,
    /// Plaintext, or `env:VAR`.
    pub value: String,
    #[serde(default = "default_status")]
    pub status: CredentialStatus,
}

fn default_status() -> CredentialStatus {
    CredentialStatus::Active
}

/// On-disk shape of a records file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorityRecords {
    #[serde(default)]
    pub hosts: Vec<HostDescriptor>,
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
    #[serde(default)]
    pub credentials: Vec<CredentialRecord>,
}

#[derive(Default)]
struct Records {
    hosts: HashMap<String, HostDescriptor>,
    agents: HashMap<String, AgentRecord>,
    /// (agent_id, name) → credential
    credentials: HashMap<(String, String), CredentialRecord>,
    /// Plugins last synced per host, with issued ids.
    plugins: HashMap<String, Vec<Plugin>>,
}

#[derive(Clone, Default)]
pub struct InMemoryAuthorityRepository {
    records: Arc<RwLock<Records>>,
}

impl InMemoryAuthorityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: AuthorityRecords) -> Self {
        let repository = Self::new();
        for host in records.hosts {
            repository.insert_host(host);
        }
        for agent in records.agents {
            repository.insert_agent(agent);
        }
        for credential in records.credentials {
            repository.insert_credential(credential);
        }
        repository
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let content = std::fs::read_to_string(path)?;
        let records: AuthorityRecords = serde_yaml::from_str(&content)?;
        Ok(Self::from_records(records))
    }

    pub fn insert_host(&self, host: HostDescriptor) {
        self.records.write().hosts.insert(host.id.clone(), host);
    }

    pub fn insert_agent(&self, agent: AgentRecord) {
        self.records.write().agents.insert(agent.id.clone(), agent);
    }

    pub fn remove_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.records.write().agents.remove(agent_id)
    }

    pub fn insert_credential(&self, credential: CredentialRecord) {
        let key = (credential.agent_id.clone(), credential.name.clone());
        self.records.write().credentials.insert(key, credential);
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.records.read().agents.get(agent_id).cloned()
    }

    fn owns(&self, host_id: &str, agent_id: &str) -> bool {
        self.records
            .read()
            .agents
            .get(agent_id)
            .and_then(|a| a.host_id.as_deref())
            == Some(host_id)
    }
}

/// Assign ids to `declared`, reusing those issued for the same plugin and
/// function names in `previous`.
fn issue_plugin_ids(previous: &[Plugin], declared: &[Plugin]) -> Vec<Plugin> {
    declared
        .iter()
        .map(|plugin| {
            let known = previous.iter().find(|p| match (&p.unique_name, &plugin.unique_name) {
                (Some(a), Some(b)) => a == b,
                _ => p.name == plugin.name,
            });
            let mut issued = plugin.clone();
            issued.body = None;
            issued.id = known
                .and_then(|p| p.id.clone())
                .or_else(|| plugin.id.clone())
                .or_else(|| Some(Uuid::new_v4().to_string()));
            for function in &mut issued.functions {
                function.id = known
                    .and_then(|p| p.function(&function.name))
                    .and_then(|f| f.id.clone())
                    .or_else(|| function.id.clone())
                    .or_else(|| Some(Uuid::new_v4().to_string()));
            }
            issued
        })
        .collect()
}

#[async_trait]
impl AuthorityRepository for InMemoryAuthorityRepository {
    async fn get_host_by_id(&self, host_id: &str) -> Result<Option<HostDescriptor>, RepositoryError> {
        Ok(self.records.read().hosts.get(host_id).cloned())
    }

    async fn get_agents_for_host_by_id(&self, host_id: &str) -> Result<Vec<AgentRecord>, RepositoryError> {
        let records = self.records.read();
        let mut agents: Vec<AgentRecord> = records
            .agents
            .values()
            .filter(|a| a.host_id.as_deref() == Some(host_id))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn get_host_id_for_agent_by_id(&self, agent_id: &str) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .records
            .read()
            .agents
            .get(agent_id)
            .and_then(|a| a.host_id.clone()))
    }

    async fn sync_plugins_for_host_by_id(
        &self,
        host_id: &str,
        plugins: &[Plugin],
    ) -> Result<Vec<Plugin>, RepositoryError> {
        let mut records = self.records.write();
        if !records.hosts.contains_key(host_id) {
            return Err(RepositoryError::NotFound(format!("host {host_id}")));
        }
        let previous = records.plugins.get(host_id).cloned().unwrap_or_default();
        let issued = issue_plugin_ids(&previous, plugins);
        debug!(host_id = %host_id, count = issued.len(), "Synced host plugins");
        records.plugins.insert(host_id.to_string(), issued.clone());
        Ok(issued)
    }

    async fn get_credential_for_agent_by_name(
        &self,
        agent_id: &str,
        name: &str,
    ) -> Result<Option<String>, RepositoryError> {
        let credential = self
            .records
            .read()
            .credentials
            .get(&(agent_id.to_string(), name.to_string()))
            .filter(|c| c.status == CredentialStatus::Active)
            .cloned();
        match credential {
            Some(credential) => resolve_env_reference(&credential.value)
                .map(Some)
                .map_err(|e| RepositoryError::Storage(e.to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RelationshipVerifier for InMemoryAuthorityRepository {
    async fn verify_host_source_target(
        &self,
        host_id: &str,
        source: Option<&str>,
        target: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        if source.is_none() && target.is_none() {
            return Ok(false);
        }
        Ok(source.map_or(true, |s| self.owns(host_id, s)) && target.map_or(true, |t| self.owns(host_id, t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plugin::Function;
    use std::io::Write;

    fn repository() -> InMemoryAuthorityRepository {
        let repository = InMemoryAuthorityRepository::new();
        repository.insert_host(HostDescriptor::new("h1", "one"));
        repository.insert_host(HostDescriptor::new("h2", "two"));
        repository.insert_agent(AgentRecord::new("ag1", "a").on_host("h1"));
        repository.insert_agent(AgentRecord::new("ag2", "b").on_host("h1"));
        repository.insert_agent(AgentRecord::new("ag3", "c").on_host("h2"));
        repository
    }

    #[tokio::test]
    async fn test_relationships() {
        let repository = repository();
        assert!(repository.verify_host_source_target("h1", Some("ag1"), Some("ag2")).await.unwrap());
        assert!(repository.verify_host_source_target("h1", Some("ag1"), None).await.unwrap());
        assert!(repository.verify_host_source_target("h1", None, Some("ag2")).await.unwrap());
        assert!(!repository.verify_host_source_target("h1", Some("ag1"), Some("ag3")).await.unwrap());
        assert!(!repository.verify_host_source_target("h2", Some("ag1"), None).await.unwrap());
        assert!(!repository.verify_host_source_target("h1", None, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_agents_and_owner() {
        let repository = repository();
        let agents = repository.get_agents_for_host_by_id("h1").await.unwrap();
        assert_eq!(agents.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), ["ag1", "ag2"]);
        assert_eq!(
            repository.get_host_id_for_agent_by_id("ag3").await.unwrap().as_deref(),
            Some("h2")
        );
        assert_eq!(repository.get_host_id_for_agent_by_id("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_only_active_credentials_served() {
        let repository = repository();
        repository.insert_credential(CredentialRecord {
            agent_id: "ag1".to_string(),
            name: "OpenAI".to_string(),
            value: "sk-1".to_string(),
            status: CredentialStatus::Active,
        });
        repository.insert_credential(CredentialRecord {
            agent_id: "ag1".to_string(),
            name: "Legacy".to_string(),
            value: "old".to_string(),
            status: CredentialStatus::Revoked,
        });

        assert_eq!(
            repository.get_credential_for_agent_by_name("ag1", "OpenAI").await.unwrap().as_deref(),
            Some("sk-1")
        );
        assert_eq!(repository.get_credential_for_agent_by_name("ag1", "Legacy").await.unwrap(), None);
        assert_eq!(repository.get_credential_for_agent_by_name("ag2", "OpenAI").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_plugin_ids_are_stable() {
        let repository = repository();
        let declared = vec![Plugin::new("search").with_function(Function::new("query"))];

        let first = repository.sync_plugins_for_host_by_id("h1", &declared).await.unwrap();
        let plugin_id = first[0].id.clone().unwrap();
        let function_id = first[0].functions[0].id.clone().unwrap();

        let declared = vec![Plugin::new("search")
            .with_function(Function::new("query"))
            .with_function(Function::new("fetch"))];
        let second = repository.sync_plugins_for_host_by_id("h1", &declared).await.unwrap();
        assert_eq!(second[0].id.as_deref(), Some(plugin_id.as_str()));
        assert_eq!(second[0].function("query").unwrap().id.as_deref(), Some(function_id.as_str()));
        assert!(second[0].function("fetch").unwrap().id.is_some());

        assert!(matches!(
            repository.sync_plugins_for_host_by_id("unknown", &declared).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_records_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
hosts:
  - id: h1
    name: Worker
agents:
  - id: ag1
    name: Researcher
    host_id: h1
credentials:
  - agent_id: ag1
    name: OpenAI
    value: sk-file
"#
        )
        .unwrap();

        let repository = InMemoryAuthorityRepository::from_yaml_file(file.path()).unwrap();
        assert!(repository.get_host_by_id("h1").await.unwrap().is_some());
        assert!(repository.verify_host_source_target("h1", Some("ag1"), None).await.unwrap());
        assert_eq!(
            repository.get_credential_for_agent_by_name("ag1", "OpenAI").await.unwrap().as_deref(),
            Some("sk-file")
        );
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStartCompletion {
    #[default]
    Idle,
    Restart,
}

/// Named raw channel an agent listens on (`connect/{name}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTopic {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Agent record as stored by the Authority and sent in `host_welcome` /
/// `agent_connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default)]
    pub topics: Vec<AgentTopic>,
    /// Plugin ids (or names, before reconciliation) available to the agent.
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executive_function_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_start_function_id: Option<String>,
    #[serde(default)]
    pub on_auto_start_function_complete: AutoStartCompletion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            persona: None,
            topics: Vec::new(),
            plugins: Vec::new(),
            is_enabled: true,
            executive_function_id: None,
            auto_start_function_id: None,
            on_auto_start_function_complete: AutoStartCompletion::default(),
            host_id: None,
        }
    }

    pub fn on_host(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn with_topic(mut self, name: impl Into<String>) -> Self {
        self.topics.push(AgentTopic {
            name: name.into(),
            description: None,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_record_defaults() {
        let record: AgentRecord = serde_json::from_str(r#"{"id":"ag1","name":"Researcher"}"#).unwrap();
        assert!(record.is_enabled);
        assert!(record.topics.is_empty());
        assert_eq!(record.on_auto_start_function_complete, AutoStartCompletion::Idle);
    }
}

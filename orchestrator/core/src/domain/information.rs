// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Information records carried by INFORMATION messages.
//!
//! An `Information` is a unit of work flowing between agents: an input, an
//! output, the agents that produced each, and a link to the record it was
//! derived from. Records form a DAG tracked by [`crate::domain::history::History`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::data::Data;

/// `base64url(SHA-256(random 128-bit value))`, unpadded.
pub fn generate_information_id() -> String {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Information {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Data>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Data>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
}

impl Information {
    pub fn new(parent_id: Option<String>) -> Self {
        Self::with_id(generate_information_id(), parent_id)
    }

    pub fn with_id(id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            parent_id,
            input: None,
            input_agent_id: None,
            input_timestamp: None,
            output: None,
            output_agent_id: None,
            output_timestamp: None,
            function_id: None,
        }
    }

    /// Derive a child record whose parent is `self`.
    pub fn child(&self) -> Self {
        Self::new(Some(self.id.clone()))
    }

    pub fn set_input(&mut self, input: Data, agent_id: impl Into<String>, timestamp: impl Into<String>) {
        self.input = Some(input);
        self.input_agent_id = Some(agent_id.into());
        self.input_timestamp = Some(timestamp.into());
    }

    pub fn set_output(&mut self, output: Data, agent_id: impl Into<String>, timestamp: impl Into<String>) {
        self.output = Some(output);
        self.output_agent_id = Some(agent_id.into());
        self.output_timestamp = Some(timestamp.into());
    }

    /// Copy every populated field of `other` onto `self`; `id` is kept.
    pub fn merge_from(&mut self, other: &Information) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field.clone(); })*
            };
        }
        take!(
            parent_id,
            input,
            input_agent_id,
            input_timestamp,
            output,
            output_agent_id,
            output_timestamp,
            function_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unpadded_sha256_base64url() {
        let id = generate_information_id();
        assert_eq!(id.len(), 43);
        assert!(!id.contains('=') && !id.contains('+') && !id.contains('/'));
        assert_ne!(id, generate_information_id());
    }

    #[test]
    fn test_child_links_parent() {
        let root = Information::new(None);
        let child = root.child();
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    }

    #[test]
    fn test_merge_keeps_existing_fields() {
        let mut base = Information::with_id("i1", None);
        base.set_input(Data::new().with("q", "hi"), "ag1", "2026-01-01T00:00:00.000");

        let mut update = Information::with_id("i1", None);
        update.set_output(Data::new().with("a", "hello"), "ag2", "2026-01-01T00:00:01.000");

        base.merge_from(&update);
        assert_eq!(base.input_agent_id.as_deref(), Some("ag1"));
        assert_eq!(base.output_agent_id.as_deref(), Some("ag2"));
    }

    #[test]
    fn test_json_omits_empty_fields() {
        let info = Information::with_id("i1", None);
        assert_eq!(serde_json::to_string(&info).unwrap(), r#"{"id":"i1"}"#);
    }
}

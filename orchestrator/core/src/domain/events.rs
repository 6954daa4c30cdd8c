// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Control Events
//!
//! Typed view of the EVENT payloads exchanged by the Authority, Hosts and
//! Agents. On the wire each event is a flat [`Data`] map with a `type`
//! discriminator; nested values (host, agents, plugins, jwk) are JSON text.
//!
//! | `type` | Direction |
//! |--------|-----------|
//! | `host_connect` | Host → Authority |
//! | `host_welcome` | Authority → Host |
//! | `agent_connect` / `agent_disconnect` | Agent → Authority → Host |
//! | `credential_request` | Agent → Authority |
//! | `credential_response` | Authority → Agent |

use thiserror::Error;

use crate::domain::agent::AgentRecord;
use crate::domain::credential::PublicJwk;
use crate::domain::data::Data;
use crate::domain::host::HostDescriptor;
use crate::domain::plugin::Plugin;

pub const HOST_CONNECT: &str = "host_connect";
pub const HOST_WELCOME: &str = "host_welcome";
pub const AGENT_CONNECT: &str = "agent_connect";
pub const AGENT_DISCONNECT: &str = "agent_disconnect";
pub const CREDENTIAL_REQUEST: &str = "credential_request";
pub const CREDENTIAL_RESPONSE: &str = "credential_response";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event has no 'type' field")]
    MissingType,

    #[error("Event '{event}' is missing field '{field}'")]
    MissingField { event: String, field: &'static str },

    #[error("Event '{event}' has invalid field '{field}': {source}")]
    InvalidField {
        event: String,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    HostConnect {
        timestamp: String,
        host: HostDescriptor,
    },
    HostWelcome {
        timestamp: String,
        host: HostDescriptor,
        plugins: Vec<Plugin>,
        agents: Vec<AgentRecord>,
    },
    AgentConnect {
        timestamp: String,
        agent: AgentRecord,
    },
    AgentDisconnect {
        timestamp: String,
        agent_id: String,
    },
    CredentialRequest {
        agent_id: String,
        credential_name: String,
        jwk: PublicJwk,
    },
    CredentialResponse {
        credential_name: String,
        encrypted_credential: String,
        key_id: Option<String>,
    },
}

impl ControlEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HostConnect { .. } => HOST_CONNECT,
            Self::HostWelcome { .. } => HOST_WELCOME,
            Self::AgentConnect { .. } => AGENT_CONNECT,
            Self::AgentDisconnect { .. } => AGENT_DISCONNECT,
            Self::CredentialRequest { .. } => CREDENTIAL_REQUEST,
            Self::CredentialResponse { .. } => CREDENTIAL_RESPONSE,
        }
    }

    pub fn to_data(&self) -> Result<Data, EventError> {
        let data = Data::new().with("type", self.kind());
        let data = match self {
            Self::HostConnect { timestamp, host } => data.with("timestamp", timestamp).with_json("host", host)?,
            Self::HostWelcome {
                timestamp,
                host,
                plugins,
                agents,
            } => data
                .with("timestamp", timestamp)
                .with_json("host", host)?
                .with_json("plugins", plugins)?
                .with_json("agents", agents)?,
            Self::AgentConnect { timestamp, agent } => data.with("timestamp", timestamp).with_json("agent", agent)?,
            Self::AgentDisconnect { timestamp, agent_id } => {
                data.with("timestamp", timestamp).with("agent_id", agent_id)
            }
            Self::CredentialRequest {
                agent_id,
                credential_name,
                jwk,
            } => data
                .with("agent_id", agent_id)
                .with("credential_name", credential_name)
                .with_json("jwk", jwk)?,
            Self::CredentialResponse {
                credential_name,
                encrypted_credential,
                key_id,
            } => {
                let data = data
                    .with("credential_name", credential_name)
                    .with("encrypted_credential", encrypted_credential);
                match key_id {
                    Some(key_id) => data.with("key_id", key_id),
                    None => data,
                }
            }
        };
        Ok(data)
    }

    /// Decode a payload. `Ok(None)` for event types this module does not
    /// know, which callers ignore.
    pub fn from_data(data: &Data) -> Result<Option<Self>, EventError> {
        let kind = data.get("type").ok_or(EventError::MissingType)?;
        let reader = Reader { data, kind };

        let event = match kind {
            HOST_CONNECT => Self::HostConnect {
                timestamp: reader.string("timestamp")?,
                host: reader.json("host")?,
            },
            HOST_WELCOME => Self::HostWelcome {
                timestamp: reader.string("timestamp")?,
                host: reader.json("host")?,
                plugins: reader.json_or_default("plugins")?,
                agents: reader.json_or_default("agents")?,
            },
            AGENT_CONNECT => Self::AgentConnect {
                timestamp: reader.string("timestamp")?,
                agent: reader.json("agent")?,
            },
            AGENT_DISCONNECT => Self::AgentDisconnect {
                timestamp: reader.string("timestamp")?,
                agent_id: reader.string("agent_id")?,
            },
            CREDENTIAL_REQUEST => Self::CredentialRequest {
                agent_id: reader.string("agent_id")?,
                credential_name: reader.string("credential_name")?,
                jwk: reader.json("jwk")?,
            },
            CREDENTIAL_RESPONSE => Self::CredentialResponse {
                credential_name: reader.string("credential_name")?,
                encrypted_credential: reader.string("encrypted_credential")?,
                key_id: data.get("key_id").map(str::to_string),
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

struct Reader<'a> {
    data: &'a Data,
    kind: &'a str,
}

impl Reader<'_> {
    fn string(&self, field: &'static str) -> Result<String, EventError> {
        self.data
            .get(field)
            .map(str::to_string)
            .ok_or_else(|| EventError::MissingField {
                event: self.kind.to_string(),
                field,
            })
    }

    fn json<T: serde::de::DeserializeOwned>(&self, field: &'static str) -> Result<T, EventError> {
        let raw = self.string(field)?;
        serde_json::from_str(&raw).map_err(|source| EventError::InvalidField {
            event: self.kind.to_string(),
            field,
            source,
        })
    }

    fn json_or_default<T: serde::de::DeserializeOwned + Default>(&self, field: &'static str) -> Result<T, EventError> {
        if self.data.contains_key(field) {
            self.json(field)
        } else {
            Ok(T::default())
        }
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Broker Message Envelope
//!
//! `{type, topic, payload}` wrapper for all bus traffic. The message type is
//! carried as the `message.type` transport property; the payload is the
//! canonical JSON of a [`Data`] map (EVENT, CONTEXT) or an [`Information`]
//! record (INFORMATION).
//!
//! `sender_id` and `destination` are computed from the wire topic on every
//! call so they always agree with what the subscriber actually received.
//!
//! # Architecture
//!
//! - **Layer:** Domain
//! - **Purpose:** Envelope marshaling shared by `Broker` and its callers

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::data::Data;
use crate::domain::events::{ControlEvent, EventError};
use crate::domain::information::Information;
use crate::domain::topic::{TopicAddress, CONNECT_PREFIX, EVENT_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerMessageType {
    Event,
    Information,
    Context,
    Unknown,
}

impl BrokerMessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "EVENT",
            Self::Information => "INFORMATION",
            Self::Context => "CONTEXT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_property(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_uppercase).as_deref() {
            Some("EVENT") => Self::Event,
            Some("INFORMATION") => Self::Information,
            Some("CONTEXT") => Self::Context,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for BrokerMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Data(Data),
    Information(Information),
    /// Unknown message types keep their bytes as text.
    Raw(String),
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Malformed {message_type} payload: {source}")]
    Malformed {
        message_type: BrokerMessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub message_type: BrokerMessageType,
    /// Wire topic exactly as published or received.
    pub topic: String,
    pub payload: Payload,
}

impl BrokerMessage {
    pub fn event(topic: &TopicAddress, data: Data) -> Self {
        Self {
            message_type: BrokerMessageType::Event,
            topic: topic.render(),
            payload: Payload::Data(data),
        }
    }

    pub fn control(topic: &TopicAddress, event: &ControlEvent) -> Result<Self, EventError> {
        Ok(Self::event(topic, event.to_data()?))
    }

    pub fn information(topic: &TopicAddress, information: Information) -> Self {
        Self {
            message_type: BrokerMessageType::Information,
            topic: topic.render(),
            payload: Payload::Information(information),
        }
    }

    /// Message on a `connect/` pass-through channel.
    pub fn raw(topic: impl Into<String>, message_type: BrokerMessageType, payload: Payload) -> Self {
        Self {
            message_type,
            topic: topic.into(),
            payload,
        }
    }

    fn event_segments(&self) -> Option<(&str, &str)> {
        let body = self.topic.strip_prefix(EVENT_PREFIX)?;
        body.split_once('/')
    }

    /// First topic segment. `None` for pass-through (`connect/`) topics.
    pub fn sender_id(&self) -> Option<&str> {
        self.event_segments().map(|(sender, _)| sender)
    }

    /// Topic after the sender segment (`{authority}/{host}/{agent}`), or
    /// the channel name for pass-through topics.
    pub fn destination(&self) -> Option<&str> {
        match self.event_segments() {
            Some((_, destination)) => Some(destination),
            None => self.topic.strip_prefix(CONNECT_PREFIX),
        }
    }

    pub fn address(&self) -> Option<TopicAddress> {
        TopicAddress::parse(&self.topic).ok()
    }

    pub fn data(&self) -> Option<&Data> {
        match &self.payload {
            Payload::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn control_event(&self) -> Option<Result<Option<ControlEvent>, EventError>> {
        if self.message_type != BrokerMessageType::Event {
            return None;
        }
        self.data().map(ControlEvent::from_data)
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, MessageError> {
        let text = match &self.payload {
            Payload::Data(data) => data.raw(),
            Payload::Information(information) => serde_json::to_string(information)?,
            Payload::Raw(raw) => raw.clone(),
        };
        Ok(text.into_bytes())
    }

    pub fn decode(topic: impl Into<String>, message_type: BrokerMessageType, payload: Vec<u8>) -> Result<Self, MessageError> {
        let text = String::from_utf8(payload)?;
        let payload = match message_type {
            BrokerMessageType::Event | BrokerMessageType::Context => Payload::Data(
                Data::from_raw(&text).map_err(|source| MessageError::Malformed { message_type, source })?,
            ),
            BrokerMessageType::Information => Payload::Information(
                serde_json::from_str(&text).map_err(|source| MessageError::Malformed { message_type, source })?,
            ),
            BrokerMessageType::Unknown => Payload::Raw(text),
        };
        Ok(Self {
            message_type,
            topic: topic.into(),
            payload,
        })
    }
}

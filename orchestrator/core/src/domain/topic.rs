// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Topic Addressing
//!
//! Every message on the bus travels on a 4-segment topic:
//!
//! ```text
//! event/{sender}/{authority}/{host|-}/{agent|-}
//! ```
//!
//! `-` marks a segment that is not addressed (authority level), `0` addresses
//! every host at once, and `+` in the sender position is the subscription
//! wildcard used to receive traffic from any sender. Raw pass-through
//! channels use the `connect/{name}` prefix and bypass the scheme entirely.
//!
//! # Architecture
//!
//! - **Layer:** Domain
//! - **Purpose:** Build and parse topic strings shared by every principal
//! - **Consumers:** `Broker`, `AclEvaluator`, Authority/Host/Agent protocol

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const EVENT_PREFIX: &str = "event/";
pub const CONNECT_PREFIX: &str = "connect/";

/// Segment value for "not addressed" / authority self-reference.
pub const NONE_SEGMENT: &str = "-";
/// Segment value addressing every host.
pub const ALL_SEGMENT: &str = "0";
/// Single-level wildcard, only valid in the sender position of a subscription.
pub const SENDER_WILDCARD: &str = "+";
/// Reserved for access masks; never valid inside a topic.
pub const QUERY_SEGMENT: &str = "?";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Malformed mask: {0}")]
    MalformedMask(String),
}

/// Immutable `(sender, authority, host, agent)` address.
///
/// `host`/`agent` of `None` render as `-`. A sender equal to the authority
/// collapses to `-` at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicAddress {
    sender: String,
    authority: String,
    host: Option<String>,
    agent: Option<String>,
}

impl TopicAddress {
    pub fn new(
        sender: &str,
        authority: &str,
        host: Option<&str>,
        agent: Option<&str>,
    ) -> Result<Self, TopicError> {
        if sender.is_empty() {
            return Err(TopicError::InvalidTopic("sender id must not be empty".to_string()));
        }
        if authority.is_empty() {
            return Err(TopicError::InvalidTopic("authority id must not be empty".to_string()));
        }
        let sender = if sender == authority { NONE_SEGMENT } else { sender };
        Self::from_segments(sender, authority, host, agent)
    }

    /// Subscription form: sender replaced by the `+` wildcard.
    pub fn subscription(
        authority: &str,
        host: Option<&str>,
        agent: Option<&str>,
    ) -> Result<Self, TopicError> {
        if authority.is_empty() {
            return Err(TopicError::InvalidTopic("authority id must not be empty".to_string()));
        }
        Self::from_segments(SENDER_WILDCARD, authority, host, agent)
    }

    fn from_segments(
        sender: &str,
        authority: &str,
        host: Option<&str>,
        agent: Option<&str>,
    ) -> Result<Self, TopicError> {
        validate_segment("sender", sender, true)?;
        validate_segment("authority", authority, false)?;
        if matches!(authority, NONE_SEGMENT | ALL_SEGMENT) {
            return Err(TopicError::InvalidTopic(format!(
                "authority segment cannot be the reserved token '{authority}'"
            )));
        }
        let host = normalize(host);
        let agent = normalize(agent);
        if let Some(h) = host {
            validate_segment("host", h, false)?;
        }
        if let Some(a) = agent {
            validate_segment("agent", a, false)?;
        }

        Ok(Self {
            sender: sender.to_string(),
            authority: authority.to_string(),
            host: host.map(str::to_string),
            agent: agent.map(str::to_string),
        })
    }

    /// Parse a rendered topic. The `event/` prefix is optional; `connect/`
    /// topics are not addresses and are rejected.
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        if topic.starts_with(CONNECT_PREFIX) {
            return Err(TopicError::InvalidTopic(format!(
                "'{topic}' is a pass-through channel, not an address"
            )));
        }
        let body = topic.strip_prefix(EVENT_PREFIX).unwrap_or(topic);
        let segments: Vec<&str> = body.split('/').collect();
        if segments.len() != 4 {
            return Err(TopicError::InvalidTopic(format!(
                "'{topic}' has {} segments, expected 4",
                segments.len()
            )));
        }
        Self::from_segments(
            segments[0],
            segments[1],
            Some(segments[2]),
            Some(segments[3]),
        )
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn agent(&self) -> Option<&str> {
        self.agent.as_deref()
    }

    pub fn is_subscription(&self) -> bool {
        self.sender == SENDER_WILDCARD
    }

    /// `{authority}/{host|-}/{agent|-}`: the part of the topic after the sender.
    pub fn destination(&self) -> String {
        format!(
            "{}/{}/{}",
            self.authority,
            self.host.as_deref().unwrap_or(NONE_SEGMENT),
            self.agent.as_deref().unwrap_or(NONE_SEGMENT)
        )
    }

    pub fn render(&self) -> String {
        format!("{EVENT_PREFIX}{}/{}", self.sender, self.destination())
    }
}

impl fmt::Display for TopicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for TopicAddress {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn normalize(segment: Option<&str>) -> Option<&str> {
    segment.filter(|s| *s != NONE_SEGMENT)
}

fn validate_segment(name: &str, value: &str, sender: bool) -> Result<(), TopicError> {
    if value.trim().is_empty() {
        return Err(TopicError::InvalidTopic(format!("{name} segment is empty")));
    }
    if value.contains('/') || value.contains('#') {
        return Err(TopicError::InvalidTopic(format!(
            "{name} segment '{value}' contains a reserved character"
        )));
    }
    if value == QUERY_SEGMENT {
        return Err(TopicError::InvalidTopic(format!(
            "{name} segment cannot be the literal '?'"
        )));
    }
    if value.contains('+') && !(sender && value == SENDER_WILDCARD) {
        return Err(TopicError::InvalidTopic(format!(
            "{name} segment '{value}' contains a wildcard"
        )));
    }
    Ok(())
}

/// Topic builder bound to one principal (`sender_id`) under one authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicGenerator {
    authority_id: String,
    sender_id: String,
}

impl TopicGenerator {
    pub fn new(authority_id: impl Into<String>, sender_id: impl Into<String>) -> Result<Self, TopicError> {
        let authority_id = authority_id.into();
        let sender_id = sender_id.into();
        // Validates both ids once so later builders only check host/agent.
        TopicAddress::new(&sender_id, &authority_id, None, None)?;
        Ok(Self {
            authority_id,
            sender_id,
        })
    }

    /// Generator for the authority itself; its sender segment renders as `-`.
    pub fn for_authority(authority_id: impl Into<String>) -> Result<Self, TopicError> {
        let authority_id = authority_id.into();
        Self::new(authority_id.clone(), authority_id)
    }

    pub fn authority_id(&self) -> &str {
        &self.authority_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn connect_to(&self, name: &str) -> String {
        format!("{CONNECT_PREFIX}{name}")
    }

    pub fn publish_to(&self, host: Option<&str>, agent: Option<&str>) -> Result<TopicAddress, TopicError> {
        TopicAddress::new(&self.sender_id, &self.authority_id, host, agent)
    }

    pub fn subscribe_as(&self, host: Option<&str>, agent: Option<&str>) -> Result<TopicAddress, TopicError> {
        TopicAddress::subscription(&self.authority_id, host, agent)
    }

    pub fn publish_to_agent(&self, agent_id: &str) -> Result<TopicAddress, TopicError> {
        self.publish_to(None, Some(agent_id))
    }

    pub fn publish_to_host(&self, host_id: &str) -> Result<TopicAddress, TopicError> {
        self.publish_to(Some(host_id), None)
    }

    pub fn publish_to_authority(&self) -> Result<TopicAddress, TopicError> {
        self.publish_to(None, None)
    }

    pub fn publish_to_all_hosts(&self) -> Result<TopicAddress, TopicError> {
        self.publish_to(Some(ALL_SEGMENT), None)
    }

    pub fn subscribe_as_agent(&self) -> Result<TopicAddress, TopicError> {
        self.subscribe_as(None, Some(&self.sender_id))
    }

    pub fn subscribe_as_host(&self) -> Result<TopicAddress, TopicError> {
        self.subscribe_as(Some(&self.sender_id), None)
    }

    pub fn subscribe_as_all_hosts(&self) -> Result<TopicAddress, TopicError> {
        self.subscribe_as(Some(ALL_SEGMENT), None)
    }

    pub fn subscribe_as_authority(&self) -> Result<TopicAddress, TopicError> {
        self.subscribe_as(None, None)
    }
}

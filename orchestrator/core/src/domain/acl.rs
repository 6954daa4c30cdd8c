// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Access Masks
//!
//! Masks have the same 4-segment shape as a topic body and use reserved
//! tokens:
//!
//! | Token | Meaning |
//! |-------|---------|
//! | `0` | matches only the literal `0` (all hosts) |
//! | `-` | matches only the literal `-` |
//! | `*` | matches anything except `0` |
//! | `+` | matches anything |
//! | `?` | matches anything, pending a relationship check |
//!
//! Masks are derived from a principal's claims at evaluation time and are
//! never persisted. The async evaluation itself lives in
//! `crate::application::acl_evaluator`.
//!
//! # Architecture
//!
//! - **Layer:** Domain
//! - **Purpose:** Mask algebra and principal claims

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::domain::topic::{TopicError, ALL_SEGMENT, NONE_SEGMENT, QUERY_SEGMENT, SENDER_WILDCARD};

pub const ROLE_AUTHORITY: &str = "authority";
pub const ROLE_HOST: &str = "host";

const ANY_EXCLUSIVE: &str = "*";

/// Broker access codes, as sent by the broker's authorization plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Read,
    Write,
    /// Reserved; never granted.
    ReadWrite,
    Subscribe,
}

impl AccessType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::ReadWrite),
            4 => Some(Self::Subscribe),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Read => 1,
            Self::Write => 2,
            Self::ReadWrite => 3,
            Self::Subscribe => 4,
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read_write",
            Self::Subscribe => "subscribe",
        };
        f.write_str(name)
    }
}

impl FromStr for AccessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "1" => Ok(Self::Read),
            "write" | "2" => Ok(Self::Write),
            "read_write" | "readwrite" | "3" => Ok(Self::ReadWrite),
            "subscribe" | "4" => Ok(Self::Subscribe),
            other => Err(format!("unknown access type '{other}'")),
        }
    }
}

/// Authenticated claims of the principal performing an action.
///
/// Built by the auth layer (bearer token, broker session) and passed
/// explicitly into every check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub principal_id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    pub authority_id: String,
    #[serde(default)]
    pub host_id: Option<String>,
}

impl Claims {
    pub fn authority(authority_id: impl Into<String>) -> Self {
        let authority_id = authority_id.into();
        Self {
            principal_id: authority_id.clone(),
            roles: BTreeSet::from([ROLE_AUTHORITY.to_string()]),
            authority_id,
            host_id: None,
        }
    }

    pub fn host(authority_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        let host_id = host_id.into();
        Self {
            principal_id: host_id.clone(),
            roles: BTreeSet::from([ROLE_HOST.to_string()]),
            authority_id: authority_id.into(),
            host_id: Some(host_id),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Per-action authorization decision as seen by a broker.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// `access_code` is the raw broker code; unknown codes are denied.
    async fn permits(&self, topic: &str, access_code: u8, claims: &Claims) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MaskSegment {
    All,
    None,
    AnyExclusive,
    AnyInclusive,
    Query,
    Literal(String),
}

impl MaskSegment {
    fn parse(raw: &str) -> Self {
        match raw {
            ALL_SEGMENT => Self::All,
            NONE_SEGMENT => Self::None,
            ANY_EXCLUSIVE => Self::AnyExclusive,
            SENDER_WILDCARD => Self::AnyInclusive,
            QUERY_SEGMENT => Self::Query,
            other => Self::Literal(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Self::All => ALL_SEGMENT,
            Self::None => NONE_SEGMENT,
            Self::AnyExclusive => ANY_EXCLUSIVE,
            Self::AnyInclusive => SENDER_WILDCARD,
            Self::Query => QUERY_SEGMENT,
            Self::Literal(value) => value,
        }
    }

    /// Literal match of one topic segment. `?` never matches literally.
    pub fn matches(&self, segment: &str) -> bool {
        match self {
            Self::AnyInclusive => true,
            Self::AnyExclusive => segment != ALL_SEGMENT,
            Self::All => segment == ALL_SEGMENT,
            Self::None => segment == NONE_SEGMENT,
            Self::Query => false,
            Self::Literal(value) => value == segment,
        }
    }
}

/// Result of matching a topic against a query mask structurally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryMatch {
    /// Non-query segments do not fit the mask.
    NoMatch,
    /// Structurally impossible (self-write, `-` in a queried position).
    Deny,
    /// Authoritative answer requires the relationship check.
    Verify {
        source: Option<String>,
        target: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessMask {
    segments: [MaskSegment; 4],
}

impl AccessMask {
    pub fn segments(&self) -> &[MaskSegment; 4] {
        &self.segments
    }

    pub fn has_query(&self) -> bool {
        self.segments.iter().any(|s| *s == MaskSegment::Query)
    }

    /// Candidate masks for `access` derived from the principal's roles.
    ///
    /// Roles accumulate: a principal holding both roles gets both mask sets.
    pub fn for_principal(access: AccessType, claims: &Claims) -> Vec<AccessMask> {
        let authority = claims.authority_id.as_str();
        let mut patterns = Vec::new();

        if authority.is_empty() {
            return Vec::new();
        }

        if claims.has_role(ROLE_AUTHORITY) {
            match access {
                AccessType::Read | AccessType::Subscribe => {
                    patterns.push(format!("*/{authority}/-/-"));
                }
                AccessType::Write => {
                    patterns.push(format!("-/{authority}/+/+"));
                }
                AccessType::ReadWrite => {}
            }
        }

        if claims.has_role(ROLE_HOST) {
            if let Some(host) = claims.host_id.as_deref().filter(|h| !h.is_empty()) {
                match access {
                    AccessType::Read | AccessType::Subscribe => {
                        patterns.push(format!("-/{authority}/0/-"));
                        patterns.push(format!("-/{authority}/{host}/-"));
                        patterns.push(format!("-/{authority}/{host}/?"));
                        patterns.push(format!("*/{authority}/-/?"));
                    }
                    AccessType::Write => {
                        patterns.push(format!("{host}/{authority}/-/-"));
                        patterns.push(format!("?/{authority}/-/-"));
                        patterns.push(format!("?/{authority}/-/?"));
                    }
                    AccessType::ReadWrite => {}
                }
            }
        }

        patterns
            .iter()
            .filter_map(|p| p.parse::<AccessMask>().ok())
            .collect()
    }

    /// Literal match of a 4-segment topic body under `access`.
    pub fn matches_literal(&self, topic: &[&str; 4], access: AccessType) -> bool {
        if !sender_rule(&self.segments[0], topic[0], access) {
            return false;
        }
        self.segments[1..]
            .iter()
            .zip(topic[1..].iter())
            .all(|(mask, segment)| mask.matches(segment))
    }

    /// Query match: non-`?` segments must match literally, `?` segments
    /// yield the ids the relationship check must confirm.
    pub fn match_query(&self, topic: &[&str; 4], access: AccessType) -> QueryMatch {
        if !self.has_query() {
            return QueryMatch::NoMatch;
        }

        let sender_queried = self.segments[0] == MaskSegment::Query;
        if !sender_queried && !sender_rule(&self.segments[0], topic[0], access) {
            return QueryMatch::NoMatch;
        }
        for (mask, segment) in self.segments[1..].iter().zip(topic[1..].iter()) {
            if *mask != MaskSegment::Query && !mask.matches(segment) {
                return QueryMatch::NoMatch;
            }
        }

        let source = sender_queried.then(|| topic[0].to_string());
        let target = (self.segments[3] == MaskSegment::Query).then(|| topic[3].to_string());

        let is_none = |v: &Option<String>| v.as_deref() == Some(NONE_SEGMENT);
        if is_none(&source) || is_none(&target) {
            return QueryMatch::Deny;
        }
        if access == AccessType::Write && source.is_some() && source == target {
            return QueryMatch::Deny;
        }

        QueryMatch::Verify { source, target }
    }
}

/// Sender segment rule applied before the per-segment loop.
fn sender_rule(mask: &MaskSegment, sender: &str, access: AccessType) -> bool {
    match access {
        AccessType::Read => true,
        AccessType::Subscribe => sender == SENDER_WILDCARD,
        AccessType::Write => sender == mask.as_str(),
        AccessType::ReadWrite => false,
    }
}

impl FromStr for AccessMask {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(TopicError::MalformedMask(s.to_string()));
        }
        Ok(Self {
            segments: [
                MaskSegment::parse(parts[0]),
                MaskSegment::parse(parts[1]),
                MaskSegment::parse(parts[2]),
                MaskSegment::parse(parts[3]),
            ],
        })
    }
}

impl fmt::Display for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.segments.iter().map(MaskSegment::as_str).collect();
        f.write_str(&parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(s: &str) -> AccessMask {
        s.parse().unwrap()
    }

    #[test]
    fn test_access_codes() {
        assert_eq!(AccessType::from_code(1), Some(AccessType::Read));
        assert_eq!(AccessType::from_code(4), Some(AccessType::Subscribe));
        assert_eq!(AccessType::from_code(0), None);
        assert_eq!(AccessType::Write.code(), 2);
        assert_eq!("subscribe".parse::<AccessType>().unwrap(), AccessType::Subscribe);
    }

    #[test]
    fn test_mask_arity() {
        assert!(matches!("a/b/c".parse::<AccessMask>(), Err(TopicError::MalformedMask(_))));
        assert!("a/b/c/d/e".parse::<AccessMask>().is_err());
        assert!("a//c/d".parse::<AccessMask>().is_err());
        assert_eq!(mask("-/a/+/?").to_string(), "-/a/+/?");
    }

    #[test]
    fn test_segment_tokens() {
        assert!(MaskSegment::AnyInclusive.matches("0"));
        assert!(MaskSegment::AnyExclusive.matches("h1"));
        assert!(!MaskSegment::AnyExclusive.matches("0"));
        assert!(MaskSegment::All.matches("0"));
        assert!(!MaskSegment::All.matches("h1"));
        assert!(MaskSegment::None.matches("-"));
        assert!(!MaskSegment::None.matches("h1"));
        assert!(!MaskSegment::Query.matches("?"));
    }

    #[test]
    fn test_sender_rules() {
        let m = mask("h1/a/-/-");
        assert!(m.matches_literal(&["h1", "a", "-", "-"], AccessType::Write));
        assert!(!m.matches_literal(&["h2", "a", "-", "-"], AccessType::Write));
        assert!(m.matches_literal(&["h2", "a", "-", "-"], AccessType::Read));
        assert!(m.matches_literal(&["+", "a", "-", "-"], AccessType::Subscribe));
        assert!(!m.matches_literal(&["h1", "a", "-", "-"], AccessType::Subscribe));
    }

    #[test]
    fn test_query_extraction() {
        let m = mask("?/a/-/?");
        assert_eq!(
            m.match_query(&["ag1", "a", "-", "ag2"], AccessType::Write),
            QueryMatch::Verify {
                source: Some("ag1".to_string()),
                target: Some("ag2".to_string())
            }
        );
        assert_eq!(m.match_query(&["ag1", "a", "-", "ag1"], AccessType::Write), QueryMatch::Deny);
        assert_eq!(m.match_query(&["-", "a", "-", "ag1"], AccessType::Write), QueryMatch::Deny);
        assert_eq!(m.match_query(&["ag1", "a", "h1", "ag2"], AccessType::Write), QueryMatch::NoMatch);
        assert_eq!(mask("h1/a/-/-").match_query(&["h1", "a", "-", "-"], AccessType::Write), QueryMatch::NoMatch);
    }

    #[test]
    fn test_principal_masks() {
        let host = Claims::host("a", "h1");
        let read: Vec<String> = AccessMask::for_principal(AccessType::Read, &host)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(read, vec!["-/a/0/-", "-/a/h1/-", "-/a/h1/?", "*/a/-/?"]);

        let write: Vec<String> = AccessMask::for_principal(AccessType::Write, &host)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(write, vec!["h1/a/-/-", "?/a/-/-", "?/a/-/?"]);

        let authority = Claims::authority("a");
        assert_eq!(
            AccessMask::for_principal(AccessType::Write, &authority)[0].to_string(),
            "-/a/+/+"
        );
        assert!(AccessMask::for_principal(AccessType::ReadWrite, &authority).is_empty());

        let mut orphan = Claims::host("a", "h1");
        orphan.host_id = None;
        assert!(AccessMask::for_principal(AccessType::Read, &orphan).is_empty());
    }
}

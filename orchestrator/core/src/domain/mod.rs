// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Topic addressing, access masks, message envelopes and the records the
//! Authority, Hosts and Agents exchange.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and algorithms with no I/O

pub mod acl;
pub mod agent;
pub mod credential;
pub mod data;
pub mod events;
pub mod history;
pub mod host;
pub mod information;
pub mod message;
pub mod node_config;
pub mod plugin;
pub mod repository;
pub mod topic;

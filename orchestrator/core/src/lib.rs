// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agora Core
//!
//! Control plane of the agora agent mesh: hierarchical topic addressing, the
//! broker ACL evaluator, a clock-synchronized broker client, the
//! Authority/Host/Agent connection protocol and the encrypted credential relay.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain types, protocol services, transports and the broker ACL hook

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;

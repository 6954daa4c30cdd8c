// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`agora-core`)
//!
//! HTTP surface consumed by the message broker. Token checks and ACL
//! decisions are delegated to [`crate::application::AclEvaluator`].
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`acl_hook`] | HTTP (Axum) | Connect and topic ACL checks for the broker auth plugin |

pub mod acl_hook;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod acl_evaluator;
pub mod agent;
pub mod authority;
pub mod credential_relay;
pub mod error;
pub mod host;

pub use acl_evaluator::AclEvaluator;
pub use agent::Agent;
pub use authority::Authority;
pub use credential_relay::{CredentialError, CredentialRelay};
pub use error::ConnectionError;
pub use host::{Host, HostSettings, HostState};

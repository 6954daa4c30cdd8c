// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the agora CLI

pub mod acl;
pub mod config;
pub mod host;
pub mod topic;

pub use self::acl::AclCommand;
pub use self::config::ConfigCommand;
pub use self::host::HostCommand;
pub use self::topic::TopicCommand;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use thiserror::Error;

use crate::domain::events::EventError;
use crate::domain::repository::RepositoryError;
use crate::domain::topic::TopicError;
use crate::infrastructure::broker::BrokerError;
use crate::infrastructure::clock::ClockError;
use crate::infrastructure::crypto::CryptoError;
use crate::infrastructure::discovery::{DiscoveryError, TokenError};

/// Failure of a step in the Authority/Host/Agent connection protocol.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("Invalid node configuration: {0}")]
    Configuration(String),

    #[error("Connect cancelled")]
    Cancelled,
}

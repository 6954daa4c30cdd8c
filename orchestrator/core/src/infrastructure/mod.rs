// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod broker;
pub mod clock;
pub mod crypto;
pub mod discovery;
pub mod repositories;
pub mod transport;

pub use broker::{Broker, BrokerError, BrokerState, Subscription};
pub use clock::{Clock, ClockError};
pub use repositories::InMemoryAuthorityRepository;
pub use transport::{InMemoryBus, Transport, TransportMessage};

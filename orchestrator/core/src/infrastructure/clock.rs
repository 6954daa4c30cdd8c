// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Network Clock
//!
//! Network-time-disciplined clock used to stamp outgoing control events.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Time source failover, offset tracking, periodic resync
//! - **States:** `Uninitialized → Syncing → Synced → (periodic) Syncing`
//!
//! Sync walks the pool starting from the last good source. A failing source
//! advances to the next one immediately; only a full cycle of failures
//! triggers a backoff (1s, doubling, capped) before the next cycle.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::node_config::ClockConfig;

pub const NTP_POOL_SUFFIX: &str = "pool.ntp.org";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

const NTP_PORT: u16 = 123;
/// Seconds between 1900-01-01 (NTP era 0) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("Clock has not been synchronized")]
    NotSynchronized,

    #[error("Invalid time source '{0}': must end with 'pool.ntp.org'")]
    InvalidTimeSource(String),

    #[error("Time query to '{host}' failed: {reason}")]
    Query { host: String, reason: String },
}

/// One network time query.
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn query(&self, host: &str) -> Result<DateTime<Utc>, ClockError>;
}

/// Minimal SNTP (RFC 4330) client.
pub struct SntpTimeSource {
    timeout: Duration,
}

impl SntpTimeSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(host: &str) -> std::io::Result<[u8; 48]> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, NTP_PORT)).await?;

        let mut request = [0u8; 48];
        // LI = 0, VN = 3, Mode = 3 (client)
        request[0] = 0x1B;
        socket.send(&request).await?;

        let mut response = [0u8; 48];
        let read = socket.recv(&mut response).await?;
        if read < 48 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("short SNTP response ({read} bytes)"),
            ));
        }
        Ok(response)
    }
}

impl Default for SntpTimeSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl TimeSource for SntpTimeSource {
    async fn query(&self, host: &str) -> Result<DateTime<Utc>, ClockError> {
        let failed = |reason: String| ClockError::Query {
            host: host.to_string(),
            reason,
        };

        let response = tokio::time::timeout(self.timeout, Self::exchange(host))
            .await
            .map_err(|_| failed("timed out".to_string()))?
            .map_err(|e| failed(e.to_string()))?;

        parse_transmit_timestamp(&response).ok_or_else(|| failed("invalid transmit timestamp".to_string()))
    }
}

/// Transmit timestamp (bytes 40..48) of an SNTP response.
fn parse_transmit_timestamp(packet: &[u8; 48]) -> Option<DateTime<Utc>> {
    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]) as u64;
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]) as u64;
    if seconds < NTP_UNIX_OFFSET {
        return None;
    }
    let nanos = (fraction * 1_000_000_000) >> 32;
    Utc.timestamp_opt((seconds - NTP_UNIX_OFFSET) as i64, nanos as u32).single()
}

/// Trusts the local system clock. For offline nodes and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

#[async_trait]
impl TimeSource for SystemTimeSource {
    async fn query(&self, _host: &str) -> Result<DateTime<Utc>, ClockError> {
        Ok(Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockPhase {
    Uninitialized,
    Syncing,
    Synced,
}

#[derive(Debug)]
struct ClockState {
    phase: ClockPhase,
    active_index: usize,
    offset: Option<chrono::Duration>,
    last_sync: Option<DateTime<Utc>>,
}

pub struct Clock {
    pool: Vec<String>,
    source: Arc<dyn TimeSource>,
    max_backoff: Duration,
    state: RwLock<ClockState>,
}

impl Clock {
    pub fn default_pool() -> Vec<String> {
        ["", "north-america.", "europe.", "asia.", "south-america.", "africa.", "oceania."]
            .iter()
            .map(|region| format!("{region}{NTP_POOL_SUFFIX}"))
            .collect()
    }

    /// `custom_host` replaces the whole pool and must end with `pool.ntp.org`.
    pub fn new(
        custom_host: Option<&str>,
        source: Arc<dyn TimeSource>,
        max_backoff: Duration,
    ) -> Result<Self, ClockError> {
        let pool = match custom_host {
            Some(host) if host.ends_with(NTP_POOL_SUFFIX) => vec![host.to_string()],
            Some(host) => return Err(ClockError::InvalidTimeSource(host.to_string())),
            None => Self::default_pool(),
        };
        Ok(Self {
            pool,
            source,
            max_backoff,
            state: RwLock::new(ClockState {
                phase: ClockPhase::Uninitialized,
                active_index: 0,
                offset: None,
                last_sync: None,
            }),
        })
    }

    /// SNTP-backed clock tuned by `spec.clock`.
    pub fn from_config(config: &ClockConfig) -> Result<Self, ClockError> {
        Self::new(
            config.custom_ntp_host.as_deref(),
            Arc::new(SntpTimeSource::new(config.query_timeout())),
            config.max_backoff(),
        )
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    pub fn phase(&self) -> ClockPhase {
        self.state.read().phase
    }

    pub fn active_source(&self) -> &str {
        &self.pool[self.state.read().active_index]
    }

    pub fn is_synchronized(&self) -> bool {
        self.state.read().offset.is_some()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_sync
    }

    pub fn now(&self) -> Result<DateTime<Utc>, ClockError> {
        let offset = self.state.read().offset.ok_or(ClockError::NotSynchronized)?;
        Ok(Utc::now() + offset)
    }

    /// `yyyy-MM-ddTHH:mm:ss.fff` in UTC.
    pub fn timestamp(&self) -> Result<String, ClockError> {
        Ok(self.now()?.format(TIMESTAMP_FORMAT).to_string())
    }

    /// One pass over the pool starting at the active source. Returns the
    /// last query error if every source failed.
    pub async fn try_sync_once(&self) -> Result<(), ClockError> {
        let start = {
            let mut state = self.state.write();
            state.phase = ClockPhase::Syncing;
            state.active_index
        };

        let mut last_error = ClockError::NotSynchronized;
        for step in 0..self.pool.len() {
            let index = (start + step) % self.pool.len();
            let host = &self.pool[index];
            let sent_at = Utc::now();
            match self.source.query(host).await {
                Ok(remote) => {
                    let received_at = Utc::now();
                    let midpoint = sent_at + (received_at - sent_at) / 2;
                    let offset = remote - midpoint;
                    let mut state = self.state.write();
                    state.phase = ClockPhase::Synced;
                    state.active_index = index;
                    state.offset = Some(offset);
                    state.last_sync = Some(received_at);
                    debug!(source = %host, offset_ms = offset.num_milliseconds(), "Clock synchronized");
                    return Ok(());
                }
                Err(e) => {
                    warn!(source = %host, error = %e, "Time source failed, advancing to next");
                    last_error = e;
                }
            }
        }

        let mut state = self.state.write();
        state.active_index = (start + 1) % self.pool.len();
        if state.offset.is_some() {
            state.phase = ClockPhase::Synced;
        }
        Err(last_error)
    }

    /// Sync until success or cancellation, backing off between full cycles.
    pub async fn start_sync(&self, cancel: &CancellationToken) -> Result<(), ClockError> {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.try_sync_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "All time sources failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }

    /// Keep the clock synchronized until `cancel` fires. An unsynchronized
    /// clock is synced right away with backoff; a synced one every `interval`.
    pub fn spawn_resync(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let clock = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if clock.is_synchronized() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                match clock.start_sync(&cancel).await {
                    Ok(()) => info!(source = %clock.active_source(), "Clock resynchronized"),
                    Err(e) => {
                        debug!(error = %e, "Clock resync cancelled");
                        break;
                    }
                }
            }
        })
    }
}

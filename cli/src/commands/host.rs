// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host diagnostics
//!
//! Commands: check

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use agora_core::domain::node_config::{ClockConfig, NodeConfig};
use agora_core::infrastructure::clock::Clock;
use agora_core::infrastructure::discovery::{AuthorityDiscovery, TokenClient};

#[derive(Subcommand)]
pub enum HostCommand {
    /// Resolve authority endpoints and request a host token
    Check {
        /// Skip the token request
        #[arg(long)]
        discovery_only: bool,

        /// Also query the configured time sources
        #[arg(long)]
        clock: bool,
    },
}

pub async fn handle_command(command: HostCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        HostCommand::Check { discovery_only, clock } => check(config_path, discovery_only, clock).await,
    }
}

async fn check_clock(config: &ClockConfig) -> Result<()> {
    let clock = Clock::from_config(config).context("Invalid clock configuration")?;
    println!("{}", "Clock:".bold());
    match clock.try_sync_once().await {
        Ok(()) => {
            println!("  Source: {}", clock.active_source());
            println!("  Time: {}", clock.timestamp()?);
        }
        Err(e) => println!("  {}", format!("✗ No time source answered: {}", e).red()),
    }
    println!();
    Ok(())
}

async fn check(config_path: Option<PathBuf>, discovery_only: bool, clock: bool) -> Result<()> {
    let config = NodeConfig::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    if clock {
        check_clock(&config.spec.clock).await?;
    }

    let discovery = AuthorityDiscovery::from_config(&config.spec.authority, &config.spec.retry)
        .context("Invalid authority configuration")?;

    println!("{}", "Authority:".bold());
    println!("  ID: {}", discovery.authority_id());
    println!("  URI: {}", config.spec.authority.uri);

    let document = discovery
        .initialize()
        .await
        .context("Authority discovery failed")?;
    println!("  Broker: {}", document.broker_uri);
    println!("  Token endpoint: {}", document.token_endpoint);
    if let Some(files) = &document.files_uri {
        println!("  Files: {}", files);
    }
    println!();

    if discovery_only {
        return Ok(());
    }

    let host = config
        .spec
        .host
        .as_ref()
        .context("spec.host is required to request a host token")?;
    let secret = host.resolve_secret()?;

    let token = TokenClient::new()
        .client_credentials(&document.token_endpoint, &host.id, &secret)
        .await
        .with_context(|| format!("Token request for host '{}' failed", host.id))?;

    println!(
        "{}",
        format!("✓ Host '{}' obtained a {} token", host.id, token.token_type).green()
    );
    if let Some(expires_in) = token.expires_in {
        println!("  Expires in: {}s", expires_in);
    }

    Ok(())
}

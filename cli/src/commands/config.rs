// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use agora_core::domain::node_config::NodeConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./agora-config.yaml)
        #[arg(short, long, default_value = "./agora-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfig::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. AGORA_CONFIG_PATH: {}",
            std::env::var("AGORA_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./agora-config.yaml");
        println!("  4. ~/.agora/config.yaml");
        println!("  5. /etc/agora/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Authority:".bold());
    println!("  URI: {}", config.spec.authority.uri);
    if let Ok(id) = config.authority_id() {
        println!("  ID: {}", id);
    }
    if let Some(internal) = &config.spec.authority.internal_uri {
        println!("  Internal URI: {}", internal);
    }
    if let Some(broker) = &config.spec.authority.broker_uri {
        println!("  Broker override: {}", broker);
    }
    println!();

    println!("{}", "Host:".bold());
    match &config.spec.host {
        Some(host) => {
            println!("  ID: {}", host.id);
            if !host.name.is_empty() {
                println!("  Name: {}", host.name);
            }
            let secret = if host.secret.starts_with("env:") {
                host.secret.clone()
            } else {
                "<redacted>".to_string()
            };
            println!("  Secret: {}", secret);
        }
        None => println!("  {}", "(not configured)".dimmed()),
    }
    println!();

    println!("{}", "Clock:".bold());
    println!(
        "  Time source: {}",
        config
            .spec
            .clock
            .custom_ntp_host
            .as_deref()
            .unwrap_or("pool.ntp.org (regional pool)")
    );
    println!("  Resync interval: {}s", config.spec.clock.resync_interval_secs);
    println!();

    println!("{}", "Timeouts:".bold());
    println!("  Broker connect: {}s", config.spec.broker.connect_timeout_secs);
    println!("  Connect retry delay: {}s", config.spec.retry.connect_retry_delay_secs);
    println!("  Discovery max backoff: {}s", config.spec.retry.discovery_max_backoff_secs);
    println!("  Credential request: {}s", config.spec.credentials.request_timeout_secs);
    println!();

    if let Some(hook) = &config.spec.acl_hook {
        println!("{}", "ACL Hook:".bold());
        println!("  Bind: {}", hook.bind);
        println!("  Issuer: {}", hook.issuer);
        println!("  Audience: {}", hook.audience);
        if let Some(records) = &hook.records_path {
            println!("  Records: {}", records.display());
        }
        println!();
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfig::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # agora CLI
//!
//! Operator tooling for an agora control plane node.
//!
//! ## Commands
//!
//! - `agora host check` - Discover the authority and fetch a host token
//! - `agora acl check|serve` - Evaluate broker ACLs offline or serve the broker hook
//! - `agora topic render|parse` - Topic address helpers
//! - `agora config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod commands;

use commands::{AclCommand, ConfigCommand, HostCommand, TopicCommand};

/// agora - control plane for a multi-tenant agent mesh
#[derive(Parser)]
#[command(name = "agora")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AGORA_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AGORA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Host connection diagnostics
    #[command(name = "host")]
    Host {
        #[command(subcommand)]
        command: HostCommand,
    },

    /// Broker access control
    #[command(name = "acl")]
    Acl {
        #[command(subcommand)]
        command: AclCommand,
    },

    /// Topic address helpers
    #[command(name = "topic")]
    Topic {
        #[command(subcommand)]
        command: TopicCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Some(Commands::Host { command }) => commands::host::handle_command(command, cli.config).await,
        Some(Commands::Acl { command }) => commands::acl::handle_command(command, cli.config).await,
        Some(Commands::Topic { command }) => commands::topic::handle_command(command),
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}

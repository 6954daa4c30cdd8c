// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Broker access control commands
//!
//! Commands: check, serve

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use agora_core::application::AclEvaluator;
use agora_core::domain::acl::{AccessType, Claims};
use agora_core::domain::node_config::NodeConfig;
use agora_core::infrastructure::repositories::InMemoryAuthorityRepository;
use agora_core::presentation::acl_hook::{self, BrokerTokenVerifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Authority,
    Host,
}

#[derive(Subcommand)]
pub enum AclCommand {
    /// Evaluate one access decision offline
    Check {
        /// Principal role
        #[arg(long, value_enum)]
        role: Role,

        /// Host id (required for --role host)
        #[arg(long)]
        host_id: Option<String>,

        /// Authority id
        #[arg(long)]
        authority: String,

        /// read, write, read_write or subscribe (or the numeric code)
        #[arg(long, default_value = "write")]
        access: AccessType,

        /// YAML records file answering host/agent relationship checks
        #[arg(long, value_name = "FILE")]
        records: Option<PathBuf>,

        /// Topic to check
        #[arg(value_name = "TOPIC")]
        topic: String,
    },

    /// Serve the broker ACL hook
    Serve {
        /// Listen address (default: spec.acl_hook.bind)
        #[arg(long)]
        bind: Option<String>,
    },
}

pub async fn handle_command(command: AclCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        AclCommand::Check {
            role,
            host_id,
            authority,
            access,
            records,
            topic,
        } => check(role, host_id, &authority, access, records.as_deref(), &topic).await,
        AclCommand::Serve { bind } => serve(config_path, bind).await,
    }
}

fn load_repository(records: Option<&Path>) -> Result<InMemoryAuthorityRepository> {
    match records {
        Some(path) => InMemoryAuthorityRepository::from_yaml_file(path)
            .with_context(|| format!("Failed to load records from {:?}", path)),
        None => Ok(InMemoryAuthorityRepository::new()),
    }
}

fn claims_for(role: Role, host_id: Option<String>, authority: &str) -> Result<Claims> {
    match role {
        Role::Authority => Ok(Claims::authority(authority)),
        Role::Host => {
            let host_id = host_id.context("--host-id is required for --role host")?;
            Ok(Claims::host(authority, host_id))
        }
    }
}

async fn check(
    role: Role,
    host_id: Option<String>,
    authority: &str,
    access: AccessType,
    records: Option<&Path>,
    topic: &str,
) -> Result<()> {
    let claims = claims_for(role, host_id, authority)?;
    let evaluator = AclEvaluator::new(Arc::new(load_repository(records)?));

    if evaluator.check_access(topic, access, &claims).await {
        println!(
            "{}",
            format!("✓ {} may {} {}", claims.principal_id, access, topic).green()
        );
    } else {
        println!(
            "{}",
            format!("✗ {} may not {} {}", claims.principal_id, access, topic).red()
        );
    }
    Ok(())
}

async fn serve(config_path: Option<PathBuf>, bind: Option<String>) -> Result<()> {
    let config = NodeConfig::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    let hook = config
        .spec
        .acl_hook
        .as_ref()
        .context("spec.acl_hook is required to serve the broker ACL hook")?;

    let verifier = BrokerTokenVerifier::from_config(hook).context("Invalid ACL hook token settings")?;
    let repository = load_repository(hook.records_path.as_deref())?;
    let app = acl_hook::router(verifier, AclEvaluator::new(Arc::new(repository)));

    let addr = bind.unwrap_or_else(|| hook.bind.clone());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Broker ACL hook listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Broker ACL hook stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_for_host_requires_id() {
        assert!(claims_for(Role::Host, None, "a.example").is_err());
        let claims = claims_for(Role::Host, Some("h1".to_string()), "a.example").unwrap();
        assert_eq!(claims.host_id.as_deref(), Some("h1"));
        assert_eq!(claims_for(Role::Authority, None, "a.example").unwrap().principal_id, "a.example");
    }

    #[tokio::test]
    async fn test_check_reads_records_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.yaml");
        std::fs::write(
            &path,
            "hosts:\n  - id: h1\n    name: one\nagents:\n  - id: ag1\n    name: a\n    host_id: h1\n",
        )
        .unwrap();

        let repository = load_repository(Some(&path)).unwrap();
        let evaluator = AclEvaluator::new(Arc::new(repository));
        let claims = claims_for(Role::Host, Some("h1".to_string()), "a.example").unwrap();
        assert!(
            evaluator
                .check_access("event/ag1/a.example/-/-", AccessType::Write, &claims)
                .await
        );
        assert!(
            !evaluator
                .check_access("event/ag2/a.example/-/-", AccessType::Write, &claims)
                .await
        );
    }
}

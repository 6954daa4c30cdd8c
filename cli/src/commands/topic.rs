// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Topic address helpers
//!
//! Commands: render, parse

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use agora_core::domain::topic::{TopicAddress, NONE_SEGMENT};

#[derive(Subcommand)]
pub enum TopicCommand {
    /// Render an address as a broker topic
    Render {
        /// Authority id
        #[arg(long)]
        authority: String,

        /// Sender id (omit with --subscribe)
        #[arg(long, required_unless_present = "subscribe")]
        sender: Option<String>,

        /// Destination host id
        #[arg(long)]
        host: Option<String>,

        /// Destination agent id
        #[arg(long)]
        agent: Option<String>,

        /// Render the subscription form (sender `+`)
        #[arg(long)]
        subscribe: bool,
    },

    /// Parse a broker topic into its segments
    Parse {
        #[arg(value_name = "TOPIC")]
        topic: String,
    },
}

pub fn handle_command(command: TopicCommand) -> Result<()> {
    match command {
        TopicCommand::Render {
            authority,
            sender,
            host,
            agent,
            subscribe,
        } => {
            println!("{}", render(&authority, sender.as_deref(), host.as_deref(), agent.as_deref(), subscribe)?);
            Ok(())
        }
        TopicCommand::Parse { topic } => parse(&topic),
    }
}

fn render(
    authority: &str,
    sender: Option<&str>,
    host: Option<&str>,
    agent: Option<&str>,
    subscribe: bool,
) -> Result<String> {
    let address = if subscribe {
        TopicAddress::subscription(authority, host, agent)?
    } else {
        let sender = sender.context("--sender is required unless --subscribe is set")?;
        TopicAddress::new(sender, authority, host, agent)?
    };
    Ok(address.render())
}

fn parse(topic: &str) -> Result<()> {
    let address = TopicAddress::parse(topic).with_context(|| format!("Failed to parse '{}'", topic))?;
    println!("{}", "Topic address:".bold());
    println!("  Sender: {}", address.sender());
    println!("  Authority: {}", address.authority());
    println!("  Host: {}", address.host().unwrap_or(NONE_SEGMENT));
    println!("  Agent: {}", address.agent().unwrap_or(NONE_SEGMENT));
    if address.is_subscription() {
        println!("  {}", "(subscription)".dimmed());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_collapses_authority_sender() {
        assert_eq!(
            render("a.example", Some("a.example"), Some("h1"), None, false).unwrap(),
            "event/-/a.example/h1/-"
        );
        assert_eq!(
            render("a.example", None, None, Some("ag1"), true).unwrap(),
            "event/+/a.example/-/ag1"
        );
        assert!(render("a.example", None, None, None, false).is_err());
    }

    #[test]
    fn test_parse_rejects_connect_channel() {
        assert!(parse("connect/chat").is_err());
        assert!(parse("event/h1/a.example/-/-").is_ok());
    }
}

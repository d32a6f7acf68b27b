//! # keel
//!
//! Operator binary for the session state service: applies the schema,
//! reports health, and inspects sessions and checkpoints.

#![deny(unsafe_code)]

mod app;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use keel_core::{OwnerKey, SessionId, SessionStatus};
use keel_session::SessionFilter;

use crate::app::App;

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Session state service")]
struct Cli {
    /// Settings file (defaults to ~/.keel/settings.json).
    #[arg(long, global = true, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade the store schema.
    Migrate,
    /// Check store and cache reachability.
    Doctor,
    /// Inspect sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Inspect checkpoints.
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsCommand {
    List {
        #[arg(long)]
        owner: String,
        #[arg(long, value_parser = parse_status)]
        status: Option<SessionStatus>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        page_size: Option<u32>,
    },
    Show {
        id: SessionId,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointsCommand {
    List { session_id: SessionId },
}

fn parse_status(raw: &str) -> Result<SessionStatus, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("keel: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let app = App::init(cli.config.as_deref()).await?;
    let outcome = execute(&app, cli.command).await;
    app.shutdown().await;
    outcome
}

/// Run one command, printing its result as JSON. Returns whether the process
/// should exit successfully.
async fn execute(app: &App, command: Command) -> Result<bool> {
    let service = &app.service;
    let output = match command {
        Command::Migrate => json!({
            "backend": service.repository().backend(),
            "database": redact(&app.settings.database.url),
            "schema": "ready",
        }),
        Command::Doctor => {
            let health = service.health().await;
            print_json(&health)?;
            return Ok(health.is_healthy());
        }
        Command::Sessions {
            command:
                SessionsCommand::List {
                    owner,
                    status,
                    page,
                    page_size,
                },
        } => {
            let filter = SessionFilter {
                status,
                page: Some(page),
                page_size,
                ..Default::default()
            };
            let page = service
                .list_sessions(&OwnerKey::new(owner), filter)
                .await
                .context("failed to list sessions")?;
            serde_json::to_value(page)?
        }
        Command::Sessions {
            command: SessionsCommand::Show { id },
        } => {
            let session = service.get_session(&id).await?;
            serde_json::to_value(session)?
        }
        Command::Checkpoints {
            command: CheckpointsCommand::List { session_id },
        } => {
            let checkpoints = service.list_checkpoints(&session_id).await?;
            serde_json::to_value(checkpoints)?
        }
    };
    print_json(&output)?;
    Ok(true)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Hide credentials in a connection URL.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

//! Demo CLI host for the debugger command queue core.
//!
//! The core has no protocol frontend of its own (out of scope per the
//! spec): this binary is a minimal harness that builds one [`QueueService`]
//! for a session, submits the commands given on the command line in order,
//! waits for each outcome, and prints the results as JSON — standing in for
//! the MCP tool surface a real frontend would expose.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dbgqueue::config::SessionConfig;
use dbgqueue::debugger::{DebuggerDriver, MockDebugger, ShellDebugger};
use dbgqueue::events::{ChannelEventSink, EventSink};
use dbgqueue::queue::QueueService;
use dbgqueue::recovery::NullRecovery;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "dbgqueue",
    version,
    about = "Serialized per-session debugger command queue — demo CLI"
)]
struct Cli {
    /// Session identifier; ids are scoped as cmd-<session>-<N>.
    #[arg(long, default_value = "demo")]
    session: String,

    /// One or more debugger commands to submit, in order. Each is awaited
    /// before the next is submitted.
    #[arg(long = "cmd", required = true)]
    commands: Vec<String>,

    /// Shell out via /bin/sh instead of the scripted MockDebugger. Not a
    /// faithful debugger model — it exists only to drive the queue against
    /// something real.
    #[arg(long)]
    shell: bool,
}

#[derive(Serialize)]
struct CommandResult {
    id: String,
    text: String,
    state: String,
    output: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    tracing::info!(session = %cli.session, shell = cli.shell, "starting dbgqueue demo CLI");

    let config = SessionConfig::new(cli.session.clone());
    let debugger: Arc<dyn DebuggerDriver> = if cli.shell {
        Arc::new(ShellDebugger::new())
    } else {
        Arc::new(MockDebugger::new())
    };
    let events: Arc<dyn EventSink> = Arc::new(ChannelEventSink::new(256));

    let svc = QueueService::new(config, debugger, Arc::new(NullRecovery), events)
        .context("invalid session config")?;

    let mut results = Vec::with_capacity(cli.commands.len());
    for text in &cli.commands {
        let id = svc.submit(text).await.context("submit failed")?;
        let output = svc.await_result(&id).await.context("await_result failed")?;
        let state = svc
            .state(&id)
            .context("state lookup failed")?
            .map_or_else(String::new, |s| s.as_str().to_string());
        results.push(CommandResult {
            id,
            text: text.clone(),
            state,
            output,
        });
    }

    svc.dispose().await;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

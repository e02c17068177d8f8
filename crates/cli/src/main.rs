// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! relay - thin operator CLI for the Session Pool daemon.

mod client;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use relay_daemon::{Request, Response};

use client::DaemonClient;

#[derive(Parser)]
#[command(name = "relay", version, about = "Operator CLI for the relayd session pool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report daemon uptime and per-workspace pool sizes
    Status,
    /// Acquire a session in a workspace, starting a subprocess if needed
    Acquire {
        /// Workspace identifier
        workspace: String,
        /// System prompt for the session
        #[arg(long, default_value = "")]
        system_prompt: String,
        /// Working directory the subprocess should run in
        #[arg(long, default_value = ".")]
        working_directory: PathBuf,
    },
    /// Send one line of input to a session
    Send {
        workspace: String,
        session: String,
        /// Text to send (read from stdin if omitted)
        input: Option<String>,
    },
    /// Release a session back to the pool as idle
    Release { workspace: String, session: String },
    /// Close a session, tearing down its subprocess
    Close { workspace: String, session: String },
    /// Show the most recently buffered output for a session
    Logs { workspace: String, session: String },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", format_error(&e));
        std::process::exit(1);
    }
}

/// Renders an anyhow error, skipping the source chain when it is already
/// implied by the top-level message (thiserror `#[from]` variants repeat it).
fn format_error(err: &anyhow::Error) -> String {
    let top = err.to_string();
    let chain_redundant = err.chain().skip(1).all(|cause| top.contains(&cause.to_string()));
    if chain_redundant {
        return top;
    }
    let mut buf = top;
    for cause in err.chain().skip(1) {
        buf.push_str(&format!("\ncaused by: {cause}"));
    }
    buf
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let client = match &cli.command {
        Commands::Acquire { .. } => DaemonClient::connect_or_start().await?,
        _ => DaemonClient::connect().await?,
    };

    let request = match cli.command {
        Commands::Status => Request::Status,
        Commands::Acquire { workspace, system_prompt, working_directory } => {
            Request::Acquire { workspace_id: workspace, system_prompt, working_directory }
        }
        Commands::Send { workspace, session, input } => {
            let input = match input {
                Some(input) => input,
                None => read_stdin()?,
            };
            Request::Send { workspace_id: workspace, session_id: session, input }
        }
        Commands::Release { workspace, session } => Request::Release { workspace_id: workspace, session_id: session },
        Commands::Close { workspace, session } => Request::Close { workspace_id: workspace, session_id: session },
        Commands::Logs { workspace, session } => Request::Logs { workspace_id: workspace, session_id: session },
    };

    let response = client.request(request).await?;
    print_response(response)
}

fn read_stdin() -> Result<String> {
    use std::io::Read;
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf).context("reading input from stdin")?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_error_skips_a_redundant_source_chain() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "no such socket");
        let err = anyhow::Error::new(source).context("relayd is not running: no such socket");
        assert_eq!(format_error(&err), "relayd is not running: no such socket");
    }

    #[test]
    fn format_error_keeps_a_distinct_source_chain() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err = anyhow::Error::new(source).context("failed to load config");
        assert_eq!(format_error(&err), "failed to load config\ncaused by: missing file");
    }
}

fn print_response(response: Response) -> Result<()> {
    match response {
        Response::Pong => println!("pong"),
        Response::Ok => println!("ok"),
        Response::Status { uptime_secs, pools } => {
            println!("uptime: {uptime_secs}s");
            if pools.is_empty() {
                println!("no active workspace pools");
            }
            for pool in pools {
                println!("{}: {} session(s)", pool.workspace_id, pool.pool_size);
            }
        }
        Response::Session(handle) => {
            println!("{} ({})", handle.session_id, handle.state);
        }
        Response::Logs { lines } => {
            for line in lines {
                println!("[{}] {}: {}", line.sequence, line.message_type, line.payload);
            }
        }
        Response::Error { kind, message } => return Err(anyhow!("{kind}: {message}")),
    }
    Ok(())
}

//! CLI Module
//!
//! Command-line interface for chipgate using Clap v4.

mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use commands::{cmd_config, cmd_init, cmd_logs, cmd_serve, load_config};

/// chipgate - WhatsApp chip session supervisor
#[derive(Parser, Debug)]
#[command(name = "chipgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug mode (writes rolling log files to ~/.chipgate/logs/)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CHIPGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the session supervisor and its HTTP / WebSocket gateway
    Serve {
        /// Drive sessions with the built-in simulated protocol client
        #[arg(long)]
        simulated: bool,
    },

    /// Initialize configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show configuration
    Config {
        /// Include the mirror token
        #[arg(short, long)]
        show_secrets: bool,
    },

    /// Log management operations
    Logs {
        #[command(subcommand)]
        operation: LogCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum LogCommands {
    /// Show log file location and status
    Status,
    /// Clean up old log files
    Clean {
        /// Maximum age in days (default: 7)
        #[arg(short = 'a', long, default_value = "7")]
        days: u64,
    },
}

/// Main CLI entry point
pub async fn run() -> Result<()> {
    run_with(Cli::parse()).await
}

/// Run an already-parsed command line
pub async fn run_with(cli: Cli) -> Result<()> {
    if cli.debug {
        tracing::info!("Debug mode enabled");
    }

    match cli.command {
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
        Some(Commands::Serve { simulated }) => {
            let config = load_config(cli.config.as_deref())?;
            cmd_serve(&config, simulated).await
        }
        Some(Commands::Init { force }) => cmd_init(force),
        Some(Commands::Config { show_secrets }) => {
            let config = load_config(cli.config.as_deref())?;
            cmd_config(&config, show_secrets)
        }
        Some(Commands::Logs { operation }) => cmd_logs(operation),
    }
}

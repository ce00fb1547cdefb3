//! CLI subcommands: serve, init, config, logs, and config loading.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::events::EventBus;
use crate::gateway;
use crate::logging;
use crate::mirror::StatusMirror;
use crate::protocol::SimulatedClient;
use crate::supervisor::SessionSupervisor;

use super::LogCommands;

/// Load configuration from file or defaults
pub(crate) fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = config_path {
        tracing::info!("Loading configuration from custom path: {}", path.display());
        Config::load_from_path(path)?
    } else {
        tracing::debug!("Loading default configuration");
        Config::load()?
    };

    config.validate()?;

    Ok(config)
}

/// Run the supervisor and gateway until Ctrl-C
pub(crate) async fn cmd_serve(config: &Config, simulated: bool) -> Result<()> {
    if !simulated {
        anyhow::bail!(
            "No WhatsApp protocol adapter is bundled with this build.\n\
             Run `chipgate serve --simulated` to drive sessions with the simulated client."
        );
    }

    let credentials_dir = &config.supervisor.credentials_dir;
    std::fs::create_dir_all(credentials_dir)
        .with_context(|| format!("Failed to create credentials directory: {}", credentials_dir.display()))?;

    let client = SimulatedClient::new(config.simulator.to_settings());
    let bus = EventBus::new(config.gateway.subscriber_queue);
    let supervisor = SessionSupervisor::new(Arc::new(client), bus.clone(), config.supervisor.to_policy());

    let mirror = match config.mirror.to_settings() {
        Some(settings) => Some(StatusMirror::new(settings)?.spawn(bus.subscribe_all())),
        None => None,
    };

    let settings = config.gateway.to_settings();
    let handle = gateway::start(&settings, supervisor.clone())
        .await
        .with_context(|| format!("Failed to bind gateway on {}:{}", settings.bind, settings.port))?;

    println!("chipgate listening on http://{}", handle.local_addr());
    println!("   WebSocket: ws://{}/ws", handle.local_addr());
    println!("   Protocol client: simulated");
    println!("\nPress Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!(active = supervisor.active_chips(), "Shutting down");
    supervisor.shutdown().await;
    handle.shutdown().await.context("Gateway did not shut down cleanly")?;
    if let Some(mirror) = mirror {
        mirror.abort();
    }

    println!("chipgate stopped");
    Ok(())
}

/// Write the default configuration to `path`, refusing to clobber unless `force`
pub(crate) fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at: {}\nUse --force to overwrite",
            path.display()
        );
    }
    Config::default().save(path)
}

/// Initialize configuration file
pub(crate) fn cmd_init(force: bool) -> Result<()> {
    println!("chipgate Configuration Initialization\n");

    let config_path = Config::system_config_path().context("Could not determine config directory")?;
    write_default_config(&config_path, force)?;

    println!("Configuration initialized at: {}", config_path.display());
    println!("\nNext steps:");
    println!("   1. Adjust gateway.port and supervisor limits if needed");
    println!("   2. Set mirror.url to forward status changes to a webhook");
    println!("   3. Run 'chipgate serve --simulated' to start");

    Ok(())
}

/// Show configuration
pub(crate) fn cmd_config(config: &Config, show_secrets: bool) -> Result<()> {
    println!("chipgate Configuration\n");

    if show_secrets {
        let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
        println!("{}", rendered);
        return Ok(());
    }

    let supervisor = &config.supervisor;
    println!("Log level: {}", config.logging.level);
    if let Some(file) = &config.logging.file {
        println!("Log file: {}", file.display());
    }
    println!("Log format: {}", if config.logging.json { "json" } else { "text" });
    println!("Gateway: {}:{}", config.gateway.bind, config.gateway.port);
    println!("Subscriber queue: {}", config.gateway.subscriber_queue);
    println!("Heartbeat: {}s", config.gateway.heartbeat_secs);
    println!("\nSupervisor:");
    println!("  Credentials: {}", supervisor.credentials_dir.display());
    println!(
        "  QR timeout: {}s (max {} refreshes)",
        supervisor.qr_timeout_secs, supervisor.max_qr_refreshes
    );
    println!(
        "  Reconnect: up to {} attempts, {}ms..{}ms, jitter {}",
        supervisor.max_reconnect_attempts,
        supervisor.backoff_base_ms,
        supervisor.backoff_max_ms,
        supervisor.backoff_jitter
    );
    println!("\nMirror:");
    match &config.mirror.url {
        Some(url) => {
            println!("  URL: {}", url);
            println!(
                "  Token: {}",
                if config.mirror.token.is_some() { "[SET]" } else { "[NOT SET]" }
            );
        }
        None => println!("  disabled"),
    }

    println!("\nUse --show-secrets to display the full configuration");
    Ok(())
}

/// Log management
pub(crate) fn cmd_logs(operation: LogCommands) -> Result<()> {
    let log_dir = logging::log_dir();

    match operation {
        LogCommands::Status => {
            println!("chipgate Logging Status\n");
            println!("Log directory: {}", log_dir.display());

            let files = logging::log_files()?;
            if files.is_empty() {
                println!("Status: no logs found");
                println!("\nTo enable debug logging, run with -d flag:");
                println!("   chipgate -d serve --simulated");
                return Ok(());
            }

            let total_size: u64 = files
                .iter()
                .filter_map(|path| std::fs::metadata(path).ok())
                .map(|metadata| metadata.len())
                .sum();

            println!("Log files: {}", files.len());
            println!("Total size: {:.2} MB", total_size as f64 / (1024.0 * 1024.0));
            if let Some(newest) = files.last() {
                println!("Latest log: {}", newest.display());
            }
            Ok(())
        }

        LogCommands::Clean { days } => {
            println!("Cleaning up log files older than {} days...\n", days);

            match logging::cleanup_old_logs(days) {
                Ok(removed) if removed > 0 => println!("Removed {} old log file(s)", removed),
                Ok(_) => println!("No old log files to remove"),
                Err(e) => println!("Error cleaning logs: {}", e),
            }
            Ok(())
        }
    }
}

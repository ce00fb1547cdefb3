use anyhow::Result;
use chipgate::config::Config;
use chipgate::{cli, logging};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file before anything else (silently ignore if missing)
    dotenvy::dotenv().ok();

    // Parse CLI arguments first to check for debug flag
    let cli_args = cli::Cli::parse();

    // `[logging]` settings; a broken config is reported by the command itself
    let logging_settings = match cli_args.config.as_deref() {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .map(|config| config.logging)
    .unwrap_or_default();

    let mut log_config = logging::LogConfig::from_settings(&logging_settings).with_debug_mode(cli_args.debug);

    // Custom log directory from env
    if let Ok(log_dir) = std::env::var("CHIPGATE_LOG_DIR") {
        log_config = log_config.with_log_dir(std::path::PathBuf::from(log_dir));
    }

    let _guard = logging::init_logging(log_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    // Clean up old log files (keep last 7 days)
    if cli_args.debug
        && let Ok(removed) = logging::cleanup_old_logs(7)
        && removed > 0
    {
        tracing::info!("Cleaned up {} old log file(s)", removed);
    }

    cli::run_with(cli_args).await
}

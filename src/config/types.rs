//! Configuration types, defaults, loading, and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::GatewaySettings;
use crate::mirror::MirrorSettings;
use crate::protocol::SimulatorSettings;
use crate::supervisor::{BackoffPolicy, SupervisorPolicy};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP / WebSocket gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Session lifecycle policy
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Simulated protocol client timings (`serve --simulated`)
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Status mirror webhook
    #[serde(default)]
    pub mirror: MirrorConfig,
}

/// Canonical base directory: `~/.chipgate/`
///
/// Holds pairing credentials and debug logs.
pub fn chipgate_home() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let p = home.join(".chipgate");
    if !p.exists() {
        let _ = std::fs::create_dir_all(&p);
    }
    p
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log to file
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// HTTP / WebSocket gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address (default: "127.0.0.1")
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Gateway port (default: 18790)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Events buffered per subscriber before it is evicted
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,

    /// WebSocket ping interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18790
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            port: default_gateway_port(),
            subscriber_queue: default_subscriber_queue(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn to_settings(&self) -> GatewaySettings {
        GatewaySettings {
            bind: self.bind.clone(),
            port: self.port,
            heartbeat: Duration::from_secs(self.heartbeat_secs),
            outbound_queue: self.subscriber_queue,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Root directory for per-chip pairing credentials
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,

    #[serde(default = "default_qr_timeout_secs")]
    pub qr_timeout_secs: u64,

    /// Expired QR codes replaced before the chip fails with `pairing_timeout`
    #[serde(default = "default_max_qr_refreshes")]
    pub max_qr_refreshes: u32,

    /// Automatic reconnects before the chip fails with `unexpected_close`
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Random spread applied to each delay, 0.0 to 1.0
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    #[serde(default = "default_logout_timeout_secs")]
    pub logout_timeout_secs: u64,
}

fn default_credentials_dir() -> PathBuf {
    chipgate_home().join("credentials")
}

fn default_qr_timeout_secs() -> u64 {
    60
}

fn default_max_qr_refreshes() -> u32 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_logout_timeout_secs() -> u64 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            credentials_dir: default_credentials_dir(),
            qr_timeout_secs: default_qr_timeout_secs(),
            max_qr_refreshes: default_max_qr_refreshes(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            logout_timeout_secs: default_logout_timeout_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn to_policy(&self) -> SupervisorPolicy {
        SupervisorPolicy {
            qr_timeout: Duration::from_secs(self.qr_timeout_secs),
            max_qr_refreshes: self.max_qr_refreshes,
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                jitter: self.backoff_jitter,
                max_attempts: self.max_reconnect_attempts,
            },
            logout_timeout: Duration::from_secs(self.logout_timeout_secs),
            credentials_dir: self.credentials_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_pairing_delay_ms")]
    pub pairing_delay_ms: u64,

    /// Pretend the phone scans the code after this long; unset waits forever
    #[serde(default)]
    pub auto_pair_after_ms: Option<u64>,

    #[serde(default = "default_open_delay_ms")]
    pub open_delay_ms: u64,
}

fn default_pairing_delay_ms() -> u64 {
    500
}

fn default_open_delay_ms() -> u64 {
    300
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            pairing_delay_ms: default_pairing_delay_ms(),
            auto_pair_after_ms: None,
            open_delay_ms: default_open_delay_ms(),
        }
    }
}

impl SimulatorConfig {
    pub fn to_settings(&self) -> SimulatorSettings {
        SimulatorSettings {
            pairing_delay: Some(Duration::from_millis(self.pairing_delay_ms)),
            auto_pair_after: self.auto_pair_after_ms.map(Duration::from_millis),
            open_delay: Some(Duration::from_millis(self.open_delay_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Webhook receiving every transition; mirroring is off when unset
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_mirror_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_mirror_timeout_secs() -> u64 {
    10
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: default_mirror_timeout_secs(),
        }
    }
}

impl MirrorConfig {
    /// Settings for the mirror task, or `None` when no webhook is configured.
    pub fn to_settings(&self) -> Option<MirrorSettings> {
        let url = self.url.as_ref().filter(|url| !url.trim().is_empty())?;
        Some(MirrorSettings {
            url: url.clone(),
            token: self.token.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

/// Overlay `overlay` onto `base`, recursing into tables so sibling keys survive.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge_tables(existing, incoming);
                } else {
                    base.insert(key, toml::Value::Table(incoming));
                }
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Priority (lowest to highest):
    /// 1. Default values
    /// 2. System config: ~/.config/chipgate/config.toml
    /// 3. Local config: ./chipgate.toml
    /// 4. Environment variables
    pub fn load() -> Result<Self> {
        tracing::debug!("Loading configuration...");

        let mut layers = Vec::new();
        if let Some(system_config_path) = Self::system_config_path()
            && system_config_path.exists()
        {
            tracing::debug!("Loading system config from: {:?}", system_config_path);
            layers.push(system_config_path);
        }

        let local_config_path = Self::local_config_path();
        if local_config_path.exists() {
            tracing::debug!("Loading local config from: {:?}", local_config_path);
            layers.push(local_config_path);
        }

        let config = Self::apply_env_overrides(Self::load_layers(&layers)?)?;

        tracing::debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Merge config files key by key; later files win, unset keys keep defaults
    fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut layered = toml::Table::new();
        for path in paths {
            merge_tables(&mut layered, Self::read_table(path)?);
        }
        toml::Value::Table(layered)
            .try_into()
            .context("Failed to parse layered configuration")
    }

    /// Load configuration from a specific file path, then apply env overrides
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Loading configuration from custom path: {:?}", path);

        if !path.exists() {
            anyhow::bail!("Config file not found: {:?}", path);
        }
        let config = Self::merge_from_file(path)?;
        Self::apply_env_overrides(config)
    }

    /// Get the system config path: ~/.config/chipgate/config.toml
    pub fn system_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chipgate").join("config.toml"))
    }

    /// Get the local config path: ./chipgate.toml
    pub fn local_config_path() -> PathBuf {
        PathBuf::from("./chipgate.toml")
    }

    /// Parse a TOML file; sections it leaves out keep their defaults
    fn merge_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        toml::from_str(&contents).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    fn read_table(path: &Path) -> Result<toml::Table> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        toml::from_str(&contents).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: Self) -> Result<Self> {
        if let Ok(log_level) = std::env::var("CHIPGATE_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        if let Ok(json) = std::env::var("CHIPGATE_LOG_JSON") {
            config.logging.json = matches!(json.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(bind) = std::env::var("CHIPGATE_BIND") {
            config.gateway.bind = bind;
        }

        if let Ok(port) = std::env::var("CHIPGATE_PORT") {
            config.gateway.port = port
                .parse()
                .with_context(|| format!("CHIPGATE_PORT is not a valid port: {port}"))?;
        }

        if let Ok(dir) = std::env::var("CHIPGATE_CREDENTIALS_DIR") {
            config.supervisor.credentials_dir = PathBuf::from(dir);
        }

        if let Ok(url) = std::env::var("CHIPGATE_MIRROR_URL") {
            config.mirror.url = Some(url);
        }

        if let Ok(token) = std::env::var("CHIPGATE_MIRROR_TOKEN") {
            config.mirror.token = Some(token);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        tracing::debug!("Validating configuration...");

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        let supervisor = &self.supervisor;
        if supervisor.qr_timeout_secs == 0 {
            anyhow::bail!("supervisor.qr_timeout_secs must be greater than zero");
        }
        if supervisor.max_reconnect_attempts == 0 {
            anyhow::bail!("supervisor.max_reconnect_attempts must be greater than zero");
        }
        if !(0.0..=1.0).contains(&supervisor.backoff_jitter) {
            anyhow::bail!(
                "supervisor.backoff_jitter must be between 0.0 and 1.0, got {}",
                supervisor.backoff_jitter
            );
        }
        if supervisor.backoff_base_ms > supervisor.backoff_max_ms {
            anyhow::bail!(
                "supervisor.backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                supervisor.backoff_base_ms,
                supervisor.backoff_max_ms
            );
        }

        if self.gateway.subscriber_queue == 0 {
            anyhow::bail!("gateway.subscriber_queue must be greater than zero");
        }
        if self.gateway.heartbeat_secs == 0 {
            anyhow::bail!("gateway.heartbeat_secs must be greater than zero");
        }

        if let Some(url) = &self.mirror.url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            anyhow::bail!("mirror.url must be an http(s) URL, got {url}");
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        if path.exists() {
            let backup = path.with_extension("toml.backup");
            if let Err(e) = fs::copy(path, &backup) {
                tracing::warn!("Failed to back up config before write: {e}");
            }
        }

        fs::write(path, toml_string).with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Configuration saved to: {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.gateway.port, 18790);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.supervisor.qr_timeout_secs, 60);
        assert_eq!(config.supervisor.max_reconnect_attempts, 10);
        assert!(config.mirror.url.is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());
    }

    #[rstest]
    #[case::log_level(|c: &mut Config| c.logging.level = "loud".into())]
    #[case::qr_timeout(|c: &mut Config| c.supervisor.qr_timeout_secs = 0)]
    #[case::attempts(|c: &mut Config| c.supervisor.max_reconnect_attempts = 0)]
    #[case::jitter_high(|c: &mut Config| c.supervisor.backoff_jitter = 1.5)]
    #[case::jitter_negative(|c: &mut Config| c.supervisor.backoff_jitter = -0.1)]
    #[case::base_over_max(|c: &mut Config| c.supervisor.backoff_base_ms = 120_000)]
    #[case::queue(|c: &mut Config| c.gateway.subscriber_queue = 0)]
    #[case::mirror_url(|c: &mut Config| c.mirror.url = Some("ftp://example".into()))]
    fn test_config_validation_rejects(#[case] break_it: fn(&mut Config)) {
        let mut config = Config::default();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_content = r#"
[logging]
level = "debug"
json = true

[gateway]
port = 9000

[supervisor]
credentials_dir = "/var/lib/chipgate"
max_reconnect_attempts = 3
backoff_jitter = 0.0

[simulator]
auto_pair_after_ms = 2000

[mirror]
url = "https://example.com/hook"
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert!(config.logging.file.is_none());
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.supervisor.credentials_dir, PathBuf::from("/var/lib/chipgate"));
        assert_eq!(config.supervisor.max_reconnect_attempts, 3);
        assert_eq!(config.supervisor.qr_timeout_secs, 60);
        assert_eq!(config.simulator.auto_pair_after_ms, Some(2000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_supervisor_config_to_policy() {
        let config = SupervisorConfig {
            max_reconnect_attempts: 4,
            backoff_base_ms: 250,
            ..Default::default()
        };
        let policy = config.to_policy();
        assert_eq!(policy.backoff.max_attempts, 4);
        assert_eq!(policy.backoff.base, Duration::from_millis(250));
        assert_eq!(policy.qr_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_mirror_disabled_without_url() {
        assert!(MirrorConfig::default().to_settings().is_none());

        let config = MirrorConfig {
            url: Some("http://localhost:9999/hook".into()),
            token: Some("t".into()),
            ..Default::default()
        };
        let settings = config.to_settings().unwrap();
        assert_eq!(settings.token.as_deref(), Some("t"));
        assert_eq!(settings.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_simulator_settings() {
        let settings = SimulatorConfig::default().to_settings();
        assert_eq!(settings.pairing_delay, Some(Duration::from_millis(500)));
        assert!(settings.auto_pair_after.is_none());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.gateway.port = 18888;
        config.mirror.url = Some("https://example.com/hook".into());

        config.save(temp_file.path()).unwrap();
        let loaded = Config::merge_from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.gateway.port, 18888);
        assert_eq!(loaded.mirror.url, config.mirror.url);
        assert_eq!(loaded.logging.level, config.logging.level);
    }

    #[test]
    fn test_later_config_file_overrides_only_its_own_keys() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.toml");
        let local = dir.path().join("local.toml");
        fs::write(
            &system,
            r#"
[logging]
level = "debug"
file = "/var/log/chipgate.log"

[gateway]
port = 9000
bind = "0.0.0.0"

[mirror]
url = "https://example.com/hook"
"#,
        )
        .unwrap();
        fs::write(
            &local,
            r#"
[gateway]
port = 9100

[supervisor]
max_reconnect_attempts = 2
"#,
        )
        .unwrap();

        let config = Config::load_layers(&[system, local]).unwrap();
        assert_eq!(config.gateway.port, 9100);
        assert_eq!(config.gateway.bind, "0.0.0.0");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/var/log/chipgate.log")));
        assert_eq!(config.mirror.url.as_deref(), Some("https://example.com/hook"));
        assert_eq!(config.supervisor.max_reconnect_attempts, 2);
        assert_eq!(config.supervisor.qr_timeout_secs, 60);
    }

    #[test]
    fn test_no_config_files_yields_defaults() {
        let config = Config::load_layers(&[]).unwrap();
        assert_eq!(config.gateway.port, 18790);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_load_from_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from_path(dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_system_config_path() {
        if let Some(path) = Config::system_config_path() {
            assert!(path.to_string_lossy().contains("chipgate"));
            assert!(path.to_string_lossy().ends_with("config.toml"));
        }
    }

    #[test]
    fn test_local_config_path() {
        assert_eq!(Config::local_config_path(), PathBuf::from("./chipgate.toml"));
    }
}

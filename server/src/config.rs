use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use url::Url;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory holding the database and the token secret.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Base URL of the inference service.
    #[arg(long)]
    pub relay_url: Option<String>,
}

/// Where and how the AI relay is reached.
#[derive(Clone, Debug)]
pub struct RelaySettings {
    /// Validated base URL of the inference service.
    pub url: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct AuthSettings {
    /// Explicit signing secret. Generated and persisted when absent.
    pub jwt_secret: Option<String>,
    pub token_ttl_hours: i64,
    pub login_attempts_per_minute: usize,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("token_ttl_hours", &self.token_ttl_hours)
            .field("login_attempts_per_minute", &self.login_attempts_per_minute)
            .finish()
    }
}

/// Background retry of turns that never received an answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub min_age: Duration,
    pub batch: usize,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory for the database and persisted secrets.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    pub relay: RelaySettings,
    pub auth: AuthSettings,
    pub sweep: SweepSettings,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    relay: FileRelay,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    sweep: FileSweep,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    data_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileRelay {
    #[serde(default = "default_relay_url")]
    url: String,
    #[serde(default = "default_relay_timeout")]
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    token_ttl_hours: i64,
    #[serde(default = "default_login_attempts")]
    login_attempts_per_minute: usize,
}

#[derive(Deserialize)]
struct FileSweep {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_sweep_interval")]
    interval_secs: u64,
    #[serde(default = "default_sweep_min_age")]
    min_age_secs: u64,
    #[serde(default = "default_sweep_batch")]
    batch: usize,
}

fn default_port() -> u16 {
    5000
}

fn default_logging() -> bool {
    true
}

fn default_relay_url() -> String {
    "http://127.0.0.1:5001".into()
}

fn default_relay_timeout() -> u64 {
    30
}

fn default_token_ttl() -> i64 {
    24 * 7
}

fn default_login_attempts() -> usize {
    10
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_sweep_min_age() -> u64 {
    120
}

fn default_sweep_batch() -> usize {
    20
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: None,
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileRelay {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            timeout_secs: default_relay_timeout(),
        }
    }
}

impl Default for FileAuth {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: default_token_ttl(),
            login_attempts_per_minute: default_login_attempts(),
        }
    }
}

impl Default for FileSweep {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_sweep_interval(),
            min_age_secs: default_sweep_min_age(),
            batch: default_sweep_batch(),
        }
    }
}

impl Config {
    /// Configuration with every default applied, used by tests and embedders.
    pub fn new(bind: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let relay = FileRelay::default();
        let auth = FileAuth::default();
        let sweep = FileSweep::default();
        Self {
            bind: bind.into(),
            data_dir: data_dir.into(),
            logging_enabled: default_logging(),
            relay: RelaySettings {
                url: relay.url,
                timeout: Duration::from_secs(relay.timeout_secs),
            },
            auth: AuthSettings {
                jwt_secret: auth.jwt_secret,
                token_ttl_hours: auth.token_ttl_hours,
                login_attempts_per_minute: auth.login_attempts_per_minute,
            },
            sweep: SweepSettings {
                enabled: sweep.enabled,
                interval: Duration::from_secs(sweep.interval_secs),
                min_age: Duration::from_secs(sweep.min_age_secs),
                batch: sweep.batch,
            },
        }
    }

    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| {
                std::env::var("HEALTH_ASSISTANT_CONFIG")
                    .ok()
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| PathBuf::from("config/health_assistant.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };

        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut relay_url = file_cfg.relay.url;
        let mut jwt_secret = file_cfg.auth.jwt_secret;
        let mut data_dir = file_cfg.server.data_dir;

        // environment overrides
        if let Ok(p) = std::env::var("HEALTH_ASSISTANT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("HEALTH_ASSISTANT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(u) = std::env::var("AI_RELAY_URL") {
            relay_url = u;
        }
        if let Ok(s) = std::env::var("JWT_SECRET") {
            if !s.is_empty() {
                jwt_secret = Some(s);
            }
        }
        if let Ok(d) = std::env::var("DATA_DIR") {
            data_dir = Some(PathBuf::from(d));
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }
        if let Some(u) = &cli.relay_url {
            relay_url = u.clone();
        }
        if let Some(d) = &cli.data_dir {
            data_dir = Some(d.clone());
        }

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if file_cfg.relay.timeout_secs == 0 {
            anyhow::bail!("relay timeout must be positive");
        }
        if file_cfg.sweep.interval_secs == 0 {
            anyhow::bail!("sweep interval must be positive");
        }
        if file_cfg.auth.token_ttl_hours <= 0 {
            anyhow::bail!("token lifetime must be positive");
        }
        if file_cfg.auth.login_attempts_per_minute == 0 {
            anyhow::bail!("login attempts per minute must be at least 1");
        }
        Url::parse(&relay_url).context("invalid relay url")?;

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        Ok(Self {
            bind,
            data_dir: data_dir.unwrap_or_else(default_data_dir),
            logging_enabled: logging,
            relay: RelaySettings {
                url: relay_url,
                timeout: Duration::from_secs(file_cfg.relay.timeout_secs),
            },
            auth: AuthSettings {
                jwt_secret,
                token_ttl_hours: file_cfg.auth.token_ttl_hours,
                login_attempts_per_minute: file_cfg.auth.login_attempts_per_minute,
            },
            sweep: SweepSettings {
                enabled: file_cfg.sweep.enabled,
                interval: Duration::from_secs(file_cfg.sweep.interval_secs),
                min_age: Duration::from_secs(file_cfg.sweep.min_age_secs),
                batch: file_cfg.sweep.batch,
            },
        })
    }

    /// Location of the SQLite database inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("health_assistant.db")
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/health_assistant");
        p
    } else {
        PathBuf::from("./health_assistant_data")
    }
}

//! Configuration management for the BGH Smart sync engine

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, time::Duration};
use url::Url;

/// Cloud flavour; both speak the same protocol on different hosts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// BGH Smart Control (default)
    #[default]
    Bgh,
    /// Generic Solidmation / MyHabeetat cloud
    Solidmation,
}

impl Provider {
    pub fn base_url(&self) -> &'static str {
        match self {
            Provider::Bgh => "https://bgh-services.solidmation.com",
            Provider::Solidmation => "https://myhabeetatcloud-services.solidmation.com",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bgh" => Ok(Provider::Bgh),
            "solidmation" => Ok(Provider::Solidmation),
            other => Err(SyncError::config(format!("Unknown provider '{other}'"))),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Cloud account and transport settings
    pub solidmation: SolidmationConfig,

    /// Cache and debounce tuning
    pub engine: EngineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cloud account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolidmationConfig {
    pub provider: Provider,

    /// Overrides the provider's base URL (used by tests and proxies)
    pub base_url: Option<Url>,

    pub email: String,

    #[serde(skip_serializing)]
    pub password: String,

    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Only sync homes whose description is listed; empty means all
    pub homes: Vec<String>,
}

impl Default for SolidmationConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            base_url: None,
            email: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(15),
            homes: Vec::new(),
        }
    }
}

impl SolidmationConfig {
    /// Base URL actually used for requests
    pub fn resolved_base_url(&self) -> Result<Url> {
        match &self.base_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(self.provider.base_url())
                .map_err(|e| SyncError::config(format!("Invalid provider URL: {e}"))),
        }
    }
}

/// Engine timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a home snapshot is trusted without re-fetching
    #[serde(with = "humantime_serde")]
    pub cache_window: Duration,

    /// Quiet period after the last patch before a command is dispatched
    #[serde(with = "humantime_serde")]
    pub debounce_window: Duration,

    /// Capacity of the dispatch event feed
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_window: Duration::from_millis(5000),
            debounce_window: Duration::from_millis(2000),
            event_capacity: 64,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,

    /// Optional log file; rotated daily
    pub file: Option<PathBuf>,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| SyncError::config(format!("{name} must be milliseconds: {e}"))),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// Default config file location (`~/.bgh-smart/config.toml`)
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bgh-smart")
            .join("config.toml")
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file; a missing file yields defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load from file (if any), then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::load_from_file(Self::default_path())?,
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `BGH_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(email) = env::var("BGH_EMAIL") {
            self.solidmation.email = email;
        }
        if let Ok(password) = env::var("BGH_PASSWORD") {
            self.solidmation.password = password;
        }
        if let Ok(provider) = env::var("BGH_PROVIDER") {
            self.solidmation.provider = provider.parse()?;
        }
        if let Ok(url) = env::var("BGH_BASE_URL") {
            self.solidmation.base_url = Some(
                Url::parse(&url).map_err(|e| SyncError::config(format!("BGH_BASE_URL: {e}")))?,
            );
        }
        if let Some(window) = env_millis("BGH_CACHE_WINDOW_MS")? {
            self.engine.cache_window = window;
        }
        if let Some(window) = env_millis("BGH_DEBOUNCE_WINDOW_MS")? {
            self.engine.debounce_window = window;
        }
        if let Ok(file) = env::var("BGH_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(file));
        }
        Ok(())
    }

    /// Reject configurations that cannot possibly log in
    pub fn validate(&self) -> Result<()> {
        if self.solidmation.email.trim().is_empty() || self.solidmation.password.is_empty() {
            return Err(SyncError::config(
                "Missing credentials. Set solidmation.email/password or BGH_EMAIL/BGH_PASSWORD",
            ));
        }
        if self.engine.event_capacity == 0 {
            return Err(SyncError::config("engine.event_capacity must be positive"));
        }
        self.solidmation.resolved_base_url()?;
        Ok(())
    }
}

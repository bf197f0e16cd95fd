//! Layered configuration for the webs service.
//!
//! Values are resolved in three layers, later layers winning:
//! `webs.toml` → environment (`WEBS_*`, `.env` loaded by `main`) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//! dev = false
//!
//! [database]
//! path = ".webs/webs.db"
//!
//! [runner]
//! base_url = "http://localhost:4111/api"
//! workflow_name = "webAnalysisWorkflow"
//! timeout_secs = 30
//!
//! [app]
//! base_url = "http://localhost:3000"
//!
//! [stream]
//! poll_interval_ms = 1000
//! keep_alive_secs = 15
//!
//! [webhook]
//! enforce_run_id = true
//!
//! [log]
//! level = "info"
//! format = "pretty"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "webs.toml";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a local front-end dev server.
    #[serde(default)]
    pub dev: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Base URL of the workflow runner API, without trailing slash.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_workflow_name")]
    pub workflow_name: String,
    /// Sent as a bearer token on runner calls when set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_runner_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            base_url: None,
            workflow_name: default_workflow_name(),
            api_key: None,
            timeout_secs: default_runner_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSection {
    /// Public base URL the runner uses to reach the completion webhook.
    /// Falls back to `http://{server.host}:{server.port}`.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSection {
    /// Reject callbacks whose `metadata.runId` differs from the item's active run.
    #[serde(default = "default_true")]
    pub enforce_run_id: bool,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            enforce_run_id: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily-rolling file in this directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_db_path() -> PathBuf {
    PathBuf::from(".webs/webs.db")
}
fn default_workflow_name() -> String {
    "webAnalysisWorkflow".to_string()
}
fn default_runner_timeout_secs() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_keep_alive_secs() -> u64 {
    15
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

/// Full service configuration as read from `webs.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebsConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub log: LogSection,
}

impl WebsConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse webs.toml")?;
        config.check_hard_limits()?;
        Ok(config)
    }

    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize webs.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `WEBS_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WEBS_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("WEBS_PORT") {
            self.server.port = v
                .parse()
                .with_context(|| format!("WEBS_PORT is not a valid port: {}", v))?;
        }
        if let Some(v) = lookup("WEBS_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WEBS_RUNNER_URL") {
            self.runner.base_url = Some(v);
        }
        if let Some(v) = lookup("WEBS_WORKFLOW_NAME") {
            self.runner.workflow_name = v;
        }
        if let Some(v) = lookup("WEBS_RUNNER_API_KEY") {
            self.runner.api_key = Some(v);
        }
        if let Some(v) = lookup("WEBS_APP_BASE_URL") {
            self.app.base_url = Some(v);
        }
        if let Some(v) = lookup("WEBS_POLL_INTERVAL_MS") {
            self.stream.poll_interval_ms = v
                .parse()
                .with_context(|| format!("WEBS_POLL_INTERVAL_MS is not a number: {}", v))?;
        }
        if let Some(v) = lookup("WEBS_ENFORCE_RUN_ID") {
            self.webhook.enforce_run_id = v != "false" && v != "0";
        }
        if let Some(v) = lookup("WEBS_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = lookup("WEBS_LOG_FORMAT") {
            self.log.format = v.parse()?;
        }
        self.check_hard_limits()
    }

    /// Values the service cannot run with at all.
    fn check_hard_limits(&self) -> Result<()> {
        if self.stream.poll_interval_ms == 0 {
            anyhow::bail!("stream.poll_interval_ms must be greater than 0");
        }
        Ok(())
    }

    /// Public URL of this service, used to build the webhook address.
    pub fn app_base_url(&self) -> String {
        match &self.app.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.server.host, self.server.port),
        }
    }

    /// Absolute URL of the completion webhook handed to the runner.
    pub fn webhook_url(&self) -> String {
        format!("{}/webhooks/workflow", self.app_base_url())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream.poll_interval_ms.max(1))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.stream.keep_alive_secs)
    }

    pub fn runner_timeout(&self) -> Duration {
        Duration::from_secs(self.runner.timeout_secs)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match &self.runner.base_url {
            None => warnings.push(
                "runner.base_url is not set; dispatch and retry will fail until it is configured"
                    .to_string(),
            ),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                warnings.push(format!("runner.base_url '{}' is not an http(s) URL", url))
            }
            _ => {}
        }
        if self.runner.workflow_name.trim().is_empty() {
            warnings.push("runner.workflow_name is empty".to_string());
        }
        if self.runner.timeout_secs == 0 {
            warnings.push("runner.timeout_secs of 0 disables runner calls entirely".to_string());
        }
        if !self.webhook.enforce_run_id {
            warnings.push(
                "webhook.enforce_run_id is off; stale callbacks can overwrite a newer run"
                    .to_string(),
            );
        }

        warnings
    }
}

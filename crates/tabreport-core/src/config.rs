//! TabReport configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ReportError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

impl ReportConfig {
    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReportError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ReportError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ReportError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TabReport home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tabreport")
    }

    /// Override hosts and secrets from environment variables.
    ///
    /// Takes a lookup function so callers can pass `std::env::var` or a map.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("SMTP_SERVER") {
            self.email.smtp_host = host;
            self.email.enabled = true;
        }
        if let Some(port) = get("SMTP_PORT") {
            match port.trim().parse() {
                Ok(p) => self.email.smtp_port = p,
                Err(_) => tracing::warn!("⚠️ Ignoring invalid SMTP_PORT '{port}'"),
            }
        }
        if let Some(sender) = get("SENDER_EMAIL") {
            if self.email.username.is_empty() {
                self.email.username = sender.clone();
            }
            self.email.from_address = sender;
        }
        if let Some(password) = get("SENDER_PASSWORD") {
            self.email.password = password;
        }
        if let Some(token) = get("WHATSAPP_ACCESS_TOKEN") {
            self.whatsapp.access_token = token;
            self.whatsapp.enabled = true;
        }
        if let Some(phone_id) = get("WHATSAPP_PHONE_NUMBER_ID") {
            self.whatsapp.phone_number_id = phone_id;
        }
        if let Some(base_url) = get("BASE_URL") {
            self.artifacts.base_url = base_url;
        }
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 8501 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// On-disk locations of the schedule store and the downloaded datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// SQLite file the Tableau downloader writes datasets into.
    #[serde(default = "default_datasets_db")]
    pub datasets_db: String,
}

fn default_db_path() -> String { "~/.tabreport/schedules.db".into() }
fn default_datasets_db() -> String { "~/.tabreport/tableau_data.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            datasets_db: default_datasets_db(),
        }
    }
}

/// Scheduler loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// How long a claimed job stays locked to this worker.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Lease owner name. Empty = host name.
    #[serde(default)]
    pub worker_id: String,
}

fn default_tick_secs() -> u64 { 60 }
fn default_max_concurrent_runs() -> usize { 4 }
fn default_lease_secs() -> u64 { 900 }
fn default_shutdown_grace_secs() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            lease_secs: default_lease_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            worker_id: String::new(),
        }
    }
}

impl SchedulerConfig {
    /// Worker id used as lease owner: configured value, else the host name.
    pub fn resolved_worker_id(&self) -> String {
        if !self.worker_id.trim().is_empty() {
            return self.worker_id.trim().to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "tabreport-worker".into())
    }
}

/// SMTP delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            display_name: None,
        }
    }
}

/// WhatsApp Business Cloud API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default = "default_whatsapp_api_base")]
    pub api_base: String,
    /// Payloads larger than this are sent as a link instead of a document.
    #[serde(default = "default_attachment_limit")]
    pub attachment_limit_bytes: usize,
}

fn default_whatsapp_api_base() -> String { "https://graph.facebook.com/v21.0".into() }
fn default_attachment_limit() -> usize { 5 * 1024 * 1024 }

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            access_token: String::new(),
            phone_number_id: String::new(),
            api_base: default_whatsapp_api_base(),
            attachment_limit_bytes: default_attachment_limit(),
        }
    }
}

/// Where published report files live and how they are reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_dir")]
    pub dir: String,
    /// Public base URL of the gateway; links are `<base_url>/reports/<file>`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Hours a published report link stays valid before the sweep deletes it.
    #[serde(default = "default_link_ttl_hours")]
    pub link_ttl_hours: u64,
}

fn default_artifacts_dir() -> String { "~/.tabreport/reports".into() }
fn default_base_url() -> String { "http://localhost:8501".into() }
fn default_link_ttl_hours() -> u64 { 24 }

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
            base_url: default_base_url(),
            link_ttl_hours: default_link_ttl_hours(),
        }
    }
}

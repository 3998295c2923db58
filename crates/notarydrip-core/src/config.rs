//! NotaryDrip configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DripError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DripConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub template: TemplateConfig,
}

impl DripConfig {
    /// Load config from the default path (~/.notarydrip/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DripError::Config(format!("Failed to read config: {e}")))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| DripError::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env();
        config.validate()?;
        tracing::debug!("⚙️ Loaded config from {}", path.display());
        Ok(config)
    }

    /// Secrets from the environment win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("NOTARYDRIP_EMAIL_API_KEY") {
            self.email.api_key = key;
        }
        if let Ok(pw) = std::env::var("NOTARYDRIP_SMTP_PASSWORD") {
            self.email.smtp_password = pw;
        }
        if let Ok(token) = std::env::var("NOTARYDRIP_SMS_AUTH_TOKEN") {
            self.sms.auth_token = token;
        }
        if let Ok(token) = std::env::var("NOTARYDRIP_API_TOKEN") {
            self.gateway.api_token = Some(token);
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.engine.timezone()?;
        if self.engine.sweep_interval_secs == 0 {
            return Err(DripError::Config("engine.sweep_interval_secs must be > 0".into()));
        }
        if self.engine.batch_size == 0 {
            return Err(DripError::Config("engine.batch_size must be > 0".into()));
        }
        if self.engine.claim_lease_secs <= self.engine.dispatch_timeout_secs {
            return Err(DripError::Config(
                "engine.claim_lease_secs must be greater than engine.dispatch_timeout_secs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(DripError::Config("retry.jitter must be within 0.0..=1.0".into()));
        }
        Ok(())
    }

    /// Save config to a path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DripError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the NotaryDrip home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".notarydrip")
    }
}

/// Expand `~` in configured paths.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Sweep loop and scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// IANA name of the timezone send windows are evaluated in.
    #[serde(default = "default_timezone")]
    pub reference_timezone: String,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    /// How long an idempotency claim on a pending send stays exclusive. A
    /// worker that dies mid-send leaves its claim behind; once the lease
    /// lapses another worker may take the send over. Must exceed the
    /// dispatch timeout.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
    /// Identifies this replica on idempotency claims. Defaults to hostname + pid.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_sweep_interval() -> u64 { 60 }
fn default_batch_size() -> usize { 100 }
fn default_timezone() -> String { "America/New_York".into() }
fn default_dispatch_timeout() -> u64 { 30 }
fn default_claim_lease() -> u64 { 300 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            batch_size: default_batch_size(),
            reference_timezone: default_timezone(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            claim_lease_secs: default_claim_lease(),
            worker_id: None,
        }
    }
}

impl EngineConfig {
    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.reference_timezone.parse::<chrono_tz::Tz>().map_err(|e| {
            DripError::Config(format!(
                "Unknown reference_timezone '{}': {e}",
                self.reference_timezone
            ))
        })
    }
}

/// Retry/backoff settings for transient dispatch failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before each retry. The number of entries is the number of
    /// retries; total attempts = len + 1.
    #[serde(default = "default_backoff")]
    pub backoff_secs: Vec<u64>,
    /// Random spread applied to each delay, as a fraction (0.1 = ±10%).
    #[serde(default)]
    pub jitter: f64,
}

fn default_backoff() -> Vec<u64> { vec![60, 300, 1800, 7200] }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_secs: default_backoff(),
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.notarydrip/notarydrip.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Admin/intake HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token required on `/api/*`. None disables auth.
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_port() -> u16 { 3100 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            api_token: None,
        }
    }
}

/// Which email transport to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailProvider {
    Sendgrid,
    Smtp,
    #[default]
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub provider: EmailProvider,
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub from_name: Option<String>,
    /// HTTP API key (sendgrid).
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_email_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
}

fn default_email_api_base() -> String { "https://api.sendgrid.com".into() }
fn default_smtp_port() -> u16 { 587 }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: EmailProvider::default(),
            from_email: String::new(),
            from_name: None,
            api_key: String::new(),
            api_base: default_email_api_base(),
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            smtp_username: String::new(),
            smtp_password: String::new(),
        }
    }
}

/// Which SMS transport to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsProvider {
    Twilio,
    #[default]
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub provider: SmsProvider,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    #[serde(default = "default_sms_api_base")]
    pub api_base: String,
}

fn default_sms_api_base() -> String { "https://api.twilio.com".into() }

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            provider: SmsProvider::default(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            api_base: default_sms_api_base(),
        }
    }
}

/// Defaults merged under every template's variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_company")]
    pub company_name: String,
    #[serde(default)]
    pub support_email: String,
    #[serde(default)]
    pub form_link: String,
    /// HTML layout for email bodies, using `{{subject}}` and `{{content}}`.
    #[serde(default)]
    pub email_layout: Option<String>,
}

fn default_company() -> String { "NotaryDrip".into() }

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            company_name: default_company(),
            support_email: String::new(),
            form_link: String::new(),
            email_layout: None,
        }
    }
}

impl TemplateConfig {
    /// The config-level variables as a map.
    pub fn defaults(&self) -> std::collections::HashMap<String, String> {
        let mut vars = std::collections::HashMap::new();
        vars.insert("company_name".to_string(), self.company_name.clone());
        if !self.support_email.is_empty() {
            vars.insert("support_email".to_string(), self.support_email.clone());
        }
        if !self.form_link.is_empty() {
            vars.insert("form_link".to_string(), self.form_link.clone());
        }
        vars
    }
}

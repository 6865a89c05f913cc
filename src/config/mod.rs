use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub meetings: MeetingsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Offset of the school's local time from UTC, in minutes (Asia/Dhaka = 360)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    /// Public base URL used to build gateway callback URLs
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Browser origins allowed to call the API (the web frontend)
    #[serde(default = "default_cors_allowed_origins")]
    pub cors_allowed_origins: Vec<String>,
}

impl ServerConfig {
    /// The configured local offset, falling back to UTC when out of range
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            utc_offset_minutes: default_utc_offset_minutes(),
            public_url: default_public_url(),
            cors_allowed_origins: default_cors_allowed_origins(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_utc_offset_minutes() -> i32 {
    360
}

fn default_public_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_cors_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Days a login token stays valid
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
    /// Bootstrap admin created at startup when no admin exists
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_days: default_session_ttl_days(),
            admin_email: None,
            admin_password: None,
        }
    }
}

fn default_session_ttl_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_requests")]
    pub api_requests_per_window: u32,
    #[serde(default = "default_webhook_requests")]
    pub webhook_requests_per_window: u32,
    #[serde(default = "default_auth_requests")]
    pub auth_requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_requests_per_window: default_api_requests(),
            webhook_requests_per_window: default_webhook_requests(),
            auth_requests_per_window: default_auth_requests(),
            window_seconds: default_window_seconds(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_requests() -> u32 {
    100
}

fn default_webhook_requests() -> u32 {
    500
}

fn default_auth_requests() -> u32 {
    20
}

fn default_window_seconds() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeetingsConfig {
    /// Microsoft Teams via Microsoft Graph. Unset disables Teams meeting creation.
    pub teams: Option<TeamsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamsConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// User id or UPN whose calendar owns the events
    pub organizer: String,
    #[serde(default = "default_authority_url")]
    pub authority_url: String,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    #[serde(default = "default_graph_scope")]
    pub scope: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_authority_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_graph_scope() -> String {
    "https://graph.microsoft.com/.default".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub whatsapp: Option<WhatsAppConfig>,
    /// Where assessment submissions and weekly reports go
    pub admin_email: Option<String>,
    pub admin_whatsapp: Option<String>,
    #[serde(default = "default_reminder_lead_minutes")]
    pub reminder_lead_minutes: i64,
    #[serde(default = "default_reminder_interval")]
    pub reminder_interval_seconds: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            email: None,
            whatsapp: None,
            admin_email: None,
            admin_whatsapp: None,
            reminder_lead_minutes: default_reminder_lead_minutes(),
            reminder_interval_seconds: default_reminder_interval(),
        }
    }
}

fn default_reminder_lead_minutes() -> i64 {
    60
}

fn default_reminder_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default = "default_true")]
    pub smtp_tls: bool,
    pub from_address: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_from_name() -> String {
    "Amar Quran".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender number, with or without the `whatsapp:` prefix
    pub from_number: String,
    #[serde(default = "default_twilio_api_base")]
    pub api_base_url: String,
}

fn default_twilio_api_base() -> String {
    "https://api.twilio.com".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentsConfig {
    pub stripe: Option<StripeConfig>,
    pub sslcommerz: Option<SslCommerzConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    #[serde(default = "default_stripe_api_base")]
    pub api_base_url: String,
    /// Maximum age of a signed webhook, in seconds
    #[serde(default = "default_signature_tolerance")]
    pub signature_tolerance_seconds: i64,
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_signature_tolerance() -> i64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslCommerzConfig {
    pub store_id: String,
    pub store_password: String,
    #[serde(default = "default_true")]
    pub sandbox: bool,
    /// Overrides the sandbox/live host, mainly for testing
    pub base_url: Option<String>,
}

impl SslCommerzConfig {
    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.sandbox => "https://sandbox.sslcommerz.com".to_string(),
            None => "https://securepay.sslcommerz.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Local directory for backup artifacts, relative to data_dir when not absolute
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Uploaded media to archive alongside the database
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_backup_interval")]
    pub interval_seconds: u64,
    pub s3_bucket: Option<String>,
    #[serde(default = "default_s3_prefix")]
    pub s3_prefix: String,
    pub s3_region: Option<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backup_dir: default_backup_dir(),
            media_dir: default_media_dir(),
            retention_days: default_retention_days(),
            interval_seconds: default_backup_interval(),
            s3_bucket: None,
            s3_prefix: default_s3_prefix(),
            s3_region: None,
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("./media")
}

fn default_retention_days() -> i64 {
    30
}

fn default_backup_interval() -> u64 {
    86_400
}

fn default_s3_prefix() -> String {
    "backups/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_true")]
    pub weekly_enabled: bool,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            weekly_enabled: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            meetings: MeetingsConfig::default(),
            notifications: NotificationsConfig::default(),
            payments: PaymentsConfig::default(),
            backup: BackupConfig::default(),
            reports: ReportsConfig::default(),
        }
    }
}

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub crm: CrmConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub db: DbConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL Twilio can reach (https://...), no trailing slash.
    pub external_url: String,
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,
}

fn default_route_prefix() -> String {
    "/outgoing".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Caller ID for outbound calls (E.164).
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrmConfig {
    #[serde(default = "default_crm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub location_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: default_crm_base_url(),
            location_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

fn default_crm_base_url() -> String {
    "https://services.leadconnectorhq.com".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifierConfig {
    /// Chat webhook URL for operational events. Empty disables notifications.
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_max_active_calls")]
    pub max_active_calls: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// In-flight entries older than this are reset to pending at startup.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// Civil time zone for wall-clock retry anchors (IANA name).
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_active_calls: default_max_active_calls(),
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
            stale_after_secs: default_stale_after_secs(),
            timezone: default_timezone(),
        }
    }
}

fn default_max_active_calls() -> usize {
    3
}

fn default_interval_ms() -> u64 {
    10_000
}

/// Floor for the scheduler tick; shorter intervals hammer the carrier API.
pub const MIN_INTERVAL_MS: u64 = 5_000;

fn default_max_attempts() -> i64 {
    10
}

fn default_stale_after_secs() -> i64 {
    300
}

fn default_timezone() -> String {
    "Europe/Rome".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "outdial.db".to_string()
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config: Config = toml::from_str(&contents)?;

        // Allow env var overrides for secrets and deploy-specific values
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            config.twilio.account_sid = v;
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            config.twilio.auth_token = v;
        }
        if let Ok(v) = std::env::var("TWILIO_PHONE_NUMBER") {
            config.twilio.phone_number = v;
        }
        if let Ok(v) = std::env::var("AGENT_ID") {
            config.agent.agent_id = v;
        }
        if let Ok(v) = std::env::var("AGENT_API_KEY") {
            config.agent.api_key = v;
        }
        if let Ok(v) = std::env::var("CRM_LOCATION_ID") {
            config.crm.location_id = v;
        }
        if let Ok(v) = std::env::var("NOTIFIER_WEBHOOK_URL") {
            config.notifier.webhook_url = v;
        }
        if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
            config.server.external_url = v;
        }
        if let Ok(v) = std::env::var("DB_PATH") {
            config.db.path = v;
        }
        if let Ok(v) = std::env::var("MAX_ACTIVE_CALLS") {
            config.queue.max_active_calls = v.parse()?;
        }
        if let Ok(v) = std::env::var("QUEUE_INTERVAL_MS") {
            config.queue.interval_ms = v.parse()?;
        }

        if config.queue.interval_ms < MIN_INTERVAL_MS {
            tracing::warn!(
                configured = config.queue.interval_ms,
                floor = MIN_INTERVAL_MS,
                "Queue interval below floor, clamping"
            );
            config.queue.interval_ms = MIN_INTERVAL_MS;
        }

        Ok(config)
    }

    /// Base for routes Twilio calls back into, e.g. "https://host/outgoing".
    pub fn public_route_base(&self) -> String {
        format!(
            "{}{}",
            self.server.external_url.trim_end_matches('/'),
            self.server.route_prefix
        )
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("OUTDIAL_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".outdial")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("OUTDIAL_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}

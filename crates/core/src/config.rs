use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Directory for the WhatsApp client's file-backed auth. Created on
    /// startup if missing.
    pub session_storage_path: PathBuf,
    /// CORS allow-list anchor for the dashboard.
    pub frontend_url: Option<String>,
    pub log_level: String,
    pub port: u16,
    /// Optional HMAC-SHA256 key for signing outbound webhook bodies.
    pub webhook_secret: Option<String>,
}

impl AppConfig {
    /// Load from process environment: `DATABASE_URL`, `SESSION_STORAGE_PATH`,
    /// `FRONTEND_URL`, `LOG_LEVEL`, `PORT`, `WEBHOOK_SECRET`.
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("database_url", "sqlite://wabridge.db?mode=rwc")?
            .set_default("session_storage_path", "./sessions")?
            .set_default("log_level", "info")?
            .set_default("port", 3000)?
            .add_source(Environment::default())
            .build()?;

        s.try_deserialize()
    }
}

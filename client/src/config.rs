use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::transport::Identity;

/// Top-level client configuration, loaded from rollcall.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerSection,
    pub identity: IdentitySection,
    pub session: SessionSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// WebSocket endpoint of the attendance channel.
    pub url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/attendance".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub email: String,
    /// Dashboard role; decides which commands are offered.
    pub role: String,
    /// Bearer token for the upgrade request.
    pub token: Option<String>,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            email: String::new(),
            role: "teacher".into(),
            token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// How long a create/join waits for its acknowledgement.
    pub ack_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter used when RUST_LOG is unset.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl ClientConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, String> {
        if !Path::new(path).exists() {
            info!("No config file found at {}, using defaults", path);
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {}", path, e))?;
        Self::parse(&contents).map_err(|e| format!("failed to parse config file {}: {}", path, e))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `ROLLCALL_*` overrides from `lookup`. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_SERVER_URL") {
            self.server.url = v;
        }
        if let Some(v) = lookup("ROLLCALL_EMAIL") {
            self.identity.email = v;
        }
        if let Some(v) = lookup("ROLLCALL_ROLE") {
            self.identity.role = v;
        }
        if let Some(v) = lookup("ROLLCALL_TOKEN") {
            self.identity.token = Some(v).filter(|t| !t.is_empty());
        }
        if let Some(v) = lookup("ROLLCALL_ACK_TIMEOUT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.session.ack_timeout_secs = secs;
        }
        if let Some(v) = lookup("ROLLCALL_LOG") {
            self.logging.level = v;
        }
    }

    pub fn identity(&self) -> Identity {
        let identity = Identity::new(&self.identity.email, &self.identity.role);
        match &self.identity.token {
            Some(token) => identity.with_token(token),
            None => identity,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.session.ack_timeout_secs)
    }
}

use crate::{env_or_default, env_parse, ConfigError, FromEnv};

/// Broker endpoint and credentials for the NATS JetStream backend
#[derive(Clone, Debug)]
pub struct NatsConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Client name reported to the server (shows up in `nats server report connections`)
    pub connection_name: String,
    url_override: Option<String>,
}

impl NatsConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
            connection_name: "notification-pipeline".to_string(),
            url_override: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    /// Server URL, `NATS_URL` wins over host/port when set
    pub fn url(&self) -> String {
        match &self.url_override {
            Some(url) => url.clone(),
            None => format!("nats://{}:{}", self.host, self.port),
        }
    }

    /// Credentials only count when both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

impl FromEnv for NatsConfig {
    /// Reads from environment variables with defaults matching the compose setup:
    /// - NATS_URL: full server URL, overrides host/port
    /// - NATS_HOST: defaults to "nats"
    /// - NATS_PORT: defaults to 4222
    /// - NATS_USER / NATS_PASSWORD: optional
    /// - NATS_CONNECTION_NAME: defaults to "notification-pipeline"
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("NATS_HOST", "nats");
        let port = env_parse("NATS_PORT", 4222)?;

        Ok(Self {
            host,
            port,
            user: std::env::var("NATS_USER").ok().filter(|v| !v.is_empty()),
            password: std::env::var("NATS_PASSWORD").ok().filter(|v| !v.is_empty()),
            connection_name: env_or_default("NATS_CONNECTION_NAME", "notification-pipeline"),
            url_override: std::env::var("NATS_URL").ok().filter(|v| !v.is_empty()),
        })
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::new("localhost", 4222)
    }
}

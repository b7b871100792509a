//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Service configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Port the HTTP server listens on.
    pub port: u16,
    /// Path of the libSQL database file.
    pub db_path: String,
    /// Ticketing system settings.
    pub jira: JiraConfig,
}

/// Settings for the Jira-compatible Service Desk API.
#[derive(Debug, Clone)]
pub struct JiraConfig {
    /// Base URL, e.g. `https://jira.example.com`. `None` disables ticketing.
    pub base_url: Option<String>,
    /// Bearer token.
    pub api_token: SecretString,
    /// Upper bound for any single ticketing request.
    pub timeout: Duration,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: SecretString::from(String::new()),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5003,
            db_path: "./data/onboarding.db".to_string(),
            jira: JiraConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr = lookup("ONBOARDING_BIND_ADDR").unwrap_or(defaults.bind_addr);
        let port = parse_or("ONBOARDING_PORT", lookup("ONBOARDING_PORT"), defaults.port)?;
        let db_path = lookup("ONBOARDING_DB_PATH").unwrap_or(defaults.db_path);

        let base_url = lookup("JIRA_BASE_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());
        let api_token = SecretString::from(lookup("JIRA_API_TOKEN").unwrap_or_default());
        let timeout_secs: u64 = parse_or(
            "JIRA_TIMEOUT_SECS",
            lookup("JIRA_TIMEOUT_SECS"),
            defaults.jira.timeout.as_secs(),
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JIRA_TIMEOUT_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            port,
            db_path,
            jira: JiraConfig {
                base_url,
                api_token,
                timeout: Duration::from_secs(timeout_secs),
            },
        })
    }

    /// `host:port` string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(s) => s.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{s:?}: {e}"),
        }),
    }
}

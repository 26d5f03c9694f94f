use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File};
use feed_client::RetryPolicy;
use serde::Deserialize;
use shared::domain::Credential;
use thiserror::Error;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "timer.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub broadcast_host: String,
    pub broadcast_port: u16,
    pub data_dir: PathBuf,
    pub feed_ws_url: String,
    pub feed_api_url: String,
    pub client_id: Option<String>,
    pub access_token: Option<String>,
    pub broadcaster_id: Option<String>,
    pub reconnect_base_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub tick_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broadcast_host: "127.0.0.1".into(),
            broadcast_port: 8081,
            data_dir: PathBuf::from("./data"),
            feed_ws_url: feed_client::DEFAULT_FEED_URL.into(),
            feed_api_url: "https://api.twitch.tv/helix".into(),
            client_id: None,
            access_token: None,
            broadcaster_id: None,
            reconnect_base_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 5,
            tick_interval_ms: 1000,
        }
    }
}

/// Defaults, then the TOML file, then `APP__*` environment variables.
/// `path` names a file that must exist; without it `timer.toml` is read
/// when present.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let defaults = Settings::default();
    let (file, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    let settings: Settings = Config::builder()
        .set_default("broadcast_host", defaults.broadcast_host)?
        .set_default("broadcast_port", u64::from(defaults.broadcast_port))?
        .set_default("data_dir", defaults.data_dir.to_string_lossy().into_owned())?
        .set_default("feed_ws_url", defaults.feed_ws_url)?
        .set_default("feed_api_url", defaults.feed_api_url)?
        .set_default("reconnect_base_ms", defaults.reconnect_base_ms)?
        .set_default("reconnect_max_delay_ms", defaults.reconnect_max_delay_ms)?
        .set_default("reconnect_max_attempts", u64::from(defaults.reconnect_max_attempts))?
        .set_default("tick_interval_ms", defaults.tick_interval_ms)?
        .add_source(File::from(file.as_path()).required(required))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    Ok(settings)
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcast_port == 0 {
            return Err(invalid("broadcast_port", "must be non-zero"));
        }
        if self.broadcast_host.trim().is_empty() {
            return Err(invalid("broadcast_host", "must not be empty"));
        }
        check_url("feed_ws_url", &self.feed_ws_url, &["ws", "wss"])?;
        check_url("feed_api_url", &self.feed_api_url, &["http", "https"])?;
        if self.reconnect_base_ms == 0 {
            return Err(invalid("reconnect_base_ms", "must be non-zero"));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_ms {
            return Err(invalid(
                "reconnect_max_delay_ms",
                format!(
                    "{} is below reconnect_base_ms {}",
                    self.reconnect_max_delay_ms, self.reconnect_base_ms
                ),
            ));
        }
        if self.reconnect_max_attempts == 0 {
            return Err(invalid("reconnect_max_attempts", "must be non-zero"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms", "must be non-zero"));
        }
        Ok(())
    }

    /// Feed credential, or `None` when any part is missing or blank.
    pub fn credential(&self) -> Option<Credential> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Some(Credential {
            client_id: present(&self.client_id)?,
            access_token: present(&self.access_token)?,
            broadcaster_id: present(&self.broadcaster_id)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn check_url(field: &'static str, raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|error| invalid(field, format!("{raw}: {error}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(
            field,
            format!("scheme `{}` is not one of {}", url.scheme(), schemes.join(", ")),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

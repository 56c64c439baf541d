use std::{env, str::FromStr, time::Duration};

use tracing::info;

const DEFAULT_PORT: u16 = 9500;
const DEFAULT_PAGE_SIZE: i64 = 50;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Tuning for a live notification feed
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Records fetched on initialization
    pub page_size: i64,
    /// Cap on the list size; `None` keeps every inserted record
    pub max_items: Option<usize>,
    pub reconnect_delay: Duration,
    /// Consecutive failed stream openings tolerated before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_items: None,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self {
            page_size: parse_or("FEED_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            max_items: parse_optional("FEED_MAX_ITEMS")?,
            reconnect_delay: Duration::from_millis(parse_or(
                "FEED_RECONNECT_DELAY_MS",
                DEFAULT_RECONNECT_DELAY_MS,
            )?),
            max_reconnect_attempts: parse_or(
                "FEED_MAX_RECONNECT_ATTEMPTS",
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            )?,
        }
        .validate()
    }

    /// Reject sizes that would leave the feed permanently empty
    fn validate(self) -> Result<Self, ConfigError> {
        if self.page_size <= 0 {
            return Err(ConfigError::Invalid {
                key: "FEED_PAGE_SIZE".to_string(),
                value: self.page_size.to_string(),
            });
        }
        if self.max_items == Some(0) {
            return Err(ConfigError::Invalid {
                key: "FEED_MAX_ITEMS".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub feed: FeedConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            port: parse_or("PORT", DEFAULT_PORT)?,
            feed: FeedConfig::from_env()?,
        })
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key.to_string()))
}

fn parse_value<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value,
    })
}

fn parse_or<T: FromStr + std::fmt::Display>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => parse_value(key, value),
        Err(_) => {
            info!("{} not set, using default: {}", key, default);
            Ok(default)
        }
    }
}

fn parse_optional<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => parse_value(key, value).map(Some),
        _ => Ok(None),
    }
}

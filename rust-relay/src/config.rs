//! Configuration module for environment variable parsing.
//!
//! Everything the relay needs is read from the environment once at startup.

use std::env;
use std::time::Duration;
use tracing::warn;

/// Default SparkLoop API base URL (v2).
pub const DEFAULT_SPARKLOOP_API_BASE: &str = "https://api.sparkloop.app/v2";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// Shared secret for Ghost signatures and static bearer/query tokens.
    /// When unset, inbound requests are not authenticated.
    pub auth_token: Option<String>,

    /// SparkLoop API key sent as `X-Api-Key`
    pub sparkloop_api_key: Option<String>,

    /// SparkLoop API base URL, without a trailing slash
    pub sparkloop_api_base: String,

    /// Discord incoming webhook URL
    pub discord_webhook_url: Option<String>,

    /// Slack incoming webhook URL
    pub slack_webhook_url: Option<String>,

    /// Maximum POST requests per source address within the window
    pub rate_limit_max: usize,

    /// Sliding window length in milliseconds
    pub rate_limit_window_ms: u64,

    /// HTTP request timeout in milliseconds for outbound calls
    pub request_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            port: parse_or("PORT", 8080),

            auth_token: non_blank("AUTH_TOKEN"),

            sparkloop_api_key: non_blank("SPARKLOOP_API_KEY"),

            sparkloop_api_base: non_blank("SPARKLOOP_API_BASE")
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_SPARKLOOP_API_BASE.to_string()),

            discord_webhook_url: non_blank("DISCORD_WEBHOOK_URL"),

            slack_webhook_url: non_blank("SLACK_WEBHOOK_URL"),

            rate_limit_max: parse_or("RATE_LIMIT_MAX", 10),

            rate_limit_window_ms: parse_or("RATE_LIMIT_WINDOW_MS", 60_000),

            request_timeout_ms: parse_or("REQUEST_TIMEOUT_MS", 8000),
        }
    }

    /// Sliding window length for the rate limiter.
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    /// Timeout applied to every outbound HTTP request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            auth_token: None,
            sparkloop_api_key: None,
            sparkloop_api_base: DEFAULT_SPARKLOOP_API_BASE.to_string(),
            discord_webhook_url: None,
            slack_webhook_url: None,
            rate_limit_max: 10,
            rate_limit_window_ms: 60_000,
            request_timeout_ms: 8000,
        }
    }
}

/// Parse a numeric variable, falling back to `default` when unset or malformed.
fn parse_or<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(env_var = name, value = %raw, "Invalid numeric value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read an optional variable, treating blank values as unset.
fn non_blank(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

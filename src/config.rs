//! Configuration for the failover gateway
//!
//! The CLI layer produces a validated [`Config`]; everything else consumes it
//! as a plain struct.

use std::time::Duration;

use clap::ValueEnum;
use eyre::Result;

/// Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Endpoint selection strategy for new downstream sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// First online endpoint in fixed order, oldest-offline fallback
    #[value(name = "roundrobin")]
    RoundRobin,
    /// Stick to earlier endpoints until their failure budget is exhausted
    #[value(name = "primary-instant")]
    PrimaryInstant,
    /// Serve from a secondary while probing the primary in the background
    #[value(name = "primary-async")]
    PrimaryAsync,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::RoundRobin => "roundrobin",
            Strategy::PrimaryInstant => "primary-instant",
            Strategy::PrimaryAsync => "primary-async",
        };
        f.write_str(name)
    }
}

/// Validated gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint selection strategy
    pub strategy: Strategy,
    /// Maximum failed attempts before moving past an endpoint (primary-* strategies)
    pub max_attempts: u32,
    /// Delay between background reconnect probes to the primary (primary-async)
    pub reconnect_timeout: Duration,
    /// Port the WebSocket listener binds to
    pub port: u16,
    /// Longest tolerated gap between block header notifications
    pub header_timeout: Duration,
    /// Upstream WebSocket URLs, in priority order
    pub endpoints: Vec<String>,
}

impl Config {
    /// Validate the configuration, rejecting empty pools and non-ws URLs
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one upstream endpoint is required".to_string(),
            )
            .into());
        }

        for endpoint in &self.endpoints {
            validate_endpoint_url(endpoint)?;
        }

        Ok(())
    }
}

/// Validate that a string is a WebSocket URL (ws:// or wss://)
fn validate_endpoint_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !parsed.scheme().starts_with("ws") {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "scheme must be ws:// or wss://".to_string(),
        }
        .into());
    }

    Ok(())
}

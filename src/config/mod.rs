//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`SECCONV_*`)
//!
//! All durations are carried in seconds and converted at the point of use.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::token::KeyPolicy;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Token caching and key policy
    #[serde(default)]
    pub token_policy: TokenPolicy,

    /// Renewal and rollover scheduling
    #[serde(default)]
    pub renewal: RenewalConfig,

    /// Close handshake behavior
    #[serde(default)]
    pub close: CloseConfig,

    /// Transport settings
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SECCONV_CACHE_THRESHOLD_PCT") {
            if let Ok(val) = val.parse() {
                config.token_policy.cache_threshold_pct = val;
            }
        }
        if let Ok(val) = std::env::var("SECCONV_MAX_CACHING_SECS") {
            if let Ok(val) = val.parse() {
                config.token_policy.max_caching_secs = val;
            }
        }
        if let Ok(val) = std::env::var("SECCONV_RENEWAL_THRESHOLD_PCT") {
            if let Ok(val) = val.parse() {
                config.renewal.renewal_threshold_pct = val;
            }
        }
        if let Ok(val) = std::env::var("SECCONV_ROLLOVER_SECS") {
            if let Ok(val) = val.parse() {
                config.renewal.rollover_interval_secs = val;
            }
        }
        if let Ok(val) = std::env::var("SECCONV_CLOSE_TIMEOUT_SECS") {
            if let Ok(val) = val.parse() {
                config.close.close_timeout_secs = val;
            }
        }

        config
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.token_policy.cache_threshold_pct == 0 || self.token_policy.cache_threshold_pct > 100
        {
            return Err(Error::Config(format!(
                "cache_threshold_pct must be in (0,100], got {}",
                self.token_policy.cache_threshold_pct
            )));
        }
        if self.renewal.renewal_threshold_pct == 0 || self.renewal.renewal_threshold_pct > 100 {
            return Err(Error::Config(format!(
                "renewal_threshold_pct must be in (0,100], got {}",
                self.renewal.renewal_threshold_pct
            )));
        }
        if self.token_policy.accepted_key_bits.is_empty() {
            return Err(Error::Config(
                "accepted_key_bits must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Token caching and key acceptance policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPolicy {
    /// Percentage of the validity interval after which a cached token is
    /// treated as expired
    pub cache_threshold_pct: u8,

    /// Upper bound on how long any token may be cached, in seconds
    pub max_caching_secs: u64,

    /// Accepted symmetric key sizes in bits
    pub accepted_key_bits: Vec<u16>,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            cache_threshold_pct: 90,
            max_caching_secs: 24 * 60 * 60,
            accepted_key_bits: vec![128, 192, 256],
        }
    }
}

impl TokenPolicy {
    /// Caching cap as a `chrono` duration
    pub fn max_caching(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_caching_secs as i64)
    }

    /// Key policy derived from the accepted bit lengths
    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy::new(self.accepted_key_bits.clone())
    }
}

/// Renewal and rollover scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// Percentage of the validity interval after which the channel renews
    /// its session key
    pub renewal_threshold_pct: u8,

    /// Hard ceiling on the renewal interval, in seconds
    pub max_renewal_interval_secs: u64,

    /// Grace window during which the superseded token still verifies
    /// incoming messages, in seconds
    pub rollover_interval_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            renewal_threshold_pct: 85,
            max_renewal_interval_secs: 10 * 60 * 60,
            rollover_interval_secs: 5 * 60,
        }
    }
}

impl RenewalConfig {
    /// Renewal ceiling as a `chrono` duration
    pub fn max_renewal_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_renewal_interval_secs as i64)
    }

    /// Rollover grace window as a `chrono` duration
    pub fn rollover_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.rollover_interval_secs as i64)
    }
}

/// Close handshake behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseConfig {
    /// Whether a close initiated by the remote side is accepted
    pub allow_remote_close: bool,

    /// Default budget for the full close handshake, in seconds
    pub close_timeout_secs: u64,
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            allow_remote_close: true,
            close_timeout_secs: 60,
        }
    }
}

impl CloseConfig {
    /// Close budget as a std duration
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Budget for opening a transport channel, in seconds
    pub connect_timeout_secs: u64,

    /// Maximum frame size accepted from the wire, in bytes
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

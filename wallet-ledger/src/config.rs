//! Configuration for the wallet ledger

use crate::math::DEFAULT_SCALE;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Decimal engine configuration
    pub math: MathConfig,

    /// Integrity checksum configuration
    pub checksum: ChecksumConfig,

    /// Lock manager configuration
    pub lock: LockConfig,

    /// Balance cache configuration
    pub cache: CacheConfig,

    /// Wallet defaults
    pub wallet: WalletConfig,
}

/// Decimal engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MathConfig {
    /// Fractional digits kept by arithmetic results
    pub scale: u32,
}

impl Default for MathConfig {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
        }
    }
}

/// Integrity checksum configuration
///
/// With checksums disabled, checksum columns stay empty and tampering
/// cannot be detected.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    /// Stamp and verify checksums
    pub enabled: bool,

    /// HMAC secret
    pub secret: String,
}

impl std::fmt::Debug for ChecksumConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumConfig")
            .field("enabled", &self.enabled)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Lock backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockDriver {
    /// In-process lock table (single-process hosts)
    Memory,
    /// Locks stored in a shared keyed cache
    Cache,
}

/// Lock manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Backend
    pub driver: LockDriver,

    /// Maximum time a lock may be held before it expires
    pub ttl_seconds: u64,

    /// Maximum time to wait for a lock before failing
    pub timeout_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            driver: LockDriver::Memory,
            ttl_seconds: 5,
            timeout_seconds: 5,
        }
    }
}

impl LockConfig {
    /// Lock TTL
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Acquisition timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Balance cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime; 0 keeps entries until evicted explicitly
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 600 } // 10 minutes
    }
}

impl CacheConfig {
    /// Entry lifetime, `None` for no expiry
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }
}

/// Wallet defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Name of a wallet created without one
    pub default_name: String,

    /// Slug of a wallet created without name or slug
    pub default_slug: String,

    /// Decimal places of a wallet created without explicit precision
    pub decimal_places: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            default_name: "Default Wallet".to_string(),
            default_slug: "default".to_string(),
            decimal_places: 2,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(enabled) = std::env::var("LEDGER_CHECKSUM_ENABLED") {
            config.checksum.enabled = parse_var("LEDGER_CHECKSUM_ENABLED", &enabled)?;
        }

        if let Ok(secret) = std::env::var("LEDGER_CHECKSUM_SECRET") {
            config.checksum.secret = secret;
        }

        if let Ok(scale) = std::env::var("LEDGER_MATH_SCALE") {
            config.math.scale = parse_var("LEDGER_MATH_SCALE", &scale)?;
        }

        if let Ok(driver) = std::env::var("LEDGER_LOCK_DRIVER") {
            config.lock.driver = match driver.to_ascii_lowercase().as_str() {
                "memory" => LockDriver::Memory,
                "cache" => LockDriver::Cache,
                other => {
                    return Err(Error::Config(format!("Unknown lock driver: {}", other)));
                }
            };
        }

        if let Ok(ttl) = std::env::var("LEDGER_LOCK_TTL_SECONDS") {
            config.lock.ttl_seconds = parse_var("LEDGER_LOCK_TTL_SECONDS", &ttl)?;
        }

        if let Ok(timeout) = std::env::var("LEDGER_LOCK_TIMEOUT_SECONDS") {
            config.lock.timeout_seconds = parse_var("LEDGER_LOCK_TIMEOUT_SECONDS", &timeout)?;
        }

        if let Ok(ttl) = std::env::var("LEDGER_CACHE_TTL_SECONDS") {
            config.cache.ttl_seconds = parse_var("LEDGER_CACHE_TTL_SECONDS", &ttl)?;
        }

        if let Ok(places) = std::env::var("LEDGER_WALLET_DECIMAL_PLACES") {
            config.wallet.decimal_places = parse_var("LEDGER_WALLET_DECIMAL_PLACES", &places)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the ledger cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.checksum.enabled && self.checksum.secret.is_empty() {
            return Err(Error::Config(
                "checksum.secret must be set when checksums are enabled".to_string(),
            ));
        }

        if self.lock.ttl_seconds == 0 {
            return Err(Error::Config("lock.ttl_seconds must be positive".to_string()));
        }

        if self.wallet.default_slug.is_empty() {
            return Err(Error::Config("wallet.default_slug must not be empty".to_string()));
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {}", name, value)))
}

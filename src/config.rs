//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default number of bits used for the expiry engine's virtual clock.
pub const DEFAULT_TIME_BITS: u32 = 16;

// == Storage Mode ==
/// How many values a single key may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// One value per key; writes replace.
    #[default]
    Set,
    /// Many values per key; writes append.
    Bag,
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "set" => Ok(StorageMode::Set),
            "bag" => Ok(StorageMode::Bag),
            other => Err(format!("unknown storage mode '{}'", other)),
        }
    }
}

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
/// Durations are in milliseconds; a zero value disables the feature.
#[derive(Debug, Clone)]
pub struct Config {
    /// Expiry engine tick interval in milliseconds (0 disables expiry)
    pub tick_interval_ms: u64,
    /// Default TTL in milliseconds for entries without explicit TTL (0 = never)
    pub default_ttl_ms: u64,
    /// Lock acquire timeout in milliseconds (0 = wait forever)
    pub lock_timeout_ms: u64,
    /// Bits of the expiry engine's virtual clock before it wraps
    pub time_bits: u32,
    /// Number of lock manager shards
    pub lock_shards: usize,
    /// Maximum number of keys the cache can hold (0 = unbounded)
    pub max_entries: usize,
    /// Whether reads renew the TTL of the key they hit
    pub touch_on_read: bool,
    /// Single-value or multi-value storage
    pub storage_mode: StorageMode,
    /// HTTP server port
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `TICK_INTERVAL_MS` - Expiry tick interval (default: 1000)
    /// - `DEFAULT_TTL_MS` - Default TTL (default: 0, never expire)
    /// - `LOCK_TIMEOUT_MS` - Lock acquire timeout (default: 5000)
    /// - `TIME_BITS` - Virtual clock width (default: 16)
    /// - `LOCK_SHARDS` - Lock manager shard count (default: 1)
    /// - `MAX_ENTRIES` - Maximum cache keys (default: 0, unbounded)
    /// - `TOUCH_ON_READ` - Renew TTL on reads (default: false)
    /// - `STORAGE_MODE` - `set` or `bag` (default: set)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tick_interval_ms: parse_var("TICK_INTERVAL_MS").unwrap_or(defaults.tick_interval_ms),
            default_ttl_ms: parse_var("DEFAULT_TTL_MS").unwrap_or(defaults.default_ttl_ms),
            lock_timeout_ms: parse_var("LOCK_TIMEOUT_MS").unwrap_or(defaults.lock_timeout_ms),
            time_bits: parse_var("TIME_BITS")
                .unwrap_or(defaults.time_bits)
                .clamp(1, 32),
            lock_shards: parse_var("LOCK_SHARDS")
                .unwrap_or(defaults.lock_shards)
                .max(1),
            max_entries: parse_var("MAX_ENTRIES").unwrap_or(defaults.max_entries),
            touch_on_read: parse_var("TOUCH_ON_READ").unwrap_or(defaults.touch_on_read),
            storage_mode: parse_var("STORAGE_MODE").unwrap_or(defaults.storage_mode),
            server_port: parse_var("SERVER_PORT").unwrap_or(defaults.server_port),
        }
    }

    /// Expiry tick interval, or `None` when expiry is disabled.
    pub fn tick_interval(&self) -> Option<Duration> {
        non_zero_millis(self.tick_interval_ms)
    }

    /// Default TTL applied by writes that don't specify one.
    pub fn default_ttl(&self) -> Option<Duration> {
        non_zero_millis(self.default_ttl_ms)
    }

    /// Lock acquire timeout, or `None` to wait forever.
    pub fn lock_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.lock_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            default_ttl_ms: 0,
            lock_timeout_ms: 5000,
            time_bits: DEFAULT_TIME_BITS,
            lock_shards: 1,
            max_entries: 0,
            touch_on_read: false,
            storage_mode: StorageMode::Set,
            server_port: 3000,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.tick_interval(), Some(Duration::from_secs(1)));
        assert_eq!(config.default_ttl(), None);
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.time_bits, 16);
        assert_eq!(config.lock_shards, 1);
        assert_eq!(config.storage_mode, StorageMode::Set);
        assert_eq!(config.server_port, 3000);
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        for var in [
            "TICK_INTERVAL_MS",
            "DEFAULT_TTL_MS",
            "LOCK_TIMEOUT_MS",
            "TIME_BITS",
            "LOCK_SHARDS",
            "MAX_ENTRIES",
            "TOUCH_ON_READ",
            "STORAGE_MODE",
            "SERVER_PORT",
        ] {
            env::remove_var(var);
        }

        let config = Config::from_env();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.default_ttl_ms, 0);
        assert_eq!(config.lock_timeout_ms, 5000);
        assert_eq!(config.max_entries, 0);
        assert!(!config.touch_on_read);
    }

    #[test]
    fn test_zero_disables() {
        let config = Config {
            tick_interval_ms: 0,
            lock_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.tick_interval().is_none());
        assert!(config.lock_timeout().is_none());
    }

    #[test]
    fn test_storage_mode_parse() {
        assert_eq!("bag".parse::<StorageMode>(), Ok(StorageMode::Bag));
        assert_eq!("SET".parse::<StorageMode>(), Ok(StorageMode::Set));
        assert!("list".parse::<StorageMode>().is_err());
    }
}

//! Configuration for the sync engine
//!
//! Combines configuration for every sync component. The rebroadcast policy
//! booleans and the cache TTL/size are owned by the settings surface, which
//! persists them through [`SyncConfig::to_json`] / [`SyncConfig::from_json`].

use std::time::Duration;

use folio_storage::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

/// Streaming query timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Soft timeout for the local tier
    pub local_timeout: Duration,
    /// Soft timeout for the remote tier
    pub remote_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            local_timeout: Duration::from_millis(1200),
            remote_timeout: Duration::from_secs(6),
        }
    }
}

/// Reconnection sync settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Wait after a remote node becomes reachable before replaying the queue
    pub debounce: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
        }
    }
}

/// Where fetched records are republished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebroadcastPolicy {
    /// Publish to local-tier nodes
    pub use_local_as_cache: bool,
    /// Publish to the whole pool (takes precedence)
    pub broadcast_to_all: bool,
}

impl RebroadcastPolicy {
    pub fn is_enabled(&self) -> bool {
        self.use_local_as_cache || self.broadcast_to_all
    }
}

/// Configuration for the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub query: QueryConfig,
    pub reconnect: ReconnectConfig,
    pub rebroadcast: RebroadcastPolicy,
    pub cache: CacheConfig,
    /// Capacity of overlay and connectivity broadcast channels
    pub event_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            query: QueryConfig::default(),
            reconnect: ReconnectConfig::default(),
            rebroadcast: RebroadcastPolicy::default(),
            cache: CacheConfig::default(),
            event_channel_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Create a config for devices that are mostly disconnected
    ///
    /// Warms local nodes with everything fetched and waits longer for the
    /// remote tier.
    pub fn offline_first() -> Self {
        Self {
            query: QueryConfig {
                local_timeout: Duration::from_millis(1500),
                remote_timeout: Duration::from_secs(10),
            },
            reconnect: ReconnectConfig {
                debounce: Duration::from_secs(3),
            },
            rebroadcast: RebroadcastPolicy {
                use_local_as_cache: true,
                broadcast_to_all: false,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(14 * 24 * 60 * 60),
                max_entries: 2048,
            },
            event_channel_capacity: 256,
        }
    }

    /// Create a config for well-connected devices
    ///
    /// Uses shorter timeouts and debounce.
    pub fn low_latency() -> Self {
        Self {
            query: QueryConfig {
                local_timeout: Duration::from_millis(500),
                remote_timeout: Duration::from_secs(3),
            },
            reconnect: ReconnectConfig {
                debounce: Duration::from_millis(500),
            },
            rebroadcast: RebroadcastPolicy::default(),
            cache: CacheConfig::default(),
            event_channel_capacity: 256,
        }
    }

    /// Set the query configuration
    pub fn with_query(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    /// Set the reconnection configuration
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the rebroadcast policy
    pub fn with_rebroadcast(mut self, rebroadcast: RebroadcastPolicy) -> Self {
        self.rebroadcast = rebroadcast;
        self
    }

    /// Set the cache configuration
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Validate configuration invariants
    ///
    /// An empty list means the configuration is valid.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.query.local_timeout >= self.query.remote_timeout {
            warnings.push(ConfigWarning::LocalTimeoutNotShorter);
        }
        if self.query.local_timeout.is_zero() || self.query.remote_timeout.is_zero() {
            warnings.push(ConfigWarning::ZeroQueryTimeout);
        }
        if self.cache.ttl.is_zero() {
            warnings.push(ConfigWarning::ZeroCacheTtl);
        }
        if self.cache.max_entries == 0 {
            warnings.push(ConfigWarning::ZeroCacheCapacity);
        }
        if self.reconnect.debounce.is_zero() {
            warnings.push(ConfigWarning::ZeroDebounce);
        }
        if self.event_channel_capacity == 0 {
            warnings.push(ConfigWarning::ZeroChannelCapacity);
        }

        warnings
    }

    /// Check if the configuration is valid (no warnings)
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Configuration warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Local tier would wait as long as the remote tier
    LocalTimeoutNotShorter,
    /// A tier timeout is zero
    ZeroQueryTimeout,
    /// Cache entries expire immediately
    ZeroCacheTtl,
    /// Cache cannot hold anything
    ZeroCacheCapacity,
    /// Queue replay starts before handshakes finish
    ZeroDebounce,
    /// Broadcast channels cannot be created with zero capacity
    ZeroChannelCapacity,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LocalTimeoutNotShorter => {
                write!(f, "local_timeout is not shorter than remote_timeout")
            }
            ConfigWarning::ZeroQueryTimeout => write!(f, "a query timeout is zero"),
            ConfigWarning::ZeroCacheTtl => write!(f, "cache ttl is zero"),
            ConfigWarning::ZeroCacheCapacity => write!(f, "cache max_entries is zero"),
            ConfigWarning::ZeroDebounce => write!(f, "reconnect debounce is zero"),
            ConfigWarning::ZeroChannelCapacity => write!(f, "event_channel_capacity is zero"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.query.local_timeout, Duration::from_millis(1200));
        assert_eq!(config.query.remote_timeout, Duration::from_secs(6));
        assert_eq!(config.reconnect.debounce, Duration::from_secs(2));
        assert_eq!(config.cache.ttl, Duration::from_secs(604_800));
        assert!(!config.rebroadcast.is_enabled());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(SyncConfig::default().is_valid());
        assert!(SyncConfig::offline_first().is_valid());
        assert!(SyncConfig::low_latency().is_valid());
        assert!(SyncConfig::offline_first().rebroadcast.use_local_as_cache);
    }

    #[test]
    fn test_invalid_config_detected() {
        let config = SyncConfig::default()
            .with_query(QueryConfig {
                local_timeout: Duration::from_secs(10),
                remote_timeout: Duration::from_secs(5),
            })
            .with_cache(CacheConfig {
                ttl: Duration::ZERO,
                max_entries: 0,
            });

        let warnings = config.validate();
        assert!(warnings.contains(&ConfigWarning::LocalTimeoutNotShorter));
        assert!(warnings.contains(&ConfigWarning::ZeroCacheTtl));
        assert!(warnings.contains(&ConfigWarning::ZeroCacheCapacity));
        assert!(!config.is_valid());
    }

    #[test]
    fn test_json_roundtrip_keeps_policy() {
        let config = SyncConfig::default().with_rebroadcast(RebroadcastPolicy {
            use_local_as_cache: true,
            broadcast_to_all: true,
        });
        let json = config.to_json().unwrap();
        assert_eq!(SyncConfig::from_json(&json).unwrap(), config);
        assert!(SyncConfig::from_json("{").is_err());
    }
}

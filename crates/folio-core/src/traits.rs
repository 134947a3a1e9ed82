//! Core seams for Folio
//!
//! - [`Clock`]: Time abstraction for testability
//! - [`Signer`]: Opaque record signing capability

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SignerError;
use crate::record::{Record, UnsignedRecord};

/// Wall-clock abstraction
///
/// Cache TTLs and record timestamps are expressed in unix seconds, so tests
/// swap in a [`MockClock`] to move time without sleeping.
pub trait Clock: Send + Sync {
    /// Current UTC datetime
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current time in unix seconds
    fn now_unix(&self) -> u64 {
        self.now_utc().timestamp().max(0) as u64
    }
}

/// Real clock using system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    unix: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new(unix: u64) -> Self {
        Self {
            unix: Arc::new(AtomicU64::new(unix)),
        }
    }

    pub fn set(&self, unix: u64) {
        self.unix.store(unix, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.unix.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.now_unix() as i64, 0).unwrap_or_default()
    }

    fn now_unix(&self) -> u64 {
        self.unix.load(Ordering::SeqCst)
    }
}

/// Opaque signing capability
///
/// Key management lives outside the sync engine; the engine only ever sees
/// the signed result or an error.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, draft: UnsignedRecord) -> Result<Record, SignerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advances() {
        let clock = MockClock::new(1_000);
        assert_eq!(clock.now_unix(), 1_000);
        clock.advance(60);
        assert_eq!(clock.now_unix(), 1_060);
        assert_eq!(clock.now_utc().timestamp(), 1_060);

        let shared = clock.clone();
        shared.set(5);
        assert_eq!(clock.now_unix(), 5);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01
        assert!(SystemClock.now_unix() > 1_577_836_800);
    }
}

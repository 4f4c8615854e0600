//! In-process counter store.
//!
//! Mirrors the Redis semantics (TTL on creation, lazy expiry, delete-of-absent
//! is a no-op) behind a single mutex. Useful for tests and single-process
//! deployments; counts are not shared with other processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::{crosses_limit, CounterStore, Expiry, Increment};
use crate::error::{GateError, StoreError};

/// A counter record held in memory.
#[derive(Debug, Clone, Copy)]
struct Record {
    count: u64,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A counter store held in process memory.
///
/// Time is read from `tokio::time`, so tests can pause and advance the clock.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    records: Mutex<HashMap<String, Record>>,
    connected: AtomicBool,
    unavailable: AtomicBool,
}

impl MemoryCounterStore {
    /// Create an empty, disconnected store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that is already connected.
    pub fn connected() -> Self {
        let store = Self::new();
        store.connected.store(true, Ordering::SeqCst);
        store
    }

    /// Simulate the backing service going away. While unavailable every
    /// operation fails with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current count for `key`, ignoring expired records.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.records
            .lock()
            .get(key)
            .filter(|r| !r.is_expired(now))
            .map(|r| r.count)
    }

    /// Overwrite a record directly, bypassing the counting rules.
    pub fn insert_raw(&self, key: &str, count: u64, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.records
            .lock()
            .insert(key.to_string(), Record { count, expires_at });
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .values()
            .filter(|r| !r.is_expired(now))
            .count()
    }

    /// Whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("memory store marked unavailable".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn connect(&self) -> Result<(), GateError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GateError::Connection(
                "memory store marked unavailable".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        block: Duration,
    ) -> Result<Increment, StoreError> {
        self.check_available()?;
        let now = Instant::now();

        let mut records = self.records.lock();
        if records.get(key).is_some_and(|r| r.is_expired(now)) {
            records.remove(key);
        }

        let record = records.entry(key.to_string()).or_insert(Record {
            count: 0,
            expires_at: None,
        });
        record.count += 1;
        if record.expires_at.is_none() {
            if record.count > 1 {
                warn!(key = %key, count = record.count, "Counter had no TTL; attached the window expiry");
            }
            record.expires_at = Some(now + window);
        }
        let extended = crosses_limit(record.count, limit);
        if extended {
            record.expires_at = Some(now + block);
        }

        trace!(key = %key, count = record.count, limit = limit, extended = extended, "Incremented counter");
        Ok(Increment::new(record.count, limit, extended))
    }

    async fn set_expiry(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();

        let mut records = self.records.lock();
        let live = records.get(key).is_some_and(|r| !r.is_expired(now));
        if !live {
            records.remove(key);
            return Ok(false);
        }

        match (at - Utc::now()).to_std() {
            Ok(ttl) if !ttl.is_zero() => {
                if let Some(record) = records.get_mut(key) {
                    record.expires_at = Some(now + ttl);
                }
            }
            // An expiry in the past removes the key, as Redis does.
            _ => {
                records.remove(key);
            }
        }
        Ok(true)
    }

    async fn get_expiry(&self, key: &str) -> Result<Expiry, StoreError> {
        self.check_available()?;
        let now = Instant::now();

        let records = self.records.lock();
        Ok(match records.get(key) {
            None => Expiry::Absent,
            Some(r) if r.is_expired(now) => Expiry::Absent,
            Some(Record {
                expires_at: None, ..
            }) => Expiry::Persistent,
            Some(Record {
                expires_at: Some(at),
                ..
            }) => Expiry::Remaining(at.duration_since(now)),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();

        let removed = self.records.lock().remove(key);
        Ok(removed.is_some_and(|r| !r.is_expired(now)))
    }

    async fn delete_if_exceeded(&self, key: &str, limit: u64) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();

        let mut records = self.records.lock();
        match records.get(key).map(|r| (r.is_expired(now), r.count)) {
            Some((true, _)) => {
                records.remove(key);
                Ok(false)
            }
            Some((false, count)) if count > limit => {
                records.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

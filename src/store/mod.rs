//! Counter store abstraction shared by every process enforcing quotas.
//!
//! The store owns the lifetime of each counter record. The decision engine only
//! issues operations against it and never holds counter state of its own.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{GateError, StoreError};

pub use memory::MemoryCounterStore;
pub use redis_store::{RedisCounterStore, RedisSettings};

/// Deadline applied to every store operation, including `connect`.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Remaining lifetime of a counter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No record exists for the key.
    Absent,
    /// The record exists but carries no TTL. This is a leaked key.
    Persistent,
    /// The record expires after the given duration.
    Remaining(Duration),
}

impl Expiry {
    /// Remaining lifetime, if the record exists and carries a TTL.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Expiry::Remaining(d) => Some(*d),
            _ => None,
        }
    }
}

/// The result of an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    /// The counter value after this increment
    pub count: u64,
    /// Whether `count` is above the limit
    pub exceeded: bool,
    /// Whether this increment crossed the limit and moved the expiry out to
    /// the block duration
    pub extended: bool,
}

impl Increment {
    /// Build the outcome of an increment that produced `count`.
    pub fn new(count: u64, limit: u64, extended: bool) -> Self {
        Self {
            count,
            exceeded: count > limit,
            extended,
        }
    }
}

/// Whether `count` is the value that crosses `limit`. The store's atomic
/// increment hands this value to exactly one caller per window.
pub fn crosses_limit(count: u64, limit: u64) -> bool {
    count == limit.saturating_add(1)
}

/// Trait for counter store implementations.
///
/// Implementations must keep `increment_and_check` indivisible: the increment,
/// the TTL attached on record creation and the block extension applied when
/// the limit is crossed happen in one step. No caller can ever observe a
/// counter without an expiry, or a crossed counter still on its window TTL.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Establish the connection to the backing service.
    ///
    /// Fails with [`GateError::Connection`] if the service cannot be reached
    /// within [`STORE_TIMEOUT`].
    async fn connect(&self) -> Result<(), GateError>;

    /// Release the connection. Safe to call more than once.
    async fn disconnect(&self) -> Result<(), StoreError>;

    /// Increment the counter for `key`, creating it with a TTL of `window` when
    /// absent, and report whether the new value is above `limit`. The increment
    /// that takes the counter to `limit + 1` also sets its TTL to `block`.
    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        block: Duration,
    ) -> Result<Increment, StoreError>;

    /// Set the absolute expiry of `key`. Returns `false` if the key is absent.
    async fn set_expiry(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Read the remaining lifetime of `key`.
    async fn get_expiry(&self, key: &str) -> Result<Expiry, StoreError>;

    /// Remove `key`. Returns `false` if it was already gone.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove `key` only while its count is above `limit`, in one step.
    /// A counter that has since restarted in a fresh window is left alone.
    async fn delete_if_exceeded(&self, key: &str, limit: u64) -> Result<bool, StoreError>;
}

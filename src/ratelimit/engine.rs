//! Admission decisions against the shared counter store.
//!
//! Per identity the counter moves through these states, all held in the store:
//!
//! ```text
//! Absent --first request--> Counting(ttl = window)
//! Counting --within limit--> Counting        (ttl not refreshed)
//! Counting --over limit----> Blocked(ttl = retry_after)   once per episode
//! Blocked  --any request---> Blocked         (ttl untouched)
//! Counting | Blocked --ttl or cleanup--> Absent
//! ```
//!
//! The block extension is applied by the store inside the same atomic
//! increment that takes the counter to `limit + 1`, so exactly one request per
//! window starts a block and no window TTL can lapse before it does.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::cleanup::CleanupScheduler;
use super::policy::PolicyTable;
use crate::error::StoreError;
use crate::store::{CounterStore, Expiry};

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request must be rejected
    pub blocked: bool,
    /// Seconds the caller should wait before retrying; zero when admitted
    pub retry_after_secs: u64,
}

impl Decision {
    /// An admitted request.
    pub fn admit() -> Self {
        Self {
            blocked: false,
            retry_after_secs: 0,
        }
    }

    /// A rejected request.
    pub fn block(retry_after_secs: u64) -> Self {
        Self {
            blocked: true,
            retry_after_secs,
        }
    }
}

/// Makes admit/block decisions for inbound requests.
///
/// The engine holds no counting state of its own; every concurrent caller,
/// in this process or any other, coordinates through the store.
pub struct DecisionEngine<S: CounterStore + 'static> {
    store: Arc<S>,
    policy: Arc<PolicyTable>,
    cleanup: Option<CleanupScheduler<S>>,
}

impl<S: CounterStore + 'static> DecisionEngine<S> {
    /// Create an engine without cleanup scheduling.
    pub fn new(store: Arc<S>, policy: Arc<PolicyTable>) -> Self {
        Self {
            store,
            policy,
            cleanup: None,
        }
    }

    /// Create an engine that schedules counter deletion when an identity
    /// becomes blocked.
    pub fn with_cleanup(store: Arc<S>, policy: Arc<PolicyTable>) -> Self {
        let cleanup = CleanupScheduler::new(store.clone());
        Self {
            store,
            policy,
            cleanup: Some(cleanup),
        }
    }

    /// Decide whether a request is admitted.
    ///
    /// `token` is the value of the access-token header, if any, and
    /// `remote_addr` the `host:port` the request came from. A store failure is
    /// returned as an error and never turned into a decision; the caller picks
    /// whether to fail open or closed.
    pub async fn decide(
        &self,
        token: Option<&str>,
        remote_addr: &str,
    ) -> Result<Decision, StoreError> {
        let resolution = self.policy.resolve(token, remote_addr);
        let key = resolution.identity.key();
        let limit = resolution.limit;

        trace!(
            key = %key,
            kind = ?resolution.identity.kind(),
            limit = limit,
            "Checking admission"
        );

        let retry_after = self.policy.retry_after();
        let outcome = self
            .store
            .increment_and_check(key, limit, self.policy.window(), retry_after)
            .await?;

        if !outcome.exceeded {
            return Ok(Decision::admit());
        }

        // Only the increment that crossed the limit starts a block episode,
        // and the store has already moved its expiry out to the block duration.
        // Later requests in the episode leave the expiry alone.
        if !outcome.extended {
            let retry_after_secs = match self.store.get_expiry(key).await? {
                Expiry::Remaining(remaining) => ceil_secs(remaining),
                Expiry::Absent => 1,
                Expiry::Persistent => {
                    warn!(key = %key, "Blocked counter has no TTL");
                    retry_after.as_secs()
                }
            };
            trace!(key = %key, count = outcome.count, retry_after_secs = retry_after_secs, "Identity already blocked");
            return Ok(Decision::block(retry_after_secs));
        }

        debug!(
            key = %key,
            limit = limit,
            retry_after_secs = retry_after.as_secs(),
            "Limit exceeded, identity blocked"
        );

        if let Some(cleanup) = &self.cleanup {
            cleanup.schedule(key, limit, retry_after);
        }

        Ok(Decision::block(retry_after.as_secs()))
    }

    /// Get the policy table.
    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Get the counter store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the cleanup scheduler, if cleanup is enabled.
    pub fn cleanup(&self) -> Option<&CleanupScheduler<S>> {
        self.cleanup.as_ref()
    }

    /// Cancel pending cleanups. The store's own expiry still reclaims every
    /// counter.
    pub fn shutdown(&self) {
        if let Some(cleanup) = &self.cleanup {
            cleanup.shutdown();
        }
    }
}

impl<S: CounterStore + 'static> std::fmt::Debug for DecisionEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("policy", &self.policy)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

/// Whole seconds, rounded up, never below one.
fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GateError;
    use crate::ratelimit::policy::{PolicyConfig, TokenLimit};
    use crate::store::{Increment, MemoryCounterStore};
    use chrono::{DateTime, Utc};

    fn policy(window_secs: u64, retry_after_secs: u64) -> Arc<PolicyTable> {
        Arc::new(PolicyTable::new(&PolicyConfig {
            ip_limit: 10,
            fallback_token_limit: 20,
            tokens: vec![
                TokenLimit::new("NORMAL_TOKEN", 50),
                TokenLimit::new("ULTRA_TOKEN", 100),
            ],
            window_secs,
            retry_after_secs,
        }))
    }

    /// Delegates to the memory store, but the reply to any over-limit
    /// increment arrives only after `lag` has passed.
    struct SlowReplyStore {
        inner: MemoryCounterStore,
        lag: Duration,
    }

    #[async_trait::async_trait]
    impl CounterStore for SlowReplyStore {
        async fn connect(&self) -> Result<(), GateError> {
            self.inner.connect().await
        }

        async fn disconnect(&self) -> Result<(), StoreError> {
            self.inner.disconnect().await
        }

        async fn increment_and_check(
            &self,
            key: &str,
            limit: u64,
            window: Duration,
            block: Duration,
        ) -> Result<Increment, StoreError> {
            let outcome = self
                .inner
                .increment_and_check(key, limit, window, block)
                .await?;
            if outcome.exceeded {
                tokio::time::advance(self.lag).await;
            }
            Ok(outcome)
        }

        async fn set_expiry(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.set_expiry(key, at).await
        }

        async fn get_expiry(&self, key: &str) -> Result<Expiry, StoreError> {
            self.inner.get_expiry(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn delete_if_exceeded(&self, key: &str, limit: u64) -> Result<bool, StoreError> {
            self.inner.delete_if_exceeded(key, limit).await
        }
    }

    fn engine(window_secs: u64, retry_after_secs: u64) -> DecisionEngine<MemoryCounterStore> {
        let store = Arc::new(MemoryCounterStore::connected());
        DecisionEngine::new(store, policy(window_secs, retry_after_secs))
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
        assert_eq!(ceil_secs(Duration::from_millis(59_001)), 60);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_saturation() {
        let engine = engine(1, 60);

        for i in 1..=10 {
            let decision = engine.decide(None, "127.0.0.1:8080").await.unwrap();
            assert!(!decision.blocked, "request {} should be admitted", i);
            assert_eq!(decision, Decision::admit());
        }

        let decision = engine.decide(None, "127.0.0.1:8080").await.unwrap();
        assert_eq!(decision, Decision::block(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_port_does_not_split_identity() {
        let engine = engine(1, 60);

        for port in 0..10u16 {
            let addr = format!("10.1.1.1:{}", 40000 + port);
            assert!(!engine.decide(None, &addr).await.unwrap().blocked);
        }
        assert!(engine.decide(None, "10.1.1.1:50000").await.unwrap().blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_takes_precedence_over_ip() {
        let engine = engine(1, 60);

        // Well past the IP limit of 10, within ULTRA_TOKEN's 100.
        for i in 1..=20 {
            let decision = engine
                .decide(Some("ULTRA_TOKEN"), "10.0.0.1:8080")
                .await
                .unwrap();
            assert!(!decision.blocked, "token request {} should be admitted", i);
        }

        assert_eq!(engine.store().count("ULTRA_TOKEN"), Some(20));
        assert_eq!(engine.store().count("10.0.0.1"), None);

        // The address itself still has its full quota.
        assert!(!engine.decide(None, "10.0.0.1:8080").await.unwrap().blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_token_limit() {
        let engine = engine(1, 60);

        for _ in 0..50 {
            assert!(!engine
                .decide(Some("NORMAL_TOKEN"), "192.168.1.1:8080")
                .await
                .unwrap()
                .blocked);
        }
        assert!(engine
            .decide(Some("NORMAL_TOKEN"), "192.168.1.1:8080")
            .await
            .unwrap()
            .blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_token_uses_fallback_limit() {
        let engine = engine(1, 60);

        for i in 1..=20 {
            let decision = engine
                .decide(Some("invalid-token-xyz"), "172.16.0.1:8080")
                .await
                .unwrap();
            assert!(!decision.blocked, "request {} should use the fallback limit", i);
        }
        assert!(engine
            .decide(Some("invalid-token-xyz"), "172.16.0.1:8080")
            .await
            .unwrap()
            .blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_token_counts_against_ip() {
        let engine = engine(1, 60);

        engine.decide(Some(""), "127.0.0.1:8080").await.unwrap();
        assert_eq!(engine.store().count("127.0.0.1"), Some(1));
        assert_eq!(engine.store().count(""), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_lost_updates_under_concurrency() {
        let engine = Arc::new(engine(60, 120));
        let total = 200;

        let tasks: Vec<_> = (0..total)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.decide(None, "203.0.113.9:1234").await })
            })
            .collect();

        let mut admitted = 0;
        let mut blocked = 0;
        for result in futures::future::join_all(tasks).await {
            let decision = result.unwrap().unwrap();
            if decision.blocked {
                blocked += 1;
            } else {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(blocked, total - 10);
        assert_eq!(engine.store().count("203.0.113.9"), Some(total as u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_outlasts_short_window() {
        let engine = engine(1, 5);
        let addr = "198.51.100.7:9000";

        for _ in 0..10 {
            engine.decide(None, addr).await.unwrap();
        }
        assert_eq!(engine.decide(None, addr).await.unwrap(), Decision::block(5));

        // The window alone would have reset by now.
        tokio::time::advance(Duration::from_secs(2)).await;
        let decision = engine.decide(None, addr).await.unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.retry_after_secs, 3);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!engine.decide(None, addr).await.unwrap().blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_survives_window_lapse_after_crossing() {
        let store = Arc::new(SlowReplyStore {
            inner: MemoryCounterStore::connected(),
            lag: Duration::from_secs(1),
        });
        let engine = DecisionEngine::new(store.clone(), policy(1, 60));
        let addr = "198.51.100.20:1";

        for _ in 0..10 {
            assert!(!engine.decide(None, addr).await.unwrap().blocked);
        }
        // The window runs out while the crossing reply is in flight.
        assert_eq!(engine.decide(None, addr).await.unwrap(), Decision::block(60));

        let decision = engine.decide(None, addr).await.unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.retry_after_secs, 58);
        assert_eq!(store.inner.count("198.51.100.20"), Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_is_extended_once_per_episode() {
        let engine = engine(1, 5);
        let addr = "198.51.100.8:9000";

        for _ in 0..11 {
            engine.decide(None, addr).await.unwrap();
        }
        let remaining = engine
            .store()
            .get_expiry("198.51.100.8")
            .await
            .unwrap()
            .remaining()
            .unwrap();
        assert!(remaining > Duration::from_secs(4) && remaining <= Duration::from_secs(5));

        // Retrying during the block, including its last second, must not push
        // the expiry out again.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(engine.decide(None, addr).await.unwrap().blocked);
        }
        let remaining = engine
            .store()
            .get_expiry("198.51.100.8")
            .await
            .unwrap()
            .remaining()
            .unwrap();
        assert!(remaining <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!engine.decide(None, addr).await.unwrap().blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_admission() {
        let engine = engine(1, 5);

        for _ in 0..10 {
            engine.decide(None, "192.0.2.1:1").await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        for _ in 0..10 {
            assert!(!engine.decide(None, "192.0.2.1:1").await.unwrap().blocked);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_shorter_than_window() {
        let engine = engine(10, 5);
        let addr = "192.0.2.50:1";

        for _ in 0..10 {
            engine.decide(None, addr).await.unwrap();
        }
        assert_eq!(engine.decide(None, addr).await.unwrap(), Decision::block(5));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(engine.decide(None, addr).await.unwrap().blocked);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!engine.decide(None, addr).await.unwrap().blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaked_counter_gets_window_ttl() {
        let engine = engine(1, 60);
        engine.store().insert_raw("192.0.2.77", 50, None);

        let decision = engine.decide(None, "192.0.2.77:1").await.unwrap();
        assert!(decision.blocked);
        // The increment attached the window TTL to the leaked counter.
        assert!(engine
            .store()
            .get_expiry("192.0.2.77")
            .await
            .unwrap()
            .remaining()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_always_carries_ttl() {
        let engine = engine(1, 60);

        engine.decide(Some("NORMAL_TOKEN"), "127.0.0.1:1").await.unwrap();
        let expiry = engine.store().get_expiry("NORMAL_TOKEN").await.unwrap();
        assert_eq!(expiry, Expiry::Remaining(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_surfaced() {
        let engine = engine(1, 60);
        engine.store().set_unavailable(true);

        let result = engine.decide(None, "127.0.0.1:8080").await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_schedules_single_cleanup() {
        let store = Arc::new(MemoryCounterStore::connected());
        let engine = DecisionEngine::with_cleanup(store.clone(), policy(1, 5));
        let addr = "192.0.2.99:1";

        for _ in 0..13 {
            engine.decide(None, addr).await.unwrap();
        }
        let cleanup = engine.cleanup().unwrap();
        assert_eq!(cleanup.pending_count(), 1);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(cleanup.pending_count(), 0);
        assert_eq!(store.count("192.0.2.99"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_cleanup() {
        let store = Arc::new(MemoryCounterStore::connected());
        let engine = DecisionEngine::with_cleanup(store, policy(1, 60));

        for _ in 0..11 {
            engine.decide(None, "192.0.2.10:1").await.unwrap();
        }
        assert_eq!(engine.cleanup().unwrap().pending_count(), 1);

        engine.shutdown();
        assert_eq!(engine.cleanup().unwrap().pending_count(), 0);
    }
}

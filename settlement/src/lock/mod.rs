// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Distributed locks over Postgres with an optional Redis fast path.
//!
//! Layout:
//!
//! ```text
//!   acquire ──► Redis SET NX ──(taken)──► Contended, no DB round trip
//!                  │(ok / redis down)
//!                  ▼
//!            Postgres upsert on lock_records   <- source of truth
//!                  │(denied)
//!                  ▼
//!            undo Redis key, Contended
//! ```
//!
//! Contention is an expected outcome, not a failure: concurrent workers race
//! for the same named lock every tick and the losers simply skip the cycle.
//! Only a missing durable backend is an error, and that error fails closed.

use ethers::types::Address as EthAddress;
use redis::aio::ConnectionManager;
use settlement_pg_db::Db;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::LockConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::metrics::SettlementMetrics;

mod pg_store;
mod redis_cache;

use pg_store::PgLockStore;
use redis_cache::RedisLockCache;

pub const CHAIN_SCAN_LOCK: &str = "chain_scan";
pub const REWARD_ACCRUAL_LOCK: &str = "reward_accrual";
pub const STUCK_RECOVERY_LOCK: &str = "stuck_recovery";

pub fn reward_session_lock_key(session_id: i64) -> String {
    format!("reward_session:{session_id}")
}

pub fn nonce_lock_key(address: EthAddress) -> String {
    format!("nonce_lock:{address:#x}")
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub ttl: Duration,
    pub blocking: bool,
    pub blocking_timeout: Duration,
}

impl LockOptions {
    pub fn non_blocking(ttl: Duration) -> Self {
        Self {
            ttl,
            blocking: false,
            blocking_timeout: Duration::ZERO,
        }
    }

    pub fn blocking(ttl: Duration, blocking_timeout: Duration) -> Self {
        Self {
            ttl,
            blocking: true,
            blocking_timeout,
        }
    }
}

/// Result of running a closure under a named lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt<T> {
    Completed(T),
    /// Another holder kept the lock for the whole acquire window.
    Contended,
}

impl<T> LockAttempt<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            LockAttempt::Completed(value) => Some(value),
            LockAttempt::Contended => None,
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: PgLockStore,
    cache: Option<RedisLockCache>,
    poll_interval: Duration,
    metrics: Arc<SettlementMetrics>,
}

impl LockManager {
    pub fn new(
        db: Db,
        redis: Option<ConnectionManager>,
        config: &LockConfig,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        if redis.is_none() {
            tracing::info!("[Lock] No Redis configured, running on Postgres only");
        }
        Self {
            store: PgLockStore::new(db),
            cache: redis.map(RedisLockCache::new),
            poll_interval: config.poll_interval,
            metrics,
        }
    }

    /// Run `f` while holding `key`. The lock is released afterwards whether
    /// `f` succeeded or not; a crash leaves the row to expire via its TTL.
    pub async fn try_with_lock<T, F, Fut>(
        &self,
        key: &str,
        options: &LockOptions,
        f: F,
    ) -> SettlementResult<LockAttempt<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SettlementResult<T>>,
    {
        let Some(token) = self.acquire(key, options).await? else {
            self.metrics
                .lock_contended
                .with_label_values(&[key_prefix(key)])
                .inc();
            return Ok(LockAttempt::Contended);
        };
        self.metrics
            .lock_acquired
            .with_label_values(&[key_prefix(key)])
            .inc();

        let result = f().await;
        self.release(key, &token).await;
        result.map(LockAttempt::Completed)
    }

    /// Like [`Self::try_with_lock`] but surfaces contention as
    /// [`SettlementError::LockContended`], for callers that must run.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        options: &LockOptions,
        f: F,
    ) -> SettlementResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SettlementResult<T>>,
    {
        match self.try_with_lock(key, options, f).await? {
            LockAttempt::Completed(value) => Ok(value),
            LockAttempt::Contended => Err(SettlementError::LockContended(key.to_owned())),
        }
    }

    async fn acquire(&self, key: &str, options: &LockOptions) -> SettlementResult<Option<String>> {
        let token = new_holder_token();
        let deadline = options
            .blocking
            .then(|| Instant::now() + options.blocking_timeout);

        loop {
            if self.acquire_once(key, &token, options.ttl).await? {
                return Ok(Some(token));
            }
            match deadline {
                Some(deadline) if Instant::now() + self.poll_interval < deadline => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                _ => return Ok(None),
            }
        }
    }

    async fn acquire_once(&self, key: &str, token: &str, ttl: Duration) -> SettlementResult<bool> {
        let mut cached = false;
        if let Some(cache) = &self.cache {
            match cache.try_acquire(key, token, ttl).await {
                Ok(true) => cached = true,
                Ok(false) => return Ok(false),
                Err(e) => {
                    // Fast path down; the durable store decides on its own.
                    tracing::warn!("[Lock] Redis unavailable, falling back to Postgres: {e}");
                    self.metrics
                        .lock_backend_errors
                        .with_label_values(&["redis"])
                        .inc();
                }
            }
        }

        match self.store.try_acquire(key, token, ttl).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                if cached {
                    self.undo_cache(key, token).await;
                }
                Ok(false)
            }
            Err(e) => {
                self.metrics
                    .lock_backend_errors
                    .with_label_values(&["postgres"])
                    .inc();
                if cached {
                    self.undo_cache(key, token).await;
                }
                Err(e)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.release(key, token).await {
                tracing::warn!("[Lock] Failed to release Redis key {key}: {e}");
            }
        }
        match self.store.release(key, token).await {
            Ok(true) => {}
            Ok(false) => {
                // Lease expired mid-run and someone else took over.
                tracing::warn!("[Lock] Lock {key} was no longer held at release");
            }
            Err(e) => {
                self.metrics
                    .lock_backend_errors
                    .with_label_values(&["postgres"])
                    .inc();
                tracing::warn!("[Lock] Failed to release lock {key}: {e}");
            }
        }
    }

    async fn undo_cache(&self, key: &str, token: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.release(key, token).await {
                tracing::warn!("[Lock] Failed to undo Redis key {key}: {e}");
            }
        }
    }
}

fn new_holder_token() -> String {
    format!(
        "{:016x}{:016x}",
        rand::random::<u64>(),
        rand::random::<u64>()
    )
}

// Keys like `nonce_lock:0xabc..` would blow up metric cardinality.
fn key_prefix(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::collections::HashMap;

    #[test]
    fn test_holder_tokens_are_unique() {
        let a = new_holder_token();
        let b = new_holder_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_prefix_strips_identifier() {
        assert_eq!(key_prefix("nonce_lock:0xabc"), "nonce_lock");
        assert_eq!(key_prefix("chain_scan"), "chain_scan");
        assert_eq!(key_prefix("reward_session:42"), "reward_session");
    }

    #[test]
    fn test_well_known_keys() {
        assert_eq!(reward_session_lock_key(7), "reward_session:7");
        let key = nonce_lock_key(EthAddress::repeat_byte(0xab));
        assert_eq!(key, format!("nonce_lock:0x{}", "ab".repeat(20)));
    }

    // In-memory mirror of the lock_records upsert/delete semantics.
    struct Row {
        holder_token: String,
        expires_at: DateTime<Utc>,
    }

    fn apply_acquire(
        table: &mut HashMap<String, Row>,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: ChronoDuration,
    ) -> bool {
        match table.get(key) {
            Some(row) if row.expires_at >= now => false,
            _ => {
                table.insert(
                    key.to_owned(),
                    Row {
                        holder_token: token.to_owned(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    fn apply_release(table: &mut HashMap<String, Row>, key: &str, token: &str) -> bool {
        match table.get(key) {
            Some(row) if row.holder_token == token => {
                table.remove(key);
                true
            }
            _ => false,
        }
    }

    #[test]
    fn test_second_holder_is_denied_until_release() {
        let mut table = HashMap::new();
        let now = Utc::now();
        let ttl = ChronoDuration::seconds(60);

        assert!(apply_acquire(&mut table, "chain_scan", "worker-a", now, ttl));
        assert!(!apply_acquire(&mut table, "chain_scan", "worker-b", now, ttl));

        assert!(apply_release(&mut table, "chain_scan", "worker-a"));
        assert!(apply_acquire(&mut table, "chain_scan", "worker-b", now, ttl));
    }

    #[test]
    fn test_expired_lease_is_stolen() {
        let mut table = HashMap::new();
        let now = Utc::now();
        let ttl = ChronoDuration::seconds(60);

        assert!(apply_acquire(&mut table, "chain_scan", "worker-a", now, ttl));

        let later = now + ChronoDuration::seconds(61);
        assert!(apply_acquire(&mut table, "chain_scan", "worker-b", later, ttl));

        // The original holder's release must now be a no-op.
        assert!(!apply_release(&mut table, "chain_scan", "worker-a"));
        assert_eq!(table["chain_scan"].holder_token, "worker-b");
    }

    #[test]
    fn test_release_requires_matching_token() {
        let mut table = HashMap::new();
        let now = Utc::now();
        let ttl = ChronoDuration::seconds(60);

        assert!(apply_acquire(&mut table, "stuck_recovery", "worker-a", now, ttl));
        assert!(!apply_release(&mut table, "stuck_recovery", "worker-b"));
        assert!(table.contains_key("stuck_recovery"));
    }
}

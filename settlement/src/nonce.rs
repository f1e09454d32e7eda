// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Safe nonce allocation for outbound payment addresses.
//!
//! The pending transaction count is the only nonce value guaranteed not to
//! collide with anything the node has already seen, so that is what gets
//! handed out, even when the pending/confirmed gap suggests stuck
//! transactions. Concurrent senders for one address serialize through the
//! `nonce_lock:{address}` named lock.

use std::sync::Arc;
use std::time::Duration;

use ethers::providers::JsonRpcClient;
use ethers::types::Address as EthAddress;

use crate::chain_client::ChainClient;
use crate::config::NonceConfig;
use crate::error::SettlementResult;
use crate::lock::{nonce_lock_key, LockManager, LockOptions};
use crate::metrics::SettlementMetrics;

// Allocation is two RPC reads; the lease just has to cover a slow provider.
const NONCE_LOCK_TTL: Duration = Duration::from_secs(30);

pub struct NonceAllocator<P> {
    client: Arc<ChainClient<P>>,
    locks: Arc<LockManager>,
    config: NonceConfig,
    metrics: Arc<SettlementMetrics>,
}

/// Pending vs confirmed counts for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCursor {
    pub pending: u64,
    pub confirmed: u64,
}

impl NonceCursor {
    /// Transactions broadcast but not yet mined.
    pub fn in_flight(&self) -> u64 {
        self.pending.saturating_sub(self.confirmed)
    }

    pub fn looks_stuck(&self, threshold: u64) -> bool {
        self.in_flight() > threshold
    }
}

impl<P: JsonRpcClient> NonceAllocator<P> {
    pub fn new(
        client: Arc<ChainClient<P>>,
        locks: Arc<LockManager>,
        config: NonceConfig,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        Self {
            client,
            locks,
            config,
            metrics,
        }
    }

    pub async fn cursor(&self, address: EthAddress) -> SettlementResult<NonceCursor> {
        let pending = self.client.transaction_count(address, true).await?;
        let confirmed = self.client.transaction_count(address, false).await?;
        Ok(NonceCursor { pending, confirmed })
    }

    /// Next safe nonce for `address`. Warns when the in-flight window exceeds
    /// the stuck threshold but still returns the pending count.
    pub async fn safe_nonce(&self, address: EthAddress) -> SettlementResult<u64> {
        let cursor = self.cursor(address).await?;
        if cursor.looks_stuck(self.config.stuck_threshold) {
            self.metrics.nonce_stuck_warnings.inc();
            tracing::warn!(
                "[Nonce] Address {:#x} has {} transactions in flight (pending {}, confirmed {}), likely stuck",
                address,
                cursor.in_flight(),
                cursor.pending,
                cursor.confirmed
            );
        }
        Ok(cursor.pending)
    }

    /// [`Self::safe_nonce`] under the per-address lock. Blocks up to the lock
    /// timeout so two payment senders take turns instead of racing; if the
    /// lock never frees, surfaces `LockContended` rather than guessing.
    pub async fn safe_nonce_locked(&self, address: EthAddress) -> SettlementResult<u64> {
        let key = nonce_lock_key(address);
        let options = LockOptions::blocking(NONCE_LOCK_TTL, Duration::from_secs(10));
        self.locks
            .with_lock(&key, &options, || self.safe_nonce(address))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_window() {
        let cursor = NonceCursor {
            pending: 17,
            confirmed: 14,
        };
        assert_eq!(cursor.in_flight(), 3);
        assert!(!cursor.looks_stuck(5));
    }

    #[test]
    fn test_stuck_detection_past_threshold() {
        let cursor = NonceCursor {
            pending: 20,
            confirmed: 14,
        };
        assert_eq!(cursor.in_flight(), 6);
        assert!(cursor.looks_stuck(5));
        // Exactly at the threshold is still fine.
        let cursor = NonceCursor {
            pending: 19,
            confirmed: 14,
        };
        assert!(!cursor.looks_stuck(5));
    }

    #[test]
    fn test_confirmed_ahead_of_pending_is_not_stuck() {
        // Some providers briefly report latest > pending during reorgs.
        let cursor = NonceCursor {
            pending: 10,
            confirmed: 12,
        };
        assert_eq!(cursor.in_flight(), 0);
        assert!(!cursor.looks_stuck(0));
    }
}

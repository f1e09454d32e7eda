// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Post-commit notification points.
//!
//! Hooks run after the owning database transaction has committed, so an
//! implementation that fails or hangs can never roll back settlement state.
//! Implementations must tolerate replays: a crash between commit and hook
//! delivery means the next sweep may fire the same notification again.

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use ethers::types::H256;

/// Downstream integration surface (notifications, referral program,
/// analytics). All methods default to no-ops so integrations implement only
/// what they consume.
#[async_trait]
pub trait SettlementHooks: Send + Sync {
    /// A new incoming transfer was stored in the cache.
    async fn deposit_seen(&self, _tx_hash: H256, _user_id: Option<i64>, _amount: &BigDecimal) {}

    /// A reward ledger entry was written and the user balance credited.
    async fn reward_credited(&self, _user_id: i64, _deposit_id: i64, _amount: &BigDecimal) {}

    /// Fired after `reward_credited` so the referral program can cascade
    /// percentages up the referrer chain.
    async fn referral_cascade(&self, _user_id: i64, _deposit_id: i64, _amount: &BigDecimal) {}

    /// A broadcast withdrawal was confirmed on chain.
    async fn withdrawal_confirmed(&self, _withdrawal_id: i64, _tx_hash: H256) {}

    /// A failed withdrawal was refunded to the user's balance.
    async fn withdrawal_refunded(&self, _withdrawal_id: i64, _user_id: i64, _amount: &BigDecimal) {}
}

/// Hooks that do nothing; the default wiring for tests and standalone runs.
pub struct NoopHooks;

#[async_trait]
impl SettlementHooks for NoopHooks {}

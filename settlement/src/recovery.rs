// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation sweep for outbound withdrawals stuck in `broadcast`.
//!
//! Classification per withdrawal:
//!
//! ```text
//!   receipt status 1 ──► confirmed
//!   receipt status 0 ──► failed_refunded (balance refund, audited)
//!   no receipt, in mempool, priced ok ──► leave as is
//!   no receipt, in mempool, underpriced ──► stuck_pending (speed-up advised)
//!   unknown to the node ──► retry_pending (re-broadcast with fresh nonce)
//! ```
//!
//! Every transition is guarded by `WHERE status = 'broadcast'`, so a rerun
//! over an already-classified withdrawal changes nothing and never refunds
//! twice.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use ethers::providers::JsonRpcClient;
use ethers::types::{H256, U256};
use settlement_pg_db::Db;
use settlement_schema::models::{NewAccountEntry, User, Withdrawal};
use settlement_schema::schema::{account_entries, users, withdrawals};

use crate::chain_client::ChainClient;
use crate::config::RecoveryConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::hooks::SettlementHooks;
use crate::lock::{LockAttempt, LockManager, LockOptions, STUCK_RECOVERY_LOCK};
use crate::metrics::SettlementMetrics;

const RECOVERY_LOCK_TTL: Duration = Duration::from_secs(300);

/// What the chain knows about a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainTxStatus {
    Confirmed { block: u64 },
    Reverted,
    InMempool { gas_price: Option<U256> },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RecoveryAction {
    Confirm,
    Refund,
    LeavePending,
    FlagStuck { recommended_gas: U256 },
    RetryNonce,
}

/// Map chain status to a transition, extracted for testability.
///
/// A mempool transaction priced at or above the network's current gas price
/// just needs more time; an underpriced one will likely never mine and gets
/// flagged with a recommended replacement price.
pub(crate) fn classify(
    status: &ChainTxStatus,
    network_gas: U256,
    bump_percent: u64,
) -> RecoveryAction {
    match status {
        ChainTxStatus::Confirmed { .. } => RecoveryAction::Confirm,
        ChainTxStatus::Reverted => RecoveryAction::Refund,
        ChainTxStatus::InMempool { gas_price } => match gas_price {
            Some(gas) if *gas < network_gas => RecoveryAction::FlagStuck {
                recommended_gas: bumped_gas(network_gas, bump_percent),
            },
            _ => RecoveryAction::LeavePending,
        },
        ChainTxStatus::NotFound => RecoveryAction::RetryNonce,
    }
}

fn bumped_gas(network_gas: U256, bump_percent: u64) -> U256 {
    network_gas * U256::from(100 + bump_percent) / U256::from(100)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub processed: u64,
    pub confirmed: u64,
    pub refunded: u64,
    pub pending: u64,
    pub stuck: u64,
    pub retry: u64,
}

pub struct StuckTransactionRecovery<P> {
    client: Arc<ChainClient<P>>,
    db: Db,
    locks: Arc<LockManager>,
    hooks: Arc<dyn SettlementHooks>,
    config: RecoveryConfig,
    metrics: Arc<SettlementMetrics>,
}

impl<P: JsonRpcClient> StuckTransactionRecovery<P> {
    pub fn new(
        client: Arc<ChainClient<P>>,
        db: Db,
        locks: Arc<LockManager>,
        hooks: Arc<dyn SettlementHooks>,
        config: RecoveryConfig,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        Self {
            client,
            db,
            locks,
            hooks,
            config,
            metrics,
        }
    }

    /// One sweep over withdrawals broadcast more than `stuck_after` ago.
    pub async fn scan(&self) -> SettlementResult<LockAttempt<RecoveryReport>> {
        let options = LockOptions::non_blocking(RECOVERY_LOCK_TTL);
        self.locks
            .try_with_lock(STUCK_RECOVERY_LOCK, &options, || self.scan_inner())
            .await
    }

    async fn scan_inner(&self) -> SettlementResult<RecoveryReport> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stuck_after)
                .map_err(|e| SettlementError::Internal(format!("stuck_after: {e}")))?;

        let mut conn = self.db.connect().await?;
        let stale: Vec<Withdrawal> = withdrawals::table
            .filter(withdrawals::status.eq("broadcast"))
            .filter(withdrawals::tx_hash.is_not_null())
            .filter(withdrawals::updated_at.lt(cutoff))
            .order(withdrawals::id.asc())
            .select(Withdrawal::as_select())
            .load(&mut conn)
            .await?;
        drop(conn);

        if stale.is_empty() {
            return Ok(RecoveryReport::default());
        }
        tracing::info!("[Recovery] Checking {} stale withdrawals", stale.len());
        let network_gas = self.client.gas_price().await?;

        let mut report = RecoveryReport::default();
        for withdrawal in stale {
            report.processed += 1;
            let Some(tx_hash) = withdrawal.tx_hash.as_deref() else {
                continue;
            };
            let tx_hash: H256 = match tx_hash.parse() {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::warn!(
                        "[Recovery] Withdrawal {} has unparseable tx hash: {}",
                        withdrawal.id,
                        e
                    );
                    continue;
                }
            };

            let status = match self.chain_status(tx_hash).await {
                Ok(status) => status,
                Err(e) => {
                    // Provider hiccup for one hash; next sweep retries.
                    tracing::warn!(
                        "[Recovery] Chain lookup failed for withdrawal {}: {}",
                        withdrawal.id,
                        e
                    );
                    continue;
                }
            };

            match classify(&status, network_gas, self.config.gas_bump_percent) {
                RecoveryAction::Confirm => {
                    if self.mark_confirmed(&withdrawal, tx_hash).await? {
                        report.confirmed += 1;
                    }
                }
                RecoveryAction::Refund => {
                    if self.refund(&withdrawal).await? {
                        report.refunded += 1;
                    }
                }
                RecoveryAction::LeavePending => {
                    report.pending += 1;
                    self.metrics
                        .recovery_classified
                        .with_label_values(&["pending"])
                        .inc();
                }
                RecoveryAction::FlagStuck { recommended_gas } => {
                    if self.mark_status(withdrawal.id, "stuck_pending").await? {
                        report.stuck += 1;
                        tracing::warn!(
                            "[Recovery] Withdrawal {} underpriced in mempool, recommend gas {}",
                            withdrawal.id,
                            recommended_gas
                        );
                        self.metrics
                            .recovery_classified
                            .with_label_values(&["stuck_pending"])
                            .inc();
                    }
                }
                RecoveryAction::RetryNonce => {
                    if self.mark_status(withdrawal.id, "retry_pending").await? {
                        report.retry += 1;
                        self.metrics
                            .recovery_classified
                            .with_label_values(&["retry_pending"])
                            .inc();
                    }
                }
            }
        }

        Ok(report)
    }

    async fn chain_status(&self, tx_hash: H256) -> SettlementResult<ChainTxStatus> {
        if let Some(receipt) = self.client.transaction_receipt(tx_hash).await? {
            let reverted = receipt.status.map(|s| s.as_u64()) == Some(0);
            if reverted {
                return Ok(ChainTxStatus::Reverted);
            }
            return Ok(ChainTxStatus::Confirmed {
                block: receipt.block_number.map(|b| b.as_u64()).unwrap_or(0),
            });
        }
        match self.client.mempool_transaction(tx_hash).await? {
            Some(tx) => Ok(ChainTxStatus::InMempool {
                gas_price: tx.gas_price,
            }),
            None => Ok(ChainTxStatus::NotFound),
        }
    }

    /// Guarded transition; false means some other run already moved it.
    async fn mark_status(&self, withdrawal_id: i64, status: &str) -> SettlementResult<bool> {
        let mut conn = self.db.connect().await?;
        let rows = diesel::update(
            withdrawals::table
                .find(withdrawal_id)
                .filter(withdrawals::status.eq("broadcast")),
        )
        .set((
            withdrawals::status.eq(status),
            withdrawals::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(rows == 1)
    }

    async fn mark_confirmed(
        &self,
        withdrawal: &Withdrawal,
        tx_hash: H256,
    ) -> SettlementResult<bool> {
        let transitioned = self.mark_status(withdrawal.id, "confirmed").await?;
        if transitioned {
            self.metrics
                .recovery_classified
                .with_label_values(&["confirmed"])
                .inc();
            self.hooks
                .withdrawal_confirmed(withdrawal.id, tx_hash)
                .await;
        }
        Ok(transitioned)
    }

    /// Refund the user's balance and close the withdrawal out, atomically.
    /// The `broadcast` status check runs again under the row lock, so a
    /// concurrent sweep cannot produce a second refund.
    async fn refund(&self, withdrawal: &Withdrawal) -> SettlementResult<bool> {
        let withdrawal_id = withdrawal.id;
        let mut conn = self.db.connect().await?;
        let refunded: Option<(i64, BigDecimal)> = conn
            .transaction::<_, SettlementError, _>(|conn| {
                async move {
                    let current = withdrawals::table
                        .find(withdrawal_id)
                        .for_update()
                        .select(Withdrawal::as_select())
                        .first(conn)
                        .await?;
                    if current.status != "broadcast" {
                        return Ok(None);
                    }

                    let user = users::table
                        .find(current.user_id)
                        .for_update()
                        .select(User::as_select())
                        .first(conn)
                        .await?;

                    let balance_after = &user.balance + &current.amount;
                    diesel::update(users::table.find(user.id))
                        .set((
                            users::balance.eq(&balance_after),
                            users::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                    diesel::insert_into(account_entries::table)
                        .values(&NewAccountEntry {
                            user_id: user.id,
                            kind: "withdrawal_refund".to_owned(),
                            amount: current.amount.clone(),
                            balance_before: user.balance.clone(),
                            balance_after,
                            deposit_id: None,
                            withdrawal_id: Some(withdrawal_id),
                            note: None,
                        })
                        .execute(conn)
                        .await?;
                    diesel::update(withdrawals::table.find(withdrawal_id))
                        .set((
                            withdrawals::status.eq("failed_refunded"),
                            withdrawals::error.eq("transaction reverted on chain"),
                            withdrawals::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    Ok(Some((user.id, current.amount.clone())))
                }
                .scope_boxed()
            })
            .await?;

        if let Some((user_id, amount)) = refunded {
            self.metrics.recovery_refunds.inc();
            self.metrics
                .recovery_classified
                .with_label_values(&["failed_refunded"])
                .inc();
            self.hooks
                .withdrawal_refunded(withdrawal_id, user_id, &amount)
                .await;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_classify_confirmed_and_reverted() {
        assert_eq!(
            classify(&ChainTxStatus::Confirmed { block: 100 }, gwei(30), 20),
            RecoveryAction::Confirm
        );
        assert_eq!(
            classify(&ChainTxStatus::Reverted, gwei(30), 20),
            RecoveryAction::Refund
        );
    }

    #[test]
    fn test_classify_mempool_priced_ok_waits() {
        let status = ChainTxStatus::InMempool {
            gas_price: Some(gwei(30)),
        };
        assert_eq!(classify(&status, gwei(30), 20), RecoveryAction::LeavePending);
        let status = ChainTxStatus::InMempool {
            gas_price: Some(gwei(40)),
        };
        assert_eq!(classify(&status, gwei(30), 20), RecoveryAction::LeavePending);
    }

    #[test]
    fn test_classify_underpriced_gets_bumped_recommendation() {
        let status = ChainTxStatus::InMempool {
            gas_price: Some(gwei(10)),
        };
        assert_eq!(
            classify(&status, gwei(30), 20),
            RecoveryAction::FlagStuck {
                recommended_gas: gwei(36),
            }
        );
    }

    #[test]
    fn test_classify_unknown_gas_price_waits() {
        let status = ChainTxStatus::InMempool { gas_price: None };
        assert_eq!(classify(&status, gwei(30), 20), RecoveryAction::LeavePending);
    }

    #[test]
    fn test_classify_dropped_tx_retries_nonce() {
        assert_eq!(
            classify(&ChainTxStatus::NotFound, gwei(30), 20),
            RecoveryAction::RetryNonce
        );
    }
}

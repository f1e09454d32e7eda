// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The accrual engine.
//!
//! Both entry points follow the same shape: take a named lock, select
//! candidate deposit ids, then handle each deposit in its own transaction
//! under a `FOR UPDATE` row lock. One bad deposit is logged and skipped, the
//! rest of the batch still commits. Ledger entries are written at most once
//! per (deposit, session) — a unique index backs the in-transaction check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use settlement_pg_db::Db;
use settlement_schema::models::{Deposit, NewAccountEntry, NewRewardLedgerEntry, RewardSession, User};
use settlement_schema::schema::{account_entries, deposits, reward_ledger, reward_sessions, users};

use crate::config::RewardConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::hooks::SettlementHooks;
use crate::lock::{
    reward_session_lock_key, LockAttempt, LockManager, LockOptions, REWARD_ACCRUAL_LOCK,
};
use crate::metrics::SettlementMetrics;
use crate::rewards::calculator::{cap_reward, effective_rate, reward_amount};

const ACCRUAL_LOCK_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq)]
pub struct SessionAccrual {
    pub calculated: u64,
    pub skipped: u64,
    pub total_amount: BigDecimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DueAccrual {
    pub processed: u64,
    pub total_amount: BigDecimal,
}

/// What one accrual run should do to one deposit, extracted for testability.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AccrualDecision {
    pub amount: BigDecimal,
    pub capped: bool,
    pub completes: bool,
}

/// `None` means the deposit has no ROI space left and must only be marked
/// completed.
pub(crate) fn decide_accrual(
    deposit_amount: &BigDecimal,
    base_rate: &BigDecimal,
    session_rate: Option<&BigDecimal>,
    days: i32,
    cap: &BigDecimal,
    paid: &BigDecimal,
) -> Option<AccrualDecision> {
    let rate = match session_rate {
        Some(session_rate) => effective_rate(session_rate, base_rate),
        None => base_rate.clone(),
    };
    let raw = reward_amount(deposit_amount, &rate, days);
    let capped = cap_reward(raw, cap, paid);
    if capped.amount.is_zero() {
        return None;
    }
    let completes = &(paid + &capped.amount) >= cap;
    Some(AccrualDecision {
        amount: capped.amount,
        capped: capped.capped,
        completes,
    })
}

pub struct RewardAccrualEngine {
    db: Db,
    locks: Arc<LockManager>,
    hooks: Arc<dyn SettlementHooks>,
    config: RewardConfig,
    metrics: Arc<SettlementMetrics>,
    emergency_stop: Arc<AtomicBool>,
}

struct CreditedDeposit {
    deposit_id: i64,
    user_id: i64,
    amount: BigDecimal,
    capped: bool,
}

impl RewardAccrualEngine {
    pub fn new(
        db: Db,
        locks: Arc<LockManager>,
        hooks: Arc<dyn SettlementHooks>,
        config: RewardConfig,
        metrics: Arc<SettlementMetrics>,
        emergency_stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            db,
            locks,
            hooks,
            config,
            metrics,
            emergency_stop,
        }
    }

    fn check_emergency_stop(&self) -> SettlementResult<()> {
        if AtomicBool::load(&self.emergency_stop, Ordering::Relaxed) {
            tracing::warn!("[Rewards] Accrual suspended by emergency stop");
            return Err(SettlementError::AccrualSuspended);
        }
        Ok(())
    }

    /// Accrue every eligible deposit of one reward session. Contention means
    /// another worker already owns this session's run.
    pub async fn accrue_session(
        &self,
        session_id: i64,
    ) -> SettlementResult<LockAttempt<SessionAccrual>> {
        self.check_emergency_stop()?;
        let key = reward_session_lock_key(session_id);
        let options = LockOptions::non_blocking(ACCRUAL_LOCK_TTL);
        self.locks
            .try_with_lock(&key, &options, || self.accrue_session_inner(session_id))
            .await
    }

    async fn accrue_session_inner(&self, session_id: i64) -> SettlementResult<SessionAccrual> {
        let mut conn = self.db.connect().await?;
        let session = reward_sessions::table
            .find(session_id)
            .select(RewardSession::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| {
                SettlementError::Storage(format!("reward session {session_id} not found"))
            })?;

        let candidates: Vec<i64> = deposits::table
            .filter(deposits::status.eq("confirmed"))
            .filter(deposits::roi_completed.eq(false))
            .filter(deposits::confirmed_at.between(session.starts_at, session.ends_at))
            .order(deposits::id.asc())
            .select(deposits::id)
            .load(&mut conn)
            .await?;

        tracing::info!(
            "[Rewards] Session {} has {} candidate deposits",
            session_id,
            candidates.len()
        );

        let mut outcome = SessionAccrual {
            calculated: 0,
            skipped: 0,
            total_amount: BigDecimal::zero(),
        };
        for deposit_id in candidates {
            match self
                .accrue_one(&mut conn, deposit_id, Some(&session), None)
                .await
            {
                Ok(Some(credited)) => {
                    outcome.calculated += 1;
                    outcome.total_amount += &credited.amount;
                    self.notify_credited(&credited, "session").await;
                }
                Ok(None) => outcome.skipped += 1,
                Err(e) => {
                    // One bad deposit must not abort the batch.
                    tracing::warn!(
                        "[Rewards] Deposit {} failed in session {}: {}",
                        deposit_id,
                        session_id,
                        e
                    );
                    outcome.skipped += 1;
                    self.metrics
                        .rewards_skipped
                        .with_label_values(&["error"])
                        .inc();
                }
            }
        }
        Ok(outcome)
    }

    /// Sessions whose window has closed but which have not been processed.
    pub async fn pending_sessions(&self, now: DateTime<Utc>) -> SettlementResult<Vec<i64>> {
        let mut conn = self.db.connect().await?;
        let ids = reward_sessions::table
            .filter(reward_sessions::status.eq("pending"))
            .filter(reward_sessions::ends_at.le(now))
            .order(reward_sessions::id.asc())
            .select(reward_sessions::id)
            .load(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Close a session out after its accrual run completed.
    pub async fn mark_session_processed(&self, session_id: i64) -> SettlementResult<()> {
        let mut conn = self.db.connect().await?;
        diesel::update(
            reward_sessions::table
                .find(session_id)
                .filter(reward_sessions::status.eq("pending")),
        )
        .set(reward_sessions::status.eq("processed"))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    /// Accrue every deposit whose `next_accrual_at` has elapsed, then push it
    /// one period into the future.
    pub async fn accrue_due(
        &self,
        now: DateTime<Utc>,
    ) -> SettlementResult<LockAttempt<DueAccrual>> {
        self.check_emergency_stop()?;
        let options = LockOptions::non_blocking(ACCRUAL_LOCK_TTL);
        self.locks
            .try_with_lock(REWARD_ACCRUAL_LOCK, &options, || self.accrue_due_inner(now))
            .await
    }

    async fn accrue_due_inner(&self, now: DateTime<Utc>) -> SettlementResult<DueAccrual> {
        let mut conn = self.db.connect().await?;
        let candidates: Vec<i64> = deposits::table
            .filter(deposits::status.eq("confirmed"))
            .filter(deposits::roi_completed.eq(false))
            .filter(deposits::next_accrual_at.le(now))
            .order(deposits::id.asc())
            .select(deposits::id)
            .load(&mut conn)
            .await?;

        let next_accrual_at = now
            + chrono::Duration::from_std(self.config.accrual_period)
                .map_err(|e| SettlementError::Internal(format!("accrual period: {e}")))?;

        let mut outcome = DueAccrual {
            processed: 0,
            total_amount: BigDecimal::zero(),
        };
        for deposit_id in candidates {
            match self
                .accrue_one(&mut conn, deposit_id, None, Some(next_accrual_at))
                .await
            {
                Ok(Some(credited)) => {
                    outcome.processed += 1;
                    outcome.total_amount += &credited.amount;
                    self.notify_credited(&credited, "individual").await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("[Rewards] Deposit {} failed accrual: {}", deposit_id, e);
                    self.metrics
                        .rewards_skipped
                        .with_label_values(&["error"])
                        .inc();
                }
            }
        }
        Ok(outcome)
    }

    /// One deposit, one transaction. Row locks on the deposit and its user
    /// serialize against concurrent accruals and withdrawals; the ledger
    /// existence check under that lock makes the credit at-most-once.
    async fn accrue_one(
        &self,
        conn: &mut settlement_pg_db::Connection<'_>,
        deposit_id: i64,
        session: Option<&RewardSession>,
        reschedule_to: Option<DateTime<Utc>>,
    ) -> SettlementResult<Option<CreditedDeposit>> {
        let metrics = &self.metrics;
        let conn: &mut diesel_async::AsyncPgConnection = conn;
        let credited = conn
            .transaction::<_, SettlementError, _>(|conn| {
                async move {
                    let deposit = deposits::table
                        .find(deposit_id)
                        .for_update()
                        .select(Deposit::as_select())
                        .first(conn)
                        .await?;

                    // Re-check under the lock; a concurrent run may have won.
                    if deposit.roi_completed {
                        metrics
                            .rewards_skipped
                            .with_label_values(&["completed"])
                            .inc();
                        return Ok(None);
                    }
                    if let Some(next_at) = reschedule_to {
                        match deposit.next_accrual_at {
                            Some(due) if due <= Utc::now() => {}
                            _ => {
                                metrics
                                    .rewards_skipped
                                    .with_label_values(&["not_due"])
                                    .inc();
                                return Ok(None);
                            }
                        }
                        diesel::update(deposits::table.find(deposit_id))
                            .set((
                                deposits::next_accrual_at.eq(next_at),
                                deposits::updated_at.eq(Utc::now()),
                            ))
                            .execute(conn)
                            .await?;
                    }

                    let user = users::table
                        .find(deposit.user_id)
                        .for_update()
                        .select(User::as_select())
                        .first(conn)
                        .await?;
                    if user.earnings_blocked || user.is_banned {
                        metrics
                            .rewards_skipped
                            .with_label_values(&["user_blocked"])
                            .inc();
                        return Ok(None);
                    }

                    let session_id = session.map(|s| s.id);
                    if let Some(session_id) = session_id {
                        let existing = reward_ledger::table
                            .filter(reward_ledger::deposit_id.eq(deposit_id))
                            .filter(reward_ledger::session_id.eq(session_id))
                            .select(reward_ledger::id)
                            .first::<i64>(conn)
                            .await
                            .optional()?;
                        if existing.is_some() {
                            metrics
                                .rewards_skipped
                                .with_label_values(&["already_accrued"])
                                .inc();
                            return Ok(None);
                        }
                    }

                    let days = session.map(|s| s.days).unwrap_or(1);
                    let decision = decide_accrual(
                        &deposit.amount,
                        &deposit.rate,
                        session.map(|s| &s.rate),
                        days,
                        &deposit.roi_cap_amount,
                        &deposit.roi_paid_amount,
                    );
                    let Some(decision) = decision else {
                        // Cap already reached; close the deposit out.
                        diesel::update(deposits::table.find(deposit_id))
                            .set((
                                deposits::roi_completed.eq(true),
                                deposits::updated_at.eq(Utc::now()),
                            ))
                            .execute(conn)
                            .await?;
                        metrics
                            .rewards_skipped
                            .with_label_values(&["cap_reached"])
                            .inc();
                        return Ok(None);
                    };

                    if decision.capped {
                        tracing::warn!(
                            "[Rewards] Deposit {} reward truncated to cap remainder {}",
                            deposit_id,
                            decision.amount
                        );
                    }

                    let rate = match session {
                        Some(session) => effective_rate(&session.rate, &deposit.rate),
                        None => deposit.rate.clone(),
                    };
                    diesel::insert_into(reward_ledger::table)
                        .values(&NewRewardLedgerEntry {
                            deposit_id,
                            session_id,
                            user_id: deposit.user_id,
                            amount: decision.amount.clone(),
                            rate,
                            days,
                            capped: decision.capped,
                        })
                        .execute(conn)
                        .await?;

                    diesel::update(deposits::table.find(deposit_id))
                        .set((
                            deposits::roi_paid_amount
                                .eq(&deposit.roi_paid_amount + &decision.amount),
                            deposits::roi_completed.eq(decision.completes),
                            deposits::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    // Balance credit plus its audit row, same transaction.
                    let balance_after = &user.balance + &decision.amount;
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
                            kind: "reward".to_owned(),
                            amount: decision.amount.clone(),
                            balance_before: user.balance.clone(),
                            balance_after,
                            deposit_id: Some(deposit_id),
                            withdrawal_id: None,
                            note: session_id.map(|id| format!("session {id}")),
                        })
                        .execute(conn)
                        .await?;

                    Ok(Some(CreditedDeposit {
                        deposit_id,
                        user_id: user.id,
                        amount: decision.amount,
                        capped: decision.capped,
                    }))
                }
                .scope_boxed()
            })
            .await?;
        Ok(credited)
    }

    async fn notify_credited(&self, credited: &CreditedDeposit, kind: &str) {
        self.metrics
            .rewards_credited
            .with_label_values(&[kind])
            .inc();
        if credited.capped {
            self.metrics.rewards_capped.inc();
        }
        self.hooks
            .reward_credited(credited.user_id, credited.deposit_id, &credited.amount)
            .await;
        self.hooks
            .referral_cascade(credited.user_id, credited.deposit_id, &credited.amount)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_decide_accrual_normal_day() {
        // Deposit of 1000, cap 5000 (500%), daily rate 1.117%.
        let decision = decide_accrual(
            &dec("1000"),
            &dec("1.117"),
            None,
            1,
            &dec("5000"),
            &dec("0"),
        )
        .unwrap();
        assert_eq!(decision.amount, dec("11.17"));
        assert!(!decision.capped);
        assert!(!decision.completes);
    }

    #[test]
    fn test_decide_accrual_session_rate_overrides() {
        let decision = decide_accrual(
            &dec("1000"),
            &dec("1.117"),
            Some(&dec("2")),
            1,
            &dec("5000"),
            &dec("0"),
        )
        .unwrap();
        assert_eq!(decision.amount, dec("20"));

        // Zero session rate falls back to the deposit rate.
        let decision = decide_accrual(
            &dec("1000"),
            &dec("1.117"),
            Some(&dec("0")),
            1,
            &dec("5000"),
            &dec("0"),
        )
        .unwrap();
        assert_eq!(decision.amount, dec("11.17"));
    }

    #[test]
    fn test_decide_accrual_truncates_at_cap() {
        // Paid 4950 of 5000; a computed 100 only credits 50 and completes.
        let decision = decide_accrual(
            &dec("1000"),
            &dec("10"),
            None,
            1,
            &dec("5000"),
            &dec("4950"),
        )
        .unwrap();
        assert_eq!(decision.amount, dec("50"));
        assert!(decision.capped);
        assert!(decision.completes);
    }

    #[test]
    fn test_decide_accrual_exact_cap_completes_uncapped() {
        let decision = decide_accrual(
            &dec("1000"),
            &dec("5"),
            None,
            1,
            &dec("5000"),
            &dec("4950"),
        )
        .unwrap();
        assert_eq!(decision.amount, dec("50"));
        assert!(!decision.capped);
        assert!(decision.completes);
    }

    #[test]
    fn test_decide_accrual_exhausted_is_none() {
        assert!(decide_accrual(
            &dec("1000"),
            &dec("1.117"),
            None,
            1,
            &dec("5000"),
            &dec("5000"),
        )
        .is_none());
    }

    #[test]
    fn test_decide_accrual_multi_day_session() {
        let decision = decide_accrual(
            &dec("1000"),
            &dec("1"),
            None,
            3,
            &dec("5000"),
            &dec("0"),
        )
        .unwrap();
        assert_eq!(decision.amount, dec("30"));
    }
}

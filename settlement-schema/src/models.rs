// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed row models for the settlement tables.
//!
//! Money columns are `NUMERIC` and surface as [`BigDecimal`] so reward
//! arithmetic never goes through floats.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::schema::{
    account_entries, deposits, lock_records, reward_ledger, reward_sessions, sync_bookmarks,
    transfer_cache, users, withdrawals,
};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = transfer_cache)]
pub struct CachedTransfer {
    pub id: i64,
    pub tx_hash: String,
    pub block_number: i64,
    pub from_address: String,
    pub to_address: String,
    pub token_type: String,
    pub token_address: Option<String>,
    pub amount: BigDecimal,
    pub amount_raw: String,
    pub direction: String,
    pub user_id: Option<i64>,
    pub deposit_id: Option<i64>,
    pub withdrawal_id: Option<i64>,
    pub is_processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = transfer_cache)]
pub struct NewCachedTransfer {
    pub tx_hash: String,
    pub block_number: i64,
    pub from_address: String,
    pub to_address: String,
    pub token_type: String,
    pub token_address: Option<String>,
    pub amount: BigDecimal,
    pub amount_raw: String,
    pub direction: String,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sync_bookmarks)]
pub struct SyncBookmark {
    pub token_type: String,
    pub last_synced_block: i64,
    pub first_synced_block: i64,
    pub total_indexed: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = deposits)]
pub struct Deposit {
    pub id: i64,
    pub user_id: i64,
    pub token_type: String,
    pub amount: BigDecimal,
    pub rate: BigDecimal,
    pub roi_cap_amount: BigDecimal,
    pub roi_paid_amount: BigDecimal,
    pub roi_completed: bool,
    pub status: String,
    pub next_accrual_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = reward_sessions)]
pub struct RewardSession {
    pub id: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub rate: BigDecimal,
    pub days: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = reward_ledger)]
pub struct RewardLedgerEntry {
    pub id: i64,
    pub deposit_id: i64,
    pub session_id: Option<i64>,
    pub user_id: i64,
    pub amount: BigDecimal,
    pub rate: BigDecimal,
    pub days: i32,
    pub capped: bool,
    pub paid: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = reward_ledger)]
pub struct NewRewardLedgerEntry {
    pub deposit_id: i64,
    pub session_id: Option<i64>,
    pub user_id: i64,
    pub amount: BigDecimal,
    pub rate: BigDecimal,
    pub days: i32,
    pub capped: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i64,
    pub wallet_address: String,
    pub balance: BigDecimal,
    pub earnings_blocked: bool,
    pub is_banned: bool,
    pub referrer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = withdrawals)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: i64,
    pub token_type: String,
    pub amount: BigDecimal,
    pub to_address: String,
    pub status: String,
    pub tx_hash: Option<String>,
    pub nonce: Option<i64>,
    pub gas_price: Option<BigDecimal>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = account_entries)]
pub struct NewAccountEntry {
    pub user_id: i64,
    pub kind: String,
    pub amount: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub deposit_id: Option<i64>,
    pub withdrawal_id: Option<i64>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = lock_records)]
pub struct LockRecord {
    pub lock_key: String,
    pub holder_token: String,
    pub expires_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
}

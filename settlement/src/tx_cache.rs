// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Idempotent cache of on-chain transfers.
//!
//! `tx_hash` is unique, and inserts go through `ON CONFLICT DO NOTHING`, so
//! the scanner can replay any block range without double-counting. Everything
//! downstream (deposit crediting, reconciliation) keys off this table.

use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use ethers::types::{Address as EthAddress, H256};
use settlement_pg_db::Db;
use settlement_schema::models::{CachedTransfer, NewCachedTransfer};
use settlement_schema::schema::{transfer_cache, users};

use crate::error::SettlementResult;
use crate::types::{InsertOutcome, TokenType, TransferDirection, TransferEvent};

pub fn fmt_hash(hash: H256) -> String {
    format!("{hash:#x}")
}

pub fn fmt_address(address: EthAddress) -> String {
    format!("{address:#x}")
}

/// Build the row for a decoded transfer. `amount` is the human-unit value,
/// `user_id` the already-resolved owner of the counterparty wallet, if any.
pub fn cached_transfer_row(
    event: &TransferEvent,
    direction: TransferDirection,
    amount: BigDecimal,
    user_id: Option<i64>,
) -> NewCachedTransfer {
    NewCachedTransfer {
        tx_hash: fmt_hash(event.tx_hash),
        block_number: event.block_number as i64,
        from_address: fmt_address(event.from),
        to_address: fmt_address(event.to),
        token_type: event.token.as_str().to_owned(),
        token_address: Some(fmt_address(event.token_address)),
        amount,
        amount_raw: event.value.to_string(),
        direction: direction.as_str().to_owned(),
        user_id,
    }
}

/// Aggregate row of [`TransactionCache::system_wallet_stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionStats {
    pub direction: String,
    pub transfers: i64,
    pub total_amount: BigDecimal,
}

#[derive(Clone)]
pub struct TransactionCache {
    db: Db,
}

impl TransactionCache {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert on the caller's connection so a whole chunk of transfers
    /// commits (or rolls back) together with its bookmark advance.
    pub async fn insert(
        &self,
        conn: &mut AsyncPgConnection,
        row: &NewCachedTransfer,
    ) -> SettlementResult<InsertOutcome> {
        let rows = diesel::insert_into(transfer_cache::table)
            .values(row)
            .on_conflict_do_nothing()
            .execute(conn)
            .await?;
        Ok(if rows == 1 {
            InsertOutcome::Stored
        } else {
            InsertOutcome::AlreadyCached
        })
    }

    pub async fn exists(&self, tx_hash: H256) -> SettlementResult<bool> {
        let mut conn = self.db.connect().await?;
        let found = transfer_cache::table
            .filter(transfer_cache::tx_hash.eq(fmt_hash(tx_hash)))
            .select(transfer_cache::id)
            .first::<i64>(&mut conn)
            .await
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn get(&self, tx_hash: H256) -> SettlementResult<Option<CachedTransfer>> {
        let mut conn = self.db.connect().await?;
        let transfer = transfer_cache::table
            .filter(transfer_cache::tx_hash.eq(fmt_hash(tx_hash)))
            .select(CachedTransfer::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(transfer)
    }

    /// Resolve the registered owner of a wallet, if there is one. Runs on the
    /// caller's connection because it is part of the chunk commit.
    pub async fn find_user_for_wallet(
        &self,
        conn: &mut AsyncPgConnection,
        wallet: EthAddress,
    ) -> SettlementResult<Option<i64>> {
        let user_id = users::table
            .filter(users::wallet_address.eq(fmt_address(wallet)))
            .select(users::id)
            .first::<i64>(conn)
            .await
            .optional()?;
        Ok(user_id)
    }

    pub async fn link_user(&self, transfer_id: i64, user_id: i64) -> SettlementResult<()> {
        let mut conn = self.db.connect().await?;
        diesel::update(transfer_cache::table.find(transfer_id))
            .set(transfer_cache::user_id.eq(user_id))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn link_deposit(&self, transfer_id: i64, deposit_id: i64) -> SettlementResult<()> {
        let mut conn = self.db.connect().await?;
        diesel::update(transfer_cache::table.find(transfer_id))
            .set(transfer_cache::deposit_id.eq(deposit_id))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn link_withdrawal(
        &self,
        transfer_id: i64,
        withdrawal_id: i64,
    ) -> SettlementResult<()> {
        let mut conn = self.db.connect().await?;
        diesel::update(transfer_cache::table.find(transfer_id))
            .set(transfer_cache::withdrawal_id.eq(withdrawal_id))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn mark_processed(&self, transfer_id: i64) -> SettlementResult<()> {
        let mut conn = self.db.connect().await?;
        diesel::update(transfer_cache::table.find(transfer_id))
            .set((
                transfer_cache::is_processed.eq(true),
                transfer_cache::processed_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Oldest-first unprocessed transfers in one direction, for the deposit
    /// crediting job.
    pub async fn unprocessed(
        &self,
        direction: TransferDirection,
        limit: i64,
    ) -> SettlementResult<Vec<CachedTransfer>> {
        let mut conn = self.db.connect().await?;
        let transfers = transfer_cache::table
            .filter(transfer_cache::is_processed.eq(false))
            .filter(transfer_cache::direction.eq(direction.as_str()))
            .order(transfer_cache::block_number.asc())
            .limit(limit)
            .select(CachedTransfer::as_select())
            .load(&mut conn)
            .await?;
        Ok(transfers)
    }

    /// Attach registered users to cached transfers that predate their
    /// registration. Returns how many transfers got linked.
    pub async fn link_unprocessed_to_users(&self, limit: i64) -> SettlementResult<u64> {
        let mut conn = self.db.connect().await?;
        let unlinked: Vec<(i64, String, String, String)> = transfer_cache::table
            .filter(transfer_cache::user_id.is_null())
            .filter(transfer_cache::is_processed.eq(false))
            .order(transfer_cache::id.asc())
            .limit(limit)
            .select((
                transfer_cache::id,
                transfer_cache::from_address,
                transfer_cache::to_address,
                transfer_cache::direction,
            ))
            .load(&mut conn)
            .await?;

        let mut linked = 0u64;
        for (transfer_id, from_address, to_address, direction) in unlinked {
            let counterparty = match direction.as_str() {
                "incoming" => from_address,
                "outgoing" => to_address,
                // Internal transfers have no counterparty wallet.
                _ => continue,
            };
            let user_id = users::table
                .filter(users::wallet_address.eq(&counterparty))
                .select(users::id)
                .first::<i64>(&mut conn)
                .await
                .optional()?;
            if let Some(user_id) = user_id {
                diesel::update(transfer_cache::table.find(transfer_id))
                    .set(transfer_cache::user_id.eq(user_id))
                    .execute(&mut conn)
                    .await?;
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Per-direction totals for one token over the whole cache.
    pub async fn system_wallet_stats(
        &self,
        token: TokenType,
    ) -> SettlementResult<Vec<DirectionStats>> {
        use diesel::dsl::{count_star, sum};

        let mut conn = self.db.connect().await?;
        let rows: Vec<(String, i64, Option<BigDecimal>)> = transfer_cache::table
            .filter(transfer_cache::token_type.eq(token.as_str()))
            .group_by(transfer_cache::direction)
            .select((
                transfer_cache::direction,
                count_star(),
                sum(transfer_cache::amount),
            ))
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(direction, transfers, total)| DirectionStats {
                direction,
                transfers,
                total_amount: total.unwrap_or_else(BigDecimal::zero),
            })
            .collect())
    }

    /// All cached transfers touching a wallet, newest first.
    pub async fn for_wallet(
        &self,
        wallet: EthAddress,
        limit: i64,
    ) -> SettlementResult<Vec<CachedTransfer>> {
        let address = fmt_address(wallet);
        let mut conn = self.db.connect().await?;
        let transfers = transfer_cache::table
            .filter(
                transfer_cache::from_address
                    .eq(address.clone())
                    .or(transfer_cache::to_address.eq(address)),
            )
            .order(transfer_cache::block_number.desc())
            .limit(limit)
            .select(CachedTransfer::as_select())
            .load(&mut conn)
            .await?;
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TokenType, TransferDirection};
    use ethers::types::U256;

    fn event() -> TransferEvent {
        TransferEvent {
            tx_hash: H256::repeat_byte(0x42),
            block_number: 777,
            from: EthAddress::repeat_byte(0xbb),
            to: EthAddress::repeat_byte(0xaa),
            value: U256::from_dec_str("1500000000000000000").unwrap(),
            token: TokenType::Plex,
            token_address: EthAddress::repeat_byte(0x11),
        }
    }

    #[test]
    fn test_hex_formatting_is_lowercase_prefixed() {
        assert_eq!(fmt_hash(H256::repeat_byte(0xAB)), format!("0x{}", "ab".repeat(32)));
        assert_eq!(
            fmt_address(EthAddress::repeat_byte(0xAB)),
            format!("0x{}", "ab".repeat(20))
        );
    }

    #[test]
    fn test_cached_transfer_row() {
        let event = event();
        let amount: BigDecimal = "1.5".parse().unwrap();
        let row = cached_transfer_row(&event, TransferDirection::Incoming, amount.clone(), Some(9));

        assert_eq!(row.tx_hash, fmt_hash(event.tx_hash));
        assert_eq!(row.block_number, 777);
        assert_eq!(row.token_type, "plex");
        assert_eq!(row.direction, "incoming");
        assert_eq!(row.amount, amount);
        assert_eq!(row.amount_raw, "1500000000000000000");
        assert_eq!(row.user_id, Some(9));
    }

    #[test]
    fn test_row_keeps_raw_amount_verbatim() {
        let mut event = event();
        event.value = U256::MAX;
        let row = cached_transfer_row(
            &event,
            TransferDirection::Outgoing,
            BigDecimal::from(0),
            None,
        );
        assert_eq!(row.amount_raw, U256::MAX.to_string());
    }
}

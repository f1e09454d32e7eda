// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable lock backend: one row per lock in `lock_records`.
//!
//! Acquisition is a single atomic upsert that only steals the row when the
//! previous holder's lease has expired. Release only deletes the row when the
//! caller still holds it, so a stale worker cannot free a lock someone else
//! has since taken over.

use chrono::Utc;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl;
use settlement_pg_db::Db;
use settlement_schema::models::LockRecord;
use settlement_schema::schema::lock_records;
use std::time::Duration;

use crate::error::{SettlementError, SettlementResult};

#[derive(Clone)]
pub(crate) struct PgLockStore {
    db: Db,
}

impl PgLockStore {
    pub(crate) fn new(db: Db) -> Self {
        Self { db }
    }

    /// Returns true when the lock row now belongs to `holder_token`.
    ///
    /// The durable backend failing is not contention: callers must stop, not
    /// proceed unlocked, so pool and query errors both surface as
    /// [`SettlementError::LockBackendUnavailable`].
    pub(crate) async fn try_acquire(
        &self,
        key: &str,
        holder_token: &str,
        ttl: Duration,
    ) -> SettlementResult<bool> {
        use diesel::query_dsl::methods::FilterDsl;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SettlementError::Internal(format!("lock ttl out of range: {e}")))?;
        let record = LockRecord {
            lock_key: key.to_owned(),
            holder_token: holder_token.to_owned(),
            expires_at: now + ttl,
            acquired_at: now,
        };

        let mut conn = self
            .db
            .connect()
            .await
            .map_err(|e| SettlementError::LockBackendUnavailable(e.to_string()))?;

        let rows = diesel::insert_into(lock_records::table)
            .values(&record)
            .on_conflict(lock_records::lock_key)
            .do_update()
            .set((
                lock_records::holder_token.eq(excluded(lock_records::holder_token)),
                lock_records::expires_at.eq(excluded(lock_records::expires_at)),
                lock_records::acquired_at.eq(excluded(lock_records::acquired_at)),
            ))
            .filter(lock_records::expires_at.lt(now))
            .execute(&mut conn)
            .await
            .map_err(|e| SettlementError::LockBackendUnavailable(e.to_string()))?;

        Ok(rows == 1)
    }

    /// Token-checked release. Returns false when the row was already gone or
    /// stolen, which a caller should log but not fail on.
    pub(crate) async fn release(&self, key: &str, holder_token: &str) -> SettlementResult<bool> {
        let mut conn = self
            .db
            .connect()
            .await
            .map_err(|e| SettlementError::LockBackendUnavailable(e.to_string()))?;

        let rows = diesel::delete(
            lock_records::table
                .filter(lock_records::lock_key.eq(key))
                .filter(lock_records::holder_token.eq(holder_token)),
        )
        .execute(&mut conn)
        .await
        .map_err(|e| SettlementError::LockBackendUnavailable(e.to_string()))?;

        Ok(rows == 1)
    }
}

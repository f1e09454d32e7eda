// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-token sync bookmarks.
//!
//! A bookmark only ever moves forward, and only after the chunk of blocks it
//! covers has fully committed. Re-scanning committed ranges is harmless (the
//! transfer cache is idempotent), so crash recovery errs on the side of
//! scanning again rather than skipping blocks.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use settlement_pg_db::Db;
use settlement_schema::models::SyncBookmark;
use settlement_schema::schema::sync_bookmarks;

use crate::error::SettlementResult;
use crate::types::TokenType;

#[derive(Clone)]
pub struct BookmarkStore {
    db: Db,
}

impl BookmarkStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, token: TokenType) -> SettlementResult<Option<SyncBookmark>> {
        let mut conn = self.db.connect().await?;
        let bookmark = sync_bookmarks::table
            .find(token.as_str())
            .select(SyncBookmark::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(bookmark)
    }

    /// Move the bookmark to `to_block`, crediting `newly_indexed` transfers.
    ///
    /// Runs on the caller's connection so the advance commits atomically with
    /// the chunk that produced it. The GREATEST guard keeps a delayed replica
    /// from dragging the watermark backwards.
    pub async fn advance(
        &self,
        conn: &mut AsyncPgConnection,
        token: TokenType,
        to_block: u64,
        newly_indexed: u64,
    ) -> SettlementResult<()> {
        diesel::insert_into(sync_bookmarks::table)
            .values((
                sync_bookmarks::token_type.eq(token.as_str()),
                sync_bookmarks::last_synced_block.eq(to_block as i64),
                sync_bookmarks::first_synced_block.eq(to_block as i64),
                sync_bookmarks::total_indexed.eq(newly_indexed as i64),
                sync_bookmarks::updated_at.eq(Utc::now()),
            ))
            .on_conflict(sync_bookmarks::token_type)
            .do_update()
            .set((
                sync_bookmarks::last_synced_block.eq(diesel::dsl::sql::<diesel::sql_types::Int8>(
                    "GREATEST(sync_bookmarks.last_synced_block, EXCLUDED.last_synced_block)",
                )),
                sync_bookmarks::total_indexed
                    .eq(sync_bookmarks::total_indexed + newly_indexed as i64),
                sync_bookmarks::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Record a scan failure against the bookmark. A token that has never
    /// synced has no row yet; the error then only lives in the logs.
    pub async fn record_error(&self, token: TokenType, error: &str) -> SettlementResult<()> {
        let mut conn = self.db.connect().await?;
        diesel::update(sync_bookmarks::table.find(token.as_str()))
            .set((
                sync_bookmarks::error_count.eq(sync_bookmarks::error_count + 1),
                sync_bookmarks::last_error.eq(error),
                sync_bookmarks::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

/// Where a scan should start, extracted for testability.
///
/// An explicit override wins, then one past the bookmark, then an initial
/// window back from the head for a token synced for the first time.
pub fn compute_start_block(
    bookmark: Option<i64>,
    head_block: u64,
    initial_scan_window: u64,
    override_from: Option<u64>,
) -> u64 {
    if let Some(from) = override_from {
        return from;
    }
    match bookmark {
        Some(last_synced) => last_synced as u64 + 1,
        None => head_block.saturating_sub(initial_scan_window),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_block_resumes_after_bookmark() {
        assert_eq!(compute_start_block(Some(1000), 5000, 100, None), 1001);
    }

    #[test]
    fn test_start_block_first_sync_uses_window() {
        assert_eq!(compute_start_block(None, 5000, 100, None), 4900);
    }

    #[test]
    fn test_start_block_window_larger_than_chain() {
        assert_eq!(compute_start_block(None, 50, 100, None), 0);
    }

    #[test]
    fn test_start_block_override_wins() {
        assert_eq!(compute_start_block(Some(1000), 5000, 100, Some(42)), 42);
        assert_eq!(compute_start_block(None, 5000, 100, Some(42)), 42);
    }

    #[test]
    fn test_start_block_caught_up_points_past_head() {
        // Caller compares against head and skips the scan.
        assert_eq!(compute_start_block(Some(5000), 5000, 100, None), 5001);
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chunked scanner for Transfer events touching the system wallet.
//!
//! ```text
//!   bookmark ──► chunk walk ──► eth_getLogs (to wallet)
//!                    │      └─► eth_getLogs (from wallet)
//!                    ▼
//!            one tx per chunk: insert transfers + advance bookmark
//! ```
//!
//! A chunk either fully commits or leaves the bookmark untouched, so a crash
//! at any point re-scans at most one chunk, and the cache's tx_hash key makes
//! that re-scan a no-op.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::AsyncConnection;
use ethers::providers::JsonRpcClient;
use settlement_pg_db::Db;

use crate::bookmark::{compute_start_block, BookmarkStore};
use crate::chain_client::ChainClient;
use crate::config::ScanConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::hooks::SettlementHooks;
use crate::lock::{LockAttempt, LockManager, LockOptions, CHAIN_SCAN_LOCK};
use crate::metrics::SettlementMetrics;
use crate::retry_with_max_elapsed_time;
use crate::tx_cache::{cached_transfer_row, TransactionCache};
use crate::types::{
    scale_amount, BackfillReport, PollReport, TokenConfig, TransferDirection, TransferEvent,
};

// A scan tick may walk many chunks; the lease must outlive the slowest one.
const SCAN_LOCK_TTL: Duration = Duration::from_secs(300);
const RPC_RETRY_BUDGET: Duration = Duration::from_secs(60);

pub struct ChainEventScanner<P> {
    client: Arc<ChainClient<P>>,
    db: Db,
    cache: TransactionCache,
    bookmarks: BookmarkStore,
    locks: Arc<LockManager>,
    hooks: Arc<dyn SettlementHooks>,
    tokens: Vec<TokenConfig>,
    config: ScanConfig,
    metrics: Arc<SettlementMetrics>,
}

#[derive(Debug, Default)]
struct TokenScan {
    stored: u64,
    duplicates: u64,
    chunks: u64,
    /// Set when an RPC failure stopped the walk before `end_block`.
    halted: bool,
}

impl<P: JsonRpcClient> ChainEventScanner<P> {
    pub fn new(
        client: Arc<ChainClient<P>>,
        db: Db,
        locks: Arc<LockManager>,
        hooks: Arc<dyn SettlementHooks>,
        tokens: Vec<TokenConfig>,
        config: ScanConfig,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        Self {
            client,
            cache: TransactionCache::new(db.clone()),
            bookmarks: BookmarkStore::new(db.clone()),
            db,
            locks,
            hooks,
            tokens,
            config,
            metrics,
        }
    }

    /// One poll tick: walk every token from its bookmark toward the head,
    /// bounded by `max_blocks_per_poll`. Contention means another worker is
    /// already scanning this tick.
    pub async fn poll_new_blocks(&self) -> SettlementResult<LockAttempt<PollReport>> {
        let options = LockOptions::non_blocking(SCAN_LOCK_TTL);
        self.locks
            .try_with_lock(CHAIN_SCAN_LOCK, &options, || self.poll_inner())
            .await
    }

    async fn poll_inner(&self) -> SettlementResult<PollReport> {
        let head = self.client.latest_block().await?;
        self.metrics.latest_chain_block.set(head as i64);

        let mut report = PollReport {
            head_block: head,
            ..Default::default()
        };

        for token in &self.tokens {
            let bookmark = self.bookmarks.get(token.token).await?;
            let start = compute_start_block(
                bookmark.map(|b| b.last_synced_block),
                head,
                self.config.initial_scan_window,
                None,
            );
            if start > head {
                report.indexed.push((token.token, 0));
                continue;
            }
            let end = head.min(start + self.config.max_blocks_per_poll - 1);

            // One token failing must not starve the others.
            let scan = self.scan_token(token, start, end).await?;
            if scan.halted {
                tracing::warn!(
                    "[Scanner] {} scan halted before block {}, will resume next tick",
                    token.token,
                    end
                );
            }
            report.indexed.push((token.token, scan.stored));
        }

        Ok(report)
    }

    /// Walk one token from `from` (or its resolved start block) to the
    /// current head. Holds the scan lock for the duration; contention is an
    /// error here because backfills are explicitly requested.
    pub async fn backfill(
        &self,
        token_config: &TokenConfig,
        from: Option<u64>,
    ) -> SettlementResult<BackfillReport> {
        let options = LockOptions::non_blocking(SCAN_LOCK_TTL);
        self.locks
            .with_lock(CHAIN_SCAN_LOCK, &options, || async {
                let head = self.client.latest_block().await?;
                let bookmark = self.bookmarks.get(token_config.token).await?;
                let start = compute_start_block(
                    bookmark.map(|b| b.last_synced_block),
                    head,
                    self.config.initial_scan_window,
                    from,
                );
                if start > head {
                    return Ok(BackfillReport {
                        token: token_config.token,
                        from_block: start,
                        to_block: head,
                        chunks_processed: 0,
                        transfers_stored: 0,
                        duplicates_skipped: 0,
                    });
                }

                let scan = self.scan_token(token_config, start, head).await?;
                if scan.halted {
                    return Err(SettlementError::Rpc(format!(
                        "backfill of {} halted after {} chunks",
                        token_config.token, scan.chunks
                    )));
                }
                Ok(BackfillReport {
                    token: token_config.token,
                    from_block: start,
                    to_block: head,
                    chunks_processed: scan.chunks,
                    transfers_stored: scan.stored,
                    duplicates_skipped: scan.duplicates,
                })
            })
            .await
    }

    async fn scan_token(
        &self,
        token: &TokenConfig,
        start_block: u64,
        end_block: u64,
    ) -> SettlementResult<TokenScan> {
        let mut scan = TokenScan::default();

        for (chunk_start, chunk_end) in chunk_bounds(start_block, end_block, self.config.chunk_size)
        {
            let timer = self
                .metrics
                .scan_chunk_latency
                .with_label_values(&[token.token.as_str()])
                .start_timer();

            let events = match self.fetch_chunk(token, chunk_start, chunk_end).await {
                Ok(events) => events,
                Err(e) => {
                    self.metrics
                        .scan_errors
                        .with_label_values(&[e.error_type()])
                        .inc();
                    self.bookmarks
                        .record_error(token.token, &e.to_string())
                        .await?;
                    scan.halted = true;
                    return Ok(scan);
                }
            };

            let (stored, duplicates) = self.commit_chunk(token, chunk_end, &events).await?;
            timer.observe_duration();

            scan.stored += stored;
            scan.duplicates += duplicates;
            scan.chunks += 1;
            if scan.chunks % 10 == 0 {
                tracing::info!(
                    "[Scanner] {} scanned through block {} ({} chunks, {} transfers stored)",
                    token.token,
                    chunk_end,
                    scan.chunks,
                    scan.stored
                );
            }
            self.metrics
                .last_synced_blocks
                .with_label_values(&[token.token.as_str()])
                .set(chunk_end as i64);
        }

        Ok(scan)
    }

    /// Both wallet-side queries for one chunk, deduplicated by tx hash. An
    /// internal transfer (wallet to itself) shows up in both result sets.
    async fn fetch_chunk(
        &self,
        token: &TokenConfig,
        chunk_start: u64,
        chunk_end: u64,
    ) -> SettlementResult<Vec<TransferEvent>> {
        let incoming = retry_with_max_elapsed_time!(
            self.client.incoming_transfers(token, chunk_start, chunk_end),
            RPC_RETRY_BUDGET
        )??;
        let outgoing = retry_with_max_elapsed_time!(
            self.client.outgoing_transfers(token, chunk_start, chunk_end),
            RPC_RETRY_BUDGET
        )??;

        let mut seen = HashSet::new();
        let mut events = Vec::with_capacity(incoming.len() + outgoing.len());
        for event in incoming.into_iter().chain(outgoing) {
            if seen.insert(event.tx_hash) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Insert a chunk's transfers and advance the bookmark in one
    /// transaction, then fire post-commit hooks for new incoming transfers.
    async fn commit_chunk(
        &self,
        token: &TokenConfig,
        chunk_end: u64,
        events: &[TransferEvent],
    ) -> SettlementResult<(u64, u64)> {
        let wallet = self.client.system_wallet();
        let cache = &self.cache;
        let bookmarks = &self.bookmarks;

        let mut conn = self.db.connect().await?;
        let (stored_rows, duplicates) = conn
            .transaction::<_, SettlementError, _>(|conn| {
                async move {
                    let mut stored_rows = Vec::new();
                    let mut duplicates = 0u64;

                    for event in events {
                        let direction = event.direction(wallet);
                        let counterparty = match direction {
                            TransferDirection::Incoming => Some(event.from),
                            TransferDirection::Outgoing => Some(event.to),
                            TransferDirection::Internal => None,
                        };
                        let user_id = match counterparty {
                            Some(address) => cache.find_user_for_wallet(conn, address).await?,
                            None => None,
                        };

                        let amount = scale_amount(event.value, token.decimals)?;
                        let row = cached_transfer_row(event, direction, amount, user_id);
                        match cache.insert(conn, &row).await? {
                            crate::types::InsertOutcome::Stored => {
                                stored_rows.push((event.clone(), direction, row.amount, user_id));
                            }
                            crate::types::InsertOutcome::AlreadyCached => duplicates += 1,
                        }
                    }

                    bookmarks
                        .advance(conn, token.token, chunk_end, stored_rows.len() as u64)
                        .await?;
                    Ok((stored_rows, duplicates))
                }
                .scope_boxed()
            })
            .await?;

        for (event, direction, amount, user_id) in &stored_rows {
            self.metrics
                .transfers_stored
                .with_label_values(&[token.token.as_str(), direction.as_str()])
                .inc();
            if *direction == TransferDirection::Incoming {
                self.hooks
                    .deposit_seen(event.tx_hash, *user_id, amount)
                    .await;
            }
        }
        if duplicates > 0 {
            self.metrics
                .transfers_duplicate
                .with_label_values(&[token.token.as_str()])
                .inc_by(duplicates);
        }

        Ok((stored_rows.len() as u64, duplicates))
    }
}

/// Inclusive chunk ranges covering `[start, end]`, extracted for testability.
fn chunk_bounds(start: u64, end: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut bounds = Vec::new();
    let mut chunk_start = start;
    while chunk_start <= end {
        let chunk_end = end.min(chunk_start + chunk_size - 1);
        bounds.push((chunk_start, chunk_end));
        chunk_start = chunk_end + 1;
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_bounds_exact_multiple() {
        assert_eq!(
            chunk_bounds(0, 3999, 2000),
            vec![(0, 1999), (2000, 3999)]
        );
    }

    #[test]
    fn test_chunk_bounds_partial_tail() {
        assert_eq!(
            chunk_bounds(100, 4300, 2000),
            vec![(100, 2099), (2100, 4099), (4100, 4300)]
        );
    }

    #[test]
    fn test_chunk_bounds_single_block() {
        assert_eq!(chunk_bounds(42, 42, 2000), vec![(42, 42)]);
    }

    #[test]
    fn test_chunk_bounds_empty_range() {
        assert!(chunk_bounds(43, 42, 2000).is_empty());
    }

    #[test]
    fn test_chunk_bounds_zero_size_clamped() {
        assert_eq!(chunk_bounds(0, 2, 0), vec![(0, 0), (1, 1), (2, 2)]);
    }
}

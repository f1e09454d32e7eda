// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 20., 30., 60., 120., 300.,
];

#[derive(Clone, Debug)]
pub struct SettlementMetrics {
    pub(crate) last_synced_blocks: IntGaugeVec,
    pub(crate) latest_chain_block: IntGauge,
    pub(crate) transfers_stored: IntCounterVec,
    pub(crate) transfers_duplicate: IntCounterVec,
    pub(crate) scan_errors: IntCounterVec,
    pub(crate) scan_chunk_latency: HistogramVec,

    pub(crate) rewards_credited: IntCounterVec,
    pub(crate) rewards_capped: IntCounter,
    pub(crate) rewards_skipped: IntCounterVec,

    pub(crate) lock_acquired: IntCounterVec,
    pub(crate) lock_contended: IntCounterVec,
    pub(crate) lock_backend_errors: IntCounterVec,

    pub(crate) nonce_stuck_warnings: IntCounter,

    pub(crate) recovery_classified: IntCounterVec,
    pub(crate) recovery_refunds: IntCounter,
}

impl SettlementMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            last_synced_blocks: register_int_gauge_vec_with_registry!(
                "settlement_last_synced_blocks",
                "Highest block committed to the sync bookmark, by token",
                &["token"],
                registry,
            )
            .unwrap(),
            latest_chain_block: register_int_gauge_with_registry!(
                "settlement_latest_chain_block",
                "Head block last reported by the RPC node",
                registry,
            )
            .unwrap(),
            transfers_stored: register_int_counter_vec_with_registry!(
                "settlement_transfers_stored",
                "Total number of transfers newly stored in the cache, by token and direction",
                &["token", "direction"],
                registry,
            )
            .unwrap(),
            transfers_duplicate: register_int_counter_vec_with_registry!(
                "settlement_transfers_duplicate",
                "Total number of transfers skipped as already cached, by token",
                &["token"],
                registry,
            )
            .unwrap(),
            scan_errors: register_int_counter_vec_with_registry!(
                "settlement_scan_errors",
                "Total number of scan failures, by error type",
                &["type"],
                registry,
            )
            .unwrap(),
            scan_chunk_latency: register_histogram_vec_with_registry!(
                "settlement_scan_chunk_latency",
                "Time spent fetching and committing one chunk, by token",
                &["token"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            rewards_credited: register_int_counter_vec_with_registry!(
                "settlement_rewards_credited",
                "Total number of reward ledger entries written, by accrual kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            rewards_capped: register_int_counter_with_registry!(
                "settlement_rewards_capped",
                "Total number of rewards truncated by the ROI cap",
                registry,
            )
            .unwrap(),
            rewards_skipped: register_int_counter_vec_with_registry!(
                "settlement_rewards_skipped",
                "Total number of deposits skipped during accrual, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            lock_acquired: register_int_counter_vec_with_registry!(
                "settlement_lock_acquired",
                "Total number of successful lock acquisitions, by key prefix",
                &["key"],
                registry,
            )
            .unwrap(),
            lock_contended: register_int_counter_vec_with_registry!(
                "settlement_lock_contended",
                "Total number of lock attempts lost to another holder, by key prefix",
                &["key"],
                registry,
            )
            .unwrap(),
            lock_backend_errors: register_int_counter_vec_with_registry!(
                "settlement_lock_backend_errors",
                "Total number of lock backend failures, by backend",
                &["backend"],
                registry,
            )
            .unwrap(),
            nonce_stuck_warnings: register_int_counter_with_registry!(
                "settlement_nonce_stuck_warnings",
                "Times the pending nonce ran ahead of the confirmed nonce past the threshold",
                registry,
            )
            .unwrap(),
            recovery_classified: register_int_counter_vec_with_registry!(
                "settlement_recovery_classified",
                "Total number of stuck withdrawals classified, by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
            recovery_refunds: register_int_counter_with_registry!(
                "settlement_recovery_refunds",
                "Total number of failed withdrawals refunded to user balances",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_construction() {
        let registry = Registry::new();
        let metrics = SettlementMetrics::new(&registry);

        metrics
            .transfers_stored
            .with_label_values(&["usdt", "incoming"])
            .inc();
        metrics
            .recovery_classified
            .with_label_values(&["confirmed"])
            .inc();
        assert_eq!(
            metrics
                .transfers_stored
                .with_label_values(&["usdt", "incoming"])
                .get(),
            1
        );
    }

    #[test]
    fn test_new_for_testing_registers_cleanly() {
        let _ = SettlementMetrics::new_for_testing();
        let _ = SettlementMetrics::new_for_testing();
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Tunables for the settlement loops.
//!
//! Every knob has a serde default so a partial config file (or none at all)
//! yields the production values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the transfer scanner's block fetching behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Maximum number of blocks to query in a single `eth_getLogs` call.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// How far behind the head a fresh token (no bookmark yet) starts.
    #[serde(default = "default_initial_scan_window")]
    pub initial_scan_window: u64,

    /// Upper bound on blocks walked in one poll tick, so a long outage
    /// catches up across several ticks instead of one giant burst.
    #[serde(default = "default_max_blocks_per_poll")]
    pub max_blocks_per_poll: u64,

    /// Interval between poll ticks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            initial_scan_window: default_initial_scan_window(),
            max_blocks_per_poll: default_max_blocks_per_poll(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_chunk_size() -> u64 {
    2000
}

fn default_initial_scan_window() -> u64 {
    10_000
}

fn default_max_blocks_per_poll() -> u64 {
    20_000
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

/// Configuration for reward accrual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    /// Gap between two individual accruals on the same deposit.
    #[serde(default = "default_accrual_period")]
    pub accrual_period: Duration,

    /// Interval between accrual sweep ticks.
    #[serde(default = "default_accrual_interval")]
    pub accrual_interval: Duration,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            accrual_period: default_accrual_period(),
            accrual_interval: default_accrual_interval(),
        }
    }
}

fn default_accrual_period() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_accrual_interval() -> Duration {
    Duration::from_secs(60)
}

/// Configuration for distributed locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long an acquired lock lives if the holder never releases it.
    #[serde(default = "default_lock_ttl")]
    pub ttl: Duration,

    /// How long a blocking acquire keeps polling before giving up.
    #[serde(default = "default_blocking_timeout")]
    pub blocking_timeout: Duration,

    /// Delay between acquire attempts while blocking.
    #[serde(default = "default_lock_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: default_lock_ttl(),
            blocking_timeout: default_blocking_timeout(),
            poll_interval: default_lock_poll_interval(),
        }
    }
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_blocking_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_lock_poll_interval() -> Duration {
    Duration::from_millis(100)
}

/// Configuration for nonce allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    /// Warn when pending count runs this far ahead of the confirmed count.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: default_stuck_threshold(),
        }
    }
}

fn default_stuck_threshold() -> u64 {
    5
}

/// Configuration for the stuck-withdrawal sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Broadcast withdrawals younger than this are left alone.
    #[serde(default = "default_stuck_after")]
    pub stuck_after: Duration,

    /// Interval between sweep ticks.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval: Duration,

    /// Recommended gas bump for underpriced mempool transactions, percent.
    #[serde(default = "default_gas_bump_percent")]
    pub gas_bump_percent: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stuck_after: default_stuck_after(),
            recovery_interval: default_recovery_interval(),
            gas_bump_percent: default_gas_bump_percent(),
        }
    }
}

fn default_stuck_after() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_recovery_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_gas_bump_percent() -> u64 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_config_defaults() {
        let config = ScanConfig::default();
        assert_eq!(config.chunk_size, 2000);
        assert_eq!(config.poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: ScanConfig = serde_json::from_str(r#"{"chunk_size": 500}"#).unwrap();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.initial_scan_window, 10_000);
    }

    #[test]
    fn test_recovery_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.stuck_after, Duration::from_secs(900));
        assert_eq!(config.gas_bump_percent, 20);
    }
}

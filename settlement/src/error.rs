// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    // RPC call failed in a way that is worth retrying (timeout, transport).
    TransientRpc(String),
    // RPC call failed permanently (bad request, node rejected it).
    Rpc(String),
    // Database error.
    Storage(String),
    // A named lock was held by another worker for the whole acquire window.
    LockContended(String),
    // The durable lock backend could not be reached; callers must not proceed.
    LockBackendUnavailable(String),
    // A log from the node was missing fields it must have.
    MalformedLog(String),
    // Accrual is suspended by the emergency stop switch.
    AccrualSuspended,
    Config(String),
    Internal(String),
}

impl SettlementError {
    // Used as a metric label; must stay low-cardinality.
    pub fn error_type(&self) -> &'static str {
        match self {
            SettlementError::TransientRpc(_) => "transient_rpc",
            SettlementError::Rpc(_) => "rpc",
            SettlementError::Storage(_) => "storage",
            SettlementError::LockContended(_) => "lock_contended",
            SettlementError::LockBackendUnavailable(_) => "lock_backend_unavailable",
            SettlementError::MalformedLog(_) => "malformed_log",
            SettlementError::AccrualSuspended => "accrual_suspended",
            SettlementError::Config(_) => "config",
            SettlementError::Internal(_) => "internal",
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, SettlementError::LockContended(_))
    }
}

impl fmt::Display for SettlementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementError::TransientRpc(e) => write!(f, "transient rpc error: {e}"),
            SettlementError::Rpc(e) => write!(f, "rpc error: {e}"),
            SettlementError::Storage(e) => write!(f, "storage error: {e}"),
            SettlementError::LockContended(key) => write!(f, "lock contended: {key}"),
            SettlementError::LockBackendUnavailable(e) => {
                write!(f, "lock backend unavailable: {e}")
            }
            SettlementError::MalformedLog(e) => write!(f, "malformed log: {e}"),
            SettlementError::AccrualSuspended => write!(f, "reward accrual is suspended"),
            SettlementError::Config(e) => write!(f, "config error: {e}"),
            SettlementError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for SettlementError {}

impl From<diesel::result::Error> for SettlementError {
    fn from(e: diesel::result::Error) -> Self {
        SettlementError::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for SettlementError {
    fn from(e: anyhow::Error) -> Self {
        SettlementError::Storage(e.to_string())
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels_are_distinct() {
        let errors = [
            SettlementError::TransientRpc(String::new()),
            SettlementError::Rpc(String::new()),
            SettlementError::Storage(String::new()),
            SettlementError::LockContended(String::new()),
            SettlementError::LockBackendUnavailable(String::new()),
            SettlementError::MalformedLog(String::new()),
            SettlementError::AccrualSuspended,
            SettlementError::Config(String::new()),
            SettlementError::Internal(String::new()),
        ];
        let mut labels: Vec<_> = errors.iter().map(|e| e.error_type()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), errors.len());
    }

    #[test]
    fn test_lock_contention_predicate() {
        assert!(SettlementError::LockContended("chain_scan".into()).is_lock_contention());
        assert!(!SettlementError::AccrualSuspended.is_lock_contention());
    }
}

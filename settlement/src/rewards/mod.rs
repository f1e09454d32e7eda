// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reward accrual: session-based batches and per-deposit periodic accrual.

pub mod calculator;
mod engine;

pub use engine::{DueAccrual, RewardAccrualEngine, SessionAccrual};

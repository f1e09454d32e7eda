// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reward arithmetic, kept pure so every rule is unit-testable without a
//! database. All values are [`BigDecimal`]; rates are percentages.

use bigdecimal::{BigDecimal, Zero};

/// `amount * rate * days / 100`.
pub fn reward_amount(amount: &BigDecimal, rate_percent: &BigDecimal, days: i32) -> BigDecimal {
    amount * rate_percent * BigDecimal::from(days) / BigDecimal::from(100)
}

/// The session rate overrides the deposit's base rate when it is set to a
/// positive value; a zero session rate means "no override".
pub fn effective_rate(session_rate: &BigDecimal, deposit_rate: &BigDecimal) -> BigDecimal {
    if session_rate > &BigDecimal::zero() {
        session_rate.clone()
    } else {
        deposit_rate.clone()
    }
}

/// How much ROI space a deposit has left. Never negative, even if past data
/// overshot the cap.
pub fn remaining_cap(cap: &BigDecimal, paid: &BigDecimal) -> BigDecimal {
    let remaining = cap - paid;
    if remaining < BigDecimal::zero() {
        BigDecimal::zero()
    } else {
        remaining
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CappedReward {
    pub amount: BigDecimal,
    /// True when the raw reward was truncated to fit the cap.
    pub capped: bool,
}

/// Truncate `reward` so `paid + reward` never exceeds `cap`.
pub fn cap_reward(reward: BigDecimal, cap: &BigDecimal, paid: &BigDecimal) -> CappedReward {
    let remaining = remaining_cap(cap, paid);
    if reward > remaining {
        CappedReward {
            amount: remaining,
            capped: true,
        }
    } else {
        CappedReward {
            amount: reward,
            capped: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_reward_amount_daily_rate() {
        // 1000 at 1.117% for one day.
        assert_eq!(reward_amount(&dec("1000"), &dec("1.117"), 1), dec("11.17"));
        // Three days compound linearly per accrual run.
        assert_eq!(reward_amount(&dec("1000"), &dec("1.117"), 3), dec("33.51"));
        assert_eq!(reward_amount(&dec("0"), &dec("1.117"), 1), dec("0"));
    }

    #[test]
    fn test_effective_rate_session_override() {
        assert_eq!(effective_rate(&dec("2.5"), &dec("1.0")), dec("2.5"));
        assert_eq!(effective_rate(&dec("0"), &dec("1.0")), dec("1.0"));
        // A negative override is nonsense config; fall back to the base rate.
        assert_eq!(effective_rate(&dec("-1"), &dec("1.0")), dec("1.0"));
    }

    #[test]
    fn test_remaining_cap_never_negative() {
        assert_eq!(remaining_cap(&dec("5000"), &dec("4950")), dec("50"));
        assert_eq!(remaining_cap(&dec("5000"), &dec("5000")), dec("0"));
        assert_eq!(remaining_cap(&dec("5000"), &dec("5100")), dec("0"));
    }

    #[test]
    fn test_cap_reward_truncates_overshoot() {
        // Deposit 1000, cap 5000, paid 4950, computed 100 -> credit 50.
        let capped = cap_reward(dec("100"), &dec("5000"), &dec("4950"));
        assert_eq!(capped.amount, dec("50"));
        assert!(capped.capped);
    }

    #[test]
    fn test_cap_reward_passes_through_under_cap() {
        let capped = cap_reward(dec("11.17"), &dec("5000"), &dec("0"));
        assert_eq!(capped.amount, dec("11.17"));
        assert!(!capped.capped);
    }

    #[test]
    fn test_cap_reward_exhausted_deposit_gets_zero() {
        let capped = cap_reward(dec("11.17"), &dec("5000"), &dec("5000"));
        assert_eq!(capped.amount, dec("0"));
        assert!(capped.capped);
    }
}

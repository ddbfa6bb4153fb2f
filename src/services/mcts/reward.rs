//! Reward function for the search
//!
//! Guides MCTS toward rewrites that are semantically correct first and
//! faster second: invalid rewrites earn nothing, correct-but-slower earns a
//! token amount so valid beats invalid, and speedups earn proportionally
//! with a cap so one outlier cannot dominate the tree.

use crate::models::{ValidationResult, ValidationStatus};

#[derive(Debug, Clone)]
pub struct RewardConfig {
    /// Cap on the reward for a single node
    pub max_reward: f64,
    /// Speedup at which reward becomes linear in speedup
    pub speedup_threshold: f64,
    /// Speedup considered a great optimization
    pub great_speedup: f64,
    /// Reward for correct but unimproved (1.0 <= s < threshold)
    pub neutral_reward: f64,
    /// Reward for correct but slower
    pub penalty_slower: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            max_reward: 5.0,
            speedup_threshold: 1.1,
            great_speedup: 2.0,
            neutral_reward: 0.5,
            penalty_slower: 0.2,
        }
    }
}

/// Compute the reward for one validated node.
///
/// - status != pass: 0.0
/// - speedup >= 2.0: min(speedup, max_reward)
/// - speedup >= 1.1: speedup
/// - speedup >= 1.0: neutral_reward
/// - else: penalty_slower
pub fn compute_reward(result: &ValidationResult, config: &RewardConfig) -> f64 {
    if result.status != ValidationStatus::Pass {
        return 0.0;
    }

    let mut speedup = result.speedup;
    if speedup.is_infinite() {
        speedup = config.max_reward;
    }
    if speedup <= 0.0 {
        speedup = 1.0;
    }

    if speedup >= config.great_speedup {
        speedup.min(config.max_reward)
    } else if speedup >= config.speedup_threshold {
        speedup
    } else if speedup >= 1.0 {
        config.neutral_reward
    } else {
        config.penalty_slower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(speedup: f64) -> ValidationResult {
        ValidationResult {
            status: ValidationStatus::Pass,
            rows_match: true,
            checksum_match: true,
            original_ms: 100.0,
            optimized_ms: 100.0 / speedup.max(1e-9),
            speedup,
            original_rows: 1,
            optimized_rows: 1,
            error: None,
            config_variant: None,
        }
    }

    #[test]
    fn test_non_pass_earns_zero() {
        let config = RewardConfig::default();
        for status in
            [ValidationStatus::FailRows, ValidationStatus::FailError, ValidationStatus::Timeout]
        {
            let mut r = passed(3.0);
            r.status = status;
            assert_eq!(compute_reward(&r, &config), 0.0);
        }
    }

    #[test]
    fn test_reward_tiers() {
        let config = RewardConfig::default();
        assert_eq!(compute_reward(&passed(0.5), &config), 0.2);
        assert_eq!(compute_reward(&passed(1.0), &config), 0.5);
        assert_eq!(compute_reward(&passed(1.05), &config), 0.5);
        assert!((compute_reward(&passed(1.5), &config) - 1.5).abs() < 1e-9);
        assert!((compute_reward(&passed(2.5), &config) - 2.5).abs() < 1e-9);
        assert_eq!(compute_reward(&passed(17.0), &config), 5.0);
    }

    #[test]
    fn test_infinite_speedup_capped() {
        let config = RewardConfig::default();
        assert_eq!(compute_reward(&passed(f64::INFINITY), &config), 5.0);
    }

    #[test]
    fn test_reward_monotone_in_speedup() {
        let config = RewardConfig::default();
        let speedups = [0.2, 0.9, 1.0, 1.09, 1.1, 1.5, 1.99, 2.0, 3.0, 5.0, 9.0];
        let rewards: Vec<f64> =
            speedups.iter().map(|&s| compute_reward(&passed(s), &config)).collect();
        for pair in rewards.windows(2) {
            assert!(pair[1] >= pair[0], "reward not monotone: {rewards:?}");
        }
    }
}

//! Gas margin policy for HTLC submissions

use super::TxOptions;
use crate::config::NetworkConfig;

use ethers::types::U256;
use tracing::debug;

/// HTLC operation kinds, for fallback gas limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtlcOp {
    Create,
    Withdraw,
    Refund,
    Admin,
}

impl HtlcOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            HtlcOp::Create => "create",
            HtlcOp::Withdraw => "withdraw",
            HtlcOp::Refund => "refund",
            HtlcOp::Admin => "admin",
        }
    }

    /// Gas limit used when estimation itself fails
    pub fn fallback_gas_limit(&self) -> U256 {
        match self {
            HtlcOp::Create => U256::from(200_000),
            HtlcOp::Withdraw | HtlcOp::Refund | HtlcOp::Admin => U256::from(100_000),
        }
    }
}

/// Gas margin applied to estimates, raised on each retry
#[derive(Debug, Clone, Copy)]
pub struct GasPolicy {
    /// Buffer percentage for the first attempt (e.g., 20 = 20% buffer)
    base_margin_percent: u64,
    /// Added to the buffer on every further attempt
    step_percent: u64,
}

impl GasPolicy {
    pub fn new(base_margin_percent: u64, step_percent: u64) -> Self {
        Self {
            base_margin_percent,
            step_percent,
        }
    }

    pub fn from_network(config: &NetworkConfig) -> Self {
        Self::new(config.gas_margin_percent, config.gas_margin_step_percent)
    }

    /// Submission options for a 1-based attempt number
    pub fn options(&self, attempt: u32) -> TxOptions {
        let bumps = u64::from(attempt.saturating_sub(1));
        TxOptions {
            gas_margin_percent: self
                .base_margin_percent
                .saturating_add(self.step_percent.saturating_mul(bumps)),
        }
    }
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self::new(20, 30)
    }
}

impl TxOptions {
    /// Apply the margin to a gas estimate
    pub fn buffered_gas(&self, estimate: U256) -> U256 {
        let buffered = estimate + estimate * U256::from(self.gas_margin_percent) / U256::from(100);
        debug!(
            "Gas estimate {} buffered by {}% to {}",
            estimate, self.gas_margin_percent, buffered
        );
        buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin_rises_per_attempt() {
        let policy = GasPolicy::new(20, 30);
        assert_eq!(policy.options(1).gas_margin_percent, 20);
        assert_eq!(policy.options(2).gas_margin_percent, 50);
        assert_eq!(policy.options(3).gas_margin_percent, 80);
    }

    #[test]
    fn test_buffered_gas() {
        let options = TxOptions {
            gas_margin_percent: 20,
        };
        assert_eq!(options.buffered_gas(U256::from(100_000)), U256::from(120_000));
        assert_eq!(HtlcOp::Create.fallback_gas_limit(), U256::from(200_000));
    }
}

//! Timelock planning for the two legs of a swap
//!
//! The initiator's contract (HTLC1) runs on a long horizon sized to its
//! ledger's finality risk. The participant's contract (HTLC2) must expire
//! strictly earlier than `T1 - safety_margin`, so that once the secret is
//! revealed on HTLC2 the participant still has time to claim HTLC1 before the
//! initiator can refund it.

use crate::config::{NetworkConfig, Settings};
use crate::error::{SwapError, SwapResult};

use tracing::debug;

/// Computes and checks T1 / T2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelockPolicy {
    safety_margin_secs: u64,
}

impl TimelockPolicy {
    pub fn new(safety_margin_secs: u64) -> Self {
        Self { safety_margin_secs }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.protocol.safety_margin_secs)
    }

    pub fn safety_margin_secs(&self) -> u64 {
        self.safety_margin_secs
    }

    /// T1 for a contract on the initiator's ledger
    pub fn initiator_timelock(&self, now: u64, from: &NetworkConfig) -> u64 {
        now + from.initiator_window_secs
    }

    /// T2 for a contract on the participant's ledger, checked against the
    /// timelock actually recorded on HTLC1
    pub fn participant_timelock(
        &self,
        now: u64,
        to: &NetworkConfig,
        initiator_timelock: u64,
    ) -> SwapResult<u64> {
        let participant_timelock = now + to.participant_window_secs;
        self.check(initiator_timelock, participant_timelock)?;
        Ok(participant_timelock)
    }

    /// `T2 < T1 - safety_margin`
    pub fn check(&self, initiator_timelock: u64, participant_timelock: u64) -> SwapResult<()> {
        let deadline = initiator_timelock.saturating_sub(self.safety_margin_secs);
        if participant_timelock >= deadline {
            return Err(SwapError::Validation(format!(
                "participant timelock {} must be earlier than {} (initiator timelock {} less {}s safety margin)",
                participant_timelock, deadline, initiator_timelock, self.safety_margin_secs
            )));
        }

        debug!(
            "Timelocks ordered: T2 {} leaves {}s before T1 {}",
            participant_timelock,
            initiator_timelock - participant_timelock,
            initiator_timelock
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(initiator_window: u64, participant_window: u64) -> NetworkConfig {
        let settings = Settings::from_toml_str(crate::config::tests::SAMPLE).unwrap();
        let mut config = settings.network("fuji").unwrap().clone();
        config.initiator_window_secs = initiator_window;
        config.participant_window_secs = participant_window;
        config
    }

    #[test]
    fn test_standard_plan() {
        let policy = TimelockPolicy::new(1800);
        let now = 1_000_000;
        let t1 = policy.initiator_timelock(now, &network(10800, 3600));
        assert_eq!(t1, now + 10800);

        let t2 = policy
            .participant_timelock(now, &network(14400, 3600), t1)
            .unwrap();
        assert_eq!(t2, now + 3600);
    }

    #[test]
    fn test_margin_boundary() {
        let policy = TimelockPolicy::new(1800);
        // T2 == T1 - margin is not strictly earlier
        assert!(policy.check(10_000, 8_200).is_err());
        assert!(policy.check(10_000, 8_199).is_ok());
    }

    #[test]
    fn test_late_participant_is_rejected() {
        let policy = TimelockPolicy::new(1800);
        let t1 = 1_000_000 + 10800;
        // Participant shows up 2.5h later; T2 would land inside the margin
        let late = 1_000_000 + 9000;
        let err = policy
            .participant_timelock(late, &network(14400, 3600), t1)
            .unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)));
    }
}

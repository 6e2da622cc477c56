//! Tiered session recovery.
//!
//! Failures escalate through two tiers before the worker gives up:
//!
//! 1. **Session reinit** — reload the portal in the existing browser, solve a
//!    fresh CAPTCHA, seek back. Cheap; only valid while the driver still
//!    answers.
//! 2. **Full recovery** — tear the browser down completely (process,
//!    profile, cache) and rebuild from nothing.
//!
//! The state machine is pure so the escalation ladder can be tested without
//! a browser; the worker owns the side effects.

/// Where the worker stands in the recovery ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Normal operation.
    Healthy,
    /// A recoverable failure occurred and the session is still responsive;
    /// an in-place reinit should be tried.
    SessionReinitRequested,
    /// The session is wedged or reinit failed; rebuild from scratch.
    FullRecoveryRequested,
    /// All recovery rounds exhausted; the worker must exit non-zero.
    Failed,
}

impl RecoveryState {
    /// A scraping operation failed. From [`Healthy`](Self::Healthy) this
    /// requests the cheap tier first; anything already in recovery stays
    /// where it is (the probe decides escalation, not repeat failures).
    pub fn on_operation_failure(self) -> Self {
        match self {
            Self::Healthy => Self::SessionReinitRequested,
            other => other,
        }
    }

    /// Result of the liveness probe taken before attempting reinit. A dead
    /// driver makes in-place reinit pointless, so escalate immediately.
    pub fn after_probe(self, responsive: bool) -> Self {
        match self {
            Self::SessionReinitRequested if !responsive => Self::FullRecoveryRequested,
            other => other,
        }
    }

    /// Result of an in-place session reinit attempt.
    pub fn after_reinit(self, ok: bool) -> Self {
        if ok {
            Self::Healthy
        } else {
            Self::FullRecoveryRequested
        }
    }

    /// Result of a full teardown-and-rebuild round. `rounds_left` counts the
    /// remaining budget *after* this attempt.
    pub fn after_full_recovery(self, ok: bool, rounds_left: u32) -> Self {
        if ok {
            Self::Healthy
        } else if rounds_left == 0 {
            Self::Failed
        } else {
            Self::FullRecoveryRequested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_requests_cheap_tier_first() {
        let s = RecoveryState::Healthy.on_operation_failure();
        assert_eq!(s, RecoveryState::SessionReinitRequested);
    }

    #[test]
    fn test_dead_probe_skips_reinit() {
        // In-place reinit is never attempted on an unresponsive session.
        let s = RecoveryState::Healthy
            .on_operation_failure()
            .after_probe(false);
        assert_eq!(s, RecoveryState::FullRecoveryRequested);
    }

    #[test]
    fn test_reinit_failure_escalates() {
        let s = RecoveryState::SessionReinitRequested
            .after_probe(true)
            .after_reinit(false);
        assert_eq!(s, RecoveryState::FullRecoveryRequested);
    }

    #[test]
    fn test_successful_recovery_returns_to_healthy() {
        assert_eq!(
            RecoveryState::SessionReinitRequested.after_reinit(true),
            RecoveryState::Healthy
        );
        assert_eq!(
            RecoveryState::FullRecoveryRequested.after_full_recovery(true, 2),
            RecoveryState::Healthy
        );
    }

    #[test]
    fn test_exhausted_rounds_fail() {
        assert_eq!(
            RecoveryState::FullRecoveryRequested.after_full_recovery(false, 1),
            RecoveryState::FullRecoveryRequested
        );
        assert_eq!(
            RecoveryState::FullRecoveryRequested.after_full_recovery(false, 0),
            RecoveryState::Failed
        );
    }
}

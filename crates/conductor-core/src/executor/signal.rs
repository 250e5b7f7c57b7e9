//! Plan stop signal
//!
//! Cooperative cancellation for one plan run. The first reason recorded
//! wins; later stop requests only re-trigger the token.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::types::SkipReason;

#[derive(Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<SkipReason>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: SkipReason) {
        {
            let mut slot = self
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason steps are skipped once stopped
    pub fn reason(&self) -> SkipReason {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or(SkipReason::Cancelled)
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_stopped());
        clone.stop(SkipReason::Superseded);
        signal.stop(SkipReason::PlanTimeout);
        assert!(signal.is_stopped());
        assert_eq!(signal.reason(), SkipReason::Superseded);
    }
}

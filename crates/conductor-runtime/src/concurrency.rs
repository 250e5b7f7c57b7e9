//! Session admission policy
//!
//! Decides what happens to a session's earlier plan when a new request
//! arrives for the same session. Plans in different sessions never interact.

use std::str::FromStr;

/// Decision on how to admit a new request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyDecision {
    /// Nothing is in flight for the session
    Start,
    /// Stop every earlier request of the session (resolving or running),
    /// cancel the pending plan, then start
    SupersedeAndStart,
    /// Wait for the running plan and any pending proposal to settle
    WaitForIdle,
}

/// Snapshot of one session lane
#[derive(Debug, Clone, Default)]
pub struct LaneState {
    /// An admitted request is resolving or executing steps
    pub is_running: bool,
    /// A plan is parked awaiting confirmation
    pub has_pending: bool,
}

impl LaneState {
    pub fn is_idle(&self) -> bool {
        !self.is_running && !self.has_pending
    }
}

pub trait ConcurrencyPolicy: Send + Sync {
    fn decide(&self, lane: &LaneState) -> ConcurrencyDecision;
}

/// Default policy: the newest request wins. It claims the lane even when
/// idle, so a request admitted a moment later can still stop it.
pub struct SupersedePolicy;

impl ConcurrencyPolicy for SupersedePolicy {
    fn decide(&self, _lane: &LaneState) -> ConcurrencyDecision {
        ConcurrencyDecision::SupersedeAndStart
    }
}

/// Requests are served one after another; a pending proposal holds the lane
/// until it is decided or expires.
pub struct QueuePolicy;

impl ConcurrencyPolicy for QueuePolicy {
    fn decide(&self, lane: &LaneState) -> ConcurrencyDecision {
        if lane.is_idle() {
            ConcurrencyDecision::Start
        } else {
            ConcurrencyDecision::WaitForIdle
        }
    }
}

/// Policy names accepted in `runtime.session_policy`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    #[default]
    Supersede,
    Queue,
}

impl SessionPolicy {
    pub fn policy(&self) -> Box<dyn ConcurrencyPolicy> {
        match self {
            SessionPolicy::Supersede => Box::new(SupersedePolicy),
            SessionPolicy::Queue => Box::new(QueuePolicy),
        }
    }
}

impl FromStr for SessionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "supersede" => Ok(SessionPolicy::Supersede),
            "queue" => Ok(SessionPolicy::Queue),
            other => Err(format!("unsupported session policy '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy(is_running: bool, has_pending: bool) -> LaneState {
        LaneState {
            is_running,
            has_pending,
        }
    }

    #[test]
    fn test_idle_lane_decisions() {
        assert_eq!(
            SupersedePolicy.decide(&LaneState::default()),
            ConcurrencyDecision::SupersedeAndStart
        );
        assert_eq!(
            QueuePolicy.decide(&LaneState::default()),
            ConcurrencyDecision::Start
        );
    }

    #[test]
    fn test_busy_lane_decisions() {
        for lane in [busy(true, false), busy(false, true), busy(true, true)] {
            assert_eq!(
                SupersedePolicy.decide(&lane),
                ConcurrencyDecision::SupersedeAndStart
            );
            assert_eq!(QueuePolicy.decide(&lane), ConcurrencyDecision::WaitForIdle);
        }
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(
            "Supersede".parse::<SessionPolicy>().unwrap(),
            SessionPolicy::Supersede
        );
        assert_eq!(" queue ".parse::<SessionPolicy>().unwrap(), SessionPolicy::Queue);
        assert!("parallel".parse::<SessionPolicy>().is_err());
        assert_eq!(SessionPolicy::default(), SessionPolicy::Supersede);
    }
}

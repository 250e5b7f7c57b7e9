//! Proposal type definitions
//!
//! A Proposal is surfaced to the caller whenever a plan holds at least one
//! step gated for confirmation. It is consumed once by a decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{PlanId, StepId};

/// Caller decision on a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Confirm,
    Cancel,
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "confirm" | "yes" | "y" => Ok(Decision::Confirm),
            "cancel" | "no" | "n" => Ok(Decision::Cancel),
            other => Err(format!("unknown decision '{}'", other)),
        }
    }
}

/// One gated step, described for a human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalItem {
    pub step_id: StepId,
    pub capability: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub plan_id: PlanId,
    pub items: Vec<ProposalItem>,
    pub actions: Vec<Decision>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(plan_id: impl Into<PlanId>, items: Vec<ProposalItem>, window: Duration) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan_id.into(),
            items,
            actions: vec![Decision::Confirm, Decision::Cancel],
            created_at: now,
            expires_at: now + window,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Gated step descriptions in proposal order
    pub fn descriptions(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.description.as_str()).collect()
    }

    pub fn item_for(&self, step_id: &str) -> Option<&ProposalItem> {
        self.items.iter().find(|i| i.step_id.as_str() == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_parsing() {
        assert_eq!("confirm".parse::<Decision>().unwrap(), Decision::Confirm);
        assert_eq!(" Y ".parse::<Decision>().unwrap(), Decision::Confirm);
        assert_eq!("cancel".parse::<Decision>().unwrap(), Decision::Cancel);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_proposal_expiry_window() {
        let proposal = Proposal::new("p1", Vec::new(), Duration::seconds(30));
        assert_eq!(proposal.actions, vec![Decision::Confirm, Decision::Cancel]);
        assert!(!proposal.is_expired());
        assert!(proposal.is_expired_at(proposal.created_at + Duration::seconds(31)));
    }
}

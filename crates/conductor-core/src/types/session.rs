//! Session and conversation definitions
//!
//! Sessions are owned by an external store; the orchestrator only reads them
//! and writes at plan-state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::{ExecutionPlan, PlanResult, Proposal, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    User,
    Assistant,
}

/// One turn of conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: EntryRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: EntryRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: EntryRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Structured context returned by a context source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnippet {
    pub role: EntryRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ConversationEntry> for ConversationSnippet {
    fn from(entry: &ConversationEntry) -> Self {
        Self {
            role: entry.role,
            content: entry.content.clone(),
            timestamp: entry.timestamp,
        }
    }
}

/// Hint passed to a context source when the resolver flags ambiguity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHint {
    /// Back-reference terms found in the utterance
    pub references: Vec<String>,
    /// Maximum number of snippets wanted
    pub limit: usize,
}

impl ContextHint {
    pub fn new(references: Vec<String>, limit: usize) -> Self {
        Self { references, limit }
    }
}

/// A plan parked while its proposal awaits a decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPlan {
    pub plan: ExecutionPlan,
    pub proposal: Proposal,
    /// Results of the auto phase
    pub results: PlanResult,
    pub utterance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub conversation_history: VecDeque<ConversationEntry>,
    pub pending_plan: Option<PendingPlan>,
}

impl Session {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_history: VecDeque::new(),
            pending_plan: None,
        }
    }

    /// Append an entry, evicting the oldest beyond `max_history`
    pub fn push_entry(&mut self, entry: ConversationEntry, max_history: usize) {
        self.conversation_history.push_back(entry);
        while self.conversation_history.len() > max_history {
            self.conversation_history.pop_front();
        }
    }

    /// Most recent `limit` entries, oldest first
    pub fn recent(&self, limit: usize) -> Vec<&ConversationEntry> {
        let skip = self.conversation_history.len().saturating_sub(limit);
        self.conversation_history.iter().skip(skip).collect()
    }
}

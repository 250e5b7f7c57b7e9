//! SessionStore - per-session state trait

use async_trait::async_trait;

use super::StoreError;
use crate::types::{ConversationEntry, PendingPlan, Session};

/// Session persistence.
///
/// Every method is a single atomic operation; callers never hold a lock
/// across the pipeline.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Snapshot of a session, `None` if it was never touched
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Append to the bounded conversation history (oldest evicted)
    async fn append_entry(&self, session_id: &str, entry: ConversationEntry)
        -> Result<(), StoreError>;

    /// Most recent `limit` entries, oldest first
    async fn recent_entries(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationEntry>, StoreError>;

    /// Park a plan awaiting confirmation; returns the plan it displaced
    async fn save_pending_plan(
        &self,
        session_id: &str,
        pending: PendingPlan,
    ) -> Result<Option<PendingPlan>, StoreError>;

    /// Take the parked plan whatever its id
    async fn clear_pending_plan(&self, session_id: &str)
        -> Result<Option<PendingPlan>, StoreError>;

    /// Take the parked plan only if it is `plan_id`; a second caller gets `None`
    async fn take_pending_plan(
        &self,
        session_id: &str,
        plan_id: &str,
    ) -> Result<Option<PendingPlan>, StoreError>;
}

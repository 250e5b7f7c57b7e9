//! SessionStore in-memory implementation.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::debug;

use conductor_core::store::{SessionStore, StoreError};
use conductor_core::types::{ConversationEntry, PendingPlan, Session};

const DEFAULT_IN_MEMORY_SESSION_LIMIT: usize = 5_000;
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// In-memory implementation for development and testing.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    order: RwLock<VecDeque<String>>,
    max_sessions: usize,
    max_history: usize,
}

impl InMemorySessionStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_IN_MEMORY_SESSION_LIMIT, DEFAULT_HISTORY_LIMIT)
    }

    /// Create a store with a hard session cap and per-session history cap.
    pub fn with_limits(max_sessions: usize, max_history: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            order: RwLock::new(VecDeque::new()),
            max_sessions: max_sessions.max(1),
            max_history: max_history.max(1),
        }
    }

    fn touch_order(order: &mut VecDeque<String>, session_id: &str) {
        order.retain(|id| id != session_id);
        order.push_back(session_id.to_string());
    }

    /// Run `f` on the session, creating it (and evicting the least recently
    /// touched one at capacity) if needed.
    fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut order = self
            .order
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        if !sessions.contains_key(session_id) && sessions.len() >= self.max_sessions {
            if let Some(oldest_id) = order.pop_front() {
                debug!(session_id = %oldest_id, "evicting least recently used session");
                sessions.remove(&oldest_id);
            }
        }
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        let out = f(session);
        Self::touch_order(&mut order, session_id);
        Ok(out)
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn append_entry(
        &self,
        session_id: &str,
        entry: ConversationEntry,
    ) -> Result<(), StoreError> {
        let max_history = self.max_history;
        self.with_session(session_id, |session| session.push_entry(entry, max_history))
    }

    async fn recent_entries(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationEntry>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(sessions
            .get(session_id)
            .map(|s| s.recent(limit).into_iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_pending_plan(
        &self,
        session_id: &str,
        pending: PendingPlan,
    ) -> Result<Option<PendingPlan>, StoreError> {
        self.with_session(session_id, |session| session.pending_plan.replace(pending))
    }

    async fn clear_pending_plan(
        &self,
        session_id: &str,
    ) -> Result<Option<PendingPlan>, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(sessions
            .get_mut(session_id)
            .and_then(|s| s.pending_plan.take()))
    }

    async fn take_pending_plan(
        &self,
        session_id: &str,
        plan_id: &str,
    ) -> Result<Option<PendingPlan>, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };
        let matches = session
            .pending_plan
            .as_ref()
            .is_some_and(|p| p.plan.id == plan_id);
        Ok(if matches {
            session.pending_plan.take()
        } else {
            None
        })
    }
}

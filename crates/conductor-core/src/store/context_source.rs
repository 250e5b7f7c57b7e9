//! ContextSource - lazy conversation context

use async_trait::async_trait;

use super::StoreError;
use crate::types::{ContextHint, ConversationSnippet};

/// Fetched only when the resolver flags an ambiguous utterance.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Recent snippets for `session_id`, oldest first, at most `hint.limit`
    async fn fetch_recent_context(
        &self,
        session_id: &str,
        hint: &ContextHint,
    ) -> Result<Vec<ConversationSnippet>, StoreError>;
}

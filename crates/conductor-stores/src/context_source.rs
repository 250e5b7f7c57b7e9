//! ContextSource backed by a SessionStore.

use async_trait::async_trait;
use std::sync::Arc;

use conductor_core::store::{ContextSource, SessionStore, StoreError};
use conductor_core::types::{ContextHint, ConversationSnippet};

/// Reads the tail of a session's conversation history.
pub struct SessionContextSource {
    store: Arc<dyn SessionStore>,
}

impl SessionContextSource {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ContextSource for SessionContextSource {
    async fn fetch_recent_context(
        &self,
        session_id: &str,
        hint: &ContextHint,
    ) -> Result<Vec<ConversationSnippet>, StoreError> {
        let entries = self.store.recent_entries(session_id, hint.limit).await?;
        Ok(entries.iter().map(ConversationSnippet::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemorySessionStore;
    use conductor_core::types::{ConversationEntry, EntryRole};

    #[test]
    fn test_fetches_tail_of_history() {
        tokio_test::block_on(async {
            let store = Arc::new(InMemorySessionStore::new());
            store
                .append_entry("s", ConversationEntry::user("who is John?"))
                .await
                .unwrap();
            store
                .append_entry("s", ConversationEntry::assistant("John is john@example.com"))
                .await
                .unwrap();
            store
                .append_entry("s", ConversationEntry::user("email him"))
                .await
                .unwrap();

            let source = SessionContextSource::new(store);
            let snippets = source
                .fetch_recent_context("s", &ContextHint::new(vec!["him".to_string()], 2))
                .await
                .unwrap();
            assert_eq!(snippets.len(), 2);
            assert_eq!(snippets[0].role, EntryRole::Assistant);
            assert_eq!(snippets[1].content, "email him");
        });
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use colloquy_core::domain::conversation::{Conversation, ConversationId, MessageGroup};
use colloquy_core::domain::usage::TokenUsageRecord;

use super::{ConversationRepository, RepositoryError, TokenUsageRepository};

#[derive(Default)]
struct ConversationTables {
    conversations: HashMap<String, Conversation>,
    groups: HashMap<String, Vec<MessageGroup>>,
}

/// Both tables sit behind one lock so the header and first group land together.
#[derive(Default)]
pub struct InMemoryConversationRepository {
    tables: RwLock<ConversationTables>,
    fail_writes: AtomicBool,
}

impl InMemoryConversationRepository {
    /// Makes every subsequent write fail with `RepositoryError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn conversation_count(&self) -> usize {
        self.tables.read().await.conversations.len()
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn insert_conversation_with_message_group(
        &self,
        conversation: Conversation,
        group: MessageGroup,
    ) -> Result<(), RepositoryError> {
        self.check_writable()?;
        if group.conversation_id != conversation.id {
            return Err(RepositoryError::Conflict(format!(
                "message group {} does not belong to conversation {}",
                group.id.0, conversation.id.0
            )));
        }

        let mut tables = self.tables.write().await;
        if tables.conversations.contains_key(&conversation.id.0) {
            return Err(RepositoryError::Conflict(format!(
                "conversation {} already exists",
                conversation.id.0
            )));
        }

        tables.groups.insert(conversation.id.0.clone(), vec![group]);
        tables.conversations.insert(conversation.id.0.clone(), conversation);
        Ok(())
    }

    async fn insert_message_group(&self, group: MessageGroup) -> Result<(), RepositoryError> {
        self.check_writable()?;

        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&group.conversation_id.0) {
            return Err(RepositoryError::NotFound(format!(
                "conversation {}",
                group.conversation_id.0
            )));
        }

        let groups = tables.groups.entry(group.conversation_id.0.clone()).or_default();
        if groups.iter().any(|existing| existing.id == group.id) {
            return Err(RepositoryError::Conflict(format!(
                "message group {} already exists",
                group.id.0
            )));
        }
        groups.push(group);
        Ok(())
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), RepositoryError> {
        self.check_writable()?;

        let mut tables = self.tables.write().await;
        let conversation = tables
            .conversations
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("conversation {}", id.0)))?;
        conversation.title = Some(title.to_string());
        Ok(())
    }

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.conversations.get(&id.0).cloned())
    }

    async fn list_message_groups(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<MessageGroup>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.groups.get(&id.0).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryTokenUsageRepository {
    records: RwLock<Vec<TokenUsageRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryTokenUsageRepository {
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TokenUsageRepository for InMemoryTokenUsageRepository {
    async fn store(&self, record: TokenUsageRecord) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("writes disabled".to_string()));
        }
        self.records.write().await.push(record);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TokenUsageRecord>, RepositoryError> {
        Ok(self.records.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use colloquy_core::domain::agent::AgentId;
    use colloquy_core::domain::conversation::{Conversation, ConversationId, MessageGroup};
    use colloquy_core::domain::message::{ChatMessage, FinishReason};
    use colloquy_core::domain::usage::{TokenUsageRecord, UsageType};

    use crate::repositories::{
        ConversationRepository, InMemoryConversationRepository, InMemoryTokenUsageRepository,
        RepositoryError, TokenUsageRepository,
    };

    fn conversation(id: &str) -> Conversation {
        Conversation {
            id: ConversationId(id.to_string()),
            agent_id: AgentId("agent-1".to_string()),
            user_id: "user-1".to_string(),
            title: None,
            created_at: Utc::now(),
        }
    }

    fn group(conversation_id: &str, answer: &str) -> MessageGroup {
        MessageGroup::new(
            ConversationId(conversation_id.to_string()),
            AgentId("agent-1".to_string()),
            1,
            vec![ChatMessage::user("question"), ChatMessage::assistant_text(answer)],
            FinishReason::Stop,
        )
    }

    #[tokio::test]
    async fn header_and_groups_are_listed_in_insertion_order() {
        let repo = InMemoryConversationRepository::default();
        let header = conversation("c-1");

        repo.insert_conversation_with_message_group(header.clone(), group("c-1", "first"))
            .await
            .expect("insert header");
        repo.insert_message_group(group("c-1", "second")).await.expect("insert group");
        repo.update_title(&header.id, "Greeting").await.expect("update title");

        let stored = repo.find_conversation(&header.id).await.expect("find").expect("present");
        assert_eq!(stored.title.as_deref(), Some("Greeting"));

        let answers = repo
            .list_message_groups(&header.id)
            .await
            .expect("list groups")
            .iter()
            .filter_map(|group| group.final_message().and_then(ChatMessage::text))
            .collect::<Vec<_>>();
        assert_eq!(answers, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn group_without_header_is_rejected() {
        let repo = InMemoryConversationRepository::default();
        let error = repo.insert_message_group(group("missing", "x")).await.expect_err("no header");
        assert!(matches!(error, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn failing_writes_leave_nothing_behind() {
        let repo = InMemoryConversationRepository::default();
        repo.set_fail_writes(true);

        let error = repo
            .insert_conversation_with_message_group(conversation("c-2"), group("c-2", "x"))
            .await
            .expect_err("writes disabled");

        assert!(matches!(error, RepositoryError::Unavailable(_)));
        assert_eq!(repo.conversation_count().await, 0);
    }

    #[tokio::test]
    async fn token_usage_is_append_only() {
        let repo = InMemoryTokenUsageRepository::default();
        repo.store(TokenUsageRecord::new(12, UsageType::Prompt, "gpt-4o", "openai"))
            .await
            .expect("store prompt");
        repo.store(TokenUsageRecord::new(3, UsageType::Completion, "gpt-4o", "openai"))
            .await
            .expect("store completion");

        let kinds = repo
            .list()
            .await
            .expect("list")
            .iter()
            .map(|record| record.usage_type)
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec![UsageType::Prompt, UsageType::Completion]);
    }
}

use async_trait::async_trait;
use thiserror::Error;

use colloquy_core::domain::conversation::{Conversation, ConversationId, MessageGroup};
use colloquy_core::domain::usage::TokenUsageRecord;
use colloquy_core::errors::ApplicationError;

pub mod conversation;
pub mod memory;
pub mod token_usage;

pub use conversation::SqlConversationRepository;
pub use memory::{InMemoryConversationRepository, InMemoryTokenUsageRepository};
pub use token_usage::SqlTokenUsageRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Persistence(value.to_string())
    }
}

/// Durable projection of conversations. The header and its first group are written together.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn insert_conversation_with_message_group(
        &self,
        conversation: Conversation,
        group: MessageGroup,
    ) -> Result<(), RepositoryError>;

    async fn insert_message_group(&self, group: MessageGroup) -> Result<(), RepositoryError>;

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), RepositoryError>;

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// Groups of a conversation in insertion order.
    async fn list_message_groups(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<MessageGroup>, RepositoryError>;
}

/// Append-only token accounting sink.
#[async_trait]
pub trait TokenUsageRepository: Send + Sync {
    async fn store(&self, record: TokenUsageRecord) -> Result<(), RepositoryError>;
    async fn list(&self) -> Result<Vec<TokenUsageRecord>, RepositoryError>;
}

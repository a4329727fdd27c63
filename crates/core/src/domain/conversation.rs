use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::message::{ChatMessage, FinishReason, Role};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageGroupId(pub String);

impl MessageGroupId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Conversation header row. Only exists once the first turn has been persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub agent_id: AgentId,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The persisted projection of one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageGroup {
    pub id: MessageGroupId,
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub configuration_version: u32,
    pub messages: Vec<ChatMessage>,
    pub finish_reason: FinishReason,
    pub created_at: DateTime<Utc>,
}

impl MessageGroup {
    pub fn new(
        conversation_id: ConversationId,
        agent_id: AgentId,
        configuration_version: u32,
        messages: Vec<ChatMessage>,
        finish_reason: FinishReason,
    ) -> Self {
        Self {
            id: MessageGroupId::generate(),
            conversation_id,
            agent_id,
            configuration_version,
            messages,
            finish_reason,
            created_at: Utc::now(),
        }
    }

    pub fn user_message(&self) -> Option<&ChatMessage> {
        self.messages.first().filter(|message| message.role == Role::User)
    }

    pub fn final_message(&self) -> Option<&ChatMessage> {
        self.messages.last().filter(|message| message.role == Role::Assistant)
    }

    /// A complete group starts with the user and ends with an assistant message that has content.
    pub fn is_complete(&self) -> bool {
        self.user_message().is_some()
            && self.final_message().is_some_and(ChatMessage::has_content)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConversationId, MessageGroup};
    use crate::domain::agent::AgentId;
    use crate::domain::message::{ChatMessage, FinishReason, ToolCallData, ToolCallResult};

    fn group(messages: Vec<ChatMessage>) -> MessageGroup {
        MessageGroup::new(
            ConversationId("c-1".to_string()),
            AgentId("a-1".to_string()),
            3,
            messages,
            FinishReason::Stop,
        )
    }

    #[test]
    fn group_with_tool_round_trip_is_complete() {
        let group = group(vec![
            ChatMessage::user("what time is it?"),
            ChatMessage::assistant(None, vec![ToolCallData::new("t1", "clock", "{}")]),
            ChatMessage::tool(ToolCallResult { id: "t1".to_string(), content: "12:00".to_string() }),
            ChatMessage::assistant_text("It is noon."),
        ]);

        assert!(group.is_complete());
        assert_eq!(group.configuration_version, 3);
    }

    #[test]
    fn group_without_final_content_is_incomplete() {
        let group = group(vec![ChatMessage::user("hi"), ChatMessage::assistant(None, Vec::new())]);
        assert!(!group.is_complete());
    }
}

pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod lifecycle;

pub use chrono;

pub use domain::agent::{AgentConfiguration, AgentDraft, AgentId, AgentRecord, CollectionBinding};
pub use domain::conversation::{Conversation, ConversationId, MessageGroup, MessageGroupId};
pub use domain::identity::Identity;
pub use domain::message::{
    ChatMessage, ContentPart, FinishReason, MessageContent, Role, ToolCallData, ToolCallResult,
};
pub use domain::usage::{TokenUsage, TokenUsageRecord, UsageType};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use events::{ChannelEventSink, EventSink, InMemoryEventSink, NoopEventSink, WorkflowEvent};
pub use lifecycle::{LifecycleEvent, LifecycleTransitionError, WorkflowState};

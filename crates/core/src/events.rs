use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::conversation::{ConversationId, MessageGroupId};
use crate::domain::message::{FinishReason, ToolCallData, ToolCallResult};

/// Everything a workflow reports to its transport. Framing is the transport's concern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    TitleUpdated { conversation_id: ConversationId, title: String },
    StreamChunk { content: String },
    StreamComplete { finish_reason: FinishReason, group_id: Option<MessageGroupId> },
    ToolCall { call: ToolCallData },
    ToolResult { result: ToolCallResult },
    Error { message: String, correlation_id: String },
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TitleUpdated { .. } => "title-updated",
            Self::StreamChunk { .. } => "stream-chunk",
            Self::StreamComplete { .. } => "stream-complete",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Error { .. } => "error",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: WorkflowEvent) {}
}

#[derive(Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<WorkflowEvent>>>,
}

impl InMemoryEventSink {
    pub fn events(&self) -> Vec<WorkflowEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn chunks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                WorkflowEvent::StreamChunk { content } => Some(content),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: WorkflowEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Forwards events to a transport task. A closed receiver drops events silently.
#[derive(Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

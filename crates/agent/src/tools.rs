use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use colloquy_core::domain::conversation::ConversationId;
use colloquy_core::domain::identity::Identity;
use colloquy_core::domain::message::{ToolCallData, ToolCallResult};
use colloquy_core::events::{EventSink, WorkflowEvent};

/// Schema offered to the model. `parameters` is a JSON Schema object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// What a tool may act on behalf of.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCapabilities {
    pub identity: Identity,
    pub conversation_id: Option<ConversationId>,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, capabilities: &ToolCapabilities, arguments: Value) -> Result<String>;
}

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn register<H>(&mut self, definition: ToolDefinition, handler: H)
    where
        H: ToolHandler + 'static,
    {
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool { definition, handler: Arc::new(handler) },
        );
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|tool| &tool.definition)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|tool| tool.handler.clone())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The tools one workflow may call, in the agent's configured order.
pub struct Toolchain {
    tools: Vec<RegisteredTool>,
    capabilities: ToolCapabilities,
    sink: Arc<dyn EventSink>,
}

impl Toolchain {
    pub fn build(
        registry: &ToolRegistry,
        enabled: &[String],
        capabilities: ToolCapabilities,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let mut tools = Vec::with_capacity(enabled.len());
        for name in enabled {
            match registry.tools.get(name) {
                Some(tool) => tools.push(tool.clone()),
                None => warn!(
                    event_name = "agent.tool.not_registered",
                    tool = %name,
                    "enabled tool is missing from the registry"
                ),
            }
        }
        Self { tools, capabilities, sink }
    }

    pub fn list_tool_schemas(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn capabilities(&self) -> &ToolCapabilities {
        &self.capabilities
    }

    pub fn set_conversation_id(&mut self, conversation_id: ConversationId) {
        self.capabilities.conversation_id = Some(conversation_id);
    }

    /// Never fails: unknown tools, bad arguments and handler errors become `error: ...` results.
    pub async fn process_tool_call(&self, call: &ToolCallData) -> ToolCallResult {
        self.sink.emit(WorkflowEvent::ToolCall { call: call.clone() });

        let content = self.invoke(call).await;
        let result = ToolCallResult { id: call.id.clone(), content };

        self.sink.emit(WorkflowEvent::ToolResult { result: result.clone() });
        result
    }

    async fn invoke(&self, call: &ToolCallData) -> String {
        let Some(tool) = self.tools.iter().find(|tool| tool.definition.name == call.name) else {
            warn!(event_name = "agent.tool.unknown", tool = %call.name, "model requested unknown tool");
            return format!("error: unknown tool `{}`", call.name);
        };

        let arguments = match call.arguments_json() {
            Ok(arguments) => arguments,
            Err(error) => {
                return format!("error: invalid arguments for `{}`: {error}", call.name);
            }
        };

        match tool.handler.call(&self.capabilities, arguments).await {
            Ok(output) => {
                debug!(event_name = "agent.tool.completed", tool = %call.name, call_id = %call.id);
                output
            }
            Err(error) => {
                warn!(
                    event_name = "agent.tool.failed",
                    tool = %call.name,
                    call_id = %call.id,
                    error = %error,
                    "tool handler failed"
                );
                format!("error: {error}")
            }
        }
    }
}

//! Conversation orchestration for colloquy.
//!
//! A [`workflow::Workflow`] owns one conversation. Each user message becomes one turn run by
//! the [`agent::WorkflowAgent`]:
//!
//! 1. **Enrichment** (`enrichment`) - retrieve context from the agent's vector collections,
//!    filtered by the caller's groups (`access`), and prepend it to the outgoing prompt.
//! 2. **Completion** (`llm`) - call the completion provider, buffered or streaming.
//! 3. **Tools** (`tools`) - dispatch requested tool calls and feed results back, up to a
//!    bounded number of attempts.
//! 4. **Persistence** - the workflow stores the turn as one message group, creating the
//!    conversation and its title (`title`) on the first turn.
//!
//! Collaborators are passed in through registries and the [`factory::WorkflowFactory`];
//! there is no process-wide state. [`sessions::SessionStore`] keeps live workflows for
//! adapters that address conversations by an external key.

pub mod access;
pub mod agent;
pub mod enrichment;
pub mod factory;
pub mod history;
pub mod llm;
pub mod providers;
pub mod sessions;
pub mod stream;
pub mod testing;
pub mod title;
pub mod tools;
pub mod usage;
pub mod workflow;

pub use agent::{AgentError, AgentParts, AgentSettings, WorkflowAgent};
pub use factory::{FactoryError, FactorySettings, WorkflowFactory};
pub use llm::{LlmClient, LlmRegistry, ProviderError};
pub use providers::{EmbeddingProvider, ProviderRegistry, VectorProvider};
pub use sessions::{SessionPolicy, SessionStore};
pub use stream::{cancel_pair, CancelHandle, CancelSignal, StreamOutcome, TurnOutput};
pub use tools::{ToolDefinition, ToolHandler, ToolRegistry, Toolchain};
pub use workflow::{StreamReport, TurnReport, Workflow, WorkflowError};

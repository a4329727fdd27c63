use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use colloquy_core::domain::conversation::{Conversation, ConversationId, MessageGroup, MessageGroupId};
use colloquy_core::domain::identity::Identity;
use colloquy_core::domain::message::{ChatMessage, FinishReason, MessageContent};
use colloquy_core::domain::usage::TokenUsage;
use colloquy_core::errors::{ApplicationError, DomainError, InterfaceError};
use colloquy_core::events::{EventSink, WorkflowEvent};
use colloquy_core::lifecycle::{
    transition, transition_with_events, LifecycleEvent, LifecycleTransitionError, WorkflowState,
};
use colloquy_db::{ConversationRepository, RepositoryError};

use crate::agent::{AgentError, WorkflowAgent};
use crate::stream::{CancelSignal, StreamOutcome, TurnOutput};
use crate::title::{fallback_title, TitleGenerator};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Persistence(#[from] RepositoryError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleTransitionError),
    #[error("conversation {0} not found")]
    NotFound(String),
}

impl WorkflowError {
    pub fn to_interface(&self, correlation_id: &str) -> InterfaceError {
        let message = self.to_string();
        let correlation_id = correlation_id.to_string();
        match self {
            Self::Agent(_) => InterfaceError::ServiceUnavailable { message, correlation_id },
            Self::NotFound(_) => InterfaceError::BadRequest { message, correlation_id },
            Self::Persistence(_) | Self::Lifecycle(_) => {
                InterfaceError::Internal { message, correlation_id }
            }
        }
    }
}

impl From<WorkflowError> for ApplicationError {
    fn from(value: WorkflowError) -> Self {
        match value {
            WorkflowError::Agent(error) => error.into(),
            WorkflowError::Persistence(error) => error.into(),
            WorkflowError::Lifecycle(error) => ApplicationError::Domain(DomainError::from(error)),
            WorkflowError::NotFound(id) => {
                ApplicationError::Persistence(format!("conversation {id} not found"))
            }
        }
    }
}

/// What a persisted turn left behind.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnReport {
    pub conversation_id: ConversationId,
    pub group_id: MessageGroupId,
    pub finish_reason: FinishReason,
    pub reply: Option<String>,
    pub usage: TokenUsage,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamReport {
    Completed(TurnReport),
    /// `None` when the cancel came before the assistant produced anything.
    Cancelled(Option<TurnReport>),
}

/// One conversation. Turns take `&mut self`, so a workflow runs one turn at a time.
pub struct Workflow {
    agent: WorkflowAgent,
    state: WorkflowState,
    identity: Identity,
    repository: Arc<dyn ConversationRepository>,
    titles: TitleGenerator,
    sink: Arc<dyn EventSink>,
}

impl Workflow {
    pub fn new(
        agent: WorkflowAgent,
        identity: Identity,
        repository: Arc<dyn ConversationRepository>,
        titles: TitleGenerator,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { agent, state: WorkflowState::New, identity, repository, titles, sink }
    }

    /// Rebuilds a persisted conversation, replaying its complete groups into history.
    pub async fn restore(
        mut agent: WorkflowAgent,
        identity: Identity,
        repository: Arc<dyn ConversationRepository>,
        titles: TitleGenerator,
        sink: Arc<dyn EventSink>,
        conversation_id: &ConversationId,
    ) -> Result<Self, WorkflowError> {
        let conversation = repository
            .find_conversation(conversation_id)
            .await?
            .filter(|conversation| conversation.user_id == identity.user_id)
            .ok_or_else(|| WorkflowError::NotFound(conversation_id.0.clone()))?;

        let groups = repository.list_message_groups(conversation_id).await?;
        let mut replayed = 0usize;
        for group in &groups {
            if group.is_complete() {
                agent.remember(group.messages.clone());
                replayed += 1;
            }
        }

        let title = conversation.title.clone().unwrap_or_else(|| {
            let prompt = groups
                .first()
                .and_then(MessageGroup::user_message)
                .and_then(ChatMessage::text)
                .unwrap_or_default();
            fallback_title(&prompt)
        });
        agent.toolchain_mut().set_conversation_id(conversation.id.clone());

        info!(
            event_name = "workflow.restored",
            conversation_id = %conversation.id.0,
            stored_groups = groups.len(),
            replayed_groups = replayed,
            "conversation restored"
        );

        Ok(Self {
            agent,
            state: WorkflowState::Persisted { conversation_id: conversation.id, title },
            identity,
            repository,
            titles,
            sink,
        })
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.state.conversation_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn agent(&self) -> &WorkflowAgent {
        &self.agent
    }

    pub async fn send(
        &mut self,
        content: impl Into<MessageContent>,
    ) -> Result<TurnReport, WorkflowError> {
        let correlation_id = Uuid::new_v4().to_string();
        let user_message = ChatMessage::user(content);

        match self.agent.complete_turn(user_message).await {
            Ok(output) => self.commit(output, &correlation_id).await,
            Err(error) => Err(self.fail(error.into(), &correlation_id)),
        }
    }

    pub async fn send_streaming(
        &mut self,
        content: impl Into<MessageContent>,
        cancel: CancelSignal,
    ) -> Result<StreamReport, WorkflowError> {
        let correlation_id = Uuid::new_v4().to_string();
        let user_message = ChatMessage::user(content);

        match self.agent.stream_turn(user_message, cancel).await {
            StreamOutcome::Completed(output) => {
                self.commit(output, &correlation_id).await.map(StreamReport::Completed)
            }
            StreamOutcome::Cancelled(output) if output.has_assistant_output() => self
                .commit(output, &correlation_id)
                .await
                .map(|report| StreamReport::Cancelled(Some(report))),
            StreamOutcome::Cancelled(_) => {
                info!(
                    event_name = "workflow.turn.cancelled_empty",
                    correlation_id = %correlation_id,
                    "turn cancelled before any output; nothing persisted"
                );
                self.sink.emit(WorkflowEvent::StreamComplete {
                    finish_reason: FinishReason::ManualStop,
                    group_id: None,
                });
                Ok(StreamReport::Cancelled(None))
            }
            StreamOutcome::Failed(error) => Err(self.fail(error.into(), &correlation_id)),
        }
    }

    async fn commit(
        &mut self,
        output: TurnOutput,
        correlation_id: &str,
    ) -> Result<TurnReport, WorkflowError> {
        let configuration = self.agent.configuration().clone();
        let conversation_id =
            self.state.conversation_id().cloned().unwrap_or_else(ConversationId::generate);
        let group = MessageGroup::new(
            conversation_id.clone(),
            configuration.agent_id.clone(),
            configuration.version,
            output.messages.clone(),
            output.finish_reason.clone(),
        );
        let group_id = group.id.clone();
        let complete = group.is_complete();
        let reply = output.final_text();

        match &self.state {
            WorkflowState::New => {
                let conversation = Conversation {
                    id: conversation_id.clone(),
                    agent_id: configuration.agent_id.clone(),
                    user_id: self.identity.user_id.clone(),
                    title: None,
                    created_at: group.created_at,
                };
                if let Err(error) =
                    self.repository.insert_conversation_with_message_group(conversation, group).await
                {
                    return Err(self.fail(error.into(), correlation_id));
                }

                let prompt = output.messages.first().and_then(ChatMessage::text).unwrap_or_default();
                let title = self.titles.generate(&prompt, reply.as_deref().unwrap_or_default()).await;
                if let Err(error) = self.repository.update_title(&conversation_id, &title).await {
                    warn!(
                        event_name = "workflow.title.persist_failed",
                        conversation_id = %conversation_id.0,
                        error = %error,
                        "conversation title not stored"
                    );
                }

                let event = LifecycleEvent::FirstTurnPersisted {
                    conversation_id: conversation_id.clone(),
                    title,
                };
                let outcome = match transition_with_events(&self.state, &event, self.sink.as_ref()) {
                    Ok(outcome) => outcome,
                    Err(error) => return Err(self.fail(error.into(), correlation_id)),
                };
                self.state = outcome.to;
                self.agent.toolchain_mut().set_conversation_id(conversation_id.clone());

                info!(
                    event_name = "workflow.lifecycle.persisted",
                    conversation_id = %conversation_id.0,
                    agent_id = %configuration.agent_id.0,
                    version = configuration.version,
                    "conversation persisted"
                );
            }
            WorkflowState::Persisted { .. } => {
                if let Err(error) = self.repository.insert_message_group(group).await {
                    return Err(self.fail(error.into(), correlation_id));
                }
                if let Err(error) = transition(&self.state, &LifecycleEvent::TurnPersisted) {
                    return Err(self.fail(error.into(), correlation_id));
                }
            }
        }

        if complete {
            self.agent.remember(output.messages);
        }

        self.sink.emit(WorkflowEvent::StreamComplete {
            finish_reason: output.finish_reason.clone(),
            group_id: Some(group_id.clone()),
        });

        Ok(TurnReport {
            conversation_id,
            group_id,
            finish_reason: output.finish_reason,
            reply,
            usage: output.usage,
        })
    }

    /// Logs the failure and emits the single terminal error event for the turn.
    fn fail(&self, error: WorkflowError, correlation_id: &str) -> WorkflowError {
        let interface = error.to_interface(correlation_id);
        error!(
            event_name = "workflow.turn.failed",
            correlation_id = %correlation_id,
            conversation_id = self.state.conversation_id().map(|id| id.0.as_str()).unwrap_or("-"),
            error = %error,
            "turn failed"
        );
        self.sink.emit(WorkflowEvent::Error {
            message: interface.user_message().to_string(),
            correlation_id: correlation_id.to_string(),
        });
        error
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use colloquy_core::domain::agent::{AgentDraft, AgentId, AgentRecord};
    use colloquy_core::domain::conversation::ConversationId;
    use colloquy_core::domain::identity::Identity;
    use colloquy_core::domain::message::{FinishReason, Role};
    use colloquy_core::events::{InMemoryEventSink, WorkflowEvent};
    use colloquy_core::lifecycle::WorkflowState;
    use colloquy_db::{ConversationRepository, InMemoryConversationRepository};

    use super::{StreamReport, Workflow, WorkflowError};
    use crate::agent::{AgentParts, AgentSettings, WorkflowAgent};
    use crate::enrichment::ContextEnrichment;
    use crate::history::MessageBasedHistory;
    use crate::llm::{ProviderError, StreamChunk};
    use crate::providers::ProviderRegistry;
    use crate::stream::{cancel_pair, CancelSignal};
    use crate::testing::{text_response, ScriptedLlm};
    use crate::title::TitleGenerator;
    use crate::tools::{ToolCapabilities, ToolRegistry, Toolchain};
    use crate::usage::UsageRecorder;

    struct Harness {
        llm: Arc<ScriptedLlm>,
        titles: Arc<ScriptedLlm>,
        repository: Arc<InMemoryConversationRepository>,
        sink: Arc<InMemoryEventSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                llm: Arc::new(ScriptedLlm::new("scripted")),
                titles: Arc::new(ScriptedLlm::new("titles")),
                repository: Arc::new(InMemoryConversationRepository::default()),
                sink: Arc::new(InMemoryEventSink::default()),
            }
        }

        fn agent(&self) -> WorkflowAgent {
            let configuration = AgentRecord::create(
                AgentId("agent-7".to_string()),
                AgentDraft::new("helper", "scripted", "gpt-4o"),
            )
            .active();
            let identity = Identity::new("u-1");
            WorkflowAgent::new(AgentParts {
                configuration,
                client: self.llm.clone(),
                history: Box::new(MessageBasedHistory::new(50)),
                enrichment: ContextEnrichment::new(
                    Vec::new(),
                    ProviderRegistry::default(),
                    identity.clone(),
                    UsageRecorder::disabled(),
                ),
                toolchain: Toolchain::build(
                    &ToolRegistry::default(),
                    &[],
                    ToolCapabilities { identity, conversation_id: None },
                    self.sink.clone(),
                ),
                usage: UsageRecorder::disabled(),
                sink: self.sink.clone(),
                settings: AgentSettings::default(),
            })
        }

        fn title_generator(&self) -> TitleGenerator {
            TitleGenerator::new(
                self.titles.clone(),
                "gpt-4o-mini",
                32,
                UsageRecorder::disabled(),
                Duration::from_secs(5),
            )
        }

        fn workflow(&self) -> Workflow {
            Workflow::new(
                self.agent(),
                Identity::new("u-1"),
                self.repository.clone(),
                self.title_generator(),
                self.sink.clone(),
            )
        }
    }

    #[tokio::test]
    async fn first_turn_persists_conversation_and_title() {
        let harness = Harness::new();
        harness.llm.push_response(text_response("TCP is a transport protocol"));
        harness.titles.push_response(text_response("Understanding the TCP protocol"));
        let mut workflow = harness.workflow();

        let report = workflow.send("What is TCP?").await.expect("first turn");

        assert_eq!(
            workflow.state(),
            &WorkflowState::Persisted {
                conversation_id: report.conversation_id.clone(),
                title: "Understanding the TCP protocol".to_string(),
            }
        );
        let stored = harness
            .repository
            .find_conversation(&report.conversation_id)
            .await
            .expect("lookup")
            .expect("conversation stored");
        assert_eq!(stored.title.as_deref(), Some("Understanding the TCP protocol"));
        assert_eq!(stored.user_id, "u-1");

        let groups =
            harness.repository.list_message_groups(&report.conversation_id).await.expect("groups");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].configuration_version, 1);
        assert_eq!(groups[0].id, report.group_id);

        let kinds = harness.sink.events().iter().map(WorkflowEvent::event_type).collect::<Vec<_>>();
        assert_eq!(kinds, vec!["title-updated", "stream-complete"]);
        assert_eq!(workflow.agent().history().len(), 2);
    }

    #[tokio::test]
    async fn later_turns_only_append_groups() {
        let harness = Harness::new();
        harness.llm.push_response(text_response("Hi."));
        harness.llm.push_response(text_response("Still here."));
        harness.titles.push_response(text_response("Greetings"));
        let mut workflow = harness.workflow();

        let first = workflow.send("hello").await.expect("first turn");
        let second = workflow.send("are you there?").await.expect("second turn");

        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(harness.titles.requests().len(), 1);
        assert_eq!(harness.repository.conversation_count().await, 1);
        let groups =
            harness.repository.list_message_groups(&first.conversation_id).await.expect("groups");
        assert_eq!(groups.len(), 2);

        let second_request = &harness.llm.requests()[1];
        let roles = second_request.messages.iter().map(|message| message.role).collect::<Vec<_>>();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
    }

    #[tokio::test]
    async fn provider_failure_leaves_nothing_behind() {
        let harness = Harness::new();
        harness.llm.push_error(ProviderError::Request("upstream 503".to_string()));
        harness.llm.push_response(text_response("Back online."));
        harness.titles.push_response(text_response("Recovery"));
        let mut workflow = harness.workflow();

        let error = workflow.send("hello").await.expect_err("provider failure");

        assert!(matches!(error, WorkflowError::Agent(_)));
        assert_eq!(workflow.state(), &WorkflowState::New);
        assert_eq!(harness.repository.conversation_count().await, 0);
        assert!(workflow.agent().history().is_empty());
        let events = harness.sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            WorkflowEvent::Error { message, .. }
                if message == "The assistant is temporarily unavailable. Please retry shortly."
        ));

        workflow.send("hello again").await.expect("conversation stays usable");
        assert!(workflow.state().is_persisted());
    }

    #[tokio::test]
    async fn persistence_failure_keeps_state_and_history() {
        let harness = Harness::new();
        harness.llm.push_response(text_response("Hi."));
        harness.repository.set_fail_writes(true);
        let mut workflow = harness.workflow();

        let error = workflow.send("hello").await.expect_err("write failure");

        assert!(matches!(error, WorkflowError::Persistence(_)));
        assert_eq!(workflow.state(), &WorkflowState::New);
        assert!(workflow.agent().history().is_empty());
        assert!(harness.titles.requests().is_empty());
        let kinds = harness.sink.events().iter().map(WorkflowEvent::event_type).collect::<Vec<_>>();
        assert_eq!(kinds, vec!["error"]);
    }

    #[tokio::test]
    async fn cancelled_stream_persists_partial_reply() {
        let harness = Harness::new();
        harness.llm.push_hanging_stream(vec![Ok(StreamChunk::text("Hel"))]);
        harness.titles.push_response(text_response("Greeting"));
        let mut workflow = harness.workflow();
        let (handle, signal) = cancel_pair();
        let sink = harness.sink.clone();

        let turn = workflow.send_streaming("hello", signal);
        let cancel_after_first_chunk = async {
            while sink.chunks().is_empty() {
                tokio::task::yield_now().await;
            }
            handle.cancel();
        };
        let (report, ()) = tokio::join!(turn, cancel_after_first_chunk);

        let report = match report {
            Ok(StreamReport::Cancelled(Some(report))) => report,
            other => panic!("expected a persisted cancellation, got {other:?}"),
        };
        let groups =
            harness.repository.list_message_groups(&report.conversation_id).await.expect("groups");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].finish_reason, FinishReason::ManualStop);
        assert_eq!(groups[0].messages[1].role, Role::Assistant);
        assert_eq!(groups[0].messages[1].text().as_deref(), Some("Hel"));
        assert!(workflow.state().is_persisted());
        assert!(matches!(
            harness.sink.events().last(),
            Some(WorkflowEvent::StreamComplete { finish_reason: FinishReason::ManualStop, group_id: Some(_) })
        ));
    }

    #[tokio::test]
    async fn cancel_before_output_persists_nothing() {
        let harness = Harness::new();
        let mut workflow = harness.workflow();
        let (handle, signal) = cancel_pair();
        handle.cancel();

        let report = workflow.send_streaming("hello", signal).await.expect("cancel is not an error");

        assert_eq!(report, StreamReport::Cancelled(None));
        assert_eq!(harness.repository.conversation_count().await, 0);
        assert!(harness.llm.requests().is_empty());
        assert_eq!(
            harness.sink.events(),
            vec![WorkflowEvent::StreamComplete { finish_reason: FinishReason::ManualStop, group_id: None }]
        );
    }

    #[tokio::test]
    async fn streamed_turn_completes_and_persists() {
        let harness = Harness::new();
        harness.llm.push_stream(vec![
            Ok(StreamChunk::text("Hello ")),
            Ok(StreamChunk::text("there.")),
            Ok(StreamChunk::finish(FinishReason::Stop)),
        ]);
        harness.titles.push_response(text_response("Greeting"));
        let mut workflow = harness.workflow();

        let report =
            workflow.send_streaming("hi", CancelSignal::never()).await.expect("streamed turn");

        let report = match report {
            StreamReport::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(report.reply.as_deref(), Some("Hello there."));
        assert_eq!(harness.sink.chunks(), vec!["Hello ".to_string(), "there.".to_string()]);
    }

    #[tokio::test]
    async fn restore_replays_complete_groups() {
        let harness = Harness::new();
        harness.llm.push_response(text_response("Hi."));
        harness.llm.push_response(text_response("Welcome back."));
        harness.titles.push_response(text_response("Greeting"));
        let mut original = harness.workflow();
        let first = original.send("hello").await.expect("first turn");

        let mut restored = Workflow::restore(
            harness.agent(),
            Identity::new("u-1"),
            harness.repository.clone(),
            harness.title_generator(),
            harness.sink.clone(),
            &first.conversation_id,
        )
        .await
        .expect("restore");

        assert_eq!(restored.state().title(), Some("Greeting"));
        assert_eq!(restored.agent().history().len(), 2);
        restored.send("I'm back").await.expect("turn after restore");
        assert_eq!(harness.titles.requests().len(), 1);
    }

    #[tokio::test]
    async fn restore_hides_other_users_conversations() {
        let harness = Harness::new();
        harness.llm.push_response(text_response("Hi."));
        harness.titles.push_response(text_response("Greeting"));
        let first = harness.workflow().send("hello").await.expect("first turn");

        let missing = ConversationId("nope".to_string());
        for (user, id) in [("u-2", &first.conversation_id), ("u-1", &missing)] {
            let outcome = Workflow::restore(
                harness.agent(),
                Identity::new(user),
                harness.repository.clone(),
                harness.title_generator(),
                harness.sink.clone(),
                id,
            )
            .await;
            assert!(matches!(outcome, Err(WorkflowError::NotFound(_))));
        }
    }
}

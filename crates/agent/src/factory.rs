use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use colloquy_core::config::AppConfig;
use colloquy_core::domain::agent::AgentConfiguration;
use colloquy_core::domain::conversation::ConversationId;
use colloquy_core::domain::identity::Identity;
use colloquy_core::errors::ApplicationError;
use colloquy_core::events::EventSink;
use colloquy_db::ConversationRepository;

use crate::agent::{AgentParts, AgentSettings, WorkflowAgent};
use crate::enrichment::ContextEnrichment;
use crate::history::{history_for_model, TokenizerRegistry};
use crate::llm::{LlmClient, LlmRegistry};
use crate::providers::ProviderRegistry;
use crate::title::TitleGenerator;
use crate::tools::{ToolCapabilities, ToolRegistry, Toolchain};
use crate::usage::UsageRecorder;
use crate::workflow::{Workflow, WorkflowError};

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("no completion provider `{provider}` serves model `{model}`")]
    NoProviderForModel { provider: String, model: String },
    #[error(transparent)]
    Restore(#[from] WorkflowError),
}

impl From<FactoryError> for ApplicationError {
    fn from(value: FactoryError) -> Self {
        match value {
            FactoryError::NoProviderForModel { .. } => {
                ApplicationError::Configuration(value.to_string())
            }
            FactoryError::Restore(error) => error.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FactorySettings {
    pub agent: AgentSettings,
    pub history_max_messages: usize,
    pub history_max_tokens: usize,
    /// Model for title calls; the agent's own model when unset.
    pub title_model: Option<String>,
    pub title_max_tokens: u32,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            agent: AgentSettings::default(),
            history_max_messages: 40,
            history_max_tokens: 8192,
            title_model: None,
            title_max_tokens: 32,
        }
    }
}

impl From<&AppConfig> for FactorySettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            agent: AgentSettings::from(config),
            history_max_messages: config.agent.history_max_messages,
            history_max_tokens: config.agent.history_max_tokens,
            title_model: config.agent.title_model.clone(),
            title_max_tokens: config.agent.title_max_tokens,
        }
    }
}

/// Assembles workflows from a stored agent configuration and the caller's identity.
/// Every collaborator is injected here; nothing is looked up globally.
pub struct WorkflowFactory {
    llms: LlmRegistry,
    providers: ProviderRegistry,
    tools: ToolRegistry,
    tokenizers: TokenizerRegistry,
    repository: Arc<dyn ConversationRepository>,
    usage: UsageRecorder,
    settings: FactorySettings,
}

impl WorkflowFactory {
    pub fn new(
        llms: LlmRegistry,
        providers: ProviderRegistry,
        tools: ToolRegistry,
        repository: Arc<dyn ConversationRepository>,
        usage: UsageRecorder,
        settings: FactorySettings,
    ) -> Self {
        Self {
            llms,
            providers,
            tools,
            tokenizers: TokenizerRegistry::default(),
            repository,
            usage,
            settings,
        }
    }

    pub fn with_tokenizers(mut self, tokenizers: TokenizerRegistry) -> Self {
        self.tokenizers = tokenizers;
        self
    }

    pub fn settings(&self) -> &FactorySettings {
        &self.settings
    }

    pub fn create(
        &self,
        configuration: Arc<AgentConfiguration>,
        identity: Identity,
        sink: Arc<dyn EventSink>,
    ) -> Result<Workflow, FactoryError> {
        let (agent, titles) = self.assemble(configuration.clone(), &identity, sink.clone())?;
        info!(
            event_name = "workflow.created",
            agent_id = %configuration.agent_id.0,
            version = configuration.version,
            user_id = %identity.user_id,
            "workflow created"
        );
        Ok(Workflow::new(agent, identity, self.repository.clone(), titles, sink))
    }

    pub async fn restore(
        &self,
        configuration: Arc<AgentConfiguration>,
        identity: Identity,
        sink: Arc<dyn EventSink>,
        conversation_id: &ConversationId,
    ) -> Result<Workflow, FactoryError> {
        let (agent, titles) = self.assemble(configuration, &identity, sink.clone())?;
        let workflow = Workflow::restore(
            agent,
            identity,
            self.repository.clone(),
            titles,
            sink,
            conversation_id,
        )
        .await?;
        Ok(workflow)
    }

    fn assemble(
        &self,
        configuration: Arc<AgentConfiguration>,
        identity: &Identity,
        sink: Arc<dyn EventSink>,
    ) -> Result<(WorkflowAgent, TitleGenerator), FactoryError> {
        let client = self.llms.resolve(&configuration.provider, &configuration.model).ok_or_else(
            || FactoryError::NoProviderForModel {
                provider: configuration.provider.clone(),
                model: configuration.model.clone(),
            },
        )?;

        let history = history_for_model(
            &self.tokenizers,
            &configuration.model,
            self.settings.history_max_tokens,
            self.settings.history_max_messages,
        );
        let enrichment = ContextEnrichment::new(
            configuration.collections.clone(),
            self.providers.clone(),
            identity.clone(),
            self.usage.clone(),
        );
        let toolchain = Toolchain::build(
            &self.tools,
            &configuration.tools,
            ToolCapabilities { identity: identity.clone(), conversation_id: None },
            sink.clone(),
        );
        let titles = self.title_generator(&configuration, client.clone());

        let agent = WorkflowAgent::new(AgentParts {
            configuration,
            client,
            history,
            enrichment,
            toolchain,
            usage: self.usage.clone(),
            sink,
            settings: self.settings.agent,
        });
        Ok((agent, titles))
    }

    fn title_generator(
        &self,
        configuration: &AgentConfiguration,
        agent_client: Arc<dyn LlmClient>,
    ) -> TitleGenerator {
        let model = self.settings.title_model.clone().unwrap_or_else(|| configuration.model.clone());
        let client = match self
            .llms
            .resolve(&configuration.provider, &model)
            .or_else(|| self.llms.serving(&model))
        {
            Some(client) => client,
            None => {
                debug!(
                    event_name = "workflow.title.client_fallback",
                    title_model = %model,
                    "no client claims the title model; using the agent's client"
                );
                agent_client
            }
        };
        TitleGenerator::new(
            client,
            model,
            self.settings.title_max_tokens,
            self.usage.clone(),
            self.settings.agent.request_timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use colloquy_core::config::AppConfig;
    use colloquy_core::domain::agent::{AgentDraft, AgentId, AgentRecord};
    use colloquy_core::domain::identity::Identity;
    use colloquy_core::events::InMemoryEventSink;
    use colloquy_db::InMemoryConversationRepository;

    use super::{FactoryError, FactorySettings, WorkflowFactory};
    use crate::llm::LlmRegistry;
    use crate::providers::ProviderRegistry;
    use crate::testing::{text_response, ScriptedLlm};
    use crate::tools::ToolRegistry;
    use crate::usage::UsageRecorder;

    fn factory(llms: LlmRegistry, settings: FactorySettings) -> WorkflowFactory {
        WorkflowFactory::new(
            llms,
            ProviderRegistry::default(),
            ToolRegistry::default(),
            Arc::new(InMemoryConversationRepository::default()),
            UsageRecorder::disabled(),
            settings,
        )
    }

    #[test]
    fn settings_follow_app_config() {
        let mut config = AppConfig::default();
        config.agent.max_tool_attempts = 2;
        config.agent.title_model = Some("gpt-4o-mini".to_string());
        config.llm.timeout_secs = 15;

        let settings = FactorySettings::from(&config);

        assert_eq!(settings.agent.max_tool_attempts, 2);
        assert_eq!(settings.agent.request_timeout.as_secs(), 15);
        assert_eq!(settings.title_model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut llms = LlmRegistry::default();
        llms.register(Arc::new(ScriptedLlm::new("openai").with_models(&["gpt-4o"])));
        let configuration = AgentRecord::create(
            AgentId("a-1".to_string()),
            AgentDraft::new("helper", "anthropic", "claude-x"),
        )
        .active();

        let outcome = factory(llms, FactorySettings::default()).create(
            configuration,
            Identity::new("u-1"),
            Arc::new(InMemoryEventSink::default()),
        );

        assert!(matches!(
            outcome,
            Err(FactoryError::NoProviderForModel { ref provider, ref model })
                if provider == "anthropic" && model == "claude-x"
        ));
    }

    #[test]
    fn model_served_by_another_provider_is_rejected() {
        let mut llms = LlmRegistry::default();
        llms.register(Arc::new(ScriptedLlm::new("openai").with_models(&["gpt-4o"])));
        llms.register(Arc::new(ScriptedLlm::new("ollama").with_models(&["llama3.1"])));
        let configuration = AgentRecord::create(
            AgentId("a-1".to_string()),
            AgentDraft::new("helper", "openai", "llama3.1"),
        )
        .active();

        let outcome = factory(llms, FactorySettings::default()).create(
            configuration,
            Identity::new("u-1"),
            Arc::new(InMemoryEventSink::default()),
        );

        assert!(matches!(
            outcome,
            Err(FactoryError::NoProviderForModel { ref provider, ref model })
                if provider == "openai" && model == "llama3.1"
        ));
    }

    #[tokio::test]
    async fn title_model_uses_its_own_client_when_registered() {
        let chat = Arc::new(ScriptedLlm::new("openai").with_models(&["gpt-4o"]));
        let titles = Arc::new(ScriptedLlm::new("titles").with_models(&["gpt-4o-mini"]));
        chat.push_response(text_response("TCP is a transport protocol"));
        titles.push_response(text_response("About TCP"));
        let mut llms = LlmRegistry::default();
        llms.register(chat.clone());
        llms.register(titles.clone());
        let settings =
            FactorySettings { title_model: Some("gpt-4o-mini".to_string()), ..FactorySettings::default() };
        let configuration = AgentRecord::create(
            AgentId("a-1".to_string()),
            AgentDraft::new("helper", "openai", "gpt-4o"),
        )
        .active();

        let mut workflow = factory(llms, settings)
            .create(configuration, Identity::new("u-1"), Arc::new(InMemoryEventSink::default()))
            .expect("workflow");
        workflow.send("What is TCP?").await.expect("turn");

        assert_eq!(workflow.state().title(), Some("About TCP"));
        assert_eq!(chat.requests().len(), 1);
        assert_eq!(titles.requests()[0].model, "gpt-4o-mini");
    }
}

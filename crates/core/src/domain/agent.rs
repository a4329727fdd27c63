use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

/// One vector collection queried during context enrichment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionBinding {
    pub name: String,
    pub vector_provider: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub amount: u32,
    pub max_distance: f32,
    pub instruction: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Immutable snapshot of an agent's settings. Edits produce a new version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfiguration {
    pub agent_id: AgentId,
    pub version: u32,
    pub name: String,
    pub system_prompt: String,
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub collections: Vec<CollectionBinding>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Mutable fields of a configuration, handed to `AgentRecord::revise`.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentDraft {
    pub name: String,
    pub system_prompt: String,
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub collections: Vec<CollectionBinding>,
    pub tools: Vec<String>,
}

impl AgentDraft {
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: String::new(),
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            collections: Vec::new(),
            tools: Vec::new(),
        }
    }

    fn into_configuration(self, agent_id: AgentId, version: u32) -> AgentConfiguration {
        AgentConfiguration {
            agent_id,
            version,
            name: self.name,
            system_prompt: self.system_prompt,
            provider: self.provider,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            collections: self.collections,
            tools: self.tools,
            created_at: Utc::now(),
        }
    }
}

impl From<&AgentConfiguration> for AgentDraft {
    fn from(value: &AgentConfiguration) -> Self {
        Self {
            name: value.name.clone(),
            system_prompt: value.system_prompt.clone(),
            provider: value.provider.clone(),
            model: value.model.clone(),
            temperature: value.temperature,
            max_tokens: value.max_tokens,
            collections: value.collections.clone(),
            tools: value.tools.clone(),
        }
    }
}

/// All configuration versions of one agent plus the pointer to the active one.
#[derive(Clone, Debug)]
pub struct AgentRecord {
    id: AgentId,
    versions: Vec<Arc<AgentConfiguration>>,
    active: Arc<AgentConfiguration>,
}

impl AgentRecord {
    pub fn create(id: AgentId, draft: AgentDraft) -> Self {
        let first = Arc::new(draft.into_configuration(id.clone(), 1));
        Self { id, versions: vec![first.clone()], active: first }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn active(&self) -> Arc<AgentConfiguration> {
        self.active.clone()
    }

    pub fn version(&self, version: u32) -> Option<Arc<AgentConfiguration>> {
        self.versions.iter().find(|config| config.version == version).cloned()
    }

    pub fn latest_version(&self) -> u32 {
        self.versions.last().map(|config| config.version).unwrap_or(0)
    }

    /// Appends a new version built from the active one and makes it active.
    pub fn revise(&mut self, edit: impl FnOnce(&mut AgentDraft)) -> Arc<AgentConfiguration> {
        let mut draft = AgentDraft::from(self.active.as_ref());
        edit(&mut draft);

        let version = self.latest_version() + 1;
        let next = Arc::new(draft.into_configuration(self.id.clone(), version));
        self.versions.push(next.clone());
        self.active = next.clone();
        next
    }

    pub fn activate(&mut self, version: u32) -> Result<Arc<AgentConfiguration>, DomainError> {
        let config = self.version(version).ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "agent {} has no configuration version {version}",
                self.id.0
            ))
        })?;
        self.active = config.clone();
        Ok(config)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    Prompt,
    Completion,
    Embedding,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Completion => "completion",
            Self::Embedding => "embedding",
        }
    }
}

impl std::str::FromStr for UsageType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "prompt" => Ok(Self::Prompt),
            "completion" => Ok(Self::Completion),
            "embedding" => Ok(Self::Embedding),
            other => Err(DomainError::InvariantViolation(format!("unknown usage type `{other}`"))),
        }
    }
}

/// Token counts reported by a completion provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub amount: u64,
    pub usage_type: UsageType,
    pub model: String,
    pub provider: String,
    pub recorded_at: DateTime<Utc>,
}

impl TokenUsageRecord {
    pub fn new(
        amount: u64,
        usage_type: UsageType,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            usage_type,
            model: model.into(),
            provider: provider.into(),
            recorded_at: Utc::now(),
        }
    }
}

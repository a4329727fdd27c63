use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use colloquy_core::domain::message::ChatMessage;

use crate::llm::{CompletionParams, CompletionRequest, LlmClient};
use crate::usage::UsageRecorder;

pub const MAX_TITLE_CHARS: usize = 80;
pub const FALLBACK_TITLE: &str = "New conversation";

const TITLE_INSTRUCTION: &str = "Write a short title for this conversation as a single sentence \
of at most eight words. Reply with the title only, without quotes.";

/// Produces conversation titles with a dedicated short completion call.
pub struct TitleGenerator {
    client: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u32,
    usage: UsageRecorder,
    timeout: Duration,
}

impl TitleGenerator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
        max_tokens: u32,
        usage: UsageRecorder,
        timeout: Duration,
    ) -> Self {
        Self { client, model: model.into(), max_tokens, usage, timeout }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Always yields a title; provider failures fall back to one derived from the prompt.
    pub async fn generate(&self, prompt: &str, response: &str) -> String {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(TITLE_INSTRUCTION),
                ChatMessage::user(format!("User: {prompt}\nAssistant: {response}")),
            ],
            tools: Vec::new(),
            params: CompletionParams { temperature: Some(0.2), max_tokens: Some(self.max_tokens) },
        };

        let outcome = tokio::time::timeout(self.timeout, self.client.chat_completion(request)).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                warn!(
                    event_name = "agent.title.failed",
                    model = %self.model,
                    error = %error,
                    "title generation failed; deriving from prompt"
                );
                return fallback_title(prompt);
            }
            Err(_) => {
                warn!(
                    event_name = "agent.title.timed_out",
                    model = %self.model,
                    timeout_secs = self.timeout.as_secs(),
                    "title generation timed out; deriving from prompt"
                );
                return fallback_title(prompt);
            }
        };

        if let Some(usage) = response.usage {
            self.usage.record_completion(usage, &self.model, self.client.name());
        }

        let generated = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.text())
            .and_then(|text| clean_title(&text));

        match generated {
            Some(title) => {
                debug!(event_name = "agent.title.generated", chars = title.chars().count());
                title
            }
            None => fallback_title(prompt),
        }
    }
}

/// First non-blank prompt line, truncated; `New conversation` when there is none.
pub fn fallback_title(prompt: &str) -> String {
    clean_title(prompt).unwrap_or_else(|| FALLBACK_TITLE.to_string())
}

fn clean_title(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let line = line.trim_matches(|c: char| c == '"' || c == '\'' || c == '`').trim();
    let line = line.strip_prefix("Title:").map(str::trim).unwrap_or(line);
    if line.is_empty() {
        return None;
    }
    Some(truncate_chars(line, MAX_TITLE_CHARS))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].trim_end().to_string(),
        None => text.to_string(),
    }
}

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use colloquy_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

use crate::commands::CommandResult;

struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

impl Field {
    fn new(key: &'static str, value: impl Into<String>, env_keys: &'static [&'static str]) -> Self {
        Self { key, value: value.into(), env_keys }
    }
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let path = detect_config_path();
    let document = path.as_deref().and_then(load_config_document);
    CommandResult::text(render(&config, path.as_deref(), document.as_ref()))
}

/// One line per effective value, tagged with the layer it came from.
pub fn render(config: &AppConfig, file_path: Option<&Path>, document: Option<&Value>) -> String {
    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    for field in fields(config) {
        let source = field_source(&field, document, file_path);
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let optional = |value: Option<String>| value.unwrap_or_else(|| "<unset>".to_string());

    vec![
        Field::new("database.url", config.database.url.as_str(), &["COLLOQUY_DATABASE_URL"]),
        Field::new(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["COLLOQUY_DATABASE_MAX_CONNECTIONS"],
        ),
        Field::new(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["COLLOQUY_DATABASE_TIMEOUT_SECS"],
        ),
        Field::new(
            "llm.provider",
            format!("{:?}", config.llm.provider),
            &["COLLOQUY_LLM_PROVIDER"],
        ),
        Field::new("llm.model", config.llm.model.as_str(), &["COLLOQUY_LLM_MODEL"]),
        Field::new("llm.base_url", optional(config.llm.base_url.clone()), &["COLLOQUY_LLM_BASE_URL"]),
        Field::new(
            "llm.api_key",
            config.llm.api_key.as_ref().map(redact_secret).unwrap_or_else(|| "<unset>".to_string()),
            &["COLLOQUY_LLM_API_KEY"],
        ),
        Field::new(
            "llm.timeout_secs",
            config.llm.timeout_secs.to_string(),
            &["COLLOQUY_LLM_TIMEOUT_SECS"],
        ),
        Field::new(
            "agent.max_tool_attempts",
            config.agent.max_tool_attempts.to_string(),
            &["COLLOQUY_AGENT_MAX_TOOL_ATTEMPTS"],
        ),
        Field::new(
            "agent.history_max_messages",
            config.agent.history_max_messages.to_string(),
            &["COLLOQUY_AGENT_HISTORY_MAX_MESSAGES"],
        ),
        Field::new(
            "agent.history_max_tokens",
            config.agent.history_max_tokens.to_string(),
            &["COLLOQUY_AGENT_HISTORY_MAX_TOKENS"],
        ),
        Field::new(
            "agent.title_model",
            optional(config.agent.title_model.clone()),
            &["COLLOQUY_AGENT_TITLE_MODEL"],
        ),
        Field::new("agent.title_max_tokens", config.agent.title_max_tokens.to_string(), &[]),
        Field::new(
            "sessions.idle_ttl_secs",
            optional(config.sessions.idle_ttl_secs.map(|secs| secs.to_string())),
            &["COLLOQUY_SESSIONS_IDLE_TTL_SECS"],
        ),
        Field::new(
            "sessions.max_entries",
            optional(config.sessions.max_entries.map(|entries| entries.to_string())),
            &["COLLOQUY_SESSIONS_MAX_ENTRIES"],
        ),
        Field::new(
            "logging.level",
            config.logging.level.as_str(),
            &["COLLOQUY_LOGGING_LEVEL", "COLLOQUY_LOG_LEVEL"],
        ),
        Field::new(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["COLLOQUY_LOGGING_FORMAT", "COLLOQUY_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("colloquy.toml"), PathBuf::from("config/colloquy.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_document(path: &Path) -> Option<Value> {
    fs::read_to_string(path).ok()?.parse::<Value>().ok()
}

fn field_source(field: &Field, document: Option<&Value>, file_path: Option<&Path>) -> String {
    if let Some(env_key) = field.env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if document.is_some_and(|document| contains_path(document, field.key)) {
        let file_path = file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Keeps a recognisable key prefix such as `sk-`; everything else is hidden.
fn redact_secret(secret: &SecretString) -> String {
    let trimmed = secret.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.split_once('-') {
        Some((prefix, _)) if prefix.len() <= 4 => format!("{prefix}-***"),
        _ => "<redacted>".to_string(),
    }
}

//! Bounded conversation memory.
//!
//! Both strategies store whole turns (user message through final assistant message) and evict
//! from the front one turn at a time, so the retained list always starts with a user message.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::warn;

use colloquy_core::domain::message::{ChatMessage, Role};

/// Counts tokens exactly as the target model does.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Tokenizers keyed by the model name they match.
#[derive(Clone, Default)]
pub struct TokenizerRegistry {
    by_model: HashMap<String, Arc<dyn Tokenizer>>,
}

impl TokenizerRegistry {
    pub fn register(&mut self, model: impl Into<String>, tokenizer: Arc<dyn Tokenizer>) {
        self.by_model.insert(model.into(), tokenizer);
    }

    pub fn for_model(&self, model: &str) -> Option<Arc<dyn Tokenizer>> {
        self.by_model.get(model).cloned()
    }
}

pub trait ChatHistory: Send + Sync {
    /// Appends one complete turn.
    ///
    /// # Panics
    ///
    /// Panics when the turn does not start with a user message and end with an assistant message.
    fn add(&mut self, turn: Vec<ChatMessage>);

    /// Owned copies of the retained messages in insertion order.
    fn snapshot(&self) -> Vec<ChatMessage>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

fn assert_complete_turn(turn: &[ChatMessage]) {
    let first = turn.first().map(|message| message.role);
    let last = turn.last().map(|message| message.role);
    assert!(
        first == Some(Role::User) && last == Some(Role::Assistant),
        "history turn must run from a user message to an assistant message, got {first:?}..{last:?}"
    );
}

#[derive(Debug, Default)]
struct TurnBuffer {
    turns: VecDeque<(Vec<ChatMessage>, usize)>,
    used: usize,
}

impl TurnBuffer {
    fn push(&mut self, turn: Vec<ChatMessage>, cost: usize, limit: usize, unit: &'static str) {
        if cost > limit {
            warn!(
                event_name = "agent.history.turn_over_bound",
                cost,
                limit,
                unit,
                "turn alone exceeds the history bound; history cleared and turn dropped"
            );
            self.clear();
            return;
        }

        while self.used + cost > limit {
            match self.turns.pop_front() {
                Some((_, evicted)) => self.used -= evicted,
                None => break,
            }
        }

        self.used += cost;
        self.turns.push_back((turn, cost));
    }

    fn snapshot(&self) -> Vec<ChatMessage> {
        self.turns.iter().flat_map(|(turn, _)| turn.iter().cloned()).collect()
    }

    fn message_count(&self) -> usize {
        self.turns.iter().map(|(turn, _)| turn.len()).sum()
    }

    fn clear(&mut self) {
        self.turns.clear();
        self.used = 0;
    }
}

pub struct TokenBasedHistory {
    tokenizer: Arc<dyn Tokenizer>,
    max_tokens: usize,
    buffer: TurnBuffer,
}

impl TokenBasedHistory {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, max_tokens: usize) -> Self {
        Self { tokenizer, max_tokens, buffer: TurnBuffer::default() }
    }

    pub fn token_count(&self) -> usize {
        self.buffer.used
    }

    fn message_tokens(&self, message: &ChatMessage) -> usize {
        let content = message.text().map(|text| self.tokenizer.count(&text)).unwrap_or(0);
        let calls = message
            .tool_calls
            .iter()
            .map(|call| self.tokenizer.count(&call.name) + self.tokenizer.count(&call.arguments))
            .sum::<usize>();
        content + calls
    }
}

impl ChatHistory for TokenBasedHistory {
    fn add(&mut self, turn: Vec<ChatMessage>) {
        assert_complete_turn(&turn);
        let cost = turn.iter().map(|message| self.message_tokens(message)).sum();
        self.buffer.push(turn, cost, self.max_tokens, "tokens");
    }

    fn snapshot(&self) -> Vec<ChatMessage> {
        self.buffer.snapshot()
    }

    fn len(&self) -> usize {
        self.buffer.message_count()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Message-count bound, used when no tokenizer matches the model.
pub struct MessageBasedHistory {
    max_messages: usize,
    buffer: TurnBuffer,
}

impl MessageBasedHistory {
    pub fn new(max_messages: usize) -> Self {
        Self { max_messages, buffer: TurnBuffer::default() }
    }
}

impl ChatHistory for MessageBasedHistory {
    fn add(&mut self, turn: Vec<ChatMessage>) {
        assert_complete_turn(&turn);
        let cost = turn.len();
        self.buffer.push(turn, cost, self.max_messages, "messages");
    }

    fn snapshot(&self) -> Vec<ChatMessage> {
        self.buffer.snapshot()
    }

    fn len(&self) -> usize {
        self.buffer.message_count()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Token-bounded when the registry knows the model, message-bounded otherwise.
pub fn history_for_model(
    tokenizers: &TokenizerRegistry,
    model: &str,
    max_tokens: usize,
    max_messages: usize,
) -> Box<dyn ChatHistory> {
    match tokenizers.for_model(model) {
        Some(tokenizer) => Box::new(TokenBasedHistory::new(tokenizer, max_tokens)),
        None => Box::new(MessageBasedHistory::new(max_messages)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use colloquy_core::domain::message::{ChatMessage, Role, ToolCallData, ToolCallResult};

    use super::{
        history_for_model, ChatHistory, MessageBasedHistory, TokenBasedHistory,
        TokenizerRegistry,
    };
    use crate::testing::WordTokenizer;

    fn turn(question: &str, answer: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(question), ChatMessage::assistant_text(answer)]
    }

    fn assert_head_is_user(history: &dyn ChatHistory) {
        let snapshot = history.snapshot();
        if let Some(first) = snapshot.first() {
            assert_eq!(first.role, Role::User);
        }
        if let Some(last) = snapshot.last() {
            assert_eq!(last.role, Role::Assistant);
        }
    }

    #[test]
    fn message_history_evicts_whole_leading_turns() {
        let mut history = MessageBasedHistory::new(5);
        history.add(turn("one", "1"));
        history.add(vec![
            ChatMessage::user("two"),
            ChatMessage::assistant(None, vec![ToolCallData::new("t1", "clock", "{}")]),
            ChatMessage::tool(ToolCallResult { id: "t1".to_string(), content: "2".to_string() }),
            ChatMessage::assistant_text("2"),
        ]);

        // 2 + 4 > 5: the first turn goes, the second fits alone.
        assert_eq!(history.len(), 4);
        assert_head_is_user(&history);

        history.add(turn("three", "3"));
        assert_eq!(history.len(), 2, "four-message turn must be evicted whole");
        assert_eq!(history.snapshot()[0].text().as_deref(), Some("three"));
    }

    #[test]
    fn token_history_never_exceeds_bound() {
        let mut history = TokenBasedHistory::new(Arc::new(WordTokenizer), 10);

        for index in 0..20 {
            history.add(turn(&format!("question number {index}"), "short answer"));
            assert!(history.token_count() <= 10);
            assert_head_is_user(&history);
        }

        assert_eq!(history.token_count(), 10, "two five-token turns fit exactly");
        assert_eq!(history.snapshot()[0].text().as_deref(), Some("question number 18"));
    }

    #[test]
    fn tool_call_arguments_count_toward_tokens() {
        let mut history = TokenBasedHistory::new(Arc::new(WordTokenizer), 100);
        history.add(vec![
            ChatMessage::user("time please"),
            ChatMessage::assistant(
                None,
                vec![ToolCallData::new("t1", "clock", "{\"zone\": \"UTC\"}")],
            ),
            ChatMessage::tool(ToolCallResult { id: "t1".to_string(), content: "noon".to_string() }),
            ChatMessage::assistant_text("it is noon"),
        ]);

        // user 2 + call name 1 + arguments 2 + tool 1 + answer 3
        assert_eq!(history.token_count(), 9);
    }

    #[test]
    fn oversized_turn_clears_history_and_is_not_retained() {
        let mut history = MessageBasedHistory::new(3);
        history.add(turn("kept", "for now"));

        history.add(vec![
            ChatMessage::user("big"),
            ChatMessage::assistant(None, vec![ToolCallData::new("t1", "x", "{}")]),
            ChatMessage::tool(ToolCallResult { id: "t1".to_string(), content: "y".to_string() }),
            ChatMessage::assistant_text("done"),
        ]);

        assert!(history.is_empty());
    }

    #[test]
    #[should_panic(expected = "history turn must run from a user message")]
    fn partial_turn_is_a_programming_error() {
        let mut history = MessageBasedHistory::new(10);
        history.add(vec![ChatMessage::user("dangling")]);
    }

    #[test]
    fn strategy_follows_tokenizer_availability() {
        let mut tokenizers = TokenizerRegistry::default();
        tokenizers.register("gpt-4o", Arc::new(WordTokenizer));

        let mut token_based = history_for_model(&tokenizers, "gpt-4o", 3, 100);
        token_based.add(turn("one two", "three four"));
        assert!(token_based.is_empty(), "four tokens exceed a three-token bound");

        let mut message_based = history_for_model(&tokenizers, "llama3.1", 3, 100);
        message_based.add(turn("one two", "three four"));
        assert_eq!(message_based.len(), 2);
    }
}

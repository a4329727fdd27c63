use std::sync::Arc;

use tokio::sync::watch;

use colloquy_core::domain::message::{ChatMessage, FinishReason};
use colloquy_core::domain::usage::TokenUsage;

use crate::agent::AgentError;

/// Messages produced by one turn, starting with the caller's original user message.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutput {
    pub messages: Vec<ChatMessage>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

impl TurnOutput {
    pub fn final_text(&self) -> Option<String> {
        self.messages.iter().rev().find(|message| message.has_content()).and_then(ChatMessage::text)
    }

    pub fn has_assistant_output(&self) -> bool {
        self.messages.len() > 1
    }
}

#[derive(Debug)]
pub enum StreamOutcome {
    Completed(TurnOutput),
    /// Whatever was produced before the cancel; finish reason is `manual_stop`.
    Cancelled(TurnOutput),
    Failed(AgentError),
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender: Arc::new(sender) }, CancelSignal { receiver })
}

#[derive(Clone, Debug)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

#[derive(Clone, Debug)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal nobody can fire.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancelled. Pends forever if every handle is dropped first.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{cancel_pair, CancelSignal};

    #[tokio::test]
    async fn cancel_wakes_waiting_signal() {
        let (handle, mut signal) = cancel_pair();
        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            true
        });

        handle.cancel();
        assert!(waiter.await.expect("join waiter"));
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_signal_does_not_fire() {
        let mut signal = CancelSignal::never();
        let fired = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(fired.is_err());
        assert!(!signal.is_cancelled());
    }
}

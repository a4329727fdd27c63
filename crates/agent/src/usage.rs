use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use colloquy_core::domain::usage::{TokenUsage, TokenUsageRecord, UsageType};
use colloquy_db::TokenUsageRepository;

enum UsageCommand {
    Record(TokenUsageRecord),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front of the token-usage sink. Writes happen on a background task;
/// failures are logged and counted, never returned to the turn.
#[derive(Clone)]
pub struct UsageRecorder {
    sender: Option<mpsc::UnboundedSender<UsageCommand>>,
    failures: Arc<AtomicU64>,
}

impl UsageRecorder {
    /// Must be called inside a tokio runtime.
    pub fn spawn(repository: Arc<dyn TokenUsageRepository>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<UsageCommand>();
        let failures = Arc::new(AtomicU64::new(0));
        let worker_failures = failures.clone();

        let handle = tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    UsageCommand::Record(record) => {
                        let usage_type = record.usage_type;
                        if let Err(error) = repository.store(record).await {
                            worker_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                event_name = "agent.usage.store_failed",
                                usage_type = usage_type.as_str(),
                                error = %error,
                                "token usage record dropped"
                            );
                        }
                    }
                    UsageCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!(event_name = "agent.usage.worker_stopped", "usage recorder channel closed");
        });

        (Self { sender: Some(sender), failures }, handle)
    }

    pub fn disabled() -> Self {
        Self { sender: None, failures: Arc::new(AtomicU64::new(0)) }
    }

    pub fn record(&self, record: TokenUsageRecord) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(UsageCommand::Record(record)).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(event_name = "agent.usage.worker_gone", "usage recorder worker is not running");
        }
    }

    /// Records prompt and completion counts separately, skipping zero amounts.
    pub fn record_completion(&self, usage: TokenUsage, model: &str, provider: &str) {
        if usage.prompt_tokens > 0 {
            self.record(TokenUsageRecord::new(
                usage.prompt_tokens,
                UsageType::Prompt,
                model,
                provider,
            ));
        }
        if usage.completion_tokens > 0 {
            self.record(TokenUsageRecord::new(
                usage.completion_tokens,
                UsageType::Completion,
                model,
                provider,
            ));
        }
    }

    /// Resolves once every record sent before this call has been handled.
    pub async fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if sender.send(UsageCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

use std::collections::HashMap;
use std::sync::Arc;

#[cfg(not(test))]
use tokio::time::{Duration, sleep};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{ErrorCode, ParleyError};
use crate::event_stream::{ChatEventStream, ChatStreamEvent};
use crate::transport::{ChatTransport, StreamChatOptions};
use crate::types::Message;

pub const DEFAULT_TRANSPORT_RETRY_COUNT: usize = 3;
pub const DEFAULT_RETRY_BASE_BACKOFF_MS: u64 = 1_000;

/// Wraps a transport with bounded retries for transport-class failures.
///
/// Increments are forwarded as they arrive. An attempt is only retried when it
/// failed before forwarding anything, so the consumer never sees two partial
/// responses stitched together.
pub struct ReliableTransport {
    inner: Arc<dyn ChatTransport>,
    max_retries: usize,
    base_backoff_ms: u64,
    provider_backoff_ms: HashMap<String, u64>,
}

impl ReliableTransport {
    pub fn wrap(inner: Arc<dyn ChatTransport>) -> Self {
        Self {
            inner,
            max_retries: DEFAULT_TRANSPORT_RETRY_COUNT,
            base_backoff_ms: DEFAULT_RETRY_BASE_BACKOFF_MS,
            provider_backoff_ms: HashMap::new(),
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_backoff_ms(mut self, base_backoff_ms: u64) -> Self {
        self.base_backoff_ms = base_backoff_ms;
        self
    }

    pub fn provider_backoff_ms(mut self, provider: impl Into<String>, backoff_ms: u64) -> Self {
        self.provider_backoff_ms.insert(provider.into(), backoff_ms);
        self
    }

    fn resolve_retry_count(&self, request_override: Option<usize>) -> usize {
        request_override.unwrap_or(self.max_retries)
    }

    fn backoff_for(&self, provider: &str) -> u64 {
        self.provider_backoff_ms
            .get(provider)
            .copied()
            .unwrap_or(self.base_backoff_ms)
    }
}

impl ChatTransport for ReliableTransport {
    fn stream_chat(
        &self,
        messages: Vec<Message>,
        options: StreamChatOptions,
    ) -> Result<ChatEventStream, ParleyError> {
        let inner = self.inner.clone();
        let max_retries = self.resolve_retry_count(options.config.transport_retry_count);
        let base_backoff_ms = self.backoff_for(&options.config.provider);
        let output = ChatEventStream::new();
        let task_output = output.clone();

        tokio::spawn(async move {
            run_with_retry(
                inner,
                messages,
                options,
                max_retries,
                base_backoff_ms,
                task_output,
            )
            .await;
        });

        Ok(output)
    }
}

enum AttemptStatus {
    Success,
    Failure { error: ParleyError, retryable: bool },
}

async fn run_with_retry(
    inner: Arc<dyn ChatTransport>,
    messages: Vec<Message>,
    options: StreamChatOptions,
    max_retries: usize,
    base_backoff_ms: u64,
    output: ChatEventStream,
) {
    let provider = options.config.provider.clone();
    let mut retries_used = 0usize;

    loop {
        let status = match inner.stream_chat(messages.clone(), options.clone()) {
            Ok(attempt) => forward_attempt(&provider, &attempt, &output).await,
            Err(error) => AttemptStatus::Failure {
                retryable: error.code == ErrorCode::Transport,
                error,
            },
        };

        match status {
            AttemptStatus::Success => {
                if retries_used > 0 {
                    debug!(
                        provider = provider.as_str(),
                        retries = retries_used,
                        "transport succeeded after retry"
                    );
                }
                output.finish();
                return;
            }
            AttemptStatus::Failure { error, retryable } => {
                if retryable && retries_used < max_retries {
                    warn!(
                        provider = provider.as_str(),
                        attempt = retries_used + 1,
                        max_retries,
                        error = error.message.as_str(),
                        "transport attempt failed, retrying"
                    );
                    sleep_backoff(base_backoff_ms, retries_used).await;
                    retries_used += 1;
                    continue;
                }

                let error = if retries_used > 0 {
                    let mut details = error.details.clone().unwrap_or_else(|| json!({}));
                    if let Some(object) = details.as_object_mut() {
                        object.insert("retries".to_string(), retries_used.into());
                    }
                    ParleyError {
                        details: Some(details),
                        ..error
                    }
                } else {
                    error
                };
                output.fail(error);
                return;
            }
        }
    }
}

/// Pipes one attempt into `output` until its terminal event. A failure is
/// only retryable while nothing has been forwarded yet.
async fn forward_attempt(
    provider: &str,
    attempt: &ChatEventStream,
    output: &ChatEventStream,
) -> AttemptStatus {
    let mut forwarded = 0usize;
    while let Some(event) = attempt.next().await {
        match event {
            ChatStreamEvent::Increment(increment) => {
                output.push_increment(increment);
                forwarded += 1;
            }
            ChatStreamEvent::Done => return AttemptStatus::Success,
            ChatStreamEvent::Error(error) => {
                if forwarded > 0 && error.code == ErrorCode::Transport {
                    debug!(provider, forwarded, "transport failed mid-stream, not retrying");
                }
                return AttemptStatus::Failure {
                    retryable: error.code == ErrorCode::Transport && forwarded == 0,
                    error,
                };
            }
        }
    }
    AttemptStatus::Failure {
        retryable: false,
        error: ParleyError::new(
            ErrorCode::Protocol,
            format!("Transport '{provider}' ended without a terminal event"),
        ),
    }
}

#[cfg(not(test))]
async fn sleep_backoff(base_backoff_ms: u64, retry_index: usize) {
    let shift = retry_index.min(63) as u32;
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    sleep(Duration::from_millis(base_backoff_ms.saturating_mul(multiplier))).await;
}

#[cfg(test)]
async fn sleep_backoff(_base_backoff_ms: u64, _retry_index: usize) {}

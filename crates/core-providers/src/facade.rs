use std::time::Duration;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use resume_core_types::{CoreError, ErrorKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::provider::{ChatMessage, GenerateOptions, StreamChunk as RawChunk, TokenUsage};
use crate::registry::ProviderRegistry;

pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(300);

/// Normalized item the rest of the core consumes. This is the façade's half
/// of §4.2's `generate_stream` contract — the provider-native `StreamChunk`
/// never escapes this module.
#[derive(Debug, Clone)]
pub enum GenerateChunk {
    DeltaText(String),
    UsageUpdate { usage: TokenUsage, estimated: bool },
    FinishReason(String),
}

/// A deterministic, provider-independent token-count approximation used only
/// when upstream never reports real usage. ~4 characters per token, the same
/// rough ratio the rest of the industry uses for English prose estimates.
pub fn estimate_tokens(char_count: usize) -> u64 {
    ((char_count as f64) / 4.0).ceil() as u64
}

fn to_core_error(err: anyhow::Error) -> CoreError {
    match err.downcast::<CoreError>() {
        Ok(core_err) => core_err,
        Err(other) => CoreError::new(ErrorKind::Network, "provider call failed")
            .with_detail(other.to_string()),
    }
}

/// Runs one streaming call, yielding each `GenerateChunk` as it arrives from
/// upstream rather than buffering the full response. Enforces the per-call
/// deadline against the whole sequence (connect included) and guarantees at
/// least one `UsageUpdate` before the stream ends.
pub fn generate_stream<'a>(
    registry: &'a ProviderRegistry,
    provider_id: Option<&'a str>,
    model_id: Option<&'a str>,
    messages: Vec<ChatMessage>,
    options: GenerateOptions,
    deadline: Duration,
) -> impl Stream<Item = Result<GenerateChunk, CoreError>> + 'a {
    try_stream! {
        let prompt_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        let cancel = CancellationToken::new();
        let deadline_at = Instant::now() + deadline;
        let timed_out = || {
            CoreError::new(
                ErrorKind::Timeout,
                format!("provider call exceeded {}s deadline", deadline.as_secs()),
            )
        };

        let mut stream = match tokio::time::timeout_at(
            deadline_at,
            registry.stream_for_provider(provider_id, model_id, messages, &options, cancel.clone()),
        )
        .await
        {
            Ok(result) => result.map_err(to_core_error)?,
            Err(_) => {
                cancel.cancel();
                Err(timed_out())?
            }
        };

        let mut saw_usage = false;
        let mut completion_chars = 0usize;

        loop {
            let item = match tokio::time::timeout_at(deadline_at, stream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    cancel.cancel();
                    Err(timed_out())?
                }
            };
            let Some(item) = item else { break };

            match item.map_err(to_core_error)? {
                RawChunk::TextDelta(text) => {
                    completion_chars += text.chars().count();
                    yield GenerateChunk::DeltaText(text);
                }
                RawChunk::ReasoningDelta(text) => {
                    completion_chars += text.chars().count();
                    yield GenerateChunk::DeltaText(text);
                }
                RawChunk::Done { finish_reason, usage } => {
                    if let Some(usage) = usage {
                        saw_usage = true;
                        yield GenerateChunk::UsageUpdate {
                            usage,
                            estimated: false,
                        };
                    }
                    yield GenerateChunk::FinishReason(finish_reason);
                }
            }
        }

        if !saw_usage {
            let prompt_tokens = estimate_tokens(prompt_chars);
            let completion_tokens = estimate_tokens(completion_chars);
            yield GenerateChunk::UsageUpdate {
                usage: TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                },
                estimated: true,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_uses_four_chars_per_token() {
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(8), 2);
        assert_eq!(estimate_tokens(0), 0);
    }
}

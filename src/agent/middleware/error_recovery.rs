use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::errors::classify;
use crate::providers::base::ChunkStream;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_MAX_RETRIES: usize = 2;
const DEFAULT_MAX_CONNECTION_RETRIES: usize = 5;
const BACKOFF_BASE_SECS: f64 = 1.0;

/// Retries failed LLM calls with exponential backoff. Connection-class
/// errors get a larger retry budget than plain API errors. As a last resort
/// the final `tool` message is rewritten with a diagnostic (oversized or
/// malformed payloads are the usual culprit) and the call retried once more.
pub struct ErrorRecovery {
    max_retries: usize,
    max_connection_retries: usize,
}

impl ErrorRecovery {
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_connection_retries: DEFAULT_MAX_CONNECTION_RETRIES,
        }
    }
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for ErrorRecovery {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        let mut attempts = 0usize;
        let mut budget = self.max_retries;
        let last_error;

        loop {
            match next.run(session).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    attempts += 1;
                    let (is_connection, _) = classify(&e);
                    if is_connection && budget < self.max_connection_retries {
                        budget = self.max_connection_retries;
                        info!(
                            "connection error detected, increasing max retries to {}",
                            budget
                        );
                    }
                    let kind = if is_connection { "Connection error" } else { "API error" };
                    if attempts <= budget {
                        let base = BACKOFF_BASE_SECS * 2f64.powi(attempts as i32 - 1);
                        let jitter = base * 0.25 * fastrand::f64();
                        warn!(
                            "{}: {}. Retrying ({}/{}) in {:.1}s...",
                            kind,
                            e,
                            attempts,
                            budget,
                            base + jitter
                        );
                        tokio::time::sleep(Duration::from_secs_f64(base + jitter)).await;
                        continue;
                    }
                    error!("{} after {} retries: {}", kind, budget, e);
                    last_error = e;
                    break;
                }
            }
        }

        // Fallback: if the newest message is a tool result, the payload is
        // the likeliest cause. Replace it with a diagnostic and try once more.
        let can_fallback = session.history.last().is_some_and(|m| m.role == "tool");
        if can_fallback {
            info!("attempting error recovery by rewriting last tool result");
            if let Some(last) = session.history.last_mut() {
                let original_len = last.content_str().len();
                last.content = Some(format!(
                    "Error: The previous tool execution resulted in an API error (likely payload too large or invalid). Original length: {}. Please try a different approach or arguments.",
                    original_len
                ));
            }
            match next.run(session).await {
                Ok(stream) => return Ok(stream),
                Err(e) => error!("recovery attempt failed: {}", e),
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::middleware::LlmCall;
    use crate::errors::SwarmError;
    use crate::providers::base::{Message, StreamChunk};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyCall {
        calls: AtomicUsize,
        succeed_on: usize,
        message: &'static str,
    }

    #[async_trait]
    impl LlmCall for FlakyCall {
        async fn call(&self, _session: &mut AgentSession) -> Result<ChunkStream> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(Box::pin(futures_util::stream::iter(vec![Ok(
                    StreamChunk::token("ok"),
                )])))
            } else {
                Err(SwarmError::Provider {
                    message: self.message.to_string(),
                    retryable: true,
                }
                .into())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn api_error_retried_within_budget() {
        let base = FlakyCall {
            calls: AtomicUsize::new(0),
            succeed_on: 3,
            message: "500 internal",
        };
        let recovery = ErrorRecovery::new();
        let mut session = AgentSession::default();
        let chain: Vec<std::sync::Arc<dyn Middleware>> = vec![];
        let result = recovery.call(&mut session, Next::new(&chain, &base)).await;
        assert!(result.is_ok());
        assert_eq!(base.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_errors_get_larger_budget() {
        let base = FlakyCall {
            calls: AtomicUsize::new(0),
            succeed_on: 5,
            message: "connection refused",
        };
        let recovery = ErrorRecovery::new();
        let mut session = AgentSession::default();
        let chain: Vec<std::sync::Arc<dyn Middleware>> = vec![];
        let result = recovery.call(&mut session, Next::new(&chain, &base)).await;
        assert!(result.is_ok());
        assert_eq!(base.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_rewrites_last_tool_message() {
        // Exhausts 1 initial + 2 API retries, then the tool-message rewrite
        // makes the fourth attempt succeed.
        let base = FlakyCall {
            calls: AtomicUsize::new(0),
            succeed_on: 4,
            message: "400 bad request",
        };
        let recovery = ErrorRecovery::new();
        let mut session = AgentSession::default();
        session
            .history
            .push(Message::tool_result("call_1", "web_reader", "x".repeat(100_000)));

        let chain: Vec<std::sync::Arc<dyn Middleware>> = vec![];
        let result = recovery.call(&mut session, Next::new(&chain, &base)).await;
        assert!(result.is_ok());
        let rewritten = session.history.last().unwrap().content_str();
        assert!(rewritten.starts_with("Error: The previous tool execution"));
        assert!(rewritten.contains("100000"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_error() {
        let base = FlakyCall {
            calls: AtomicUsize::new(0),
            succeed_on: 100,
            message: "500 internal",
        };
        let recovery = ErrorRecovery::new();
        let mut session = AgentSession::default();
        session.history.push(Message::user("hi"));
        let chain: Vec<std::sync::Arc<dyn Middleware>> = vec![];
        let result = recovery.call(&mut session, Next::new(&chain, &base)).await;
        assert!(result.is_err());
        // 1 initial + 2 retries, no tool-message fallback available.
        assert_eq!(base.calls.load(Ordering::SeqCst), 3);
    }
}

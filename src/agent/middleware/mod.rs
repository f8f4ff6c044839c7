mod activity_logger;
mod budget;
mod context_overflow;
mod dependency_guard;
mod drift;
mod error_recovery;
mod interaction;
mod loop_breaker;
mod mailbox;
mod notifications;
mod parent_monitor;
mod request_monitor;
mod swarm_state;
mod tool_cache;
mod watchdog;
mod worker_guard;

pub use activity_logger::ActivityLogger;
pub use budget::ExecutionBudget;
pub use context_overflow::ContextOverflow;
pub use dependency_guard::DependencyGuard;
pub use drift::SemanticDriftGuard;
pub use error_recovery::ErrorRecovery;
pub use interaction::InteractionRefinement;
pub use loop_breaker::LoopBreaker;
pub use mailbox::MailboxMiddleware;
pub use notifications::NotificationAwareness;
pub use parent_monitor::ParentProcessMonitor;
pub use request_monitor::RequestMonitor;
pub use swarm_state::SwarmState;
pub use tool_cache::ToolResultCache;
pub use watchdog::WatchdogGuard;
pub use worker_guard::SwarmAgentGuard;

use crate::agent::session::AgentSession;
use crate::providers::base::{ChunkStream, StreamChunk};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;

/// The innermost LLM call the middleware chain wraps.
#[async_trait]
pub trait LlmCall: Send + Sync {
    async fn call(&self, session: &mut AgentSession) -> Result<ChunkStream>;
}

/// A composable stream interceptor around the LLM call. A middleware may
/// mutate the session before delegating, wrap the returned chunk stream,
/// synthesize a replacement stream, or re-invoke `next` to retry.
///
/// The engine wraps right-to-left: the first middleware in the configured
/// list is the outermost wrapper.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream>;

    /// End-of-run hook (cache teardown etc.). Default no-op.
    fn cleanup(&self) {}
}

/// The remainder of the chain. Cheap to copy, so retrying middlewares can
/// invoke it multiple times.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    base: &'a dyn LlmCall,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], base: &'a dyn LlmCall) -> Self {
        Self { chain, base }
    }

    pub async fn run(self, session: &mut AgentSession) -> Result<ChunkStream> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .call(
                        session,
                        Next {
                            chain: rest,
                            base: self.base,
                        },
                    )
                    .await
            }
            None => self.base.call(session).await,
        }
    }
}

/// Stateful per-chunk rewriter for stream-wrapping middlewares. Errors pass
/// through untouched; `on_end` runs once after the inner stream closes and
/// may synthesize trailing chunks.
pub(crate) trait ChunkInterceptor: Send + 'static {
    fn on_chunk(&mut self, chunk: StreamChunk, out: &mut VecDeque<StreamChunk>);
    fn on_end(&mut self, out: &mut VecDeque<StreamChunk>);
}

/// Wrap a chunk stream with an interceptor, preserving laziness (no task is
/// spawned; the interceptor runs inside the consumer's polls).
pub(crate) fn intercept<I: ChunkInterceptor>(inner: ChunkStream, interceptor: I) -> ChunkStream {
    struct State<I> {
        inner: ChunkStream,
        interceptor: I,
        pending: VecDeque<Result<StreamChunk>>,
        done: bool,
    }

    let state = State {
        inner,
        interceptor,
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            let mut out = VecDeque::new();
            match st.inner.next().await {
                Some(Ok(chunk)) => st.interceptor.on_chunk(chunk, &mut out),
                Some(Err(e)) => st.pending.push_back(Err(e)),
                None => {
                    st.done = true;
                    st.interceptor.on_end(&mut out);
                }
            }
            st.pending.extend(out.into_iter().map(Ok));
        }
    }))
}

/// Fresh id for synthesized tool calls, in the provider's `call_` format.
pub(crate) fn new_call_id() -> String {
    format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Arguments for a synthesized `wait` call. Centralized so every guard emits
/// the same well-formed shape.
pub(crate) fn wait_arguments(duration: f64, wait_for_new_index: bool, reason: &str) -> String {
    serde_json::json!({
        "duration": duration,
        "wait_for_new_index": wait_for_new_index,
        "reason": reason,
    })
    .to_string()
}

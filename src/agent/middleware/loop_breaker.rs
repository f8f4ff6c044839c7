use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::providers::base::ChunkStream;
use anyhow::Result;
use async_trait::async_trait;
use tracing::error;

const DEFAULT_MAX_REPEATS: usize = 3;

/// Detects the agent re-issuing the exact same tool call and injects a
/// strategy-change warning into the system prompt.
pub struct LoopBreaker {
    max_repeats: usize,
}

impl LoopBreaker {
    pub fn new() -> Self {
        Self {
            max_repeats: DEFAULT_MAX_REPEATS,
        }
    }
}

impl Default for LoopBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for LoopBreaker {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        // Most recent calls first; a user message resets the window.
        let mut recent: Vec<(String, String)> = Vec::new();
        for msg in session.history.iter().rev() {
            if msg.role == "user" {
                break;
            }
            if msg.is_assistant()
                && let Some(tool_calls) = &msg.tool_calls
            {
                for tc in tool_calls {
                    recent.push((tc.name.clone(), tc.arguments.clone()));
                }
            }
        }

        if recent.len() >= self.max_repeats {
            let window = &recent[..self.max_repeats];
            if window.iter().all(|sig| *sig == window[0]) {
                error!("loop detected for tool: {}", window[0].0);
                session.system_config.append_section(format!(
                    "WARNING: You have attempted to call '{}' with the same arguments {} times consecutively. This action is failing to produce a new result. PLEASE CHANGE YOUR STRATEGY or stop this action.",
                    window[0].0, self.max_repeats
                ));
            }
        }

        next.run(session).await
    }
}

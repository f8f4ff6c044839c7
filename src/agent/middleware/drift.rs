use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::providers::base::ChunkStream;
use anyhow::Result;
use async_trait::async_trait;

const DEFAULT_DRIFT_THRESHOLD: usize = 5;
const GOAL_PREVIEW_CHARS: usize = 200;

/// After enough ReAct iterations, re-anchor the agent to its original
/// instruction so long chains don't wander off-goal.
pub struct SemanticDriftGuard {
    drift_threshold: usize,
}

impl SemanticDriftGuard {
    pub fn new() -> Self {
        Self {
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
        }
    }
}

impl Default for SemanticDriftGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for SemanticDriftGuard {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        let iteration = session.metadata_usize("iteration_count").unwrap_or(0);
        if iteration >= self.drift_threshold {
            let goal: String = session
                .system_config
                .base_prompt
                .chars()
                .take(GOAL_PREVIEW_CHARS)
                .collect();
            session.system_config.upsert_section(
                "--- REMINDER ---",
                format!(
                    "--- REMINDER ---\nYou are in a long reasoning chain (Step {}). Ensure your current actions still align with your original goal: {}...\nIf the goal is achieved, provide the final answer immediately.",
                    iteration, goal
                ),
                false,
            );
        }
        next.run(session).await
    }
}

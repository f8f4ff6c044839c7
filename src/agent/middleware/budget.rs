use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::providers::base::ChunkStream;
use anyhow::Result;
use async_trait::async_trait;
use tracing::error;

const REINJECT_EVERY_TURNS: usize = 5;
const LAST_INJECTION_KEY: &str = "budget_manager_last_injection";

/// Once the assistant-turn count reaches the budget, demand final output —
/// and keep demanding it every few turns if the agent carries on.
pub struct ExecutionBudget {
    max_iterations: usize,
}

impl ExecutionBudget {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }
}

#[async_trait]
impl Middleware for ExecutionBudget {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        let turns = session.assistant_turns();
        if turns >= self.max_iterations {
            let last = session.metadata_usize(LAST_INJECTION_KEY);
            let due = match last {
                None => true,
                Some(at) => turns.saturating_sub(at) >= REINJECT_EVERY_TURNS,
            };
            if due {
                error!("execution budget exceeded: {} turns", turns);
                session.system_config.append_section(format!(
                    "CRITICAL: You have exceeded your execution budget ({} turns). You MUST provide your final best answer NOW and stop calling tools.",
                    turns
                ));
                session.set_metadata_usize(LAST_INJECTION_KEY, turns);
            }
        }
        next.run(session).await
    }
}

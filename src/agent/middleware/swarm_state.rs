use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::providers::base::ChunkStream;
use crate::registry::AgentRegistry;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::error;

pub(crate) const SWARM_STATUS_HEADER: &str = "## REAL-TIME SWARM STATUS (REGISTRY)";

/// Refreshes registry PID liveness before every LLM call and splices the
/// verified report into the system prompt, replacing the previous copy in
/// place so the prompt never grows.
pub struct SwarmState {
    registry: Option<AgentRegistry>,
}

impl SwarmState {
    pub fn new(blackboard_dir: &Path) -> Self {
        let registry = AgentRegistry::new(blackboard_dir)
            .map_err(|e| error!("swarm state: registry unavailable: {}", e))
            .ok();
        Self { registry }
    }

    fn inject_status(&self, session: &mut AgentSession) {
        let Some(registry) = &self.registry else {
            return;
        };
        let report = registry.verify_and_sync_pids();
        if report.is_empty() {
            return;
        }
        let Ok(status_text) = serde_json::to_string_pretty(&report) else {
            return;
        };
        let section = format!(
            "{}\nThis is the current state of all agents in the swarm, synced from the registry.\nVerified by Middleware (PID Check).\n\n```json\n{}\n```",
            SWARM_STATUS_HEADER, status_text
        );
        session
            .system_config
            .upsert_section(SWARM_STATUS_HEADER, section, true);
    }
}

#[async_trait]
impl Middleware for SwarmState {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        self.inject_status(session);
        next.run(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_and_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(dir.path()).unwrap();
        registry
            .register_agent("Self", "Engineer", std::process::id())
            .unwrap();

        let mw = SwarmState::new(dir.path());
        let mut session = AgentSession::default();
        mw.inject_status(&mut session);
        assert_eq!(session.system_config.extra_sections.len(), 1);
        assert!(session.system_config.extra_sections[0].contains("\"Self\""));
        assert!(session.system_config.extra_sections[0].contains("ALIVE"));

        // Second refresh replaces rather than appends.
        mw.inject_status(&mut session);
        assert_eq!(session.system_config.extra_sections.len(), 1);
    }

    #[test]
    fn dead_pid_reported_dead() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(dir.path()).unwrap();
        registry.register_agent("Gone", "Engineer", 1_900_000_900).unwrap();

        let mw = SwarmState::new(dir.path());
        let mut session = AgentSession::default();
        mw.inject_status(&mut session);
        assert!(session.system_config.extra_sections[0].contains("DEAD"));
    }

    #[test]
    fn empty_registry_injects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mw = SwarmState::new(dir.path());
        let mut session = AgentSession::default();
        mw.inject_status(&mut session);
        assert!(session.system_config.extra_sections.is_empty());
    }
}

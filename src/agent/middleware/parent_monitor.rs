use super::{Middleware, Next};
use crate::agent::runtime::cleanup_agent;
use crate::agent::session::AgentSession;
use crate::blackboard::Blackboard;
use crate::errors::SwarmError;
use crate::providers::base::ChunkStream;
use crate::registry::{AgentRegistry, AgentStatus, pid_alive};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Ties a worker's lifetime to its parent. Before each LLM call it checks
/// (a) the parent PID still exists, and (b) the parent's registry row is not
/// DEAD. Either failure triggers self-cleanup: deregister, then SIGTERM to
/// our own process so the normal shutdown path (group kill included) runs.
pub struct ParentProcessMonitor {
    parent_pid: u32,
    parent_agent_name: String,
    agent_name: String,
    registry: Option<AgentRegistry>,
    board: Blackboard,
    terminating: AtomicBool,
}

impl ParentProcessMonitor {
    pub fn new(
        parent_pid: u32,
        parent_agent_name: impl Into<String>,
        agent_name: impl Into<String>,
        board: Blackboard,
    ) -> Self {
        let registry = AgentRegistry::new(board.root()).ok();
        let monitor = Self {
            parent_pid,
            parent_agent_name: parent_agent_name.into(),
            agent_name: agent_name.into(),
            registry,
            board,
            terminating: AtomicBool::new(false),
        };
        if monitor.parent_pid > 0 {
            info!(
                "[{}] watching parent PID {} (agent: {})",
                monitor.agent_name, monitor.parent_pid, monitor.parent_agent_name
            );
        }
        monitor
    }

    /// The parent agent is treated as active unless its row says DEAD;
    /// a missing row or unreadable registry must not kill the worker.
    fn is_parent_agent_active(&self) -> bool {
        let Some(registry) = &self.registry else {
            return true;
        };
        match registry.get_agent(&self.parent_agent_name) {
            Some(entry) => entry.status != AgentStatus::Dead,
            None => true,
        }
    }

    fn terminate_self(&self, reason: &str) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = &self.registry {
            cleanup_agent(registry, &self.board, &self.agent_name, reason);
        }
        info!("[{}] self-terminating: {}", self.agent_name, reason);
        // SIGTERM ourselves so the registered handler reaps the process
        // group (browser drivers and other grandchildren included).
        unsafe {
            libc::kill(std::process::id() as libc::pid_t, libc::SIGTERM);
        }
    }

    fn check(&self) -> Result<(), SwarmError> {
        if self.parent_pid == 0 {
            return Ok(());
        }
        if !pid_alive(self.parent_pid) {
            warn!(
                "[{}] parent process {} died, terminating self",
                self.agent_name, self.parent_pid
            );
            self.terminate_self("Parent process died");
            return Err(SwarmError::Abort);
        }
        if !self.is_parent_agent_active() {
            warn!(
                "[{}] parent agent '{}' is DEAD, terminating self",
                self.agent_name, self.parent_agent_name
            );
            self.terminate_self(&format!(
                "Parent agent '{}' finished",
                self.parent_agent_name
            ));
            return Err(SwarmError::Abort);
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for ParentProcessMonitor {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        self.check()?;
        next.run(session).await
    }
}

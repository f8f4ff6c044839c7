use crate::agent::tools::base::{Tool, ToolContext};
use crate::registry::{AgentRegistry, AgentStatus};
use async_trait::async_trait;
use chrono::Local;
use serde_json::{Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

/// How long the spawner waits for the child to flip itself to RUNNING.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const HANDSHAKE_POLL: Duration = Duration::from_millis(500);

#[derive(Default, Clone)]
struct SpawnContext {
    parent_agent_name: String,
    model_key: Option<String>,
    keys_path: Option<PathBuf>,
    max_iterations: usize,
}

/// Spawns a worker agent as a detached child process, with stdout/stderr
/// redirected to its log file. Writes the STARTING registry row, then polls
/// until the child registers itself RUNNING; a child that never arrives is
/// killed and marked DEAD.
pub struct SpawnSwarmAgentTool {
    blackboard_dir: PathBuf,
    ctx: RwLock<SpawnContext>,
}

impl SpawnSwarmAgentTool {
    pub fn new(blackboard_dir: &Path) -> Self {
        Self {
            blackboard_dir: blackboard_dir.to_path_buf(),
            ctx: RwLock::new(SpawnContext {
                parent_agent_name: "Watchdog".to_string(),
                model_key: None,
                keys_path: None,
                max_iterations: 50,
            }),
        }
    }

    async fn wait_for_agent_ready(&self, registry: &AgentRegistry, name: &str) -> bool {
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if registry
                .get_agent(name)
                .is_some_and(|e| e.status == AgentStatus::Running)
            {
                return true;
            }
            tokio::time::sleep(HANDSHAKE_POLL).await;
        }
        false
    }

    async fn cleanup_failed_spawn(
        registry: &AgentRegistry,
        child: &mut tokio::process::Child,
        name: &str,
    ) {
        if let Err(e) = child.kill().await {
            warn!("failed to kill unresponsive child '{}': {}", name, e);
        }
        let _ = child.wait().await;
        if let Err(e) = registry.deregister_agent(name, "Failed to reach RUNNING within timeout") {
            warn!("failed to mark '{}' DEAD after spawn timeout: {}", name, e);
        }
    }
}

#[async_trait]
impl Tool for SpawnSwarmAgentTool {
    fn name(&self) -> &str {
        "spawn_swarm_agent"
    }

    fn description(&self) -> String {
        "Spawns a new Swarm Agent process in the background. Automatically redirects stdout/stderr to the blackboard's logs/<name>.log. Returns the PID of the new process once it has registered itself as RUNNING.".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Unique name of the agent (e.g. 'Coordinator')"
                },
                "role": {
                    "type": "string",
                    "description": "Role description (e.g. 'Project Manager')"
                },
                "goal": {
                    "type": "string",
                    "description": "Initial goal or instruction"
                },
                "model": {
                    "type": "string",
                    "description": "Optional model provider key"
                },
                "excluded_tools": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Tool names to exclude from the agent. Defaults to ['ask_user'].",
                    "default": ["ask_user"]
                }
            },
            "required": ["name", "role", "goal"]
        })
    }

    fn configure(&self, ctx: &ToolContext) {
        if let Ok(mut spawn_ctx) = self.ctx.write() {
            if let Some(name) = &ctx.agent_name {
                spawn_ctx.parent_agent_name.clone_from(name);
            }
            spawn_ctx.model_key.clone_from(&ctx.model_key);
            spawn_ctx.keys_path.clone_from(&ctx.keys_path);
            if ctx.max_iterations > 0 {
                spawn_ctx.max_iterations = ctx.max_iterations;
            }
        }
    }

    async fn execute(&self, params: Value) -> anyhow::Result<String> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let role = params.get("role").and_then(Value::as_str).unwrap_or_default();
        let goal = params.get("goal").and_then(Value::as_str).unwrap_or_default();
        if name.is_empty() || role.is_empty() || goal.is_empty() {
            return Ok("Error: name, role and goal are required.".to_string());
        }
        let model = params.get("model").and_then(Value::as_str);
        let excluded_tools: Vec<String> = params
            .get("excluded_tools")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["ask_user".to_string()]);

        let ctx = self.ctx.read().map(|c| c.clone()).unwrap_or_default();
        let active_model = model
            .map(ToString::to_string)
            .or_else(|| ctx.model_key.clone());

        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => return Ok(format!("Error: Could not resolve own executable: {}", e)),
        };

        // Log file, shared with the child for stdout/stderr.
        let log_dir = self.blackboard_dir.join("logs");
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            return Ok(format!("Error: Could not create log directory: {}", e));
        }
        let log_path = log_dir.join(format!("{}.log", name));
        let mut log_file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            Ok(file) => file,
            Err(e) => return Ok(format!("Error: Could not open log file: {}", e)),
        };
        let _ = writeln!(
            log_file,
            "\n[{}] Spawning agent...",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        let mut command = tokio::process::Command::new(&exe);
        command
            .arg("worker")
            .arg("--name")
            .arg(name)
            .arg("--role")
            .arg(role)
            .arg("--goal")
            .arg(goal)
            .arg("--blackboard")
            .arg(&self.blackboard_dir)
            .arg("--parent-pid")
            .arg(std::process::id().to_string())
            .arg("--parent-agent-name")
            .arg(&ctx.parent_agent_name)
            .arg("--max-iterations")
            .arg(ctx.max_iterations.to_string());
        if let Some(model) = &active_model {
            command.arg("--model").arg(model);
        }
        if !excluded_tools.is_empty() {
            command.arg("--exclude-tools").arg(excluded_tools.join(","));
        }
        if let Some(keys) = &ctx.keys_path {
            command.arg("--keys").arg(keys);
        }

        let stdout = match log_file.try_clone() {
            Ok(file) => std::process::Stdio::from(file),
            Err(e) => return Ok(format!("Error: Could not redirect logs: {}", e)),
        };
        let stderr = match log_file.try_clone() {
            Ok(file) => std::process::Stdio::from(file),
            Err(e) => return Ok(format!("Error: Could not redirect logs: {}", e)),
        };
        command
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(format!("Error spawning agent: {}", e)),
        };
        let pid = child.id().unwrap_or_default();
        let _ = writeln!(log_file, "PID: {}", pid);
        info!("spawned agent '{}' (PID {}), awaiting handshake", name, pid);

        let registry = match AgentRegistry::new(&self.blackboard_dir) {
            Ok(registry) => registry,
            Err(e) => return Ok(format!("Error: registry unavailable: {}", e)),
        };
        if let Err(e) = registry.record_spawn(name, role, pid, goal) {
            warn!("failed to record STARTING row for '{}': {}", name, e);
        }

        if !self.wait_for_agent_ready(&registry, name).await {
            Self::cleanup_failed_spawn(&registry, &mut child, name).await;
            return Ok(format!(
                "Error: Agent '{}' failed to start within timeout. Process cleaned up.",
                name
            ));
        }

        Ok(format!(
            "Success: Spawned agent '{}' (PID: {}) and verified RUNNING status. Log: {}",
            name,
            pid,
            log_path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_arguments_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SpawnSwarmAgentTool::new(dir.path());
        let result = tool.execute(json!({"name": "X"})).await.unwrap();
        assert!(result.starts_with("Error:"));
    }

    #[tokio::test]
    async fn handshake_observes_running_row() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SpawnSwarmAgentTool::new(dir.path());
        let registry = AgentRegistry::new(dir.path()).unwrap();
        registry.record_spawn("Coder", "Engineer", 123, "goal").unwrap();

        let flipper = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                registry.register_agent("Coder", "Engineer", 123).unwrap();
            })
        };

        assert!(tool.wait_for_agent_ready(&registry, "Coder").await);
        flipper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_without_running_row() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SpawnSwarmAgentTool::new(dir.path());
        let registry = AgentRegistry::new(dir.path()).unwrap();
        registry.record_spawn("Slow", "Engineer", 123, "goal").unwrap();
        assert!(!tool.wait_for_agent_ready(&registry, "Slow").await);
    }
}

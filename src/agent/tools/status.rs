use crate::agent::tools::base::Tool;
use crate::blackboard::Blackboard;
use crate::blackboard::plan::TaskStatus;
use crate::registry::AgentRegistry;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Introspection for the overseer: verified agent liveness plus plan
/// progress in one call. Used to decide between waiting, re-spawning, and
/// intervening.
pub struct SwarmStatusTool {
    board: Blackboard,
}

impl SwarmStatusTool {
    pub fn new(board: Blackboard) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Tool for SwarmStatusTool {
    fn name(&self) -> &str {
        "check_swarm_status"
    }

    fn description(&self) -> String {
        "Returns the comprehensive status of the Swarm: agent liveness (PID-verified registry) and central plan progress (task counts per status). Use this to decide whether to Wait, Spawn (Recover), or Intervene.".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}, "required": []})
    }

    async fn execute(&self, _params: Value) -> anyhow::Result<String> {
        let board = self.board.clone();
        let report = tokio::task::spawn_blocking(move || {
            let agents = AgentRegistry::new(board.root())
                .map(|r| r.verify_and_sync_pids())
                .unwrap_or_default();

            let plan_summary = match board.read_plan() {
                Ok(Some(plan)) => {
                    let count = |status: TaskStatus| {
                        plan.tasks.iter().filter(|t| t.status == status).count()
                    };
                    json!({
                        "mission_goal": plan.mission_goal,
                        "status": plan.status,
                        "total_tasks": plan.tasks.len(),
                        "pending": count(TaskStatus::Pending),
                        "in_progress": count(TaskStatus::InProgress),
                        "done": count(TaskStatus::Done),
                        "blocked": count(TaskStatus::Blocked),
                    })
                }
                _ => json!("No central plan found."),
            };

            json!({"agents": agents, "plan": plan_summary})
        })
        .await?;

        Ok(serde_json::to_string_pretty(&report)?)
    }
}

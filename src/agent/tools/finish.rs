use crate::agent::tools::base::{Tool, ToolContext};
use crate::blackboard::Blackboard;
use crate::blackboard::plan::{CentralPlan, TaskStatus};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::RwLock;

const PREVIEW_TASKS: usize = 5;

#[derive(Default, Clone)]
struct FinishIdentity {
    agent_name: Option<String>,
    is_architect: bool,
}

/// Signals task completion. The pre-check blocks premature exits: the
/// Architect may not finish while any task is open, a worker may not finish
/// with its own tasks still IN_PROGRESS. A blocked result is downgraded to
/// `wait` by the engine so the loop continues.
pub struct FinishTool {
    board: Blackboard,
    identity: RwLock<FinishIdentity>,
}

impl FinishTool {
    pub fn new(board: Blackboard) -> Self {
        Self {
            board,
            identity: RwLock::new(FinishIdentity::default()),
        }
    }

    fn check_incomplete_tasks(&self, plan: &CentralPlan) -> Option<String> {
        let identity = self.identity.read().ok()?.clone();

        if identity.is_architect {
            let incomplete: Vec<_> = plan
                .tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Done)
                .collect();
            if incomplete.is_empty() {
                return None;
            }
            let task_list: Vec<String> = incomplete
                .iter()
                .take(PREVIEW_TASKS)
                .map(|t| {
                    let desc: String = t.description.chars().take(80).collect();
                    format!("  - Task #{}: {} [{}]", t.id, desc, t.status)
                })
                .collect();
            let more = if incomplete.len() > PREVIEW_TASKS {
                format!("\n  ... and {} more", incomplete.len() - PREVIEW_TASKS)
            } else {
                String::new()
            };
            return Some(format!(
                "BLOCKED: There are {} incomplete task(s) in the central plan.\n\n{}{}\n\nAs the Architect, you MUST ensure all tasks are DONE before calling finish.\n\nOptions:\n- Wait for Workers to complete tasks (use the wait tool)\n- Spawn new Workers for PENDING tasks (use spawn_swarm_agent)\n- Mark tasks as DONE if they are actually complete (use blackboard update_task)\n\nDo NOT call finish until all tasks are resolved.",
                incomplete.len(),
                task_list.join("\n"),
                more
            ));
        }

        let agent_name = identity.agent_name?;
        let in_progress: Vec<_> = plan
            .tasks
            .iter()
            .filter(|t| t.assignees.contains(&agent_name) && t.status == TaskStatus::InProgress)
            .collect();
        if in_progress.is_empty() {
            return None;
        }
        let task_list: Vec<String> = in_progress
            .iter()
            .map(|t| {
                let desc: String = t.description.chars().take(80).collect();
                format!("  - Task #{}: {}", t.id, desc)
            })
            .collect();
        Some(format!(
            "BLOCKED: You have {} IN_PROGRESS task(s) that are not marked as DONE.\n\n{}\n\nYou MUST call blackboard update_task to mark them as DONE (with a result_summary and artifact_link) before calling finish.\n\nDo NOT call finish until all your assigned tasks are marked as DONE.",
            in_progress.len(),
            task_list.join("\n")
        ))
    }
}

#[async_trait]
impl Tool for FinishTool {
    fn name(&self) -> &str {
        "finish"
    }

    fn description(&self) -> String {
        "Call this function to signal that you have completed your task or objective. Provide a comprehensive paragraph describing the reason and output. If your work resulted in new or modified files, you MUST explicitly mention them and provide their absolute paths within this description.".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "A detailed paragraph summarizing the reason for finishing and the process."
                },
                "output": {
                    "type": "string",
                    "description": "A detailed paragraph summarizing the work and any produced artifacts/file paths."
                }
            },
            "required": ["output"]
        })
    }

    fn configure(&self, ctx: &ToolContext) {
        if let Ok(mut identity) = self.identity.write() {
            identity.agent_name.clone_from(&ctx.agent_name);
            identity.is_architect = ctx.is_architect;
        }
    }

    async fn execute(&self, params: Value) -> anyhow::Result<String> {
        // A broken or missing plan must not trap the agent here.
        if let Ok(Some(plan)) = self.board.read_plan()
            && !plan.tasks.is_empty()
            && let Some(blocked) = self.check_incomplete_tasks(&plan)
        {
            return Ok(blocked);
        }

        let output = params.get("output").and_then(Value::as_str).unwrap_or_default();
        let reason = params
            .get("reason")
            .and_then(Value::as_str)
            .map(|r| format!("Reason: {}\n\n", r))
            .unwrap_or_default();
        Ok(format!(
            "Agent Finished.\n\n{}===========================\n\nOutput: {}",
            reason, output
        ))
    }
}

use super::{ChunkInterceptor, Middleware, Next, intercept, wait_arguments};
use crate::agent::session::AgentSession;
use crate::blackboard::Blackboard;
use crate::blackboard::plan::TaskStatus;
use crate::providers::base::{ChunkStream, StreamChunk};
use crate::utils::json_repair::repair_truncated_json;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Enforces the dependency rules on outbound `update_task` intents.
///
/// Before each call it runs the passive auto-fix pass (auto-unblock +
/// single-assignee truncation) on the plan. The returned stream is wrapped:
/// tool-call fragments are buffered per index, `update_task` intents are
/// validated against the live plan, and a violating call is rewritten in
/// place into a `wait` so the agent backs off instead of corrupting state.
pub struct DependencyGuard {
    board: Blackboard,
}

impl DependencyGuard {
    pub fn new(board: Blackboard) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Middleware for DependencyGuard {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        if let Err(e) = self.board.run_auto_fix() {
            warn!("dependency guard auto-fix failed: {}", e);
        }
        let inner = next.run(session).await?;
        Ok(intercept(
            inner,
            GuardInterceptor {
                board: self.board.clone(),
                buffer: BTreeMap::new(),
            },
        ))
    }
}

#[derive(Default)]
struct BufferedCall {
    id: String,
    name: String,
    arguments: String,
}

struct GuardInterceptor {
    board: Blackboard,
    buffer: BTreeMap<usize, BufferedCall>,
}

impl GuardInterceptor {
    fn absorb(&mut self, chunk: &StreamChunk) {
        for tc in &chunk.tool_calls {
            let entry = self.buffer.entry(tc.index).or_default();
            if let Some(id) = &tc.id {
                entry.id.clone_from(id);
            }
            if let Some(name) = &tc.name {
                entry.name.push_str(name);
            }
            if let Some(arguments) = &tc.arguments {
                entry.arguments.push_str(arguments);
            }
        }
    }

    fn flush(&mut self, out: &mut VecDeque<StreamChunk>) {
        let buffer = std::mem::take(&mut self.buffer);
        for (index, call) in buffer {
            out.push_back(self.process_call(index, call));
        }
    }

    /// Validate one assembled call, rewriting it to `wait` on violation.
    fn process_call(&self, index: usize, call: BufferedCall) -> StreamChunk {
        if let Some(reason) = self.violation_for(&call) {
            warn!("blocked task update: {}", reason);
            let arguments = wait_arguments(
                5.0,
                false,
                &format!("BLOCKED BY GUARD: {}. Please check dependencies.", reason),
            );
            return StreamChunk::tool_call(call.id, "wait", arguments, index);
        }
        StreamChunk::tool_call(call.id, call.name, call.arguments, index)
    }

    fn violation_for(&self, call: &BufferedCall) -> Option<String> {
        if call.name != "blackboard" && call.name != "update_task" {
            return None;
        }
        let Some((_, args)) = repair_truncated_json(&call.arguments) else {
            warn!("malformed tool-call JSON could not be repaired: {}", call.arguments);
            return None;
        };
        if call.name == "blackboard" && args.get("operation").and_then(Value::as_str) != Some("update_task")
        {
            return None;
        }

        let task_id = args.get("task_id").and_then(Value::as_i64)?;
        let updates = args.get("updates").cloned().unwrap_or(Value::Null);

        let plan = match self.board.read_plan() {
            Ok(Some(plan)) => plan,
            Ok(None) => return None,
            Err(e) => {
                debug!("dependency guard could not load plan: {}", e);
                return None;
            }
        };

        if updates.get("status").and_then(Value::as_str) == Some("IN_PROGRESS") {
            let task = plan.task(task_id)?;
            for dep in &task.dependencies {
                if let Some(dep_task) = plan.task(*dep)
                    && dep_task.status != TaskStatus::Done
                {
                    return Some(format!(
                        "Dependency Task {} ('{}') is not DONE (Status: {})",
                        dep, dep_task.description, dep_task.status
                    ));
                }
            }
        }

        if let Some(assignees) = updates.get("assignees").and_then(Value::as_array)
            && assignees.len() > 1
            && plan
                .task(task_id)
                .is_some_and(|t| t.task_type == crate::blackboard::plan::TaskType::Standard)
        {
            return Some("Cannot assign multiple agents to a standard task.".to_string());
        }

        None
    }
}

impl ChunkInterceptor for GuardInterceptor {
    fn on_chunk(&mut self, chunk: StreamChunk, out: &mut VecDeque<StreamChunk>) {
        if chunk.has_tool_calls() {
            // Buffering: fragments are withheld until we can see whole calls.
            self.absorb(&chunk);
            return;
        }
        if !self.buffer.is_empty() {
            self.flush(out);
        }
        out.push_back(chunk);
    }

    fn on_end(&mut self, out: &mut VecDeque<StreamChunk>) {
        if !self.buffer.is_empty() {
            self.flush(out);
        }
    }
}

#[cfg(test)]
mod tests;

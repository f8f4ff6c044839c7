use super::{ChunkInterceptor, Middleware, Next, intercept};
use crate::agent::session::AgentSession;
use crate::blackboard::Blackboard;
use crate::providers::base::{ChunkStream, StreamChunk};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use serde_json::Value;
use std::collections::VecDeque;
use tracing::error;

/// Tool calls worth broadcasting to the rest of the swarm.
const SIGNIFICANT_TOOLS: &[&str] = &["update_task", "create_index", "create_resource", "update_index"];

/// Watches the outbound chunk stream for significant tool calls and appends
/// a one-line human summary to the shared notification stream. The entry
/// records the *intent* — it is written when the call is observed, before
/// any result exists.
pub struct ActivityLogger {
    agent_name: String,
    board: Blackboard,
}

impl ActivityLogger {
    pub fn new(agent_name: impl Into<String>, board: Blackboard) -> Self {
        Self {
            agent_name: agent_name.into(),
            board,
        }
    }
}

#[async_trait]
impl Middleware for ActivityLogger {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        let inner = next.run(session).await?;
        Ok(intercept(
            inner,
            LoggerInterceptor {
                agent_name: self.agent_name.clone(),
                board: self.board.clone(),
            },
        ))
    }
}

struct LoggerInterceptor {
    agent_name: String,
    board: Blackboard,
}

impl ChunkInterceptor for LoggerInterceptor {
    fn on_chunk(&mut self, chunk: StreamChunk, out: &mut VecDeque<StreamChunk>) {
        for tc in &chunk.tool_calls {
            if let Some(name) = tc.name.as_deref()
                && SIGNIFICANT_TOOLS.contains(&name)
            {
                log_activity(
                    &self.board,
                    &self.agent_name,
                    name,
                    tc.arguments.as_deref().unwrap_or_default(),
                );
            }
        }
        out.push_back(chunk);
    }

    fn on_end(&mut self, _out: &mut VecDeque<StreamChunk>) {}
}

fn snippet(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > max {
        let head: String = flat.chars().take(max).collect();
        format!("{}... [truncated]", head)
    } else {
        flat
    }
}

fn log_activity(board: &Blackboard, agent_name: &str, tool_name: &str, args_str: &str) {
    let args: Value = serde_json::from_str(args_str).unwrap_or(Value::Null);

    let summary = match tool_name {
        "update_task" => {
            let task_id = args.get("task_id").cloned().unwrap_or(Value::Null);
            let updates = args.get("updates").cloned().unwrap_or(Value::Null);
            let status_change = updates
                .get("status")
                .and_then(Value::as_str)
                .map(|s| format!("Status->{}", s))
                .unwrap_or_default();
            let details = updates
                .get("comments")
                .and_then(Value::as_str)
                .map(|c| format!(" | Comment: '{}'", snippet(c, 100)))
                .unwrap_or_default();
            format!("Updated Task #{}. {}{}", task_id, status_change, details)
        }
        "create_index" => format!(
            "Created Topic '{}': \"{}\"",
            args.get("filename").and_then(Value::as_str).unwrap_or("?"),
            snippet(args.get("content").and_then(Value::as_str).unwrap_or(""), 150)
        ),
        "create_resource" => format!(
            "Created Resource '{}'. Preview: \"{}\"",
            args.get("filename").and_then(Value::as_str).unwrap_or("?"),
            snippet(args.get("content").and_then(Value::as_str).unwrap_or(""), 50)
        ),
        "update_index" => format!(
            "Posted to '{}': \"{}\"",
            args.get("filename").and_then(Value::as_str).unwrap_or("?"),
            snippet(args.get("content").and_then(Value::as_str).unwrap_or(""), 150)
        ),
        _ => return,
    };

    let timestamp = Local::now().format("%H:%M:%S");
    let entry = format!("[{}] [{}] {}\n", timestamp, agent_name, summary);
    if let Err(e) = board.append_notification(&entry) {
        error!("activity log write failed: {}", e);
    }
}

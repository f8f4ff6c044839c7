use super::{ChunkInterceptor, Middleware, Next, intercept, new_call_id, wait_arguments};
use crate::agent::session::AgentSession;
use crate::providers::base::{ChunkStream, StreamChunk};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::info;

const GUARD_REASON: &str = "### [SYSTEM GUARD]\nYou did not call any tools. If your task is complete, you MUST call the `finish` tool. Otherwise, use appropriate tools to move forward. If you are waiting for something, use the `wait` tool explicitly.";

/// Keeps a worker from silently idling: a turn that produced no tool call
/// gets a synthesized `wait` appended, nudging the agent to either continue
/// or call `finish` explicitly.
pub struct SwarmAgentGuard {
    agent_name: String,
}

impl SwarmAgentGuard {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
        }
    }
}

#[async_trait]
impl Middleware for SwarmAgentGuard {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        let inner = next.run(session).await?;
        Ok(intercept(
            inner,
            GuardInterceptor {
                agent_name: self.agent_name.clone(),
                saw_tool_calls: false,
            },
        ))
    }
}

struct GuardInterceptor {
    agent_name: String,
    saw_tool_calls: bool,
}

impl ChunkInterceptor for GuardInterceptor {
    fn on_chunk(&mut self, chunk: StreamChunk, out: &mut VecDeque<StreamChunk>) {
        if chunk.has_tool_calls() {
            self.saw_tool_calls = true;
        }
        out.push_back(chunk);
    }

    fn on_end(&mut self, out: &mut VecDeque<StreamChunk>) {
        if !self.saw_tool_calls {
            info!(
                "[{}] guard triggered: no tool call detected, injecting 'wait'",
                self.agent_name
            );
            out.push_back(StreamChunk::tool_call(
                new_call_id(),
                "wait",
                wait_arguments(0.5, true, GUARD_REASON),
                0,
            ));
        }
    }
}

use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::providers::base::ChunkStream;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

/// Rewrites a trailing `ask_user` tool exchange into a natural
/// assistant-question / user-answer pair, so the model experiences a direct
/// conversation instead of a tool transcript. The rewritten user message is
/// tagged so guards (watchdog plan verification) still recognize it.
pub struct InteractionRefinement;

#[async_trait]
impl Middleware for InteractionRefinement {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        refine_last_exchange(session);
        next.run(session).await
    }
}

fn refine_last_exchange(session: &mut AgentSession) {
    let len = session.history.len();
    if len < 2 {
        return;
    }

    let is_pattern = {
        let prev = &session.history[len - 2];
        let last = &session.history[len - 1];
        prev.is_assistant()
            && last.role == "tool"
            && last.name.as_deref() == Some("ask_user")
            && prev
                .tool_calls
                .as_ref()
                .and_then(|calls| calls.first())
                .is_some_and(|tc| Some(tc.id.as_str()) == last.tool_call_id.as_deref())
    };
    if !is_pattern {
        return;
    }

    let question = session.history[len - 2]
        .tool_calls
        .as_ref()
        .and_then(|calls| calls.first())
        .map(|tc| {
            serde_json::from_str::<serde_json::Value>(&tc.arguments)
                .ok()
                .and_then(|v| v.get("question").and_then(|q| q.as_str()).map(String::from))
                .unwrap_or_else(|| tc.arguments.clone())
        })
        .unwrap_or_default();
    let answer = session.history[len - 1].content_str().to_string();

    let prev = &mut session.history[len - 2];
    prev.content = Some(question);
    prev.tool_calls = None;

    let last = &mut session.history[len - 1];
    last.role = "user".to_string();
    last.content = Some(answer);
    last.tool_call_id = None;
    last.name = None;
    last.metadata = Some(json!({"from_tool_call": "ask_user"}));

    info!("refined interaction history for ask_user");
}

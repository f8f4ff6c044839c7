use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::errors::classify;
use crate::providers::base::{ChunkStream, Message};
use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

/// How many trailing messages survive a compaction pass.
const KEEP_RECENT: usize = 4;
/// Compaction is pointless below this history size.
const MIN_HISTORY_FOR_COMPACTION: usize = 8;
const PREVIEW_CHARS: usize = 80;

/// Outermost recovery layer: when the provider rejects the request for
/// context-window overflow, compact the oldest history into a summary
/// message and retry once.
pub struct ContextOverflow;

#[async_trait]
impl Middleware for ContextOverflow {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        match next.run(session).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                let (_, is_context) = classify(&e);
                if !is_context || !compact_history(session) {
                    return Err(e);
                }
                warn!("context length exceeded; compacted history and retrying");
                next.run(session).await
            }
        }
    }
}

/// Drop the middle of the history, keeping the opening instruction and the
/// recent tail, and leave a summary of what was removed in between. Returns
/// false when the history is too short to help.
fn compact_history(session: &mut AgentSession) -> bool {
    if session.history.len() < MIN_HISTORY_FOR_COMPACTION {
        return false;
    }

    let mut tail_start = session.history.len() - KEEP_RECENT;
    // A tool result must not survive without the assistant call it answers.
    while tail_start < session.history.len() && session.history[tail_start].role == "tool" {
        tail_start += 1;
    }
    if tail_start <= 1 {
        return false;
    }

    let removed = &session.history[1..tail_start];
    let mut lines = Vec::with_capacity(removed.len());
    for msg in removed {
        let label = match (msg.role.as_str(), &msg.tool_calls, &msg.name) {
            ("assistant", Some(calls), _) if !calls.is_empty() => {
                format!("assistant called {}", calls[0].name)
            }
            ("tool", _, Some(name)) => format!("{} result", name),
            (role, _, _) => role.to_string(),
        };
        let preview: String = msg.content_str().chars().take(PREVIEW_CHARS).collect();
        lines.push(format!("- {}: {}", label, preview));
    }

    let summary = Message::user(format!(
        "[Earlier conversation compacted to fit the context window: {} messages removed]\n{}",
        removed.len(),
        lines.join("\n")
    ));

    let mut compacted = Vec::with_capacity(KEEP_RECENT + 2);
    compacted.push(session.history[0].clone());
    compacted.push(summary);
    compacted.extend(session.history[tail_start..].iter().cloned());
    session.history = compacted;
    true
}

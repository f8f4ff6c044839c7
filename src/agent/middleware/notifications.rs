use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::blackboard::Blackboard;
use crate::providers::base::ChunkStream;
use anyhow::Result;
use async_trait::async_trait;
use tracing::error;

const NOTIFICATIONS_HEADER: &str = "## RECENT NOTIFICATIONS (SWARM HEARTBEAT)";
const DEFAULT_CONTEXT_LINES: usize = 20;
const MAX_SECTION_CHARS: usize = 5000;

/// Splices the tail of the shared notification stream into the system
/// prompt so the agent stays aware of sibling activity, replacing the
/// previous copy in place.
pub struct NotificationAwareness {
    board: Blackboard,
    context_lines: usize,
}

impl NotificationAwareness {
    pub fn new(board: Blackboard) -> Self {
        Self {
            board,
            context_lines: DEFAULT_CONTEXT_LINES,
        }
    }

    fn inject_notifications(&self, session: &mut AgentSession) {
        let tail = match self.board.tail_notifications(self.context_lines, MAX_SECTION_CHARS) {
            Ok(Some(tail)) => tail,
            Ok(None) => return,
            Err(e) => {
                error!("failed to read notifications: {}", e);
                return;
            }
        };
        let section = format!(
            "{}\nThese are the latest actions performed by other agents. Check if you are mentioned (@Role) or if a topic regarding you is updated.\n\n```text\n{}\n```",
            NOTIFICATIONS_HEADER, tail
        );
        session
            .system_config
            .upsert_section(NOTIFICATIONS_HEADER, section, false);
    }
}

#[async_trait]
impl Middleware for NotificationAwareness {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        self.inject_notifications(session);
        next.run(session).await
    }
}

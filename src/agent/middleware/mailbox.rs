use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::mailbox::Mailbox;
use crate::providers::base::{ChunkStream, Message};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The fixed self-reflection line injected ahead of a mailbox intervention,
/// so the transcript reads as the agent noticing the message on its own.
const SELF_REFLECTION: &str = "A message has arrived in my mailbox. Let me read it, follow the guidance it contains, and then continue my task.";

/// Drains the agent's mailbox before each LLM call, splicing each unread
/// message into the history as an assistant acknowledgment followed by a
/// user message tagged with its mailbox origin.
pub struct MailboxMiddleware {
    agent_name: String,
    mailbox: Option<Mailbox>,
    logs_dir: PathBuf,
}

impl MailboxMiddleware {
    pub fn new(agent_name: impl Into<String>, blackboard_dir: &Path) -> Self {
        let mailbox = Mailbox::new(blackboard_dir)
            .map_err(|e| warn!("mailbox unavailable: {}", e))
            .ok();
        Self {
            agent_name: agent_name.into(),
            mailbox,
            logs_dir: blackboard_dir.join("logs"),
        }
    }

    fn inject_mail(&self, session: &mut AgentSession) {
        let Some(mailbox) = &self.mailbox else {
            return;
        };
        let drained = match mailbox.drain_unread(&self.agent_name) {
            Ok(drained) => drained,
            Err(e) => {
                warn!("error processing mailbox: {}", e);
                return;
            }
        };
        if drained.is_empty() {
            return;
        }

        for msg in &drained {
            let preview: String = msg.content.chars().take(50).collect();
            info!("mailbox intervention: {}...", preview);

            session.history.push(Message::assistant(SELF_REFLECTION));
            let mut user = Message::user(msg.content.clone());
            user.metadata = Some(json!({"source": "mailbox"}));
            session.history.push(user);
        }

        self.log_interventions(&drained);
    }

    /// Intervention events land in the agent's JSONL trace for the monitor UI.
    fn log_interventions(&self, drained: &[crate::mailbox::MailMessage]) {
        use std::io::Write;
        if std::fs::create_dir_all(&self.logs_dir).is_err() {
            return;
        }
        let path = self.logs_dir.join(format!("{}.jsonl", self.agent_name));
        let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path)
        else {
            debug!("failed to open intervention log");
            return;
        };
        for msg in drained {
            let entry = json!({
                "timestamp": crate::utils::unix_time_secs(),
                "type": "intervention",
                "data": {"role": "user", "content": msg.content},
            });
            let _ = writeln!(file, "{}", entry);
        }
    }
}

#[async_trait]
impl Middleware for MailboxMiddleware {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        self.inject_mail(session);
        next.run(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MailMessage;

    #[test]
    fn injects_reflection_and_user_pair() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path()).unwrap();
        mailbox
            .push("Coder", MailMessage::new("switch to task 4"))
            .unwrap();

        let mw = MailboxMiddleware::new("Coder", dir.path());
        let mut session = AgentSession::default();
        mw.inject_mail(&mut session);

        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[0].role, "assistant");
        assert_eq!(session.history[1].role, "user");
        assert_eq!(session.history[1].content_str(), "switch to task 4");
        assert_eq!(session.history[1].metadata_str("source"), Some("mailbox"));

        // The message was flipped to read; a second pass injects nothing.
        let mut session2 = AgentSession::default();
        mw.inject_mail(&mut session2);
        assert!(session2.history.is_empty());
    }

    #[test]
    fn writes_intervention_trace() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path()).unwrap();
        mailbox.push("Coder", MailMessage::new("note")).unwrap();

        let mw = MailboxMiddleware::new("Coder", dir.path());
        let mut session = AgentSession::default();
        mw.inject_mail(&mut session);

        let trace = std::fs::read_to_string(dir.path().join("logs/Coder.jsonl")).unwrap();
        assert!(trace.contains("\"intervention\""));
        assert!(trace.contains("note"));
    }

    #[test]
    fn empty_mailbox_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mw = MailboxMiddleware::new("Coder", dir.path());
        let mut session = AgentSession::default();
        mw.inject_mail(&mut session);
        assert!(session.history.is_empty());
    }
}

use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::providers::base::ChunkStream;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info};

const DEFAULT_DELAY_TURNS: usize = 5;
const DEFAULT_SIZE_THRESHOLD: usize = 5000;
const PREVIEW_HEAD: usize = 500;
const PREVIEW_TAIL: usize = 200;
const CACHE_MARKER: &str = "[Cached to file:";

/// Spills old oversized tool results to per-session cache files, replacing
/// them in the history with a head+tail preview and the file path. A result
/// is only spilled once it has been resident for `delay_turns` assistant
/// turns, so recent output stays verbatim.
pub struct ToolResultCache {
    delay_turns: usize,
    size_threshold: usize,
    cache_dir: PathBuf,
    cached_files: Mutex<Vec<PathBuf>>,
}

impl ToolResultCache {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        let session_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            delay_turns: DEFAULT_DELAY_TURNS,
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            cache_dir: cache_root.into().join(".agent_cache").join(session_id),
            cached_files: Mutex::new(Vec::new()),
        }
    }

    fn generate_preview(&self, content: &str) -> String {
        let chars: Vec<char> = content.chars().collect();
        if chars.len() <= PREVIEW_HEAD + PREVIEW_TAIL + 20 {
            return content.to_string();
        }
        let head: String = chars[..PREVIEW_HEAD].iter().collect();
        let tail: String = chars[chars.len() - PREVIEW_TAIL..].iter().collect();
        format!(
            "{}\n...[TRUNCATED {} chars]...\n{}",
            head,
            chars.len() - PREVIEW_HEAD - PREVIEW_TAIL,
            tail
        )
    }

    fn cache_to_file(&self, tool_name: &str, tool_call_id: &str, content: &str) -> Option<PathBuf> {
        if std::fs::create_dir_all(&self.cache_dir).is_err() {
            return None;
        }
        let id_prefix: String = tool_call_id.chars().take(8).collect();
        let path = self.cache_dir.join(format!("{}_{}.txt", tool_name, id_prefix));
        // The same result can show up again after a retry; don't re-write.
        if let Ok(files) = self.cached_files.lock()
            && files.contains(&path)
        {
            return Some(path);
        }
        if std::fs::write(&path, content).is_err() {
            return None;
        }
        if let Ok(mut files) = self.cached_files.lock() {
            files.push(path.clone());
        }
        Some(path)
    }

    fn compress_history(&self, session: &mut AgentSession) {
        let total = session.history.len();
        // Assistant turns after position i, computed from the back.
        let mut turns_after = vec![0usize; total];
        let mut count = 0;
        for i in (0..total).rev() {
            turns_after[i] = count;
            if session.history[i].is_assistant() {
                count += 1;
            }
        }

        for i in 0..total {
            let msg = &session.history[i];
            if msg.role != "tool" {
                continue;
            }
            let content = msg.content_str();
            if content.starts_with(CACHE_MARKER) || content.chars().count() < self.size_threshold {
                continue;
            }
            if turns_after[i] < self.delay_turns {
                continue;
            }

            let tool_name = msg.name.clone().unwrap_or_else(|| "unknown".to_string());
            let call_id = msg.tool_call_id.clone().unwrap_or_default();
            let content = content.to_string();
            let Some(path) = self.cache_to_file(&tool_name, &call_id, &content) else {
                continue;
            };
            let preview = self.generate_preview(&content);
            session.history[i].content = Some(format!(
                "{} {}]\nOriginal length: {} chars\n\nPreview:\n{}\n\nTo read full content, use: cat {}",
                CACHE_MARKER,
                path.display(),
                content.chars().count(),
                preview,
                path.display()
            ));
            info!("cached tool result to {} ({} chars)", path.display(), content.len());
        }
    }
}

#[async_trait]
impl Middleware for ToolResultCache {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        self.compress_history(session);
        next.run(session).await
    }

    fn cleanup(&self) {
        if self.cache_dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&self.cache_dir)
        {
            error!("failed to clean up cache directory: {}", e);
        }
        // Remove the shared parent too, when this was the last session.
        if let Some(parent) = self.cache_dir.parent() {
            let _ = std::fs::remove_dir(parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::Message;

    fn session_with_big_result(turns_after: usize) -> AgentSession {
        let mut session = AgentSession::default();
        session.history.push(Message::user("go"));
        session
            .history
            .push(Message::tool_result("call_big1", "web_reader", "z".repeat(9000)));
        for _ in 0..turns_after {
            session.history.push(Message::assistant("thinking"));
        }
        session
    }

    #[test]
    fn old_oversized_result_is_spilled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolResultCache::new(dir.path());
        let mut session = session_with_big_result(5);

        cache.compress_history(&mut session);

        let content = session.history[1].content_str();
        assert!(content.starts_with(CACHE_MARKER));
        assert!(content.contains("Original length: 9000 chars"));
        assert!(content.contains("TRUNCATED"));

        // The spilled file holds the full payload.
        let path = content
            .lines()
            .next()
            .unwrap()
            .trim_start_matches(CACHE_MARKER)
            .trim()
            .trim_end_matches(']');
        assert_eq!(std::fs::read_to_string(path).unwrap().len(), 9000);
    }

    #[test]
    fn recent_result_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolResultCache::new(dir.path());
        let mut session = session_with_big_result(2);
        cache.compress_history(&mut session);
        assert!(!session.history[1].content_str().starts_with(CACHE_MARKER));
    }

    #[test]
    fn small_result_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolResultCache::new(dir.path());
        let mut session = AgentSession::default();
        session
            .history
            .push(Message::tool_result("call_1", "wait", "short"));
        for _ in 0..6 {
            session.history.push(Message::assistant("a"));
        }
        cache.compress_history(&mut session);
        assert_eq!(session.history[0].content_str(), "short");
    }

    #[test]
    fn already_cached_result_not_respilled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolResultCache::new(dir.path());
        let mut session = session_with_big_result(5);
        cache.compress_history(&mut session);
        let once = session.history[1].content_str().to_string();
        cache.compress_history(&mut session);
        assert_eq!(session.history[1].content_str(), once);
    }

    #[test]
    fn cleanup_removes_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolResultCache::new(dir.path());
        let mut session = session_with_big_result(5);
        cache.compress_history(&mut session);
        assert!(cache.cache_dir.exists());
        cache.cleanup();
        assert!(!cache.cache_dir.exists());
    }
}

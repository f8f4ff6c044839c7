use crate::agent::tools::base::{Tool, ToolContext};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pauses execution, optionally waking early when the blackboard changes.
/// Watches both `global_indices/` (task updates from other agents) and the
/// agent's own mailbox file.
pub struct WaitTool {
    watch_dir: PathBuf,
    mailboxes_dir: PathBuf,
    agent_name: RwLock<Option<String>>,
}

impl WaitTool {
    pub fn new(blackboard_dir: &Path) -> Self {
        Self {
            watch_dir: blackboard_dir.join("global_indices"),
            mailboxes_dir: blackboard_dir.join("mailboxes"),
            agent_name: RwLock::new(None),
        }
    }

    fn mailbox_path(&self) -> Option<PathBuf> {
        let name = self.agent_name.read().ok()?.clone()?;
        Some(self.mailboxes_dir.join(format!("{}.json", name)))
    }

    /// Latest mtime across the watched locations, as fractional seconds.
    fn max_mtime(&self) -> f64 {
        let mut max = 0.0f64;
        let mut consider = |path: &Path| {
            if let Ok(meta) = std::fs::metadata(path)
                && let Ok(modified) = meta.modified()
                && let Ok(age) = modified.duration_since(std::time::UNIX_EPOCH)
            {
                max = max.max(age.as_secs_f64());
            }
        };

        consider(&self.watch_dir);
        if let Ok(entries) = std::fs::read_dir(&self.watch_dir) {
            for entry in entries.flatten() {
                if entry.file_type().is_ok_and(|t| t.is_file()) {
                    consider(&entry.path());
                }
            }
        }
        if let Some(mailbox) = self.mailbox_path() {
            consider(&mailbox);
        }
        max
    }
}

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> String {
        r"Pause execution.
Can simply sleep for a duration, OR wait until new activity is detected in global_indices or your mailbox.
Monitors:
  - global_indices/ (task updates from other agents)
  - mailboxes/{your_name}.json (messages sent to you)
Use this when you are waiting for other agents to reply or post tasks."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "duration": {
                    "type": "number",
                    "default": 15,
                    "description": "Maximum wait time in seconds (strictly <= 15s)."
                },
                "wait_for_new_index": {
                    "type": "boolean",
                    "default": true,
                    "description": "If true, returns early if any file in global_indices is modified."
                },
                "reason": {
                    "type": "string",
                    "description": "Optional reason for waiting (used for logging/protocol enforcement)."
                }
            }
        })
    }

    fn configure(&self, ctx: &ToolContext) {
        if let Ok(mut name) = self.agent_name.write() {
            name.clone_from(&ctx.agent_name);
        }
    }

    async fn execute(&self, params: Value) -> anyhow::Result<String> {
        let duration = params
            .get("duration")
            .and_then(Value::as_f64)
            .unwrap_or(15.0)
            .max(0.0);
        let wait_for_new_index = params
            .get("wait_for_new_index")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let prefix = params
            .get("reason")
            .and_then(Value::as_str)
            .map(|r| format!("[Reason: {}] ", r))
            .unwrap_or_default();

        if !wait_for_new_index {
            tokio::time::sleep(Duration::from_secs_f64(duration)).await;
            return Ok(format!("{}Waited for {} seconds.", prefix, duration));
        }

        let initial = self.max_mtime();
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(duration);
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL.min(deadline - tokio::time::Instant::now())).await;
            let current = self.max_mtime();
            if current > initial {
                let location = match self.mailbox_path() {
                    Some(mailbox)
                        if std::fs::metadata(&mailbox)
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .is_some_and(|age| age.as_secs_f64() >= initial) =>
                    {
                        "Mailbox"
                    }
                    _ => "Global Indices",
                };
                return Ok(format!(
                    "{}New activity detected in {}! Waking up.",
                    prefix, location
                ));
            }
        }

        Ok(format!(
            "{}No new activity detected after {} seconds.",
            prefix, duration
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_sleep_returns_after_duration() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WaitTool::new(dir.path());
        let result = tool
            .execute(json!({"duration": 0.05, "wait_for_new_index": false, "reason": "test"}))
            .await
            .unwrap();
        assert!(result.starts_with("[Reason: test] Waited for"));
    }

    #[tokio::test]
    async fn wakes_on_index_activity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("global_indices")).unwrap();
        let tool = WaitTool::new(dir.path());

        let indices = dir.path().join("global_indices");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            std::fs::write(indices.join("new_topic.md"), "x").unwrap();
        });

        let result = tool
            .execute(json!({"duration": 10, "wait_for_new_index": true}))
            .await
            .unwrap();
        writer.await.unwrap();
        assert!(result.contains("New activity detected"));
    }

    #[tokio::test]
    async fn times_out_quietly_without_activity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("global_indices")).unwrap();
        let tool = WaitTool::new(dir.path());
        let result = tool
            .execute(json!({"duration": 1.2, "wait_for_new_index": true}))
            .await
            .unwrap();
        assert!(result.contains("No new activity detected"));
    }
}

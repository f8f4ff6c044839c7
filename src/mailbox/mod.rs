use crate::blackboard::lock::{LockError, LockedFile};
use crate::utils::unix_time_secs;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const MAILBOX_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default budget for a blocking permission request before it times out
/// (timeout is treated as denial).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const REQUEST_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed mailbox content: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub timestamp: String,
    #[serde(default = "default_role")]
    pub role: String,
    pub content: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_role() -> String {
    "user".to_string()
}

fn default_status() -> String {
    "unread".to_string()
}

impl MailMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            role: default_role(),
            content: content.into(),
            status: default_status(),
            read_time: None,
            from: None,
            message_type: None,
            metadata: None,
            extra: Map::new(),
        }
    }

    pub fn from_agent(mut self, name: impl Into<String>) -> Self {
        self.from = Some(name.into());
        self
    }

    pub fn typed(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Per-agent message queue backed by one JSON array file under
/// `B/mailboxes/`. Writers append under exclusive lock; consumers mark
/// messages read in place within the same lock window.
#[derive(Debug, Clone)]
pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(blackboard_dir: &Path) -> std::io::Result<Self> {
        let dir = blackboard_dir.join("mailboxes");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{}.json", agent))
    }

    pub fn push(&self, agent: &str, message: MailMessage) -> Result<(), MailboxError> {
        let path = self.path_for(agent);
        let mut lock = LockedFile::exclusive(&path, MAILBOX_LOCK_TIMEOUT)?;
        let content = lock.read_to_string()?;
        let mut messages = parse_messages(&content);
        messages.push(message);
        let serialized = serde_json::to_string_pretty(&messages)
            .map_err(|e| MailboxError::Malformed(e.to_string()))?;
        lock.overwrite(&serialized)?;
        Ok(())
    }

    /// Take every unread message, flipping its status to `read` and stamping
    /// `read_time` inside the same exclusive lock window. Returns the drained
    /// messages in arrival order.
    pub fn drain_unread(&self, agent: &str) -> Result<Vec<MailMessage>, MailboxError> {
        let path = self.path_for(agent);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut lock = LockedFile::exclusive(&path, MAILBOX_LOCK_TIMEOUT)?;
        let content = lock.read_to_string()?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut messages = parse_messages(&content);

        let mut drained = Vec::new();
        let now = unix_time_secs();
        for msg in &mut messages {
            if msg.status == "unread" && !msg.content.is_empty() {
                msg.status = "read".to_string();
                msg.read_time = Some(now);
                drained.push(msg.clone());
            }
        }
        if !drained.is_empty() {
            let serialized = serde_json::to_string_pretty(&messages)
                .map_err(|e| MailboxError::Malformed(e.to_string()))?;
            lock.overwrite(&serialized)?;
        }
        Ok(drained)
    }
}

/// Tolerates both the queue format (array) and a bare single message object.
fn parse_messages(content: &str) -> Vec<MailMessage> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Array(_)) => serde_json::from_str(content).unwrap_or_default(),
        Ok(Value::Object(_)) => serde_json::from_str::<MailMessage>(content)
            .map(|m| vec![m])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Permission requests
// ---------------------------------------------------------------------------

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_APPROVED: &str = "APPROVED";
pub const STATUS_DENIED: &str = "DENIED";
pub const STATUS_TIMEOUT: &str = "TIMEOUT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub agent_name: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub content: String,
    #[serde(default)]
    pub reason: String,
    pub status: String,
    pub timestamp: f64,
    #[serde(default)]
    pub response_time: Option<f64>,
}

/// File-based request/response rendezvous: one `{uuid}.json` per outstanding
/// permission request under `B/requests/`. The requester blocks in a polling
/// loop; the approver (Architect's request monitor) flips the status under
/// exclusive lock.
#[derive(Debug, Clone)]
pub struct RequestManager {
    dir: PathBuf,
}

impl RequestManager {
    pub fn new(blackboard_dir: &Path) -> std::io::Result<Self> {
        let dir = blackboard_dir.join("requests");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn create_request(
        &self,
        agent_name: &str,
        request_type: &str,
        content: &str,
        reason: &str,
    ) -> Result<String, MailboxError> {
        let id = Uuid::new_v4().to_string();
        let request = PermissionRequest {
            id: id.clone(),
            agent_name: agent_name.to_string(),
            request_type: request_type.to_string(),
            content: content.to_string(),
            reason: reason.to_string(),
            status: STATUS_PENDING.to_string(),
            timestamp: unix_time_secs(),
            response_time: None,
        };
        let serialized = serde_json::to_string_pretty(&request)
            .map_err(|e| MailboxError::Malformed(e.to_string()))?;
        std::fs::write(self.request_path(&id), serialized)?;
        Ok(id)
    }

    /// Block until the status leaves `PENDING` or the timeout elapses.
    /// Timeout yields `TIMEOUT`, which callers treat as denial.
    pub async fn wait_for_response(&self, id: &str, timeout: Duration) -> String {
        let path = self.request_path(id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !path.exists() {
                return "ERROR_FILE_MISSING".to_string();
            }
            // A mid-write read simply retries on the next poll.
            if let Ok(content) = std::fs::read_to_string(&path)
                && let Ok(request) = serde_json::from_str::<PermissionRequest>(&content)
                && request.status != STATUS_PENDING
            {
                return request.status;
            }
            if tokio::time::Instant::now() >= deadline {
                return STATUS_TIMEOUT.to_string();
            }
            tokio::time::sleep(REQUEST_POLL_INTERVAL).await;
        }
    }

    pub fn list_pending(&self) -> Vec<PermissionRequest> {
        let mut pending = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return pending;
        };
        for entry in entries.flatten() {
            if entry.path().extension().is_none_or(|e| e != "json") {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(entry.path())
                && let Ok(request) = serde_json::from_str::<PermissionRequest>(&content)
                && request.status == STATUS_PENDING
            {
                pending.push(request);
            }
        }
        pending.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        pending
    }

    pub fn update_status(&self, id: &str, status: &str) -> Result<(), MailboxError> {
        let path = self.request_path(id);
        if !path.exists() {
            return Err(MailboxError::Malformed(format!("request {} not found", id)));
        }
        let mut lock = LockedFile::exclusive(&path, REQUEST_LOCK_TIMEOUT)?;
        let content = lock.read_to_string()?;
        let mut request: PermissionRequest = serde_json::from_str(&content)
            .map_err(|e| MailboxError::Malformed(e.to_string()))?;
        request.status = status.to_string();
        request.response_time = Some(unix_time_secs());
        let serialized = serde_json::to_string_pretty(&request)
            .map_err(|e| MailboxError::Malformed(e.to_string()))?;
        lock.overwrite(&serialized)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;

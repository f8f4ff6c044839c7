pub mod frontmatter;
pub mod lock;
pub mod plan;

use crate::blackboard::frontmatter::{has_frontmatter_delimiter, parse_frontmatter, render_frontmatter};
use crate::blackboard::lock::{DEFAULT_LOCK_TIMEOUT, LockError, LockedFile};
use crate::blackboard::plan::{CentralPlan, TaskStatus, auto_fix, parse_plan, splice_plan, validate_plan, validate_transition};
use chrono::Local;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const CENTRAL_PLAN: &str = "central_plan.md";
pub const NOTIFICATIONS: &str = "notifications.md";

const FRONTMATTER_REQUIRED: &[&str] = &["name", "description", "usage_policy"];

#[derive(Debug, Error)]
pub enum BlackboardError {
    #[error("Index '{0}' not found.")]
    NotFound(String),

    #[error("Index '{0}' already exists.")]
    AlreadyExists(String),

    #[error("CAS Failed. Content has changed. Current checksum: {current}")]
    CasConflict { current: String },

    #[error("Metadata Missing. content MUST start with '---' followed by YAML frontmatter.")]
    MetadataMissing,

    #[error("YAML Metadata incomplete. Missing fields: {0}. Refer to the blackboard tool description for the required format.")]
    MetadataIncomplete(String),

    #[error("{0}")]
    InvalidPlan(String),

    #[error("{0}")]
    Transition(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// The caller's identity as seen by access control. The Architect bypasses
/// the status-transition table and the assignee ownership check.
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub agent_name: Option<String>,
    pub is_architect: bool,
}

impl AgentIdentity {
    pub fn new(agent_name: impl Into<String>, is_architect: bool) -> Self {
        let agent_name = agent_name.into();
        let is_architect = is_architect || agent_name.to_lowercase().contains("architect");
        Self {
            agent_name: Some(agent_name),
            is_architect,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexDocument {
    pub metadata: Map<String, Value>,
    pub body: String,
    pub checksum: String,
}

/// Shared file-system blackboard bound to one root directory. All index
/// mutations are serialized by per-file advisory locks; `update_index` and
/// `update_task` are additionally CAS-protected by a content checksum.
#[derive(Debug, Clone)]
pub struct Blackboard {
    root: PathBuf,
    indices_dir: PathBuf,
    resources_dir: PathBuf,
    templates_dir: PathBuf,
    lock_timeout: Duration,
}

impl Blackboard {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        let indices_dir = root.join("global_indices");
        let resources_dir = root.join("resources");
        std::fs::create_dir_all(&indices_dir)?;
        std::fs::create_dir_all(&resources_dir)?;
        std::fs::create_dir_all(root.join("logs"))?;
        let templates_dir = root
            .parent()
            .map_or_else(|| PathBuf::from("blackboard_templates"), |p| p.join("blackboard_templates"));
        Ok(Self {
            root,
            indices_dir,
            resources_dir,
            templates_dir,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_templates_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.templates_dir = dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn indices_dir(&self) -> &Path {
        &self.indices_dir
    }

    pub fn resources_dir(&self) -> &Path {
        &self.resources_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// SHA-256 hex digest of the exact bytes, used as the CAS token.
    pub fn checksum(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Agents sometimes include the directory in the filename; strip it.
    fn sanitize_index_name(name: &str) -> &str {
        name.trim_start_matches('/')
            .strip_prefix("global_indices/")
            .unwrap_or_else(|| name.trim_start_matches('/'))
    }

    fn index_path(&self, filename: &str) -> PathBuf {
        self.indices_dir.join(Self::sanitize_index_name(filename))
    }

    fn is_central_plan(filename: &str) -> bool {
        Self::sanitize_index_name(filename) == CENTRAL_PLAN
    }

    // -- index operations ----------------------------------------------------

    pub fn list_indices(&self) -> Result<Vec<Map<String, Value>>, BlackboardError> {
        let mut indices = Vec::new();
        let entries = match std::fs::read_dir(&self.indices_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(indices),
        };
        for entry in entries.flatten() {
            let fname = entry.file_name().to_string_lossy().to_string();
            if !fname.ends_with(".md") {
                continue;
            }
            let mut item = match std::fs::read_to_string(entry.path()) {
                Ok(content) => parse_frontmatter(&content).0,
                Err(e) => {
                    let mut m = Map::new();
                    m.insert("error".to_string(), Value::String(e.to_string()));
                    m
                }
            };
            item.insert("filename".to_string(), Value::String(fname));
            indices.push(item);
        }
        indices.sort_by_key(|m| {
            m.get("filename")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });
        Ok(indices)
    }

    pub fn read_index(&self, filename: &str) -> Result<IndexDocument, BlackboardError> {
        let path = self.index_path(filename);
        if !path.exists() {
            return Err(BlackboardError::NotFound(
                Self::sanitize_index_name(filename).to_string(),
            ));
        }
        let mut lock = LockedFile::shared(&path, self.lock_timeout)?;
        let content = lock.read_to_string()?;
        drop(lock);

        let checksum = Self::checksum(&content);
        let (metadata, body) = parse_frontmatter(&content);
        Ok(IndexDocument {
            metadata,
            body,
            checksum,
        })
    }

    pub fn append_to_index(&self, filename: &str, content: &str) -> Result<(), BlackboardError> {
        let path = self.index_path(filename);
        let entry = if content.starts_with('\n') {
            content.to_string()
        } else {
            format!("\n{}", content)
        };
        let mut lock = LockedFile::exclusive_append(&path, self.lock_timeout)?;
        lock.append(&entry)?;
        Ok(())
    }

    pub fn update_index(
        &self,
        filename: &str,
        content: &str,
        expected_checksum: &str,
    ) -> Result<(), BlackboardError> {
        let path = self.index_path(filename);
        if !path.exists() {
            return Err(BlackboardError::NotFound(
                Self::sanitize_index_name(filename).to_string(),
            ));
        }
        if expected_checksum.is_empty() {
            return Err(BlackboardError::Other(
                "expected_checksum is required for update_index.".to_string(),
            ));
        }

        let mut lock = LockedFile::exclusive(&path, self.lock_timeout)?;
        let current = lock.read_to_string()?;
        let current_checksum = Self::checksum(&current);
        if current_checksum != expected_checksum {
            return Err(BlackboardError::CasConflict {
                current: current_checksum,
            });
        }

        Self::validate_index_content(filename, content, false)?;

        lock.overwrite(content)?;
        Ok(())
    }

    /// Partial task update with CAS. Runs the passive auto-fix pass inside the
    /// same exclusive lock window, then enforces assignee access and the
    /// status-transition table before applying the patch and re-validating the
    /// whole plan. On any failure the file is untouched.
    pub fn update_task(
        &self,
        identity: &AgentIdentity,
        filename: &str,
        task_id: i64,
        updates: &Map<String, Value>,
        expected_checksum: &str,
    ) -> Result<(), BlackboardError> {
        let path = self.index_path(filename);
        if !path.exists() {
            return Err(BlackboardError::NotFound(
                Self::sanitize_index_name(filename).to_string(),
            ));
        }
        if expected_checksum.is_empty() {
            return Err(BlackboardError::Other(
                "expected_checksum is required for update_task.".to_string(),
            ));
        }

        let mut lock = LockedFile::exclusive(&path, self.lock_timeout)?;
        let content = lock.read_to_string()?;
        let current_checksum = Self::checksum(&content);
        if current_checksum != expected_checksum {
            return Err(BlackboardError::CasConflict {
                current: current_checksum,
            });
        }

        let (metadata, body) = parse_frontmatter(&content);
        let mut plan = parse_plan(&body).map_err(BlackboardError::InvalidPlan)?;
        auto_fix(&mut plan);

        let task = plan
            .task(task_id)
            .cloned()
            .ok_or_else(|| BlackboardError::Other(format!("Task ID {} not found.", task_id)))?;

        Self::validate_assignee_access(identity, &task, updates)?;

        if let Some(status_value) = updates.get("status") {
            let new_status: TaskStatus = serde_json::from_value(status_value.clone())
                .map_err(|_| {
                    BlackboardError::Other(format!(
                        "Invalid status value: {}. Expected PENDING, IN_PROGRESS, DONE or BLOCKED.",
                        status_value
                    ))
                })?;
            validate_transition(&task, new_status, &plan, identity.is_architect)
                .map_err(BlackboardError::Transition)?;
        }

        // Apply the patch on the JSON representation so arbitrary fields pass
        // through, then re-type to catch malformed values.
        let mut task_value = serde_json::to_value(&task)
            .map_err(|e| BlackboardError::Other(e.to_string()))?;
        if let Value::Object(map) = &mut task_value {
            for (k, v) in updates {
                map.insert(k.clone(), v.clone());
            }
        }
        let patched: plan::Task = serde_json::from_value(task_value)
            .map_err(|e| BlackboardError::Other(format!("Invalid task update: {}", e)))?;
        *plan.task_mut(task_id).expect("task existed above") = patched;

        validate_plan(&plan).map_err(BlackboardError::InvalidPlan)?;

        let new_body = splice_plan(&body, &plan).map_err(BlackboardError::InvalidPlan)?;
        let new_content = render_frontmatter(&metadata, &new_body);
        lock.overwrite(&new_content)?;
        Ok(())
    }

    pub fn create_index(&self, filename: &str, content: &str) -> Result<(), BlackboardError> {
        let path = self.index_path(filename);
        if path.exists() {
            return Err(BlackboardError::AlreadyExists(
                Self::sanitize_index_name(filename).to_string(),
            ));
        }

        Self::validate_index_content(filename, content, true)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // create_new closes the create/exists race between sibling agents.
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    BlackboardError::AlreadyExists(Self::sanitize_index_name(filename).to_string())
                } else {
                    BlackboardError::Io(e)
                }
            })?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    fn validate_index_content(
        filename: &str,
        content: &str,
        require_fields: bool,
    ) -> Result<(), BlackboardError> {
        if !has_frontmatter_delimiter(content) {
            return Err(BlackboardError::MetadataMissing);
        }
        let (meta, body) = parse_frontmatter(content);
        if meta.is_empty() {
            return Err(BlackboardError::Other(
                "Failed to parse YAML frontmatter in the provided content.".to_string(),
            ));
        }
        if require_fields {
            let missing: Vec<&str> = FRONTMATTER_REQUIRED
                .iter()
                .filter(|f| !meta.contains_key(**f))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BlackboardError::MetadataIncomplete(missing.join(", ")));
            }
        }
        if Self::is_central_plan(filename) {
            let plan = parse_plan(&body).map_err(BlackboardError::InvalidPlan)?;
            validate_plan(&plan).map_err(BlackboardError::InvalidPlan)?;
        }
        Ok(())
    }

    fn validate_assignee_access(
        identity: &AgentIdentity,
        task: &plan::Task,
        updates: &Map<String, Value>,
    ) -> Result<(), BlackboardError> {
        if identity.is_architect {
            return Ok(());
        }
        let Some(agent_name) = identity.agent_name.as_deref() else {
            return Ok(());
        };
        // An agent adding itself to the assignee list is claiming the task.
        if let Some(Value::Array(new_assignees)) = updates.get("assignees")
            && new_assignees.iter().any(|v| v.as_str() == Some(agent_name))
        {
            return Ok(());
        }
        if task.assignees.is_empty() {
            return Ok(());
        }
        if task.assignees.iter().any(|a| a == agent_name) {
            return Ok(());
        }
        Err(BlackboardError::AccessDenied(format!(
            "Agent '{}' cannot update Task #{} which is assigned to {:?}. Only the assigned agent or the Architect can modify this task.",
            agent_name, task.id, task.assignees
        )))
    }

    // -- plan helpers (used by middlewares and the finish tool) --------------

    /// Read the central plan with a shared lock. `Ok(None)` when no plan
    /// exists or its JSON block cannot be parsed.
    pub fn read_plan(&self) -> Result<Option<CentralPlan>, BlackboardError> {
        let path = self.indices_dir.join(CENTRAL_PLAN);
        if !path.exists() {
            return Ok(None);
        }
        let mut lock = LockedFile::shared(&path, self.lock_timeout)?;
        let content = lock.read_to_string()?;
        drop(lock);
        let (_, body) = parse_frontmatter(&content);
        Ok(parse_plan(&body).ok())
    }

    /// Run the auto-unblock + single-assignee pass under an exclusive lock.
    /// Used by the dependency guard before each LLM call.
    pub fn run_auto_fix(&self) -> Result<bool, BlackboardError> {
        let path = self.indices_dir.join(CENTRAL_PLAN);
        if !path.exists() {
            return Ok(false);
        }
        let mut lock = LockedFile::exclusive(&path, self.lock_timeout)?;
        let content = lock.read_to_string()?;
        let (metadata, body) = parse_frontmatter(&content);
        let Ok(mut plan) = parse_plan(&body) else {
            return Ok(false);
        };
        if !auto_fix(&mut plan) {
            return Ok(false);
        }
        let new_body = splice_plan(&body, &plan).map_err(BlackboardError::InvalidPlan)?;
        lock.overwrite(&render_frontmatter(&metadata, &new_body))?;
        Ok(true)
    }

    // -- notifications -------------------------------------------------------

    /// Append one line to the notifications stream under exclusive lock.
    pub fn append_notification(&self, line: &str) -> Result<(), BlackboardError> {
        let path = self.indices_dir.join(NOTIFICATIONS);
        let mut lock = LockedFile::exclusive_append(&path, self.lock_timeout)?;
        lock.append(line)?;
        Ok(())
    }

    /// Broadcast a lifecycle message with a timestamp prefix.
    pub fn broadcast_notification(&self, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let entry = format!("\n- [{}] {}", timestamp, message);
        if let Err(e) = self.append_notification(&entry) {
            warn!("failed to broadcast notification: {}", e);
        }
    }

    /// Tail of the notification stream, bounded by line count and character
    /// count. `Ok(None)` when the stream is absent or empty.
    pub fn tail_notifications(
        &self,
        max_lines: usize,
        max_chars: usize,
    ) -> Result<Option<String>, BlackboardError> {
        let path = self.indices_dir.join(NOTIFICATIONS);
        if !path.exists() {
            return Ok(None);
        }
        let mut lock = LockedFile::shared(&path, self.lock_timeout)?;
        let content = lock.read_to_string()?;
        drop(lock);
        if content.trim().is_empty() {
            return Ok(None);
        }
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        let mut tail = lines[start..].join("\n");
        if tail.chars().count() > max_chars {
            let cut: String = tail
                .chars()
                .skip(tail.chars().count() - max_chars)
                .collect();
            tail = format!("...[Older notifications truncated]\n{}", cut);
        }
        Ok(Some(tail))
    }

    // -- templates & resources ----------------------------------------------

    pub fn list_templates(&self) -> Result<Vec<String>, BlackboardError> {
        let mut templates = Vec::new();
        let entries = match std::fs::read_dir(&self.templates_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(templates),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".md") {
                templates.push(name);
            }
        }
        templates.sort();
        Ok(templates)
    }

    pub fn read_template(&self, filename: &str) -> Result<String, BlackboardError> {
        if filename.is_empty() {
            return Err(BlackboardError::Other(
                "Template filename is required.".to_string(),
            ));
        }
        let path = self.templates_dir.join(filename);
        let canonical = path
            .canonicalize()
            .map_err(|_| BlackboardError::NotFound(filename.to_string()))?;
        let templates_canonical = self
            .templates_dir
            .canonicalize()
            .map_err(|_| BlackboardError::NotFound(filename.to_string()))?;
        if !canonical.starts_with(&templates_canonical) {
            return Err(BlackboardError::AccessDenied(
                "Access denied (Invalid template path).".to_string(),
            ));
        }
        Ok(std::fs::read_to_string(&canonical)?)
    }

    pub fn list_resources(&self) -> Result<Vec<String>, BlackboardError> {
        let mut resources = Vec::new();
        for entry in walkdir::WalkDir::new(&self.resources_dir)
            .into_iter()
            .flatten()
        {
            if entry.file_type().is_file()
                && let Ok(rel) = entry.path().strip_prefix(&self.resources_dir)
            {
                resources.push(rel.to_string_lossy().to_string());
            }
        }
        resources.sort();
        Ok(resources)
    }
}

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
            TaskStatus::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

impl TaskStatus {
    /// Transitions permitted to non-Architect agents. `DONE` is terminal;
    /// `BLOCKED -> PENDING` is normally performed by the auto-unblock pass.
    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::InProgress],
            TaskStatus::InProgress => &[TaskStatus::Done, TaskStatus::Pending],
            TaskStatus::Blocked => &[TaskStatus::Pending],
            TaskStatus::Done => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Standard,
    Standing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_link: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CentralPlan {
    #[serde(default)]
    pub mission_goal: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Mission-level status as observed by the watchdog. `Unknown` covers a
/// missing, unparseable, or task-less plan and is allowed to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionStatus {
    InProgress,
    Done,
    Unknown,
}

impl CentralPlan {
    pub fn task(&self, id: i64) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: i64) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn mission_status(&self) -> MissionStatus {
        if !self.tasks.is_empty() && self.tasks.iter().any(|t| t.status != TaskStatus::Done) {
            return MissionStatus::InProgress;
        }
        match self.status.as_str() {
            "DONE" => MissionStatus::Done,
            "IN_PROGRESS" => MissionStatus::InProgress,
            _ => MissionStatus::Unknown,
        }
    }
}

/// Locate the plan's fenced JSON block in a markdown body. Returns the byte
/// range of the JSON payload (between the opening ```` ```json ```` fence and
/// the final closing fence).
pub fn json_block_range(body: &str) -> Result<(usize, usize), String> {
    let start = body
        .find("```json")
        .ok_or_else(|| "Invalid central_plan: No JSON block found.".to_string())?;
    let payload_start = start + "```json".len();
    let end = body
        .rfind("```")
        .filter(|&e| e > payload_start)
        .ok_or_else(|| "Invalid central_plan: Malformed JSON block.".to_string())?;
    Ok((payload_start, end))
}

/// Parse the embedded plan from a full document body (front matter already
/// stripped by the caller).
pub fn parse_plan(body: &str) -> Result<CentralPlan, String> {
    let (start, end) = json_block_range(body)?;
    let json_str = body[start..end].trim();
    serde_json::from_str::<CentralPlan>(json_str)
        .map_err(|e| format!("Invalid central_plan: JSON Decode Error: {}", e))
}

/// Re-render the plan into the body, replacing the payload of the fenced JSON
/// block and leaving everything around it untouched.
pub fn splice_plan(body: &str, plan: &CentralPlan) -> Result<String, String> {
    let (start, end) = json_block_range(body)?;
    let json_str = serde_json::to_string_pretty(plan)
        .map_err(|e| format!("Invalid central_plan: serialization failed: {}", e))?;
    Ok(format!(
        "{}\n{}\n{}",
        &body[..start],
        json_str,
        &body[end..]
    ))
}

/// Validate the full set of plan invariants. Returns the first violation as a
/// human-readable message (surfaced verbatim to the LLM).
pub fn validate_plan(plan: &CentralPlan) -> Result<(), String> {
    let task_ids: HashSet<i64> = plan.tasks.iter().map(|t| t.id).collect();
    if task_ids.len() != plan.tasks.len() {
        return Err("Invalid central_plan: Duplicate task ids.".to_string());
    }

    for task in &plan.tasks {
        for dep in &task.dependencies {
            if !task_ids.contains(dep) {
                return Err(format!(
                    "Invalid central_plan: Task {} depends on non-existent task {}.",
                    task.id, dep
                ));
            }
            if *dep == task.id {
                return Err(format!(
                    "Invalid central_plan: Task {} depends on itself (ID: {}).",
                    task.id, task.id
                ));
            }
        }
        if task.task_type == TaskType::Standard && task.assignees.len() > 1 {
            return Err(format!(
                "Invalid central_plan: Standard task {} has {} assignees (at most one allowed).",
                task.id,
                task.assignees.len()
            ));
        }
    }

    if let Some(id) = find_cycle(plan) {
        return Err(format!(
            "Invalid central_plan: Circular dependency detected involving task {}.",
            id
        ));
    }

    for task in &plan.tasks {
        if task.status == TaskStatus::Pending {
            let unfulfilled: Vec<i64> = task
                .dependencies
                .iter()
                .filter(|dep| {
                    plan.task(**dep)
                        .is_some_and(|d| d.status != TaskStatus::Done)
                })
                .copied()
                .collect();
            if !unfulfilled.is_empty() {
                return Err(format!(
                    "Invalid central_plan: Task {} is PENDING but has unfulfilled dependencies: {:?}. Status should be BLOCKED.",
                    task.id, unfulfilled
                ));
            }
        }
    }

    Ok(())
}

fn find_cycle(plan: &CentralPlan) -> Option<i64> {
    let mut visited: HashSet<i64> = HashSet::new();
    for task in &plan.tasks {
        if !visited.contains(&task.id) {
            let mut stack = HashSet::new();
            if dfs_cycle(plan, task.id, &mut visited, &mut stack) {
                return Some(task.id);
            }
        }
    }
    None
}

fn dfs_cycle(
    plan: &CentralPlan,
    id: i64,
    visited: &mut HashSet<i64>,
    stack: &mut HashSet<i64>,
) -> bool {
    visited.insert(id);
    stack.insert(id);
    if let Some(task) = plan.task(id) {
        for dep in task.dependencies.clone() {
            if !visited.contains(&dep) {
                if dfs_cycle(plan, dep, visited, stack) {
                    return true;
                }
            } else if stack.contains(&dep) {
                return true;
            }
        }
    }
    stack.remove(&id);
    false
}

/// The passive auto-fix pass: promote `BLOCKED` tasks whose dependencies are
/// all `DONE` back to `PENDING`, and truncate standard tasks to a single
/// assignee. Returns whether anything changed.
pub fn auto_fix(plan: &mut CentralPlan) -> bool {
    let done_ids: HashSet<i64> = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id)
        .collect();

    let mut modified = false;
    for task in &mut plan.tasks {
        if task.status == TaskStatus::Blocked
            && task.dependencies.iter().all(|d| done_ids.contains(d))
        {
            task.status = TaskStatus::Pending;
            modified = true;
            tracing::info!("auto-unblocked task {}", task.id);
        }
        if task.task_type == TaskType::Standard && task.assignees.len() > 1 {
            task.assignees.truncate(1);
            modified = true;
            tracing::warn!("enforced single assignee for task {}", task.id);
        }
    }
    modified
}

/// Validate a single task's status transition under the restriction table.
/// The Architect may force any transition; everyone else is held to the table
/// and to dependency satisfaction when claiming a task.
pub fn validate_transition(
    task: &Task,
    new_status: TaskStatus,
    plan: &CentralPlan,
    is_architect: bool,
) -> Result<(), String> {
    if task.status == new_status {
        return Ok(());
    }
    if is_architect {
        return Ok(());
    }
    let allowed = task.status.allowed_transitions();
    if !allowed.contains(&new_status) {
        let allowed_str = if allowed.is_empty() {
            "none (terminal state)".to_string()
        } else {
            allowed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        return Err(format!(
            "Illegal status transition '{}' -> '{}' for Task #{}. Allowed transitions from '{}': {}. Only the Architect can override this restriction.",
            task.status, new_status, task.id, task.status, allowed_str
        ));
    }
    if new_status == TaskStatus::InProgress {
        for dep in &task.dependencies {
            if let Some(dep_task) = plan.task(*dep)
                && dep_task.status != TaskStatus::Done
            {
                return Err(format!(
                    "Cannot claim Task #{} (set IN_PROGRESS) because dependency Task #{} is '{}', not DONE.",
                    task.id, dep, dep_task.status
                ));
            }
        }
    }
    Ok(())
}

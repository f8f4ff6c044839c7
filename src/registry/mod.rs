use crate::blackboard::lock::{LockError, LockedFile};
use crate::utils::unix_time_secs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Grace window for `STARTING` agents before the PID probe applies.
const STARTING_GRACE: f64 = 30.0;

const REGISTRY_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Starting,
    Running,
    Idle,
    Dead,
}

/// Transient liveness verdict attached by [`AgentRegistry::verify_and_sync_pids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifiedStatus {
    Alive,
    Dead,
    Starting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub role: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_status: Option<VerifiedStatus>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentEntry {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            AgentStatus::Running | AgentStatus::Idle | AgentStatus::Starting
        )
    }
}

pub type RegistrySnapshot = BTreeMap<String, AgentEntry>;

/// File-lock-protected manager for `registry.json`. Every mutation goes
/// through a single locked read-modify-write; reads take a shared lock.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    path: PathBuf,
}

impl AgentRegistry {
    pub fn new(blackboard_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(blackboard_dir)?;
        let path = blackboard_dir.join("registry.json");
        if !path.exists() {
            std::fs::write(&path, "{}")?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full registry. A missing or corrupt file reads as empty: the
    /// registry is advisory state and must never wedge its callers.
    pub fn read(&self) -> RegistrySnapshot {
        if !self.path.exists() {
            return RegistrySnapshot::new();
        }
        let lock = LockedFile::shared(&self.path, REGISTRY_LOCK_TIMEOUT);
        let content = match lock {
            Ok(mut lock) => lock.read_to_string().unwrap_or_default(),
            Err(_) => return RegistrySnapshot::new(),
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    fn read_modify_write(
        &self,
        mutate: impl FnOnce(&mut RegistrySnapshot),
    ) -> Result<(), LockError> {
        let mut lock = LockedFile::exclusive(&self.path, REGISTRY_LOCK_TIMEOUT)?;
        let content = lock.read_to_string().unwrap_or_default();
        let mut registry: RegistrySnapshot = if content.is_empty() {
            RegistrySnapshot::new()
        } else {
            serde_json::from_str(&content).unwrap_or_default()
        };

        mutate(&mut registry);

        let serialized = serde_json::to_string_pretty(&registry).unwrap_or_else(|_| "{}".into());
        lock.overwrite(&serialized).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Register an agent as RUNNING. Preserves a pre-existing `spawn_time`
    /// written by the spawner so the STARTING grace window stays anchored.
    pub fn register_agent(&self, name: &str, role: &str, pid: u32) -> Result<(), LockError> {
        self.read_modify_write(|registry| {
            let spawn_time = registry.get(name).and_then(|e| e.spawn_time);
            let goal = registry.get(name).and_then(|e| e.goal.clone());
            registry.insert(
                name.to_string(),
                AgentEntry {
                    pid: Some(pid),
                    role: role.to_string(),
                    status: AgentStatus::Running,
                    start_time: Some(unix_time_secs()),
                    spawn_time,
                    exit_time: None,
                    exit_reason: None,
                    goal,
                    verified_status: None,
                    extra: Map::new(),
                },
            );
        })
    }

    /// Mark an agent DEAD. Idempotent: a second call changes nothing the
    /// reader can observe except the exit reason staying first-wins.
    pub fn deregister_agent(&self, name: &str, reason: &str) -> Result<(), LockError> {
        self.read_modify_write(|registry| {
            if let Some(entry) = registry.get_mut(name) {
                if entry.status == AgentStatus::Dead {
                    return;
                }
                entry.status = AgentStatus::Dead;
                entry.exit_time = Some(unix_time_secs());
                entry.exit_reason = Some(reason.to_string());
            }
        })
    }

    /// Insert the initial STARTING row written by the spawner.
    pub fn record_spawn(
        &self,
        name: &str,
        role: &str,
        pid: u32,
        goal: &str,
    ) -> Result<(), LockError> {
        self.read_modify_write(|registry| {
            registry.insert(
                name.to_string(),
                AgentEntry {
                    pid: Some(pid),
                    role: role.to_string(),
                    status: AgentStatus::Starting,
                    start_time: None,
                    spawn_time: Some(unix_time_secs()),
                    exit_time: None,
                    exit_reason: None,
                    goal: Some(goal.to_string()),
                    verified_status: None,
                    extra: Map::new(),
                },
            );
        })
    }

    /// Arbitrary patch to one agent's entry.
    pub fn update_agent(
        &self,
        name: &str,
        patch: impl FnOnce(&mut AgentEntry),
    ) -> Result<(), LockError> {
        self.read_modify_write(|registry| {
            if let Some(entry) = registry.get_mut(name) {
                patch(entry);
            }
        })
    }

    pub fn set_status(&self, name: &str, status: AgentStatus) -> Result<(), LockError> {
        self.update_agent(name, |e| e.status = status)
    }

    pub fn get_agent(&self, name: &str) -> Option<AgentEntry> {
        self.read().get(name).cloned()
    }

    pub fn is_agent_active(&self, name: &str) -> bool {
        self.get_agent(name).is_some_and(|e| e.is_active())
    }

    /// Verify all agent PIDs and mark dead ones in the registry, returning
    /// the verified snapshot annotated with `verified_status`.
    ///
    /// Rules:
    /// - DEAD entries are not re-probed or re-timestamped.
    /// - STARTING entries within the 30 s grace window are left alone.
    /// - Everything else gets a zero-signal PID probe.
    pub fn verify_and_sync_pids(&self) -> RegistrySnapshot {
        let mut report = RegistrySnapshot::new();
        let now = unix_time_secs();

        let result = self.read_modify_write(|registry| {
            for (name, entry) in registry.iter_mut() {
                if entry.status == AgentStatus::Dead {
                    let mut copy = entry.clone();
                    copy.verified_status = Some(VerifiedStatus::Dead);
                    report.insert(name.clone(), copy);
                    continue;
                }

                if entry.status == AgentStatus::Starting {
                    let anchor = entry.spawn_time.or(entry.start_time).unwrap_or(0.0);
                    if now - anchor < STARTING_GRACE {
                        let mut copy = entry.clone();
                        copy.verified_status = Some(VerifiedStatus::Starting);
                        report.insert(name.clone(), copy);
                        continue;
                    }
                    // Grace expired — fall through to the PID probe.
                }

                let alive = entry.pid.is_some_and(pid_alive);
                if !alive {
                    entry.status = AgentStatus::Dead;
                    if entry.exit_time.is_none() {
                        entry.exit_time = Some(now);
                    }
                    if entry.exit_reason.is_none() {
                        entry.exit_reason =
                            Some("PID not found (verified by swarm state sync)".to_string());
                    }
                }
                let mut copy = entry.clone();
                copy.verified_status = Some(if alive {
                    VerifiedStatus::Alive
                } else {
                    VerifiedStatus::Dead
                });
                report.insert(name.clone(), copy);
            }
        });

        if let Err(e) = result {
            debug!("registry PID sync failed: {}", e);
        }
        report
    }
}

/// Zero-signal probe for process existence.
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs no action beyond the existence and
    // permission checks.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

use super::{ChunkInterceptor, Middleware, Next, intercept, new_call_id, wait_arguments};
use crate::agent::session::AgentSession;
use crate::blackboard::Blackboard;
use crate::blackboard::plan::{MissionStatus, TaskStatus};
use crate::providers::base::{ChunkStream, StreamChunk, ToolCallDelta};
use crate::registry::{AgentRegistry, pid_alive};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

const PERSISTENCE_TAG: &str = "[SYSTEM INTERVENTION: PERSISTENCE GUARD]";
const DEAD_AGENT_HEADER: &str = "[SYSTEM ALERT: DEAD AGENT DETECTED]";
const PERSISTENCE_EVERY_TURNS: usize = 5;
const MAX_NO_AGENT_STRIKES: usize = 3;

/// Tools the Architect must not use before the plan is user-verified.
const EXECUTION_TOOLS: &[&str] = &["write_file", "edit_file"];

/// The Architect's protocol enforcer.
///
/// Three kinds of intervention:
/// - *Protocol*: `spawn_swarm_agent` without a plan or without user
///   verification, direct execution tools before verification, and `finish`
///   while the mission is still in progress are renamed to `wait` in the
///   outbound stream.
/// - *Liveness*: dead agents holding incomplete tasks raise a system-prompt
///   alert before the call.
/// - *End-of-stream*: a turn with no tool call gets a synthesized
///   `finish` / `ask_user` / `wait`, with a forced-recovery instruction
///   after repeated checks find no worker running.
pub struct WatchdogGuard {
    agent_name: String,
    board: Blackboard,
    registry: Option<AgentRegistry>,
    skip_user_verification: bool,
    no_agent_strikes: Arc<AtomicUsize>,
}

impl WatchdogGuard {
    pub fn new(agent_name: impl Into<String>, board: Blackboard) -> Self {
        let registry = AgentRegistry::new(board.root()).ok();
        Self {
            agent_name: agent_name.into(),
            board,
            registry,
            skip_user_verification: false,
            no_agent_strikes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn skip_user_verification(mut self, skip: bool) -> Self {
        self.skip_user_verification = skip;
        self
    }

    fn plan_path(&self) -> PathBuf {
        self.board.indices_dir().join(crate::blackboard::CENTRAL_PLAN)
    }

    fn mission_status(&self) -> MissionStatus {
        match self.board.read_plan() {
            Ok(Some(plan)) => plan.mission_status(),
            _ => MissionStatus::Unknown,
        }
    }

    /// DEAD agents that still hold PENDING / IN_PROGRESS tasks in the plan.
    fn dead_agents_with_incomplete_tasks(&self) -> Vec<(String, Vec<String>)> {
        let Some(registry) = &self.registry else {
            return Vec::new();
        };
        let Ok(Some(plan)) = self.board.read_plan() else {
            return Vec::new();
        };
        let mut results = Vec::new();
        for (name, entry) in registry.read() {
            if name == self.agent_name || entry.status != crate::registry::AgentStatus::Dead {
                continue;
            }
            let open_tasks: Vec<String> = plan
                .tasks
                .iter()
                .filter(|t| {
                    t.assignees.contains(&name)
                        && matches!(t.status, TaskStatus::InProgress | TaskStatus::Pending)
                })
                .map(|t| {
                    let desc: String = t.description.chars().take(80).collect();
                    format!("Task #{}({}): {}", t.id, t.status, desc)
                })
                .collect();
            if !open_tasks.is_empty() {
                results.push((name, open_tasks));
            }
        }
        results
    }

    fn inject_dead_agent_alert(&self, session: &mut AgentSession) {
        let dead = self.dead_agents_with_incomplete_tasks();
        if dead.is_empty() {
            return;
        }
        let mut alert = vec![DEAD_AGENT_HEADER.to_string()];
        for (name, tasks) in &dead {
            alert.push(format!(
                "  - Agent '{}' is DEAD with incomplete tasks: {}",
                name,
                tasks.join(", ")
            ));
        }
        alert.push(
            "ACTION REQUIRED: Spawn a replacement agent for these tasks or reassign them."
                .to_string(),
        );
        session
            .system_config
            .upsert_section(DEAD_AGENT_HEADER, alert.join("\n"), false);
    }

    /// Every few turns of an unfinished mission, remind the Architect it is
    /// expected to keep coordinating, via a user-level intervention.
    fn inject_persistence_guard(&self, session: &mut AgentSession) {
        let current_turn = session.assistant_turns();

        let mut last_injection_turn: Option<usize> = None;
        let mut turn_count = 0usize;
        for msg in &session.history {
            if msg.is_assistant() {
                turn_count += 1;
            }
            if msg.role == "user" && msg.content_str().contains(PERSISTENCE_TAG) {
                last_injection_turn = Some(turn_count);
            }
        }

        let should_inject = match last_injection_turn {
            None => current_turn >= PERSISTENCE_EVERY_TURNS,
            Some(last) => current_turn.saturating_sub(last) >= PERSISTENCE_EVERY_TURNS,
        };
        if !should_inject {
            return;
        }

        let is_duplicate = session
            .history
            .last()
            .is_some_and(|m| m.role == "user" && m.content_str().contains(PERSISTENCE_TAG));
        if is_duplicate {
            return;
        }

        session.history.push(crate::providers::base::Message::user(format!(
            "### {} (Turn {})\nThe mission in `central_plan.md` is NOT yet complete. You MUST continue to monitor the agents and coordinate the swarm until ALL tasks are marked as 'DONE'. Please take immediate action.",
            PERSISTENCE_TAG, current_turn
        )));
    }

    /// Whether the transcript contains a user verification of the plan — an
    /// `ask_user` tool result, or the refined user message it becomes.
    fn has_verified_plan(&self, session: &AgentSession) -> bool {
        if self.skip_user_verification {
            return true;
        }
        session.history.iter().any(|msg| {
            (msg.role == "tool" && msg.name.as_deref() == Some("ask_user"))
                || (msg.role == "user" && msg.metadata_str("from_tool_call") == Some("ask_user"))
        })
    }
}

#[async_trait]
impl Middleware for WatchdogGuard {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        let mission_status = self.mission_status();

        if mission_status == MissionStatus::InProgress && !self.skip_user_verification {
            self.inject_dead_agent_alert(session);
        }
        if mission_status == MissionStatus::InProgress {
            self.inject_persistence_guard(session);
        }

        let has_verified_plan = self.has_verified_plan(session);
        let inner = next.run(session).await?;
        Ok(intercept(
            inner,
            WatchdogInterceptor {
                guard: WatchdogView {
                    agent_name: self.agent_name.clone(),
                    board: self.board.clone(),
                    registry: self.registry.clone(),
                    plan_path: self.plan_path(),
                    no_agent_strikes: self.no_agent_strikes.clone(),
                },
                has_verified_plan,
                saw_tool_calls: false,
                swallowed_indices: HashSet::new(),
                captured_content: String::new(),
            },
        ))
    }
}

/// The owned state the stream interceptor needs from the guard.
struct WatchdogView {
    agent_name: String,
    board: Blackboard,
    registry: Option<AgentRegistry>,
    plan_path: PathBuf,
    no_agent_strikes: Arc<AtomicUsize>,
}

impl WatchdogView {
    fn mission_status(&self) -> MissionStatus {
        match self.board.read_plan() {
            Ok(Some(plan)) => plan.mission_status(),
            _ => MissionStatus::Unknown,
        }
    }

    fn is_anyone_else_running(&self) -> bool {
        let Some(registry) = &self.registry else {
            return false;
        };
        registry.read().iter().any(|(name, entry)| {
            name != &self.agent_name
                && entry.is_active()
                && entry.pid.is_none_or(pid_alive)
        })
    }
}

struct WatchdogInterceptor {
    guard: WatchdogView,
    has_verified_plan: bool,
    saw_tool_calls: bool,
    swallowed_indices: HashSet<usize>,
    captured_content: String,
}

impl WatchdogInterceptor {
    /// Decide whether a named call must be replaced; returns the replacement.
    fn replacement_for(&self, delta: &ToolCallDelta, name: &str) -> Option<StreamChunk> {
        let rewrite = |reason: String| {
            Some(StreamChunk::tool_call(
                delta.id.clone().unwrap_or_else(new_call_id),
                "wait",
                wait_arguments(0.1, false, &reason),
                delta.index,
            ))
        };

        match name {
            "spawn_swarm_agent" => {
                if !self.guard.plan_path.exists() {
                    rewrite(
                        "[SYSTEM WARNING] PLAN VIOLATION: You attempted to spawn agents but central_plan.md does not exist yet. Required order: create_index(central_plan.md) -> ask_user -> spawn_swarm_agent.".to_string(),
                    )
                } else if !self.has_verified_plan {
                    rewrite(
                        "[SYSTEM WARNING] PLAN VIOLATION: central_plan.md exists but you must call ask_user for approval first. Required order: create_index(central_plan.md) -> ask_user -> spawn_swarm_agent.".to_string(),
                    )
                } else {
                    None
                }
            }
            _ if EXECUTION_TOOLS.contains(&name) && !self.has_verified_plan => rewrite(format!(
                "[SYSTEM WARNING] EXECUTION VIOLATION: You are the Architect and attempted to execute work directly via '{}'. First call 'ask_user' to verify your plan, then use 'spawn_swarm_agent'.",
                name
            )),
            "finish" if self.guard.mission_status() == MissionStatus::InProgress => rewrite(
                "PROTOCOL VIOLATION: The Mission is NOT marked as DONE in `central_plan.md`. You cannot finish yet.".to_string(),
            ),
            _ => None,
        }
    }

    fn synthesize_end_of_stream(&mut self, out: &mut VecDeque<StreamChunk>) {
        let call_id = new_call_id();
        let mission_status = self.guard.mission_status();
        debug!("watchdog end of stream, mission status {:?}", mission_status);

        if mission_status == MissionStatus::Done {
            out.push_back(StreamChunk::tool_call(
                call_id,
                "finish",
                json!({
                    "reason": "Auto-finishing as Mission Status is DONE.",
                    "output": "Mission status in central_plan.md is DONE; all tasks completed.",
                })
                .to_string(),
                0,
            ));
            return;
        }

        if !self.has_verified_plan {
            info!(
                "[{}] guard: no tool call, plan not verified, injecting ask_user",
                self.guard.agent_name
            );
            let prompt = if self.captured_content.trim().is_empty() {
                "I have drafted a plan. Could you please review and confirm before I proceed?"
                    .to_string()
            } else {
                self.captured_content.trim().to_string()
            };
            out.push_back(StreamChunk::tool_call(
                call_id,
                "ask_user",
                json!({"question": prompt}).to_string(),
                0,
            ));
            return;
        }

        if self.guard.is_anyone_else_running() {
            self.guard.no_agent_strikes.store(0, Ordering::Relaxed);
            out.push_back(StreamChunk::tool_call(
                call_id,
                "wait",
                wait_arguments(
                    10.0,
                    true,
                    "MISSION IN PROGRESS: Sub-agents are still working. Waiting for updates.",
                ),
                0,
            ));
            return;
        }

        let strikes = self.guard.no_agent_strikes.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "[{}] no agent running, strike {}/{}",
            self.guard.agent_name, strikes, MAX_NO_AGENT_STRIKES
        );

        let reason = if strikes >= MAX_NO_AGENT_STRIKES {
            self.guard.no_agent_strikes.store(0, Ordering::Relaxed);
            format!(
                "[DEADLOCK DETECTED] No sub-agent has been running for {} consecutive checks, but the mission is still IN_PROGRESS. You MUST now take recovery action:\n1. Check which agents are DEAD with incomplete tasks\n2. Either spawn replacements or update central_plan.md status to DONE\n3. Call finish when done\nDO NOT just wait again.",
                strikes
            )
        } else if strikes == 1 {
            format!(
                "MISSION IN PROGRESS: But no sub-agent is working. (Strike {}/{}) Check REAL-TIME SWARM STATUS — if an agent is DEAD with incomplete tasks, spawn a REPLACEMENT agent immediately.",
                strikes, MAX_NO_AGENT_STRIKES
            )
        } else {
            format!(
                "MISSION IN PROGRESS: Still no sub-agent running. (Strike {}/{}) URGENT: Re-spawn the dead agent NOW. Next check will trigger forced recovery.",
                strikes, MAX_NO_AGENT_STRIKES
            )
        };

        out.push_back(StreamChunk::tool_call(
            call_id,
            "wait",
            wait_arguments(10.0, true, &reason),
            0,
        ));
    }
}

impl ChunkInterceptor for WatchdogInterceptor {
    fn on_chunk(&mut self, chunk: StreamChunk, out: &mut VecDeque<StreamChunk>) {
        if let Some(content) = &chunk.content {
            self.captured_content.push_str(content);
        }

        if !chunk.has_tool_calls() {
            out.push_back(chunk);
            return;
        }

        self.saw_tool_calls = true;
        let mut kept = StreamChunk {
            content: chunk.content.clone(),
            tool_calls: Vec::new(),
        };

        for delta in chunk.tool_calls {
            if self.swallowed_indices.contains(&delta.index) {
                // Remaining fragments of a call we already replaced.
                continue;
            }
            match delta.name.as_deref() {
                Some(name) => match self.replacement_for(&delta, name) {
                    Some(replacement) => {
                        self.swallowed_indices.insert(delta.index);
                        out.push_back(replacement);
                    }
                    None => kept.tool_calls.push(delta),
                },
                None => kept.tool_calls.push(delta),
            }
        }

        if kept.content.is_some() || kept.has_tool_calls() {
            out.push_back(kept);
        }
    }

    fn on_end(&mut self, out: &mut VecDeque<StreamChunk>) {
        if !self.saw_tool_calls {
            self.synthesize_end_of_stream(out);
        }
    }
}

use crate::agent::events::AgentEvent;
use crate::agent::middleware::{LlmCall, Middleware, Next};
use crate::agent::session::{AgentSession, SystemPromptConfig};
use crate::agent::tools::base::{
    Tool, ToolContext, environment_guard, substitute_path_variables, validate_params,
};
use crate::agent::tools::registry::ToolRegistry;
use crate::blackboard::Blackboard;
use crate::errors::SwarmError;
use crate::mailbox::{MailMessage, Mailbox};
use crate::providers::base::{
    ChatRequest, ChunkStream, LlmClient, Message, StreamChunk, ToolCallRequest,
};
use crate::utils::json_repair::repair_truncated_json;
use crate::utils::truncate_with_notice;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::join_all;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

/// Tools sharing global network clients; executed on a strictly serial lane
/// to avoid contention.
const IO_BOUND_TOOLS: &[&str] = &["web_search", "web_reader", "browser_use"];

/// Mid-stream failures re-invoke the full pipeline this many extra times.
const STREAM_RETRIES: usize = 2;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MAX_PARALLEL_WORKERS: usize = 5;
const MAX_TOOL_RESULT_CHARS: usize = 50_000;

fn tool_timeout_for(name: &str, default: Duration) -> Duration {
    match name {
        "web_search" => Duration::from_secs(30),
        "web_reader" => Duration::from_secs(45),
        "browser_use" => Duration::from_secs(60),
        _ => default,
    }
}

pub struct EngineConfig {
    pub client: Arc<dyn LlmClient>,
    pub model: Option<String>,
    pub tools: ToolRegistry,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub context: ToolContext,
    pub max_parallel_workers: usize,
    pub tool_timeout: Duration,
    pub depth: usize,
}

impl EngineConfig {
    pub fn new(client: Arc<dyn LlmClient>, tools: ToolRegistry) -> Self {
        Self {
            client,
            model: None,
            tools,
            middlewares: Vec::new(),
            context: ToolContext::default(),
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            depth: 0,
        }
    }
}

/// The ReAct execution engine: stream assistant output through the
/// middleware pipeline, accumulate tool calls, dispatch them (bounded
/// parallelism, serial IO lane, per-tool timeouts), feed results back, and
/// repeat until `finish`, a plain text answer, or the iteration cap.
///
/// Events flow through a bounded channel — the turn is never buffered, and a
/// dropped receiver cancels the run at the next emission.
pub struct AgentEngine {
    client: Arc<dyn LlmClient>,
    model: Option<String>,
    tools: ToolRegistry,
    middlewares: Vec<Arc<dyn Middleware>>,
    context: ToolContext,
    max_parallel_workers: usize,
    tool_timeout: Duration,
    depth: usize,
}

struct BaseLlmCall {
    client: Arc<dyn LlmClient>,
    model: Option<String>,
}

#[async_trait]
impl LlmCall for BaseLlmCall {
    async fn call(&self, session: &mut AgentSession) -> Result<ChunkStream> {
        let mut messages = Vec::with_capacity(session.history.len() + 1);
        messages.push(Message::system(session.system_config.build()));
        messages.extend(session.history.iter().cloned());
        self.client
            .stream_chat(ChatRequest {
                messages,
                tools: session.tools.clone(),
                model: self.model.clone(),
            })
            .await
    }
}

/// Outcome of one dispatched call, in original call order.
struct DispatchedCall {
    call: ToolCallRequest,
    result: String,
}

impl AgentEngine {
    pub fn new(config: EngineConfig) -> Self {
        let mut context = config.context;
        if context.model_key.is_none() {
            context.model_key = Some(
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| config.client.default_model().to_string()),
            );
        }
        config.tools.configure_all(&context);
        Self {
            client: config.client,
            model: config.model,
            tools: config.tools,
            middlewares: config.middlewares,
            context,
            max_parallel_workers: config.max_parallel_workers.max(1),
            tool_timeout: config.tool_timeout,
            depth: config.depth,
        }
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Run the loop. Emits events through `events`; returns when the turn
    /// completes, the iteration budget is exhausted, or the consumer goes
    /// away (cancellation).
    pub async fn run(
        &self,
        messages: Vec<Message>,
        system_config: SystemPromptConfig,
        max_iterations: usize,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let mut session = AgentSession::new(
            messages,
            self.depth + 1,
            system_config,
            self.tools.definitions(),
        );
        let base = BaseLlmCall {
            client: self.client.clone(),
            model: self.model.clone(),
        };

        let mut finished = false;
        let mut finish_reason = "max_iterations".to_string();

        let outcome: Result<()> = async {
            for iteration in 0..max_iterations {
                session.set_metadata_usize("iteration_count", iteration + 1);

                let (full_content, tool_calls) =
                    self.stream_turn(&mut session, &base, events).await?;

                if tool_calls.is_empty() {
                    let message = Message::assistant(full_content);
                    session.history.push(message.clone());
                    Self::emit(events, AgentEvent::Message { message }).await?;
                    finished = true;
                    finish_reason = "end_turn".to_string();
                    return Ok(());
                }

                let message =
                    Message::assistant_with_tools(
                        if full_content.is_empty() { None } else { Some(full_content) },
                        tool_calls.clone(),
                    );
                session.history.push(message.clone());
                Self::emit(events, AgentEvent::Message { message }).await?;
                Self::emit(
                    events,
                    AgentEvent::ToolCall {
                        tool_calls: tool_calls.clone(),
                    },
                )
                .await?;

                let dispatched = self.dispatch_tools(tool_calls).await;

                // Repairs and downgrades rewrote calls in place; the stored
                // assistant message must reflect what actually ran.
                if let Some(last) = session.history.last_mut() {
                    last.tool_calls = Some(dispatched.iter().map(|d| d.call.clone()).collect());
                }

                let mut saw_finish = false;
                for DispatchedCall { call, result } in dispatched {
                    if call.name == "finish" {
                        saw_finish = true;
                    }
                    Self::emit(
                        events,
                        AgentEvent::ToolResult {
                            tool_call_id: call.id.clone(),
                            name: call.name.clone(),
                            result: result.clone(),
                        },
                    )
                    .await?;
                    let message = Message::tool_result(call.id, call.name, result);
                    session.history.push(message.clone());
                    Self::emit(events, AgentEvent::Message { message }).await?;
                }

                if saw_finish {
                    finished = true;
                    finish_reason = "finish".to_string();
                    return Ok(());
                }
            }
            Ok(())
        }
        .await;

        for middleware in &self.middlewares {
            middleware.cleanup();
        }

        match outcome {
            Ok(()) => {
                if !finished {
                    Self::emit(
                        events,
                        AgentEvent::error(
                            "max_iterations",
                            format!(
                                "Agent (PID: {}) has reached the maximum iteration limit ({}); the agent is closed.",
                                std::process::id(),
                                max_iterations
                            ),
                            false,
                        ),
                    )
                    .await?;
                    self.max_iterations_cleanup(max_iterations).await;
                }
                Self::emit(
                    events,
                    AgentEvent::Finish {
                        reason: finish_reason,
                    },
                )
                .await?;
                Ok(())
            }
            Err(e) => {
                if e.downcast_ref::<SwarmError>()
                    .is_some_and(|se| matches!(se, SwarmError::Abort))
                {
                    return Err(e);
                }
                let _ = Self::emit(
                    events,
                    AgentEvent::error("engine_error", format!("{:#}", e), true),
                )
                .await;
                let _ = Self::emit(
                    events,
                    AgentEvent::Finish {
                        reason: "error".to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    /// Delegate a query to a subagent: a fresh engine over the definition's
    /// tools and model, one recursion level deeper, forwarding events to the
    /// same channel.
    pub async fn invoke_agent(
        &self,
        definition: &SubagentDefinition,
        query: &str,
        max_iterations: usize,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let sub = AgentEngine::new(EngineConfig {
            client: self.client.clone(),
            model: definition.model.clone().or_else(|| self.model.clone()),
            tools: definition.tools.clone(),
            middlewares: definition.middlewares.clone(),
            context: self.context.clone(),
            max_parallel_workers: self.max_parallel_workers,
            tool_timeout: self.tool_timeout,
            depth: self.depth + 1,
        });
        sub.run(
            vec![Message::user(query)],
            SystemPromptConfig::new(definition.instructions.clone()),
            max_iterations,
            events,
        )
        .await
    }

    async fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> Result<()> {
        events
            .send(event)
            .await
            .map_err(|_| SwarmError::Abort.into())
    }

    /// One pipeline invocation plus stream consumption, retried on
    /// mid-stream transport errors with the full middleware chain applying
    /// each time.
    async fn stream_turn(
        &self,
        session: &mut AgentSession,
        base: &BaseLlmCall,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<(String, Vec<ToolCallRequest>)> {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=STREAM_RETRIES {
            let mut stream = Next::new(&self.middlewares, base).run(session).await?;

            let mut full_content = String::new();
            let mut accumulator: BTreeMap<usize, ToolCallAccumulator> = BTreeMap::new();
            let mut failed = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(delta) = &chunk.content {
                            full_content.push_str(delta);
                            Self::emit(
                                events,
                                AgentEvent::Token {
                                    delta: delta.clone(),
                                },
                            )
                            .await?;
                        }
                        absorb_tool_deltas(&mut accumulator, &chunk);
                    }
                    Err(e) => {
                        warn!(
                            "stream error: {}. Retrying ({}/{})...",
                            e,
                            attempt + 1,
                            STREAM_RETRIES
                        );
                        last_error = Some(e);
                        failed = true;
                        break;
                    }
                }
            }

            if !failed {
                let tool_calls = accumulator
                    .into_values()
                    .map(ToolCallAccumulator::into_request)
                    .collect();
                return Ok((full_content, tool_calls));
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("stream failed with no error detail")))
    }

    /// Execute one iteration's tool calls: IO-bound tools serially, the rest
    /// concurrently under the worker-pool semaphore. Results come back in
    /// original call order regardless of completion order.
    async fn dispatch_tools(&self, tool_calls: Vec<ToolCallRequest>) -> Vec<DispatchedCall> {
        let mut io_lane = Vec::new();
        let mut parallel_lane = Vec::new();
        for (position, call) in tool_calls.into_iter().enumerate() {
            if IO_BOUND_TOOLS.contains(&call.name.as_str()) {
                io_lane.push((position, call));
            } else {
                parallel_lane.push((position, call));
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_workers));
        let parallel_futures = parallel_lane.into_iter().map(|(position, call)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                (position, self.execute_single_tool(call).await)
            }
        });
        let mut results: Vec<(usize, DispatchedCall)> = join_all(parallel_futures).await;

        for (position, call) in io_lane {
            results.push((position, self.execute_single_tool(call).await));
        }

        results.sort_by_key(|(position, _)| *position);
        results.into_iter().map(|(_, dispatched)| dispatched).collect()
    }

    async fn execute_single_tool(&self, mut call: ToolCallRequest) -> DispatchedCall {
        // Arguments arrive as a JSON string, possibly truncated mid-stream.
        let params = match repair_truncated_json(&call.arguments) {
            Some((repaired, value)) => {
                if repaired != call.arguments {
                    info!("repaired truncated JSON arguments for tool '{}'", call.name);
                    call.arguments = repaired;
                }
                value
            }
            None => {
                warn!(
                    "unparseable arguments for tool '{}': {}",
                    call.name, call.arguments
                );
                call.arguments = "{}".to_string();
                json!({})
            }
        };

        let result = self.run_tool(&call.name, params).await;

        // A finish whose pre-check refused must not end the loop: downgrade
        // it to a wait carrying the diagnostic.
        if call.name == "finish" && (result.starts_with("Error:") || result.starts_with("BLOCKED")) {
            let reason = format!(
                "Your finish call was rejected: {}. Resolve the blocker and call finish again.",
                result
            );
            call.name = "wait".to_string();
            call.arguments =
                json!({"duration": 0.1, "wait_for_new_index": false, "reason": reason})
                    .to_string();
            let downgraded = match self.tools.get("wait") {
                Some(_) => {
                    self.run_tool("wait", serde_json::from_str(&call.arguments).unwrap_or_default())
                        .await
                }
                None => format!("[System] {}", reason),
            };
            return DispatchedCall {
                call,
                result: downgraded,
            };
        }

        DispatchedCall { call, result }
    }

    async fn run_tool(&self, name: &str, mut params: Value) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!(
                "Error: Tool '{}' not found. Please check the tool name and try again.",
                name
            );
        };

        if let Some(rejection) = validate_params(&tool.parameters(), &params) {
            return rejection;
        }
        substitute_path_variables(&mut params, &self.context);
        if let Some(rejection) = environment_guard(&params) {
            return rejection;
        }

        let timeout = tool_timeout_for(name, self.tool_timeout);
        let result = match tokio::time::timeout(timeout, tool.execute(params)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => format!("Error: {}", e),
            Err(_) => format!(
                "Error: Tool '{}' execution timed out after {}s.",
                name,
                timeout.as_secs()
            ),
        };
        truncate_with_notice(&result, MAX_TOOL_RESULT_CHARS)
    }

    /// Budget exhaustion: tell the parent which of our tasks are still open
    /// so it can re-plan, via its mailbox.
    async fn max_iterations_cleanup(&self, max_iterations: usize) {
        let (Some(blackboard_dir), Some(agent_name), Some(parent)) = (
            self.context.blackboard_dir.clone(),
            self.context.agent_name.clone(),
            self.context.parent_agent_name.clone(),
        ) else {
            return;
        };

        let outcome = tokio::task::spawn_blocking(move || {
            let board = Blackboard::new(&blackboard_dir).ok()?;
            let my_tasks: Vec<_> = board
                .read_plan()
                .ok()
                .flatten()
                .map(|plan| {
                    plan.tasks
                        .into_iter()
                        .filter(|t| t.assignees.contains(&agent_name))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let in_progress: Vec<_> = my_tasks
                .iter()
                .filter(|t| t.status == crate::blackboard::plan::TaskStatus::InProgress)
                .collect();

            let task_details = if in_progress.is_empty() {
                "  (none)".to_string()
            } else {
                in_progress
                    .iter()
                    .map(|t| format!("  - Task #{}: {}", t.id, t.description))
                    .collect::<Vec<_>>()
                    .join("\n")
            };

            let content = format!(
                "Agent {} reached max iterations ({}) and was terminated. Tasks may be incomplete.\n\nIN_PROGRESS tasks ({}):\n{}\n\nPlease review these tasks and decide next steps:\n- Check if tasks are actually complete (check artifacts)\n- Re-spawn the worker with higher max_iterations if needed\n- Break down into smaller subtasks if needed",
                agent_name,
                max_iterations,
                in_progress.len(),
                task_details
            );
            let in_progress_count = in_progress.len();
            let tasks_snapshot: Vec<_> = my_tasks
                .iter()
                .map(|t| {
                    json!({"id": t.id, "status": t.status, "description": t.description})
                })
                .collect();

            let message = MailMessage::new(content)
                .from_agent(agent_name.clone())
                .typed("max_iterations_reached")
                .with_extra("tasks", Value::Array(tasks_snapshot))
                .with_extra("in_progress_count", json!(in_progress_count));

            let mailbox = Mailbox::new(&blackboard_dir).ok()?;
            match mailbox.push(&parent, message) {
                Ok(()) => {
                    info!(
                        "[{}] notified {}: reached max_iterations with {} IN_PROGRESS tasks",
                        agent_name, parent, in_progress_count
                    );
                    Some(())
                }
                Err(e) => {
                    warn!("[{}] failed to notify parent agent: {}", agent_name, e);
                    None
                }
            }
        })
        .await;

        if outcome.is_err() {
            warn!("max-iterations cleanup task panicked");
        }
    }
}

/// Subagent definition for `invoke_agent` delegation.
#[derive(Clone)]
pub struct SubagentDefinition {
    pub name: String,
    pub instructions: String,
    pub model: Option<String>,
    pub tools: ToolRegistry,
    pub middlewares: Vec<Arc<dyn Middleware>>,
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_request(self) -> ToolCallRequest {
        ToolCallRequest {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}

fn absorb_tool_deltas(
    accumulator: &mut BTreeMap<usize, ToolCallAccumulator>,
    chunk: &StreamChunk,
) {
    for delta in &chunk.tool_calls {
        let entry = accumulator.entry(delta.index).or_default();
        if let Some(id) = &delta.id {
            entry.id.clone_from(id);
        }
        if let Some(name) = &delta.name {
            entry.name.push_str(name);
        }
        if let Some(arguments) = &delta.arguments {
            entry.arguments.push_str(arguments);
        }
    }
}

#[cfg(test)]
mod tests;

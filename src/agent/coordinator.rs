use crate::agent::engine::{AgentEngine, EngineConfig};
use crate::agent::events::AgentEvent;
use crate::agent::middleware::{
    ActivityLogger, ContextOverflow, DependencyGuard, ErrorRecovery, ExecutionBudget,
    InteractionRefinement, LoopBreaker, MailboxMiddleware, Middleware, NotificationAwareness,
    ParentProcessMonitor, RequestMonitor, SemanticDriftGuard, SwarmAgentGuard, SwarmState,
    ToolResultCache, WatchdogGuard,
};
use crate::agent::prompt::PromptBuilder;
use crate::agent::runtime::{cleanup_agent, log_event, log_text};
use crate::agent::session::SystemPromptConfig;
use crate::agent::tools::ask_user::AskUserTool;
use crate::agent::tools::base::{ConfirmCallback, InputCallback, ToolContext};
use crate::agent::tools::blackboard::BlackboardTool;
use crate::agent::tools::finish::FinishTool;
use crate::agent::tools::spawn::SpawnSwarmAgentTool;
use crate::agent::tools::status::SwarmStatusTool;
use crate::agent::tools::wait::WaitTool;
use crate::agent::tools::registry::ToolRegistry;
use crate::blackboard::Blackboard;
use crate::providers::base::{LlmClient, Message};
use crate::registry::AgentRegistry;
use anyhow::{Context, Result};
use chrono::Local;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Hard-stop headroom over the configured iteration budget, so the
/// ExecutionBudget middleware (soft limit) gets to demand final output
/// before the engine cuts the loop.
const MAX_ITERATIONS_BUFFER: usize = 20;

/// Default middleware chain for plain (non-swarm) engine runs and subagent
/// delegation, outermost first.
pub fn default_engine_middlewares(max_iterations: usize) -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(ContextOverflow),
        Arc::new(ErrorRecovery::new()),
        Arc::new(ToolResultCache::new(std::env::temp_dir())),
        Arc::new(LoopBreaker::new()),
        Arc::new(SemanticDriftGuard::new()),
        Arc::new(ExecutionBudget::new(max_iterations)),
    ]
}

pub struct SwarmAgentConfig {
    pub role: String,
    pub scenario: String,
    pub name: String,
    pub blackboard_dir: PathBuf,
    pub model_key: Option<String>,
    pub keys_path: Option<PathBuf>,
    pub max_iterations: usize,
    pub is_architect: bool,
    /// Parent (pid, registry name); workers terminate when it dies.
    pub parent: Option<(u32, String)>,
    pub exclude_tools: Vec<String>,
    pub input_callback: Option<Arc<dyn InputCallback>>,
    pub confirm_callback: Option<Arc<dyn ConfirmCallback>>,
}

/// How one coordinator run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The finish tool fired.
    Finished,
    /// The turn ended with a plain text answer.
    EndTurn,
    /// The iteration budget ran out.
    MaxIterations,
    /// The engine surfaced a terminal error.
    Failed(String),
}

/// One swarm agent process: the engine wrapped with the role-appropriate
/// middleware chain and tool palette, plus registry lifecycle and per-agent
/// trace logging. Both the Architect and workers are driven through this.
pub struct SwarmAgent {
    engine: AgentEngine,
    board: Blackboard,
    registry: AgentRegistry,
    name: String,
    role: String,
    scenario: String,
    max_iterations: usize,
    deregistered: AtomicBool,
}

impl SwarmAgent {
    pub fn new(config: SwarmAgentConfig, client: Arc<dyn LlmClient>) -> Result<Self> {
        let board = Blackboard::new(&config.blackboard_dir)
            .context("failed to initialize blackboard directory")?;
        let registry = AgentRegistry::new(&config.blackboard_dir)
            .context("failed to initialize agent registry")?;

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(BlackboardTool::new(board.clone())));
        tools.register(Arc::new(WaitTool::new(&config.blackboard_dir)));
        tools.register(Arc::new(FinishTool::new(board.clone())));
        tools.register(Arc::new(AskUserTool::new(config.input_callback.clone())));
        tools.register(Arc::new(SpawnSwarmAgentTool::new(&config.blackboard_dir)));
        if config.is_architect {
            tools.register(Arc::new(SwarmStatusTool::new(board.clone())));
        }
        for excluded in &config.exclude_tools {
            tools.remove(excluded);
        }

        let middlewares = Self::build_middlewares(&config, &board);

        let context = ToolContext {
            agent_name: Some(config.name.clone()),
            parent_agent_name: config.parent.as_ref().map(|(_, name)| name.clone()),
            is_architect: config.is_architect,
            model_key: config.model_key.clone(),
            blackboard_dir: Some(config.blackboard_dir.clone()),
            root_path: config.blackboard_dir.parent().map(PathBuf::from),
            keys_path: config.keys_path.clone(),
            max_iterations: config.max_iterations,
            input_callback: config.input_callback.clone(),
            confirm_callback: config.confirm_callback.clone(),
        };

        let mut engine_config = EngineConfig::new(client, tools);
        engine_config.model = config.model_key.clone();
        engine_config.middlewares = middlewares;
        engine_config.context = context;
        let engine = AgentEngine::new(engine_config);

        Ok(Self {
            engine,
            board,
            registry,
            name: config.name,
            role: config.role,
            scenario: config.scenario,
            max_iterations: config.max_iterations,
            deregistered: AtomicBool::new(false),
        })
    }

    /// Assemble the role-specific chain, outermost first. Workers swap the
    /// WatchdogGuard for the SwarmAgentGuard and add the parent monitor; the
    /// Architect gets the watchdog plus the permission-request monitor.
    fn build_middlewares(
        config: &SwarmAgentConfig,
        board: &Blackboard,
    ) -> Vec<Arc<dyn Middleware>> {
        let mut chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ContextOverflow),
            Arc::new(ErrorRecovery::new()),
            Arc::new(ToolResultCache::new(&config.blackboard_dir)),
            Arc::new(LoopBreaker::new()),
            Arc::new(InteractionRefinement),
            Arc::new(DependencyGuard::new(board.clone())),
            Arc::new(MailboxMiddleware::new(&config.name, &config.blackboard_dir)),
            Arc::new(SwarmState::new(&config.blackboard_dir)),
            Arc::new(NotificationAwareness::new(board.clone())),
            // Activity entries are best-effort; give up on the lock quickly
            // rather than stall the turn.
            Arc::new(ActivityLogger::new(
                &config.name,
                board.clone().with_lock_timeout(std::time::Duration::from_secs(5)),
            )),
        ];

        if config.is_architect {
            chain.push(Arc::new(WatchdogGuard::new(&config.name, board.clone())));
        } else {
            chain.push(Arc::new(SwarmAgentGuard::new(&config.name)));
        }

        chain.push(Arc::new(ExecutionBudget::new(config.max_iterations)));

        if config.is_architect {
            chain.push(Arc::new(RequestMonitor::new(
                &config.blackboard_dir,
                config.confirm_callback.clone(),
            )));
        } else if let Some((parent_pid, parent_name)) = &config.parent {
            chain.push(Arc::new(ParentProcessMonitor::new(
                *parent_pid,
                parent_name.clone(),
                config.name.clone(),
                board.clone(),
            )));
        }

        chain
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn board(&self) -> &Blackboard {
        &self.board
    }

    pub fn engine(&self) -> &AgentEngine {
        &self.engine
    }

    pub fn register(&self) {
        match self.registry.register_agent(&self.name, &self.role, std::process::id()) {
            Ok(()) => info!("[{}] registered in blackboard registry", self.name),
            Err(e) => warn!("[{}] failed to register: {}", self.name, e),
        }
    }

    /// Park the agent between TAP turns (an aborted turn leaves it IDLE,
    /// not DEAD).
    pub fn mark_idle(&self) {
        if let Err(e) = self.registry.set_status(&self.name, crate::registry::AgentStatus::Idle) {
            warn!("[{}] failed to mark IDLE: {}", self.name, e);
        }
    }

    /// Mark this agent DEAD and broadcast its departure. Idempotent.
    pub fn deregister(&self) {
        if self.deregistered.swap(true, Ordering::SeqCst) {
            return;
        }
        cleanup_agent(
            &self.registry,
            &self.board,
            &self.name,
            "Self-terminated or normal exit",
        );
    }

    pub fn build_system_prompt(&self) -> String {
        let prompt = PromptBuilder::new(self.board.clone()).build(&self.role, &self.scenario);
        let blackboard = self.board.root().to_string_lossy().to_string();
        let root = self
            .board
            .root()
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        prompt
            .replace("{{blackboard}}", &blackboard)
            .replace("{{root_path}}", &root)
    }

    /// Run to completion with console + trace logging. Registers first and
    /// always deregisters, on every exit path.
    pub async fn run(&self, goal: &str) -> Result<RunOutcome> {
        info!("[{}] booting with role ({} chars)", self.name, self.role.len());
        self.register();

        let system_config = SystemPromptConfig::new(self.build_system_prompt());
        let initial = if goal.is_empty() {
            "Hello, please check the blackboard indices and begin your work.".to_string()
        } else {
            goal.to_string()
        };
        let messages = vec![Message::user(initial)];

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let consumer = tokio::spawn(consume_events(
            rx,
            self.board.root().to_path_buf(),
            self.name.clone(),
        ));

        let result = self
            .engine
            .run(
                messages,
                system_config,
                self.max_iterations + MAX_ITERATIONS_BUFFER,
                &tx,
            )
            .await;
        drop(tx);

        let outcome = match consumer.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[{}] event consumer failed: {}", self.name, e);
                RunOutcome::Failed("event consumer panicked".to_string())
            }
        };

        self.deregister();

        match result {
            Ok(()) => Ok(outcome),
            Err(e) => {
                if matches!(outcome, RunOutcome::Failed(_)) {
                    Ok(outcome)
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl Drop for SwarmAgent {
    fn drop(&mut self) {
        self.deregister();
    }
}

/// Consume engine events: stream tokens to the console, mirror everything
/// else into the agent's `.log` / `.jsonl` traces, and derive the outcome.
async fn consume_events(
    mut rx: mpsc::Receiver<AgentEvent>,
    blackboard_dir: PathBuf,
    name: String,
) -> RunOutcome {
    let mut outcome = RunOutcome::Failed("no finish event".to_string());

    while let Some(event) = rx.recv().await {
        if !matches!(event, AgentEvent::Token { .. }) {
            let data = serde_json::to_value(&event).unwrap_or_else(|_| json!({}));
            log_event(&blackboard_dir, &name, event.kind(), data);
        }

        let timestamp = Local::now().format("[%Y-%m-%d %H:%M:%S]");
        match &event {
            AgentEvent::Token { delta } => {
                print!("{}", delta);
            }
            AgentEvent::Message { message } => {
                log_text(
                    &blackboard_dir,
                    &name,
                    &format!("\n{} [{}] {}", timestamp, message.role, message.content_str()),
                );
            }
            AgentEvent::ToolCall { tool_calls } => {
                for call in tool_calls {
                    let line = format!("{} [Tool Call] {}({})", timestamp, call.name, call.arguments);
                    println!("\n{}", line);
                    log_text(&blackboard_dir, &name, &line);
                }
            }
            AgentEvent::ToolResult { name: tool, result, .. } => {
                let preview: String = result.chars().take(100).collect();
                println!("{} [Tool Result] {} -> {}", timestamp, tool, preview);
                log_text(
                    &blackboard_dir,
                    &name,
                    &format!("{} [Tool Result] {} -> {}", timestamp, tool, result),
                );
            }
            AgentEvent::Error { message, .. } => {
                println!("\n{} [SwarmAgent] Error: {}", timestamp, message);
                log_text(&blackboard_dir, &name, &format!("{} Error: {}", timestamp, message));
            }
            AgentEvent::Finish { reason } => {
                log_text(
                    &blackboard_dir,
                    &name,
                    &format!("\n{} [SwarmAgent] Session finished ({}).", timestamp, reason),
                );
                outcome = match reason.as_str() {
                    "finish" => RunOutcome::Finished,
                    "end_turn" => RunOutcome::EndTurn,
                    "max_iterations" => RunOutcome::MaxIterations,
                    other => RunOutcome::Failed(other.to_string()),
                };
            }
        }
    }

    outcome
}

/// Worker shutdown path: SIGTERM deregisters, then reaps the whole process
/// group so grandchildren (browser drivers etc.) don't outlive the agent.
pub fn install_sigterm_handler(registry: AgentRegistry, board: Blackboard, name: String) {
    tokio::spawn(async move {
        let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            warn!("[{}] could not install SIGTERM handler", name);
            return;
        };
        sigterm.recv().await;
        info!("[{}] SIGTERM received, cleaning up", name);
        cleanup_agent(&registry, &board, &name, "Terminated by signal");
        // Reap the process group without re-entering this handler.
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
            let pgid = libc::getpgid(0);
            if pgid > 0 {
                libc::killpg(pgid, libc::SIGTERM);
            }
        }
        std::process::exit(0);
    });
}

#[cfg(test)]
mod tests;

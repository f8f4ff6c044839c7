use crate::agent::coordinator::{RunOutcome, SwarmAgent, SwarmAgentConfig, install_sigterm_handler};
use crate::blackboard::Blackboard;
use crate::config::Credentials;
use crate::providers::create_client;
use crate::registry::AgentRegistry;
use crate::tap::{AgentProcess, StdinDispatcher, TapConfirmCallback, TapInputCallback};
use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code for a user interrupt, SIGINT convention.
const EXIT_INTERRUPTED: u8 = 130;

const DEFAULT_ARCHITECT_MAX_ITERATIONS: usize = 200;

#[derive(Parser)]
#[command(name = "swarmboard")]
#[command(about = "Multi-agent swarm orchestrator over a file-system blackboard", version)]
pub struct Cli {
    /// The mission or query for the swarm
    query: Option<String>,

    /// Role of the main agent
    #[arg(long, default_value = "Architect")]
    role: String,

    /// Name of the main agent
    #[arg(long, default_value = "Watchdog")]
    name: String,

    /// Keep the previous blackboard state (default cleans and recreates)
    #[arg(long)]
    keep_history: bool,

    /// Model provider key (e.g. openai/gpt-4o)
    #[arg(long)]
    model: Option<String>,

    /// Path to keys.json
    #[arg(long)]
    keys: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker agent (normally spawned by the Architect)
    Worker {
        #[arg(long)]
        name: String,
        #[arg(long)]
        role: String,
        #[arg(long, default_value = "")]
        goal: String,
        #[arg(long, default_value = ".blackboard")]
        blackboard: PathBuf,
        #[arg(long, default_value_t = 0)]
        parent_pid: u32,
        #[arg(long, default_value = "Watchdog")]
        parent_agent_name: String,
        #[arg(long)]
        model: Option<String>,
        /// Comma-separated list of tools to exclude
        #[arg(long, default_value = "")]
        exclude_tools: String,
        #[arg(long, default_value_t = 50)]
        max_iterations: usize,
        #[arg(long)]
        keys: Option<PathBuf>,
    },
    /// Run the coordinator as a TAP server over stdio (for a UI front-end)
    Tap {
        #[arg(long, default_value = "Watchdog")]
        name: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = ".blackboard")]
        blackboard: PathBuf,
        #[arg(long, default_value_t = DEFAULT_ARCHITECT_MAX_ITERATIONS)]
        max_iterations: usize,
        #[arg(long)]
        keys: Option<PathBuf>,
    },
}

pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Worker {
            name,
            role,
            goal,
            blackboard,
            parent_pid,
            parent_agent_name,
            model,
            exclude_tools,
            max_iterations,
            keys,
        }) => {
            run_worker(WorkerArgs {
                name,
                role,
                goal,
                blackboard,
                parent_pid,
                parent_agent_name,
                model,
                exclude_tools,
                max_iterations,
                keys,
            })
            .await
        }
        Some(Commands::Tap {
            name,
            model,
            blackboard,
            max_iterations,
            keys,
        }) => run_tap(name, model, blackboard, max_iterations, keys).await,
        None => run_architect(cli).await,
    }
}

// ---------------------------------------------------------------------------
// Architect entry
// ---------------------------------------------------------------------------

async fn run_architect(cli: Cli) -> Result<ExitCode> {
    let mission = match cli.query {
        Some(query) if !query.trim().is_empty() => query,
        _ => prompt_for_mission().await?,
    };
    if mission.is_empty() {
        println!("No mission provided. Exiting.");
        return Ok(ExitCode::from(2));
    }

    let root = std::env::current_dir().context("cannot resolve working directory")?;
    let blackboard_dir = root.join(".blackboard");

    if !cli.keep_history && blackboard_dir.exists() {
        info!("cleaning blackboard at {}", blackboard_dir.display());
        if let Err(e) = std::fs::remove_dir_all(&blackboard_dir) {
            warn!("failed to clean blackboard: {}", e);
        }
    }

    let credentials = Credentials::load(cli.keys.as_deref());
    let client = create_client(cli.model.as_deref(), &credentials)?;

    let agent = SwarmAgent::new(
        SwarmAgentConfig {
            role: load_architect_role(&root, &cli.role),
            scenario: "You are the Root Architect. Analyze the mission, design the blackboard indices, and spawn agents to execute it.".to_string(),
            name: cli.name.clone(),
            blackboard_dir: blackboard_dir.clone(),
            model_key: cli.model.clone(),
            keys_path: cli.keys.clone(),
            max_iterations: DEFAULT_ARCHITECT_MAX_ITERATIONS,
            is_architect: true,
            parent: None,
            exclude_tools: Vec::new(),
            input_callback: None,
            confirm_callback: None,
        },
        client,
    )?;

    println!("[Launcher] Starting {} ({})", cli.name, cli.role);
    println!("[Launcher] Mission: {}\n", mission);

    let goal = format!("The User's Mission is: {}", mission);
    let outcome = tokio::select! {
        result = agent.run(&goal) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let code = match outcome {
        None => {
            println!("\n[Launcher] Interrupted by user.");
            agent.deregister();
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Some(Ok(RunOutcome::Finished)) => {
            // An UNKNOWN-status plan may finish; only a mission still
            // IN_PROGRESS is suspicious.
            if !mission_is_done(&blackboard_dir) {
                warn!("finish fired with the mission still IN_PROGRESS");
            }
            ExitCode::SUCCESS
        }
        Some(Ok(RunOutcome::EndTurn)) => ExitCode::SUCCESS,
        Some(Ok(outcome)) => {
            warn!("architect ended without finishing: {:?}", outcome);
            ExitCode::FAILURE
        }
        Some(Err(e)) => {
            warn!("architect failed: {:#}", e);
            ExitCode::FAILURE
        }
    };

    archive_session(&root, &blackboard_dir);
    Ok(code)
}

async fn prompt_for_mission() -> Result<String> {
    println!("\nPlease enter the Swarm Mission:");
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(line.trim().to_string())
}

/// Prefer a project-local `prompts/architect.md`; fall back to the built-in
/// role text.
fn load_architect_role(root: &Path, role: &str) -> String {
    let prompt_path = root.join("prompts/architect.md");
    if let Ok(content) = std::fs::read_to_string(&prompt_path) {
        return content;
    }
    format!(
        r"You are the Root {role} of an agent swarm.

Your protocol, in order:
1. Analyze the mission and decompose it into tasks with explicit dependencies.
2. Create `central_plan.md` on the blackboard (via `blackboard create_index`) carrying the task plan as a fenced JSON block.
3. Call `ask_user` to have the plan verified before anything executes.
4. Spawn one worker per role with `spawn_swarm_agent`; each worker claims and completes its assigned tasks.
5. Supervise: watch the swarm status and notifications, re-spawn dead workers, reassign stuck tasks, answer permission requests.
6. When every task is DONE, set the mission status to DONE in `central_plan.md`, then call `finish`.

You coordinate; you do not execute the work yourself."
    )
}

fn mission_is_done(blackboard_dir: &Path) -> bool {
    Blackboard::new(blackboard_dir)
        .ok()
        .and_then(|board| board.read_plan().ok().flatten())
        .is_none_or(|plan| {
            plan.mission_status() != crate::blackboard::plan::MissionStatus::InProgress
        })
}

/// Copy the blackboard into `logs/session_<timestamp>/` for post-mortems.
fn archive_session(root: &Path, blackboard_dir: &Path) {
    if !blackboard_dir.exists() {
        return;
    }
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let target = root.join("logs").join(format!("session_{}", timestamp));
    match copy_dir_recursive(blackboard_dir, &target) {
        Ok(()) => println!("[Launcher] Session archived to {}", target.display()),
        Err(e) => warn!("failed to archive session: {}", e),
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker entry
// ---------------------------------------------------------------------------

struct WorkerArgs {
    name: String,
    role: String,
    goal: String,
    blackboard: PathBuf,
    parent_pid: u32,
    parent_agent_name: String,
    model: Option<String>,
    exclude_tools: String,
    max_iterations: usize,
    keys: Option<PathBuf>,
}

async fn run_worker(args: WorkerArgs) -> Result<ExitCode> {
    let credentials = Credentials::load(args.keys.as_deref());
    let client = create_client(args.model.as_deref(), &credentials)?;

    let exclude_tools: Vec<String> = args
        .exclude_tools
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();

    let agent = SwarmAgent::new(
        SwarmAgentConfig {
            role: args.role.clone(),
            scenario: String::new(),
            name: args.name.clone(),
            blackboard_dir: args.blackboard.clone(),
            model_key: args.model.clone(),
            keys_path: args.keys.clone(),
            max_iterations: args.max_iterations,
            is_architect: false,
            parent: Some((args.parent_pid, args.parent_agent_name.clone())),
            exclude_tools,
            input_callback: None,
            confirm_callback: None,
        },
        client,
    )?;

    // SIGTERM (from the parent or the parent monitor) deregisters and reaps
    // the worker's whole process group.
    let registry = AgentRegistry::new(&args.blackboard)?;
    let board = Blackboard::new(&args.blackboard)?;
    install_sigterm_handler(registry, board, args.name.clone());

    match agent.run(&args.goal).await {
        Ok(RunOutcome::Finished | RunOutcome::EndTurn) => Ok(ExitCode::SUCCESS),
        Ok(outcome) => {
            warn!("[{}] worker ended without finish: {:?}", args.name, outcome);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            warn!("[{}] worker crashed: {:#}", args.name, e);
            Ok(ExitCode::FAILURE)
        }
    }
}

// ---------------------------------------------------------------------------
// TAP entry
// ---------------------------------------------------------------------------

async fn run_tap(
    name: String,
    model: Option<String>,
    blackboard: PathBuf,
    max_iterations: usize,
    keys: Option<PathBuf>,
) -> Result<ExitCode> {
    let credentials = Credentials::load(keys.as_deref());
    let client = create_client(model.as_deref(), &credentials)?;

    let dispatcher = StdinDispatcher::new();
    dispatcher.spawn_stdin_reader();

    let root = std::env::current_dir().context("cannot resolve working directory")?;
    let agent = SwarmAgent::new(
        SwarmAgentConfig {
            role: load_architect_role(&root, "Architect"),
            scenario: String::new(),
            name,
            blackboard_dir: blackboard,
            model_key: model,
            keys_path: keys,
            max_iterations,
            is_architect: true,
            parent: None,
            exclude_tools: Vec::new(),
            input_callback: Some(Arc::new(TapInputCallback::new(dispatcher.clone()))),
            confirm_callback: Some(Arc::new(TapConfirmCallback::new(dispatcher.clone()))),
        },
        client,
    )?;

    let mut process = AgentProcess::new(Arc::new(agent), dispatcher, max_iterations);
    process.run().await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architect_defaults() {
        let cli = Cli::parse_from(["swarmboard", "build me a web scraper"]);
        assert_eq!(cli.role, "Architect");
        assert_eq!(cli.name, "Watchdog");
        assert!(!cli.keep_history);
        assert_eq!(cli.query.as_deref(), Some("build me a web scraper"));
    }

    #[test]
    fn worker_flags_parse() {
        let cli = Cli::parse_from([
            "swarmboard",
            "worker",
            "--name",
            "Coder",
            "--role",
            "Engineer",
            "--goal",
            "implement the parser",
            "--blackboard",
            "/tmp/bb",
            "--parent-pid",
            "4242",
            "--parent-agent-name",
            "Watchdog",
            "--exclude-tools",
            "ask_user,spawn_swarm_agent",
        ]);
        let Some(Commands::Worker {
            name,
            parent_pid,
            exclude_tools,
            max_iterations,
            ..
        }) = cli.command
        else {
            panic!("expected worker subcommand");
        };
        assert_eq!(name, "Coder");
        assert_eq!(parent_pid, 4242);
        assert_eq!(exclude_tools, "ask_user,spawn_swarm_agent");
        assert_eq!(max_iterations, 50);
    }

    #[test]
    fn copy_dir_recursive_copies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("sub/b.txt"), "b").unwrap();

        let dst = dir.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(dst.join("sub/b.txt")).unwrap(), "b");
    }

    #[test]
    fn mission_done_when_no_plan() {
        let dir = tempfile::tempdir().unwrap();
        assert!(mission_is_done(&dir.path().join(".blackboard")));
    }
}

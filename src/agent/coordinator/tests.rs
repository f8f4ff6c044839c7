use super::*;
use crate::providers::base::{ChatRequest, ChunkStream, StreamChunk};
use crate::registry::AgentStatus;
use async_trait::async_trait;

struct FinishingClient;

#[async_trait]
impl LlmClient for FinishingClient {
    async fn stream_chat(&self, _request: ChatRequest) -> Result<ChunkStream> {
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(
            StreamChunk::tool_call(
                "call_finish",
                "finish",
                r#"{"output": "mission handled"}"#,
                0,
            ),
        )])))
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

fn architect_config(dir: &std::path::Path) -> SwarmAgentConfig {
    SwarmAgentConfig {
        role: "You are the Root Architect.".to_string(),
        scenario: "Coordinate the swarm.".to_string(),
        name: "Watchdog".to_string(),
        blackboard_dir: dir.join(".blackboard"),
        model_key: None,
        keys_path: None,
        max_iterations: 5,
        is_architect: true,
        parent: None,
        exclude_tools: Vec::new(),
        input_callback: None,
        confirm_callback: None,
    }
}

fn worker_config(dir: &std::path::Path) -> SwarmAgentConfig {
    SwarmAgentConfig {
        role: "Engineer".to_string(),
        scenario: String::new(),
        name: "Coder".to_string(),
        blackboard_dir: dir.join(".blackboard"),
        model_key: None,
        keys_path: None,
        max_iterations: 5,
        is_architect: false,
        parent: Some((std::process::id(), "Watchdog".to_string())),
        exclude_tools: vec!["ask_user".to_string()],
        input_callback: None,
        confirm_callback: None,
    }
}

#[tokio::test]
async fn architect_runs_to_finish_and_deregisters() {
    let dir = tempfile::tempdir().unwrap();
    let agent = SwarmAgent::new(architect_config(dir.path()), Arc::new(FinishingClient)).unwrap();

    let outcome = agent.run("The mission is: write a haiku.").await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished);

    let registry = AgentRegistry::new(&dir.path().join(".blackboard")).unwrap();
    let entry = registry.get_agent("Watchdog").unwrap();
    assert_eq!(entry.status, AgentStatus::Dead);

    // Trace files exist and carry the finish.
    let log = std::fs::read_to_string(dir.path().join(".blackboard/logs/Watchdog.log")).unwrap();
    assert!(log.contains("Session finished (finish)"));
    let jsonl = std::fs::read_to_string(dir.path().join(".blackboard/logs/Watchdog.jsonl")).unwrap();
    assert!(jsonl.contains("\"tool_call\""));
    assert!(jsonl.contains("\"finish\""));
}

#[tokio::test]
async fn worker_palette_excludes_requested_tools() {
    let dir = tempfile::tempdir().unwrap();
    let agent = SwarmAgent::new(worker_config(dir.path()), Arc::new(FinishingClient)).unwrap();
    // The engine context sees worker identity; ask_user must be gone from
    // the offered definitions.
    assert_eq!(agent.engine().context().agent_name.as_deref(), Some("Coder"));
    let outcome = agent.run("do the task").await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished);
    let jsonl = std::fs::read_to_string(dir.path().join(".blackboard/logs/Coder.jsonl")).unwrap();
    assert!(!jsonl.contains("ask_user"));
}

#[tokio::test]
async fn deregister_is_idempotent_and_broadcasts_once() {
    let dir = tempfile::tempdir().unwrap();
    let agent = SwarmAgent::new(architect_config(dir.path()), Arc::new(FinishingClient)).unwrap();
    agent.register();
    agent.deregister();
    agent.deregister();

    let board = agent.board();
    let tail = board.tail_notifications(20, 5000).unwrap().unwrap();
    let departures = tail.matches("has left the swarm").count();
    assert_eq!(departures, 1);
}

#[tokio::test]
async fn system_prompt_resolves_path_variables() {
    let dir = tempfile::tempdir().unwrap();
    let agent = SwarmAgent::new(architect_config(dir.path()), Arc::new(FinishingClient)).unwrap();
    let prompt = agent.build_system_prompt();
    assert!(!prompt.contains("{{blackboard}}"));
    assert!(prompt.contains(dir.path().join(".blackboard").to_string_lossy().as_ref()));
}

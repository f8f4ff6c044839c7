use super::*;
use crate::agent::events::AgentEvent;
use crate::blackboard::CENTRAL_PLAN;
use std::sync::Mutex;
use std::collections::VecDeque;

/// Scripted streaming client: each `stream_chat` pops the next canned
/// stream. An exhausted script yields a bare `finish` call so loops end.
struct MockClient {
    scripts: Mutex<VecDeque<Vec<Result<StreamChunk>>>>,
}

impl MockClient {
    fn new(scripts: Vec<Vec<Result<StreamChunk>>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
        })
    }
}

#[async_trait]
impl LlmClient for MockClient {
    async fn stream_chat(&self, _request: ChatRequest) -> Result<ChunkStream> {
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![Ok(StreamChunk::tool_call(
                "call_done",
                "finish",
                r#"{"output": "fallback"}"#,
                0,
            ))]
        });
        Ok(Box::pin(futures_util::stream::iter(script)))
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> String {
        "echo back".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }
    async fn execute(&self, params: Value) -> Result<String> {
        Ok(format!("echo: {}", params["text"].as_str().unwrap_or("")))
    }
}

struct SlowTool {
    delay: Duration,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> String {
        "sleeps then answers".to_string()
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _params: Value) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok("slow done".to_string())
    }
}

struct FinishLike {
    blocked: bool,
}

#[async_trait]
impl Tool for FinishLike {
    fn name(&self) -> &str {
        "finish"
    }
    fn description(&self) -> String {
        "finish".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"output": {"type": "string"}, "reason": {"type": "string"}},
            "required": ["output"]
        })
    }
    async fn execute(&self, _params: Value) -> Result<String> {
        if self.blocked {
            Ok("BLOCKED: You have 1 IN_PROGRESS task(s) that are not marked as DONE.".to_string())
        } else {
            Ok("Agent Finished.".to_string())
        }
    }
}

fn basic_tools(finish_blocked: bool) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    tools.register(Arc::new(FinishLike {
        blocked: finish_blocked,
    }));
    let dir = std::env::temp_dir();
    tools.register(Arc::new(crate::agent::tools::wait::WaitTool::new(&dir)));
    tools
}

async fn run_collect(
    engine: &AgentEngine,
    max_iterations: usize,
) -> (Result<()>, Vec<AgentEvent>) {
    let (tx, mut rx) = mpsc::channel(64);
    let mut events = Vec::new();
    let outcome = {
        let run = engine.run(
            vec![Message::user("go")],
            SystemPromptConfig::new("you are a test agent"),
            max_iterations,
            &tx,
        );
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => break result,
                Some(event) = rx.recv() => events.push(event),
            }
        }
    };
    drop(tx);
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (outcome, events)
}

fn finish_reason(events: &[AgentEvent]) -> String {
    events
        .iter()
        .rev()
        .find_map(|e| match e {
            AgentEvent::Finish { reason } => Some(reason.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn text_only_turn_ends_cleanly() {
    let client = MockClient::new(vec![vec![
        Ok(StreamChunk::token("Hello ")),
        Ok(StreamChunk::token("world")),
    ]]);
    let engine = AgentEngine::new(EngineConfig::new(client, basic_tools(false)));

    let (outcome, events) = run_collect(&engine, 5).await;
    outcome.unwrap();

    let tokens: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Token { delta } => Some(delta.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, "Hello world");
    assert_eq!(finish_reason(&events), "end_turn");
}

#[tokio::test]
async fn tool_call_executes_and_finish_ends_loop() {
    let client = MockClient::new(vec![
        vec![Ok(StreamChunk::tool_call(
            "call_1",
            "echo",
            r#"{"text": "ping"}"#,
            0,
        ))],
        vec![Ok(StreamChunk::tool_call(
            "call_2",
            "finish",
            r#"{"output": "all good"}"#,
            0,
        ))],
    ]);
    let engine = AgentEngine::new(EngineConfig::new(client, basic_tools(false)));

    let (outcome, events) = run_collect(&engine, 5).await;
    outcome.unwrap();

    let results: Vec<(String, String)> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolResult { name, result, .. } => Some((name.clone(), result.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(results[0], ("echo".to_string(), "echo: ping".to_string()));
    assert_eq!(results[1].0, "finish");
    assert_eq!(finish_reason(&events), "finish");
}

#[tokio::test]
async fn blocked_finish_downgraded_to_wait() {
    let client = MockClient::new(vec![
        vec![Ok(StreamChunk::tool_call(
            "call_1",
            "finish",
            r#"{"output": "premature"}"#,
            0,
        ))],
        vec![Ok(StreamChunk::tool_call(
            "call_2",
            "echo",
            r#"{"text": "still working"}"#,
            0,
        ))],
    ]);
    let mut config = EngineConfig::new(client, basic_tools(true));
    config.max_parallel_workers = 2;
    let engine = AgentEngine::new(config);

    let (outcome, events) = run_collect(&engine, 3).await;
    outcome.unwrap();

    // First result must be the downgraded wait, not a finish.
    let first = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { name, result, .. } => Some((name.clone(), result.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(first.0, "wait");
    assert!(first.1.contains("finish call was rejected"));
    // The loop carried on past the blocked finish.
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResult { name, .. } if name == "echo"
    )));
}

#[tokio::test]
async fn truncated_arguments_are_repaired() {
    let client = MockClient::new(vec![
        vec![Ok(StreamChunk::tool_call(
            "call_1",
            "echo",
            r#"{"text": "cut off"#, // truncated mid-string
            0,
        ))],
        vec![Ok(StreamChunk::tool_call(
            "call_2",
            "finish",
            r#"{"output": "done"}"#,
            0,
        ))],
    ]);
    let engine = AgentEngine::new(EngineConfig::new(client, basic_tools(false)));

    let (outcome, events) = run_collect(&engine, 3).await;
    outcome.unwrap();

    let echo_result = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { name, result, .. } if name == "echo" => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(echo_result, "echo: cut off");
}

#[tokio::test]
async fn unknown_tool_reports_corrective_error() {
    let client = MockClient::new(vec![vec![Ok(StreamChunk::tool_call(
        "call_1",
        "teleport",
        "{}",
        0,
    ))]]);
    let engine = AgentEngine::new(EngineConfig::new(client, basic_tools(false)));

    let (outcome, events) = run_collect(&engine, 2).await;
    outcome.unwrap();

    let result = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { result, .. } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert!(result.contains("Tool 'teleport' not found"));
}

#[tokio::test]
async fn schema_validation_rejects_bad_arguments() {
    let client = MockClient::new(vec![vec![Ok(StreamChunk::tool_call(
        "call_1",
        "echo",
        r#"{"wrong_field": 1}"#,
        0,
    ))]]);
    let engine = AgentEngine::new(EngineConfig::new(client, basic_tools(false)));

    let (outcome, events) = run_collect(&engine, 2).await;
    outcome.unwrap();

    let result = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { result, .. } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert!(result.contains("Missing required parameter 'text'"));
}

#[tokio::test]
async fn results_keep_original_call_order() {
    // Call 0 is slow, call 1 fast; results must still arrive as [slow, echo].
    let client = MockClient::new(vec![vec![
        Ok(StreamChunk::tool_call("call_s", "slow", "{}", 0)),
        Ok(StreamChunk::tool_call(
            "call_e",
            "echo",
            r#"{"text": "fast"}"#,
            1,
        )),
    ]]);
    let mut tools = basic_tools(false);
    tools.register(Arc::new(SlowTool {
        delay: Duration::from_millis(150),
    }));
    let engine = AgentEngine::new(EngineConfig::new(client, tools));

    let (outcome, events) = run_collect(&engine, 2).await;
    outcome.unwrap();

    let order: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolResult { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(order[0], "slow");
    assert_eq!(order[1], "echo");
}

#[tokio::test]
async fn tool_timeout_yields_synthetic_error_and_loop_continues() {
    let client = MockClient::new(vec![
        vec![Ok(StreamChunk::tool_call("call_s", "slow", "{}", 0))],
        vec![Ok(StreamChunk::tool_call(
            "call_f",
            "finish",
            r#"{"output": "done"}"#,
            0,
        ))],
    ]);
    let mut tools = basic_tools(false);
    tools.register(Arc::new(SlowTool {
        delay: Duration::from_secs(60),
    }));
    let mut config = EngineConfig::new(client, tools);
    config.tool_timeout = Duration::from_millis(100);
    let engine = AgentEngine::new(config);

    let (outcome, events) = run_collect(&engine, 3).await;
    outcome.unwrap();

    let result = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { name, result, .. } if name == "slow" => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert!(result.contains("execution timed out"));
    assert_eq!(finish_reason(&events), "finish");
}

#[tokio::test]
async fn mid_stream_error_is_retried() {
    let client = MockClient::new(vec![
        vec![
            Ok(StreamChunk::token("partial")),
            Err(crate::errors::SwarmError::Provider {
                message: "read timed out".to_string(),
                retryable: true,
            }
            .into()),
        ],
        vec![Ok(StreamChunk::token("complete answer"))],
    ]);
    let engine = AgentEngine::new(EngineConfig::new(client, basic_tools(false)));

    let (outcome, events) = run_collect(&engine, 2).await;
    outcome.unwrap();

    let last_message = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::Message { message } if message.is_assistant() => {
                Some(message.content_str().to_string())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(last_message, "complete answer");
    assert_eq!(finish_reason(&events), "end_turn");
}

#[tokio::test]
async fn max_iterations_notifies_parent_mailbox() {
    let dir = tempfile::tempdir().unwrap();
    let blackboard_dir = dir.path().join(".blackboard");
    let board = Blackboard::new(&blackboard_dir).unwrap();
    let doc = format!(
        "---\nname: \"Plan\"\ndescription: \"d\"\nusage_policy: \"u\"\n---\n```json\n{}\n```\n",
        serde_json::to_string_pretty(&json!({
            "mission_goal": "m", "status": "IN_PROGRESS",
            "tasks": [
                {"id": 1, "description": "analysis", "status": "IN_PROGRESS",
                 "assignees": ["Coder"], "dependencies": []},
                {"id": 2, "description": "other work", "status": "PENDING",
                 "assignees": ["Coder"], "dependencies": []}
            ]
        }))
        .unwrap()
    );
    board.create_index(CENTRAL_PLAN, &doc).unwrap();

    // Every turn issues an echo call so the loop always hits the cap.
    let client = MockClient::new(vec![
        vec![Ok(StreamChunk::tool_call("c1", "echo", r#"{"text": "a"}"#, 0))],
        vec![Ok(StreamChunk::tool_call("c2", "echo", r#"{"text": "b"}"#, 0))],
    ]);
    let mut config = EngineConfig::new(client, basic_tools(false));
    config.context = ToolContext {
        agent_name: Some("Coder".to_string()),
        parent_agent_name: Some("Watchdog".to_string()),
        blackboard_dir: Some(blackboard_dir.clone()),
        ..Default::default()
    };
    let engine = AgentEngine::new(config);

    let (outcome, events) = run_collect(&engine, 2).await;
    outcome.unwrap();

    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::Error { code, .. } if code == "max_iterations"
    )));
    assert_eq!(finish_reason(&events), "max_iterations");

    let mailbox = Mailbox::new(&blackboard_dir).unwrap();
    let mail = mailbox.drain_unread("Watchdog").unwrap();
    assert_eq!(mail.len(), 1);
    assert_eq!(mail[0].message_type.as_deref(), Some("max_iterations_reached"));
    assert!(mail[0].content.contains("Task #1: analysis"));
    assert!(!mail[0].content.contains("Task #2"));
    assert_eq!(mail[0].extra["in_progress_count"], 1);
}

#[tokio::test]
async fn middleware_chain_wraps_outermost_first() {
    use crate::agent::middleware::{Middleware, Next};

    struct Recorder {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn call(
            &self,
            session: &mut AgentSession,
            next: Next<'_>,
        ) -> Result<ChunkStream> {
            self.order.lock().unwrap().push(self.label);
            next.run(session).await
        }
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let client = MockClient::new(vec![vec![Ok(StreamChunk::token("hi"))]]);
    let mut config = EngineConfig::new(client, basic_tools(false));
    config.middlewares = vec![
        Arc::new(Recorder {
            label: "outer",
            order: order.clone(),
        }),
        Arc::new(Recorder {
            label: "inner",
            order: order.clone(),
        }),
    ];
    let engine = AgentEngine::new(config);

    let (outcome, _) = run_collect(&engine, 1).await;
    outcome.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
}

#[tokio::test]
async fn dropped_receiver_cancels_run() {
    let client = MockClient::new(vec![vec![Ok(StreamChunk::token("hello"))]]);
    let engine = AgentEngine::new(EngineConfig::new(client, basic_tools(false)));

    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let outcome = engine
        .run(
            vec![Message::user("go")],
            SystemPromptConfig::new("test"),
            3,
            &tx,
        )
        .await;
    let err = outcome.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<crate::errors::SwarmError>(),
        Some(crate::errors::SwarmError::Abort)
    ));
}

use crate::agent::coordinator::SwarmAgent;
use crate::agent::events::AgentEvent;
use crate::agent::session::SystemPromptConfig;
use crate::agent::tools::base::{ConfirmCallback, InputCallback};
use crate::providers::base::{Message, ToolCallRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Default budget for a UI-serviced prompt before it resolves as
/// deny / empty answer.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(120);

const EVENT_CHANNEL_CAPACITY: usize = 64;
const USER_QUEUE_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Wire types — one JSON object per line, both directions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    pub function: WireFunction,
}

impl From<&ToolCallRequest> for WireToolCall {
    fn from(call: &ToolCallRequest) -> Self {
        Self {
            id: call.id.clone(),
            function: WireFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

/// Coordinator → UI events on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TapEvent {
    Token {
        delta: String,
    },
    Message {
        role: String,
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    ToolCall {
        tool_calls: Vec<WireToolCall>,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        result: String,
    },
    Finish {
        reason: String,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    ConfirmRequest {
        id: String,
        kind: String,
        message: String,
    },
    InputRequest {
        id: String,
        question: String,
    },
}

impl TapEvent {
    pub fn from_agent_event(event: &AgentEvent) -> Self {
        match event {
            AgentEvent::Token { delta } => TapEvent::Token {
                delta: delta.clone(),
            },
            AgentEvent::Message { message } => TapEvent::Message {
                role: message.role.clone(),
                content: message.content.clone(),
                tool_calls: message
                    .tool_calls
                    .as_ref()
                    .map(|calls| calls.iter().map(WireToolCall::from).collect()),
            },
            AgentEvent::ToolCall { tool_calls } => TapEvent::ToolCall {
                tool_calls: tool_calls.iter().map(WireToolCall::from).collect(),
            },
            AgentEvent::ToolResult {
                tool_call_id,
                name,
                result,
            } => TapEvent::ToolResult {
                tool_call_id: tool_call_id.clone(),
                name: name.clone(),
                result: result.clone(),
            },
            AgentEvent::Error {
                code,
                message,
                recoverable,
            } => TapEvent::Error {
                code: code.clone(),
                message: message.clone(),
                recoverable: *recoverable,
            },
            AgentEvent::Finish { reason } => TapEvent::Finish {
                reason: reason.clone(),
            },
        }
    }
}

/// UI → coordinator control messages on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TapControl {
    UserMessage {
        text: String,
        #[serde(default)]
        attachments: Vec<String>,
    },
    ConfirmResponse {
        id: String,
        approved: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    InputResponse {
        id: String,
        text: String,
    },
    Abort,
}

/// Serialize one event as a single stdout line. Data fields may contain
/// newlines — they are JSON-escaped, so bare `\n` as the message delimiter
/// stays safe.
pub fn emit_event(event: &TapEvent) {
    use std::io::Write;
    if let Ok(line) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

// ---------------------------------------------------------------------------
// Stdin dispatcher
// ---------------------------------------------------------------------------

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id(prefix: &str) -> String {
    format!("{}-{}", prefix, REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Outcome of a blocking rendezvous with the UI.
#[derive(Debug)]
pub enum Rendezvous {
    Response(TapControl),
    Aborted,
    TimedOut,
}

/// Background reader over stdin, dispatching control messages:
/// `user_message` into the main queue, `confirm_response`/`input_response`
/// into per-id rendezvous slots, `abort` into a broadcast that wakes every
/// pending rendezvous and the turn loop.
pub struct StdinDispatcher {
    user_tx: mpsc::Sender<TapControl>,
    user_rx: tokio::sync::Mutex<mpsc::Receiver<TapControl>>,
    pending: std::sync::Mutex<HashMap<String, oneshot::Sender<TapControl>>>,
    abort_flag: AtomicBool,
    abort_notify: Notify,
}

impl StdinDispatcher {
    pub fn new() -> Arc<Self> {
        let (user_tx, user_rx) = mpsc::channel(USER_QUEUE_CAPACITY);
        Arc::new(Self {
            user_tx,
            user_rx: tokio::sync::Mutex::new(user_rx),
            pending: std::sync::Mutex::new(HashMap::new()),
            abort_flag: AtomicBool::new(false),
            abort_notify: Notify::new(),
        })
    }

    /// Spawn the reader task over real stdin. A closed pipe closes the user
    /// queue, which ends the main loop.
    pub fn spawn_stdin_reader(self: &Arc<Self>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = tokio::io::BufReader::new(stdin).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TapControl>(line) {
                    Ok(control) => dispatcher.dispatch(control).await,
                    Err(e) => debug!("ignoring malformed control line: {}", e),
                }
            }
            info!("stdin closed, shutting down dispatcher");
        });
    }

    /// Route one control message.
    pub async fn dispatch(&self, control: TapControl) {
        match control {
            TapControl::Abort => {
                self.abort_flag.store(true, Ordering::SeqCst);
                // Wake every pending rendezvous so callbacks observe the abort.
                if let Ok(mut pending) = self.pending.lock() {
                    pending.clear();
                }
                self.abort_notify.notify_waiters();
            }
            TapControl::ConfirmResponse { ref id, .. } | TapControl::InputResponse { ref id, .. } => {
                let slot = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(id));
                match slot {
                    Some(sender) => {
                        let _ = sender.send(control);
                    }
                    None => warn!("response for unknown request id '{}'", id),
                }
            }
            TapControl::UserMessage { .. } => {
                let _ = self.user_tx.send(control).await;
            }
        }
    }

    /// Next `user_message`, or `None` when the UI side is gone.
    pub async fn next_user_message(&self) -> Option<(String, Vec<String>)> {
        let mut rx = self.user_rx.lock().await;
        match rx.recv().await {
            Some(TapControl::UserMessage { text, attachments }) => Some((text, attachments)),
            _ => None,
        }
    }

    /// Block until the response with this id arrives, the turn is aborted,
    /// or the timeout expires.
    pub async fn wait_for_response(&self, id: &str, timeout: Duration) -> Rendezvous {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.to_string(), tx);
        }

        let notified = self.abort_notify.notified();
        tokio::pin!(notified);
        if self.is_aborted() {
            self.remove_pending(id);
            return Rendezvous::Aborted;
        }

        let outcome = tokio::select! {
            response = rx => match response {
                Ok(control) => Rendezvous::Response(control),
                // Sender dropped: abort cleared the slot.
                Err(_) => Rendezvous::Aborted,
            },
            () = &mut notified => Rendezvous::Aborted,
            () = tokio::time::sleep(timeout) => Rendezvous::TimedOut,
        };
        self.remove_pending(id);
        outcome
    }

    fn remove_pending(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_flag.load(Ordering::SeqCst)
    }

    /// Resolve when an abort arrives (immediately if one is already set).
    pub async fn abort_notified(&self) {
        if self.is_aborted() {
            return;
        }
        self.abort_notify.notified().await;
    }

    /// Reset abort state for a fresh turn.
    pub fn clear_abort(&self) {
        self.abort_flag.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Stdio-backed tool callbacks
// ---------------------------------------------------------------------------

/// `ask_user` over TAP: emits `input_request`, blocks on the rendezvous.
pub struct TapInputCallback {
    dispatcher: Arc<StdinDispatcher>,
}

impl TapInputCallback {
    pub fn new(dispatcher: Arc<StdinDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl InputCallback for TapInputCallback {
    async fn ask(&self, question: &str) -> String {
        let id = next_request_id("i");
        emit_event(&TapEvent::InputRequest {
            id: id.clone(),
            question: question.to_string(),
        });
        match self.dispatcher.wait_for_response(&id, RENDEZVOUS_TIMEOUT).await {
            Rendezvous::Response(TapControl::InputResponse { text, .. }) => text,
            _ => String::new(),
        }
    }
}

/// Confirmation over TAP: emits `confirm_request`, default-deny on timeout
/// or abort.
pub struct TapConfirmCallback {
    dispatcher: Arc<StdinDispatcher>,
}

impl TapConfirmCallback {
    pub fn new(dispatcher: Arc<StdinDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl ConfirmCallback for TapConfirmCallback {
    async fn confirm(&self, message: &str) -> bool {
        let id = next_request_id("c");
        emit_event(&TapEvent::ConfirmRequest {
            id: id.clone(),
            kind: "confirmation".to_string(),
            message: message.to_string(),
        });
        match self.dispatcher.wait_for_response(&id, RENDEZVOUS_TIMEOUT).await {
            Rendezvous::Response(TapControl::ConfirmResponse { approved, .. }) => approved,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent process — the coordinator side of the protocol
// ---------------------------------------------------------------------------

/// Runs the coordinator as a TAP server: waits for `user_message`, drives
/// one engine turn per message, streams events to stdout, and services
/// abort by cancelling the in-flight turn.
pub struct AgentProcess {
    agent: Arc<SwarmAgent>,
    dispatcher: Arc<StdinDispatcher>,
    messages: Vec<Message>,
    max_iterations: usize,
}

impl AgentProcess {
    pub fn new(
        agent: Arc<SwarmAgent>,
        dispatcher: Arc<StdinDispatcher>,
        max_iterations: usize,
    ) -> Self {
        Self {
            agent,
            dispatcher,
            messages: Vec::new(),
            max_iterations,
        }
    }

    /// Main blocking loop: one turn per `user_message`, until stdin closes.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let Some((text, _attachments)) = self.dispatcher.next_user_message().await else {
                break;
            };
            if text.is_empty() {
                continue;
            }
            self.dispatcher.clear_abort();
            self.run_turn(text).await;
        }
        self.agent.deregister();
        Ok(())
    }

    async fn run_turn(&mut self, text: String) {
        self.messages.push(Message::user(text));
        self.agent.register();

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let agent = self.agent.clone();
        let messages = self.messages.clone();
        let system_config = SystemPromptConfig::new(agent.build_system_prompt());
        let max_iterations = self.max_iterations;

        let handle = tokio::spawn(async move {
            agent
                .engine()
                .run(messages, system_config, max_iterations, &tx)
                .await
        });

        let mut emitted_finish = false;
        loop {
            tokio::select! {
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => {
                        if let AgentEvent::Message { message } = &event {
                            self.messages.push(message.clone());
                        }
                        if matches!(event, AgentEvent::Finish { .. }) {
                            emitted_finish = true;
                        }
                        emit_event(&TapEvent::from_agent_event(&event));
                    }
                    None => break,
                },
                () = self.dispatcher.abort_notified() => {
                    // Cancellation: kill the engine task, which drops the
                    // in-flight chunk stream mid-poll.
                    handle.abort();
                    self.agent.mark_idle();
                    emit_event(&TapEvent::Finish {
                        reason: "aborted".to_string(),
                    });
                    return;
                }
            }
        }

        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                emit_event(&TapEvent::Error {
                    code: "engine_error".to_string(),
                    message: format!("{:#}", e),
                    recoverable: true,
                });
                if !emitted_finish {
                    emit_event(&TapEvent::Finish {
                        reason: "error".to_string(),
                    });
                    emitted_finish = true;
                }
            }
            Err(e) => {
                emit_event(&TapEvent::Error {
                    code: "engine_panic".to_string(),
                    message: e.to_string(),
                    recoverable: false,
                });
            }
        }

        if !emitted_finish {
            emit_event(&TapEvent::Finish {
                reason: "end_turn".to_string(),
            });
        }
    }
}

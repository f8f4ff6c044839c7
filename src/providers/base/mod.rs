use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A fully-assembled tool call on an assistant message. `arguments` is kept
/// as the raw JSON string the model produced (possibly repaired), matching
/// the OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on `role == "tool"` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Out-of-band tags used by middlewares (mailbox source, refined
    /// ask_user exchanges). Never sent to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn assistant_with_tools(
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: "assistant".into(),
            content,
            tool_calls: Some(tool_calls),
            ..Default::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// One incremental fragment of a streamed tool call. Fragments for the same
/// call share an `index`; `name` and `arguments` pieces are concatenated by
/// the accumulator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One chunk of the provider stream: a text delta and/or tool-call fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

impl StreamChunk {
    pub fn token(delta: impl Into<String>) -> Self {
        Self {
            content: Some(delta.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Synthesize a complete tool call as a single chunk. Guard middlewares
    /// use this to inject or rewrite calls; the emitted chunk must survive
    /// the engine accumulator and schema validation unchanged.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
        index: usize,
    ) -> Self {
        Self {
            content: None,
            tool_calls: vec![ToolCallDelta {
                index,
                id: Some(id.into()),
                name: Some(name.into()),
                arguments: Some(arguments.into()),
            }],
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// The lazy chunk stream a provider call yields. Items are `Err` for
/// mid-stream transport failures; the engine retries the whole pipeline.
pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: Option<String>,
}

/// Streaming chat client. Implementations adapt non-OpenAI providers by
/// emitting the same chunk shape.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> anyhow::Result<ChunkStream>;

    fn default_model(&self) -> &str;

    fn provider_name(&self) -> &str;
}

impl std::fmt::Debug for dyn LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn LlmClient")
            .field("provider_name", &self.provider_name())
            .finish()
    }
}

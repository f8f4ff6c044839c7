use crate::errors::SwarmError;
use crate::providers::base::{
    ChatRequest, ChunkStream, LlmClient, Message, StreamChunk, ToolCallDelta,
};
use crate::providers::sse::SseDecoder;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Streaming client for the OpenAI chat-completions wire format, shared by
/// every OpenAI-compatible endpoint (OpenAI, DeepSeek, OpenRouter, Groq, ...).
pub struct OpenAiClient {
    api_key: String,
    default_model: String,
    base_url: String,
    provider_name: String,
    client: Client,
}

impl OpenAiClient {
    pub fn new(
        api_key: String,
        default_model: String,
        base_url: String,
        provider_name: String,
    ) -> Self {
        Self {
            api_key,
            default_model,
            base_url,
            provider_name,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn message_to_wire(msg: &Message) -> Value {
        let mut m = json!({
            "role": msg.role,
            "content": msg.content,
        });
        if let Some(tool_calls) = &msg.tool_calls {
            m["tool_calls"] = json!(
                tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments,
                            }
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }
        if let Some(tool_call_id) = &msg.tool_call_id {
            m["tool_call_id"] = json!(tool_call_id);
        }
        if msg.role == "tool"
            && let Some(name) = &msg.name
        {
            m["name"] = json!(name);
        }
        m
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(Self::message_to_wire).collect();
        let mut payload = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            payload["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }
        payload
    }
}

/// Map one SSE data object into a chunk. `None` for keep-alive deltas.
fn chunk_from_event(data: &Value) -> Result<Option<StreamChunk>> {
    if let Some(error) = data.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown provider error");
        return Err(SwarmError::Provider {
            message: message.to_string(),
            retryable: false,
        }
        .into());
    }

    let Some(delta) = data.pointer("/choices/0/delta") else {
        return Ok(None);
    };

    let content = delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);

    let mut tool_calls = Vec::new();
    if let Some(arr) = delta.get("tool_calls").and_then(Value::as_array) {
        for tc in arr {
            tool_calls.push(ToolCallDelta {
                index: tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize,
                id: tc.get("id").and_then(Value::as_str).map(ToString::to_string),
                name: tc
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                arguments: tc
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            });
        }
    }

    if content.is_none() && tool_calls.is_empty() {
        return Ok(None);
    }
    Ok(Some(StreamChunk {
        content,
        tool_calls,
    }))
}

struct StreamState {
    bytes: futures_util::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamChunk>>,
    done: bool,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream> {
        let payload = self.build_payload(&request);
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| SwarmError::Provider {
                message: format!("connection to {} failed: {}", self.provider_name, e),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(ToString::to_string)
                })
                .unwrap_or_else(|| body.chars().take(500).collect());
            let retryable = status.is_server_error() || status.as_u16() == 429;
            return Err(SwarmError::Provider {
                message: format!("{} API {}: {}", self.provider_name, status, message),
                retryable,
            }
            .into());
        }

        let provider = self.provider_name.clone();
        let state = StreamState {
            bytes: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        };

        Ok(Box::pin(futures_util::stream::unfold(
            state,
            move |mut st| {
                let provider = provider.clone();
                async move {
                    loop {
                        if let Some(item) = st.pending.pop_front() {
                            return Some((item, st));
                        }
                        if st.done {
                            return None;
                        }
                        match st.bytes.next().await {
                            Some(Ok(bytes)) => {
                                for event in st.decoder.feed(&bytes) {
                                    match event.data {
                                        Some(data) => match chunk_from_event(&data) {
                                            Ok(Some(chunk)) => st.pending.push_back(Ok(chunk)),
                                            Ok(None) => {}
                                            Err(e) => st.pending.push_back(Err(e)),
                                        },
                                        // [DONE]
                                        None => st.done = true,
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                st.done = true;
                                st.pending.push_back(Err(SwarmError::Provider {
                                    message: format!("{} stream read failed: {}", provider, e),
                                    retryable: true,
                                }
                                .into()));
                            }
                            None => {
                                st.done = true;
                                for event in st.decoder.finish() {
                                    if let Some(data) = event.data
                                        && let Ok(Some(chunk)) = chunk_from_event(&data)
                                    {
                                        st.pending.push_back(Ok(chunk));
                                    }
                                }
                            }
                        }
                    }
                }
            },
        )))
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }
}

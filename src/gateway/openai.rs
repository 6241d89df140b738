//! Adapter for OpenAI-compatible `/chat/completions` and `/embeddings`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::Serialize;

use super::error::ProviderError;
use super::pricing::{chat_cost, embedding_cost};
use super::types::{ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, FinishReason};

/// One decoded event of a streamed chat completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    /// Sent once, near the end, when the provider reports usage.
    Usage { input_tokens: u32, output_tokens: u32 },
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Open a `stream: true` completion. Errors before the first byte
    /// (status, connect) are returned here; later ones arrive in the stream.
    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream, ProviderError>;
}

#[async_trait]
pub trait EmbedProvider: Send + Sync {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(20);

/// Response bodies larger than this are rejected (1 MiB).
const MAX_BODY_BYTES: usize = 1 << 20;

/// Request text budget in characters, across all messages or inputs.
const MAX_INPUT_CHARS: usize = 500_000;

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }

    /// Reads `TUTOR_API_KEY` (falling back to `OPENAI_API_KEY`),
    /// `TUTOR_BASE_URL` and `TUTOR_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let Some(api_key) = ["TUTOR_API_KEY", "OPENAI_API_KEY"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        else {
            return Err(ProviderError::config("set TUTOR_API_KEY or OPENAI_API_KEY"));
        };
        let base_url = std::env::var("TUTOR_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let timeout = std::env::var("TUTOR_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);

        Self::with_config(api_key, base_url, timeout)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| ProviderError::config("API key contains characters not allowed in a header"))?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// POST `body` to `endpoint`; non-2xx statuses become errors.
    async fn send<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(format!("{}/{endpoint}", self.base_url))
            .json(body)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(failure(endpoint, response).await)
    }

    /// POST `body` to `endpoint` and return the raw 2xx body.
    async fn post<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> Result<String, ProviderError> {
        let response = self.send(endpoint, body).await?;
        read_capped(endpoint, response).await
    }
}

async fn read_capped(endpoint: &str, mut response: reqwest::Response) -> Result<String, ProviderError> {
    let mut raw = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if raw.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(ProviderError::invalid_response(format!(
                "{endpoint} body exceeds {MAX_BODY_BYTES} bytes"
            )));
        }
        raw.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

async fn failure(endpoint: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let request_id = header_str(response.headers(), "x-request-id");
    if status.as_u16() == 429 {
        let retry_after = header_str(response.headers(), RETRY_AFTER.as_str())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
        return ProviderError::RateLimited {
            retry_after,
            request_id,
        };
    }
    let text = read_capped(endpoint, response).await.unwrap_or_default();
    let detail = serde_json::from_str::<wire::ErrorEnvelope>(&text)
        .ok()
        .and_then(|e| e.error);
    ProviderError::Status {
        status: status.as_u16(),
        message: detail
            .as_ref()
            .and_then(|d| d.message.clone())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
        code: detail.and_then(|d| d.code),
        request_id,
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn check_budget<'a>(texts: impl IntoIterator<Item = &'a str>) -> Result<(), ProviderError> {
    let chars: usize = texts.into_iter().map(str::len).sum();
    if chars > MAX_INPUT_CHARS {
        return Err(ProviderError::invalid_request(format!(
            "{chars} characters of input exceeds the {MAX_INPUT_CHARS} limit"
        )));
    }
    Ok(())
}

#[async_trait]
impl ChatProvider for OpenAiAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        check_budget(req.messages.iter().map(|m| m.content.as_str()))?;
        let started = Instant::now();

        let raw = self.post("chat/completions", &wire::ChatBody::from(req)).await?;
        let reply: wire::ChatReply = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::invalid_response(format!("chat JSON: {e}")))?;

        if let Some(message) = reply.error.and_then(|e| e.message) {
            return Err(ProviderError::invalid_response(message));
        }
        let usage = reply
            .usage
            .ok_or_else(|| ProviderError::invalid_response("chat reply has no usage"))?;
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::invalid_response("chat reply has no choices"))?;

        let content = choice.message.map(wire::ChoiceMessage::into_text).unwrap_or_default();
        let (input_tokens, output_tokens) = (usage.prompt_tokens, usage.completion_tokens);
        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            cost_nanodollars: chat_cost(&req.model, input_tokens, output_tokens),
            latency: started.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream, ProviderError> {
        check_budget(req.messages.iter().map(|m| m.content.as_str()))?;
        let body = wire::ChatBody::from(req).streaming();
        let response = self.send("chat/completions", &body).await?;
        let bytes = response.bytes_stream().map_err(ProviderError::from).boxed();
        Ok(sse_events(bytes).boxed())
    }
}

/// Decode an SSE body of `data: {chunk}` lines ending with `data: [DONE]`.
fn sse_events<S, B>(bytes: S) -> impl Stream<Item = Result<StreamEvent, ProviderError>>
where
    S: Stream<Item = Result<B, ProviderError>> + Unpin,
    B: AsRef<[u8]>,
{
    let decoder = SseDecoder {
        bytes,
        buf: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(decoder, |mut d| async move {
        let item = d.next_event().await?;
        Some((item, d))
    })
}

struct SseDecoder<S> {
    bytes: S,
    buf: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl<S, B> SseDecoder<S>
where
    S: Stream<Item = Result<B, ProviderError>> + Unpin,
    B: AsRef<[u8]>,
{
    async fn next_event(&mut self) -> Option<Result<StreamEvent, ProviderError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }
            let step = match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    self.buf.extend_from_slice(chunk.as_ref());
                    self.drain_lines()
                }
                Some(Err(err)) => Err(err),
                None => {
                    // a final line may lack its newline
                    self.buf.push(b'\n');
                    let step = self.drain_lines();
                    self.done = true;
                    step
                }
            };
            if let Err(err) = step {
                self.done = true;
                return Some(Err(err));
            }
        }
    }

    fn drain_lines(&mut self) -> Result<(), ProviderError> {
        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                self.buf.clear();
                return Ok(());
            }
            let chunk: wire::StreamChunk = serde_json::from_str(data)
                .map_err(|e| ProviderError::invalid_response(format!("stream chunk JSON: {e}")))?;
            if let Some(message) = chunk.error.and_then(|e| e.message) {
                return Err(ProviderError::invalid_response(message));
            }
            let deltas = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.and_then(|d| d.content))
                .filter(|text| !text.is_empty())
                .map(StreamEvent::Delta);
            self.pending.extend(deltas);
            if let Some(usage) = chunk.usage {
                self.pending.push_back(StreamEvent::Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EmbedProvider for OpenAiAdapter {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if req.texts.is_empty() {
            return Err(ProviderError::invalid_request("nothing to embed"));
        }
        check_budget(req.texts.iter().map(String::as_str))?;
        let started = Instant::now();

        let body = wire::EmbedBody {
            model: req.model.as_str(),
            input: &req.texts,
        };
        let raw = self.post("embeddings", &body).await?;
        let mut reply: wire::EmbedReply = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::invalid_response(format!("embeddings JSON: {e}")))?;

        if reply.data.len() != req.texts.len() {
            return Err(ProviderError::invalid_response(format!(
                "{} embeddings for {} inputs",
                reply.data.len(),
                req.texts.len()
            )));
        }
        reply.data.sort_by_key(|d| d.index);
        let tokens = reply.usage.map_or(0, |u| u.prompt_tokens);

        Ok(EmbedResponse {
            embeddings: reply.data.into_iter().map(|d| d.embedding).collect(),
            tokens,
            cost_nanodollars: embedding_cost(req.model.as_str(), tokens),
            latency: started.elapsed(),
        })
    }
}

/// Request and response bodies as the API spells them.
mod wire {
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    use crate::gateway::types::{ChatRequest, Message, OutputFormat};

    #[derive(Serialize)]
    pub struct ChatBody<'a> {
        model: &'a str,
        messages: &'a [Message],
        temperature: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_format: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_choice: Option<Value>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        stream: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_options: Option<Value>,
    }

    impl ChatBody<'_> {
        pub fn streaming(self) -> Self {
            Self {
                stream: true,
                stream_options: Some(json!({ "include_usage": true })),
                ..self
            }
        }
    }

    impl<'a> From<&'a ChatRequest> for ChatBody<'a> {
        fn from(req: &'a ChatRequest) -> Self {
            let mut body = Self {
                model: &req.model,
                messages: &req.messages,
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                response_format: None,
                tools: None,
                tool_choice: None,
                stream: false,
                stream_options: None,
            };
            match &req.output {
                OutputFormat::Text => {}
                OutputFormat::JsonObject => {
                    body.response_format = Some(json!({ "type": "json_object" }));
                }
                OutputFormat::Schema(schema) => {
                    body.tools = Some(json!([{
                        "type": "function",
                        "function": {
                            "name": schema.name,
                            "description": schema.description,
                            "parameters": schema.parameters,
                        }
                    }]));
                    body.tool_choice = Some(json!({
                        "type": "function",
                        "function": { "name": schema.name }
                    }));
                }
            }
            body
        }
    }

    #[derive(Deserialize)]
    pub struct ErrorEnvelope {
        pub error: Option<ErrorDetail>,
    }

    #[derive(Deserialize)]
    pub struct ErrorDetail {
        pub message: Option<String>,
        pub code: Option<String>,
    }

    #[derive(Deserialize)]
    pub struct ChatReply {
        #[serde(default)]
        pub choices: Vec<Choice>,
        pub usage: Option<TokenUsage>,
        pub error: Option<ErrorDetail>,
    }

    #[derive(Deserialize)]
    pub struct Choice {
        pub message: Option<ChoiceMessage>,
        pub finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    pub struct ChoiceMessage {
        content: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
        function_call: Option<FunctionCall>,
    }

    impl ChoiceMessage {
        /// Text content, or else the first non-blank function-call arguments
        /// (current `tool_calls`, then legacy `function_call`).
        pub fn into_text(self) -> String {
            if let Some(text) = self.content.filter(|c| !c.trim().is_empty()) {
                return text;
            }
            self.tool_calls
                .into_iter()
                .flatten()
                .filter_map(|t| t.function)
                .chain(self.function_call)
                .filter_map(|f| f.arguments)
                .find(|a| !a.trim().is_empty())
                .unwrap_or_default()
        }
    }

    #[derive(Deserialize)]
    struct ToolCall {
        function: Option<FunctionCall>,
    }

    #[derive(Deserialize)]
    struct FunctionCall {
        arguments: Option<String>,
    }

    #[derive(Deserialize)]
    pub struct TokenUsage {
        #[serde(default)]
        pub prompt_tokens: u32,
        #[serde(default)]
        pub completion_tokens: u32,
    }

    #[derive(Deserialize)]
    pub struct StreamChunk {
        #[serde(default)]
        pub choices: Vec<StreamChoice>,
        pub usage: Option<TokenUsage>,
        pub error: Option<ErrorDetail>,
    }

    #[derive(Deserialize)]
    pub struct StreamChoice {
        pub delta: Option<Delta>,
    }

    #[derive(Deserialize)]
    pub struct Delta {
        pub content: Option<String>,
    }

    #[derive(Serialize)]
    pub struct EmbedBody<'a> {
        pub model: &'a str,
        pub input: &'a [String],
    }

    #[derive(Deserialize)]
    pub struct EmbedReply {
        pub data: Vec<EmbedItem>,
        pub usage: Option<TokenUsage>,
    }

    #[derive(Deserialize)]
    pub struct EmbedItem {
        pub index: usize,
        pub embedding: Vec<f32>,
    }
}

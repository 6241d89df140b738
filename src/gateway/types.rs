//! Request and response values exchanged with the gateway.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who asked: the session (when known) and the code path, for usage records.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    pub session_id: Option<Uuid>,
    /// e.g. `"classifier::knowledge"`.
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            session_id: None,
            caller,
        }
    }

    pub fn with_session(self, session_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            ..self
        }
    }
}

/// Embedding models the retriever can index with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbedModel {
    #[serde(rename = "text-embedding-3-small")]
    Small3,
    #[serde(rename = "text-embedding-3-large")]
    Large3,
}

impl EmbedModel {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbedModel::Small3 => "text-embedding-3-small",
            EmbedModel::Large3 => "text-embedding-3-large",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub model: EmbedModel,
    /// One vector comes back per text.
    pub texts: Vec<String>,
    pub attribution: Attribution,
}

impl EmbedRequest {
    pub fn new(model: EmbedModel, texts: Vec<String>, attribution: Attribution) -> Self {
        Self {
            model,
            texts,
            attribution,
        }
    }

    pub fn single(model: EmbedModel, text: impl Into<String>, attribution: Attribution) -> Self {
        Self::new(model, vec![text.into()], attribution)
    }
}

#[derive(Debug, Clone)]
pub struct EmbedResponse {
    /// In the order of [`EmbedRequest::texts`].
    pub embeddings: Vec<Vec<f32>>,
    pub tokens: u32,
    pub cost_nanodollars: i64,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A function the model is forced to call; its arguments are the answer.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    /// Any JSON object (`response_format: json_object`).
    JsonObject,
    Schema(ResponseSchema),
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub output: OutputFormat,
    pub attribution: Attribution,
}

impl ChatRequest {
    /// Deterministic (temperature 0) free-text request with no token cap.
    pub fn new(model: impl Into<String>, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            output: OutputFormat::Text,
            attribution,
        }
    }

    pub fn temperature(self, temperature: f32) -> Self {
        Self {
            temperature,
            ..self
        }
    }

    pub fn max_tokens(self, max_tokens: u32) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..self
        }
    }

    pub fn json(self) -> Self {
        Self {
            output: OutputFormat::JsonObject,
            ..self
        }
    }

    pub fn schema(self, schema: ResponseSchema) -> Self {
        Self {
            output: OutputFormat::Schema(schema),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// Cut off at `max_tokens`.
    Length,
    ContentFilter,
    /// Stopped to call a function (`tool_calls` or legacy `function_call`).
    ToolCalls,
    Other(String),
}

impl From<Option<String>> for FinishReason {
    fn from(raw: Option<String>) -> Self {
        let Some(raw) = raw else {
            return FinishReason::Other(String::new());
        };
        match raw.as_str() {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            _ => FinishReason::Other(raw),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Message text, or the function-call arguments for schema requests.
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_only_touch_their_field() {
        let req = ChatRequest::new("gpt-4o-mini", vec![Message::user("hi")], Attribution::new("test"))
            .max_tokens(20)
            .json();
        assert_eq!(req.temperature, 0.0);
        assert_eq!(req.max_tokens, Some(20));
        assert!(matches!(req.output, OutputFormat::JsonObject));
        assert_eq!(req.attribution.caller, "test");
    }

    #[test]
    fn finish_reasons() {
        assert_eq!(FinishReason::from(Some("function_call".into())), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from(Some("length".into())), FinishReason::Length);
        assert_eq!(FinishReason::from(Some("eos".into())), FinishReason::Other("eos".into()));
    }

    #[test]
    fn embed_models_use_their_api_names_in_config() {
        let model: EmbedModel = serde_json::from_str("\"text-embedding-3-large\"").unwrap();
        assert_eq!(model, EmbedModel::Large3);
        assert_eq!(model.as_str(), "text-embedding-3-large");
    }
}

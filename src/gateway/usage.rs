//! Per-call usage accounting.
//!
//! The gateway hands one [`ProviderCallRecord`] per logical call (after any
//! retries) to a [`UsageSink`]. Sinks never fail the call they describe.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::ProviderError;
use super::types::{Attribution, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Embeddings,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Chat => "chat/completions",
            Endpoint::Embeddings => "embeddings",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Completed {
        input_tokens: u32,
        output_tokens: u32,
        cost_nanodollars: i64,
        latency_ms: u64,
    },
    Failed {
        code: &'static str,
        request_id: Option<String>,
    },
}

impl CallOutcome {
    pub fn failed(err: &ProviderError) -> Self {
        CallOutcome::Failed {
            code: err.code(),
            request_id: err.request_id().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub endpoint: Endpoint,
    pub model: String,
    pub caller: &'static str,
    pub session_id: Option<Uuid>,
    /// Attempts made, retries included.
    pub attempts: u32,
    pub outcome: CallOutcome,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn chat(req: &ChatRequest, attempts: u32, result: &Result<ChatResponse, ProviderError>) -> Self {
        let outcome = match result {
            Ok(r) => CallOutcome::Completed {
                input_tokens: r.input_tokens,
                output_tokens: r.output_tokens,
                cost_nanodollars: r.cost_nanodollars,
                latency_ms: millis(r.latency),
            },
            Err(e) => CallOutcome::failed(e),
        };
        Self::for_chat(req, attempts, outcome)
    }

    /// Chat record with an outcome assembled by the caller (streamed calls).
    pub fn for_chat(req: &ChatRequest, attempts: u32, outcome: CallOutcome) -> Self {
        Self::build(Endpoint::Chat, req.model.clone(), &req.attribution, attempts, outcome)
    }

    pub fn embed(req: &EmbedRequest, attempts: u32, result: &Result<EmbedResponse, ProviderError>) -> Self {
        let outcome = match result {
            Ok(r) => CallOutcome::Completed {
                input_tokens: r.tokens,
                output_tokens: 0,
                cost_nanodollars: r.cost_nanodollars,
                latency_ms: millis(r.latency),
            },
            Err(e) => CallOutcome::failed(e),
        };
        let model = req.model.as_str().to_string();
        Self::build(Endpoint::Embeddings, model, &req.attribution, attempts, outcome)
    }

    fn build(
        endpoint: Endpoint,
        model: String,
        attribution: &Attribution,
        attempts: u32,
        outcome: CallOutcome,
    ) -> Self {
        Self {
            endpoint,
            model,
            caller: attribution.caller,
            session_id: attribution.session_id,
            attempts,
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn cost_nanodollars(&self) -> i64 {
        match self.outcome {
            CallOutcome::Completed { cost_nanodollars, .. } => cost_nanodollars,
            CallOutcome::Failed { .. } => 0,
        }
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Logs each call as a structured event on the `tutor::usage` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, r: ProviderCallRecord) {
        let session = r.session_id.map(|s| s.to_string()).unwrap_or_default();
        match &r.outcome {
            CallOutcome::Completed {
                input_tokens,
                output_tokens,
                cost_nanodollars,
                latency_ms,
            } => tracing::info!(
                target: "tutor::usage",
                endpoint = r.endpoint.as_str(),
                model = %r.model,
                caller = r.caller,
                session = %session,
                attempts = r.attempts,
                input_tokens,
                output_tokens,
                cost_nanos = cost_nanodollars,
                latency_ms,
                "provider call"
            ),
            CallOutcome::Failed { code, request_id } => tracing::warn!(
                target: "tutor::usage",
                endpoint = r.endpoint.as_str(),
                model = %r.model,
                caller = r.caller,
                session = %session,
                attempts = r.attempts,
                code,
                request_id = request_id.as_deref().unwrap_or(""),
                "provider call failed"
            ),
        }
    }
}

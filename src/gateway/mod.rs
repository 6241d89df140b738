//! Provider gateway: chat completions and embeddings behind two small traits,
//! with retries and usage accounting.

pub mod error;
pub mod openai;
pub mod pricing;
pub mod types;
pub mod usage;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use openai::{ChatProvider, EmbedProvider, EventStream, OpenAiAdapter, StreamEvent};
use usage::{millis, CallOutcome, ProviderCallRecord};

pub use error::ProviderError;
pub use pricing::{chat_cost, embedding_cost, pricing_for, ModelPricing};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// Answer text as it arrives.
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

/// Completion capability used by the detectors and the answer stage.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream the reply as text deltas. Gateways without streaming deliver
    /// the whole reply as one delta.
    async fn chat_stream(&self, req: ChatRequest) -> Result<TextStream, ProviderError> {
        let resp = self.chat(req).await?;
        Ok(stream::once(async move { Ok(resp.content) }).boxed())
    }
}

/// Embedding capability used by the retriever.
#[async_trait::async_trait]
pub trait EmbedGateway: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

/// Longest wait honoured from a provider `Retry-After`.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// The adapter plus retry policy and a usage sink.
pub struct ProviderGateway<U: UsageSink> {
    adapter: OpenAiAdapter,
    usage: Arc<U>,
    config: GatewayConfig,
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn from_env(usage: Arc<U>) -> Result<Self, ProviderError> {
        Ok(Self::with_config(OpenAiAdapter::from_env()?, usage, GatewayConfig::default()))
    }

    pub fn with_config(adapter: OpenAiAdapter, usage: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            adapter,
            usage,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let (result, attempts) = self.retrying(|| self.adapter.chat(&req)).await;
        self.usage
            .record(ProviderCallRecord::chat(&req, attempts, &result))
            .await;
        result
    }

    /// Stream a chat reply. Opening the stream is retried like [`Self::chat`];
    /// usage is recorded once the stream ends, fails or is dropped.
    pub async fn chat_stream(&self, req: ChatRequest) -> Result<TextStream, ProviderError>
    where
        U: 'static,
    {
        let started = Instant::now();
        let (opened, attempts) = self.retrying(|| self.adapter.chat_stream(&req)).await;
        let events = match opened {
            Ok(events) => events,
            Err(err) => {
                self.usage
                    .record(ProviderCallRecord::for_chat(&req, attempts, CallOutcome::failed(&err)))
                    .await;
                return Err(err);
            }
        };
        let metered = Metered {
            events,
            usage: self.usage.clone(),
            req,
            attempts,
            started,
            tokens: (0, 0),
            settled: false,
        };
        Ok(stream::unfold(metered, |mut m| async move {
            let item = m.next_text().await?;
            Some((item, m))
        })
        .boxed())
    }

    pub async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let (result, attempts) = self.retrying(|| self.adapter.embed(&req)).await;
        self.usage
            .record(ProviderCallRecord::embed(&req, attempts, &result))
            .await;
        result
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    /// Returns the final result and the number of attempts made.
    async fn retrying<T, F, Fut>(&self, mut call: F) -> (Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match call().await {
                Ok(value) => return (Ok(value), attempts),
                Err(err) => err,
            };
            if !err.is_retryable() || attempts > self.config.max_retries {
                return (Err(err), attempts);
            }
            let wait = match &err {
                ProviderError::RateLimited { retry_after, .. } => (*retry_after).min(MAX_RETRY_WAIT),
                _ => backoff(self.config.retry_base_delay, attempts - 1),
            };
            debug!(attempt = attempts, wait_ms = millis(wait), error = %err, "retrying provider call");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Text deltas of an open stream, with token usage collected for the
/// usage record.
struct Metered<U: UsageSink + 'static> {
    events: EventStream,
    usage: Arc<U>,
    req: ChatRequest,
    attempts: u32,
    started: Instant,
    tokens: (u32, u32),
    settled: bool,
}

impl<U: UsageSink + 'static> Metered<U> {
    async fn next_text(&mut self) -> Option<Result<String, ProviderError>> {
        while !self.settled {
            match self.events.next().await {
                Some(Ok(StreamEvent::Delta(text))) => return Some(Ok(text)),
                Some(Ok(StreamEvent::Usage {
                    input_tokens,
                    output_tokens,
                })) => self.tokens = (input_tokens, output_tokens),
                Some(Err(err)) => {
                    self.settle(CallOutcome::failed(&err)).await;
                    return Some(Err(err));
                }
                None => {
                    let (input_tokens, output_tokens) = self.tokens;
                    let outcome = CallOutcome::Completed {
                        input_tokens,
                        output_tokens,
                        cost_nanodollars: chat_cost(&self.req.model, input_tokens, output_tokens),
                        latency_ms: millis(self.started.elapsed()),
                    };
                    self.settle(outcome).await;
                }
            }
        }
        None
    }

    async fn settle(&mut self, outcome: CallOutcome) {
        self.settled = true;
        self.usage
            .record(ProviderCallRecord::for_chat(&self.req, self.attempts, outcome))
            .await;
    }
}

impl<U: UsageSink + 'static> Drop for Metered<U> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let usage = self.usage.clone();
        let record = ProviderCallRecord::for_chat(
            &self.req,
            self.attempts,
            CallOutcome::Failed {
                code: "cancelled",
                request_id: None,
            },
        );
        runtime.spawn(async move { usage.record(record).await });
    }
}

#[async_trait::async_trait]
impl<U: UsageSink + 'static> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<TextStream, ProviderError> {
        ProviderGateway::chat_stream(self, req).await
    }
}

#[async_trait::async_trait]
impl<U: UsageSink + 'static> EmbedGateway for ProviderGateway<U> {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        ProviderGateway::embed(self, req).await
    }
}

/// `base * 2^retry`, with the exponent capped at 5.
fn backoff(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(1 << retry.min(5))
}

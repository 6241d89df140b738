use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;
use tokio::sync::Mutex;
use tutor_harness::gateway::openai::{ChatProvider, EmbedProvider, OpenAiAdapter};
use tutor_harness::gateway::{
    Attribution, ChatRequest, EmbedModel, EmbedRequest, FinishReason, GatewayConfig, Message,
    NoopUsageSink, ProviderError, ProviderGateway, ResponseSchema, UsageSink,
};
use tutor_harness::gateway::usage::{CallOutcome, ProviderCallRecord};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenAiAdapter {
    OpenAiAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn hello_request() -> ChatRequest {
    ChatRequest::new("gpt-4o-mini", vec![Message::user("hi")], Attribution::new("test"))
}

#[tokio::test]
async fn parses_content_usage_and_cost() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "hello" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&hello_request()).await.unwrap();
    assert_eq!(resp.content, "hello");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert_eq!(
        resp.cost_nanodollars,
        tutor_harness::gateway::chat_cost("gpt-4o-mini", 10, 20)
    );
}

#[tokio::test]
async fn schema_requests_force_the_function_and_read_its_arguments() {
    let server = MockServer::start().await;
    let args = r#"{"knowledge_points": ["DNS"]}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "tools": [{ "type": "function", "function": { "name": "return_knowledge_points" } }],
            "tool_choice": { "type": "function", "function": { "name": "return_knowledge_points" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{ "function": { "name": "return_knowledge_points", "arguments": args } }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let req = hello_request().schema(ResponseSchema {
        name: "return_knowledge_points",
        description: "points",
        parameters: json!({ "type": "object" }),
    });
    let resp = adapter(&server).chat(&req).await.unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
}

#[tokio::test]
async fn legacy_function_call_arguments_are_accepted() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "", "function_call": { "arguments": "{\"correct\": 1}" } },
                "finish_reason": "function_call"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&hello_request()).await.unwrap();
    assert_eq!(resp.content, "{\"correct\": 1}");
}

#[tokio::test]
async fn json_mode_sets_response_format() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": { "type": "json_object" },
            "max_tokens": 20
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "{\"correct\": 0}" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let req = hello_request().json().max_tokens(20);
    let resp = adapter(&server).chat(&req).await.unwrap();
    assert_eq!(resp.content, "{\"correct\": 0}");
}

#[tokio::test]
async fn http_429_is_rate_limited_with_request_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&hello_request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.request_id(), Some("abc123"));
}

#[tokio::test]
async fn http_400_is_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model", "code": "model_not_found" }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&hello_request()).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("bad model"));
}

/// Answers with `first` once, then with a normal completion.
struct FailOnce {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
}

impl Respond for FailOnce {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.first.clone()
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "recovered" }, "finish_reason": "stop" }],
                "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
            }))
        }
    }
}

#[derive(Default)]
struct CollectingSink(Mutex<Vec<ProviderCallRecord>>);

#[async_trait::async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.0.lock().await.push(record);
    }
}

async fn gateway_over(first: ResponseTemplate) -> (MockServer, Arc<AtomicUsize>) {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FailOnce {
            calls: calls.clone(),
            first,
        })
        .mount(&server)
        .await;
    (server, calls)
}

fn fast_retries() -> GatewayConfig {
    GatewayConfig {
        max_retries: 2,
        retry_base_delay: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn gateway_retries_server_errors_and_records_attempts() {
    let (server, calls) = gateway_over(
        ResponseTemplate::new(503).set_body_json(json!({ "error": { "message": "overloaded" } })),
    )
    .await;
    let sink = Arc::new(CollectingSink::default());
    let gateway = ProviderGateway::with_config(adapter(&server), sink.clone(), fast_retries());

    let resp = gateway.chat(hello_request()).await.unwrap();
    assert_eq!(resp.content, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let records = sink.0.lock().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 2);
    assert!(matches!(records[0].outcome, CallOutcome::Completed { .. }));
}

#[tokio::test]
async fn gateway_waits_out_retry_after() {
    let (server, calls) = gateway_over(ResponseTemplate::new(429).insert_header("retry-after", "1")).await;
    let gateway = ProviderGateway::with_config(adapter(&server), Arc::new(NoopUsageSink), fast_retries());

    let started = Instant::now();
    let resp = gateway.chat(hello_request()).await.unwrap();
    assert_eq!(resp.content, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn permanent_failures_are_recorded_without_retry() {
    let (server, calls) = gateway_over(
        ResponseTemplate::new(401)
            .insert_header("x-request-id", "req-401")
            .set_body_json(json!({ "error": { "message": "bad key", "code": "invalid_api_key" } })),
    )
    .await;
    let sink = Arc::new(CollectingSink::default());
    let gateway = ProviderGateway::with_config(adapter(&server), sink.clone(), fast_retries());

    let err = gateway.chat(hello_request()).await.unwrap_err();
    assert!(matches!(
        err,
        ProviderError::Status { status: 401, ref code, .. } if code.as_deref() == Some("invalid_api_key")
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let records = sink.0.lock().await;
    assert_eq!(
        records[0].outcome,
        CallOutcome::Failed {
            code: "client_error",
            request_id: Some("req-401".into())
        }
    );
}

fn sse(events: &[&str]) -> ResponseTemplate {
    let body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

#[tokio::test]
async fn streamed_chat_yields_deltas_and_records_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "stream": true,
            "stream_options": { "include_usage": true }
        })))
        .respond_with(sse(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"delta":{"content":"DNS maps "}}]}"#,
            r#"{"choices":[{"delta":{"content":"names."},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#,
            "[DONE]",
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(CollectingSink::default());
    let gateway = ProviderGateway::with_config(adapter(&server), sink.clone(), fast_retries());
    let pieces: Vec<String> = gateway
        .chat_stream(hello_request())
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(pieces, vec!["DNS maps ", "names."]);

    let records = sink.0.lock().await;
    assert_eq!(records.len(), 1);
    assert!(matches!(
        records[0].outcome,
        CallOutcome::Completed {
            input_tokens: 12,
            output_tokens: 3,
            ..
        }
    ));
    assert_eq!(
        records[0].cost_nanodollars(),
        tutor_harness::gateway::chat_cost("gpt-4o-mini", 12, 3)
    );
}

#[tokio::test]
async fn streamed_chat_reports_open_failures_up_front() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model", "code": "model_not_found" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(CollectingSink::default());
    let gateway = ProviderGateway::with_config(adapter(&server), sink.clone(), fast_retries());
    let Err(err) = gateway.chat_stream(hello_request()).await else {
        panic!("stream opened against a 400");
    };
    assert!(err.to_string().contains("bad model"));
    assert!(matches!(
        sink.0.lock().await[0].outcome,
        CallOutcome::Failed {
            code: "client_error",
            ..
        }
    ));
}

#[tokio::test]
async fn embeddings_are_returned_in_input_order() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({ "model": "text-embedding-3-small" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ],
            "usage": { "prompt_tokens": 8 }
        })))
        .mount(&server)
        .await;

    let req = EmbedRequest::new(
        EmbedModel::Small3,
        vec!["first".into(), "second".into()],
        Attribution::new("test"),
    );
    let resp = adapter(&server).embed(&req).await.unwrap();
    assert_eq!(resp.embeddings, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    assert_eq!(resp.tokens, 8);
}

#[tokio::test]
async fn embedding_count_mismatch_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "index": 0, "embedding": [1.0] }],
            "usage": { "prompt_tokens": 2 }
        })))
        .mount(&server)
        .await;

    let req = EmbedRequest::new(
        EmbedModel::Small3,
        vec!["a".into(), "b".into()],
        Attribution::new("test"),
    );
    assert!(adapter(&server).embed(&req).await.is_err());
}

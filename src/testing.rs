//! Scripted chat gateway for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::gateway::{ChatGateway, ChatRequest, ChatResponse, FinishReason, ProviderError, TextStream};

#[derive(Clone)]
enum Reply {
    Content(String),
    Fail,
}

/// Answers each request by its attribution caller.
#[derive(Default)]
pub struct ScriptedGateway {
    replies: HashMap<&'static str, Reply>,
    delays: HashMap<&'static str, Duration>,
    seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, caller: &'static str, content: &str) -> Self {
        self.replies.insert(caller, Reply::Content(content.to_string()));
        self
    }

    pub fn fail(mut self, caller: &'static str) -> Self {
        self.replies.insert(caller, Reply::Fail);
        self
    }

    pub fn delay(mut self, caller: &'static str, d: Duration) -> Self {
        self.delays.insert(caller, d);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let caller = req.attribution.caller;
        self.seen.lock().unwrap().push(req);
        if let Some(d) = self.delays.get(caller) {
            tokio::time::sleep(*d).await;
        }
        match self.replies.get(caller) {
            Some(Reply::Content(c)) => Ok(ChatResponse {
                content: c.clone(),
                input_tokens: 10,
                output_tokens: 5,
                cost_nanodollars: 0,
                latency: Duration::from_millis(1),
                finish_reason: FinishReason::Stop,
            }),
            Some(Reply::Fail) | None => Err(ProviderError::invalid_response("no scripted reply")),
        }
    }

    /// Streams the scripted reply one word at a time.
    async fn chat_stream(&self, req: ChatRequest) -> Result<TextStream, ProviderError> {
        let resp = self.chat(req).await?;
        let words: Vec<Result<String, ProviderError>> = resp
            .content
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(stream::iter(words).boxed())
    }
}

//! C-dimension detector: does the question contain an obvious mistake?

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::completion::complete_structured;
use crate::dimensions::{Correctness, Dimension};
use crate::gateway::{Attribution, ChatGateway, ChatRequest};
use crate::prompts::CORRECTNESS_PROMPT;

/// `{"correct": 0}` is correct, `{"correct": 1}` is incorrect.
#[derive(Debug, Deserialize)]
struct CorrectnessReply {
    correct: Option<serde_json::Value>,
}

impl CorrectnessReply {
    fn verdict(&self) -> Option<Correctness> {
        let index = match self.correct.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64()?,
            serde_json::Value::Bool(b) => u64::from(!*b),
            serde_json::Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Correctness::from_index(u32::try_from(index).ok()?)
    }
}

pub struct CorrectnessDetector {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    max_tokens: u32,
}

impl CorrectnessDetector {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            max_tokens: 20,
        }
    }

    /// Fails open: anything other than an explicit "incorrect" verdict is
    /// [`Correctness::Correct`].
    pub async fn detect(&self, query: &str) -> Correctness {
        let prompt = CORRECTNESS_PROMPT.render(&[("query", query)]);
        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            Attribution::new("classifier::correctness"),
        )
        .temperature(0.0)
        .max_tokens(self.max_tokens)
        .json();

        let reply: CorrectnessReply = match complete_structured(self.gateway.as_ref(), req).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "correctness detection failed; assuming correct");
                return Correctness::Correct;
            }
        };

        match reply.verdict() {
            Some(c) => {
                debug!(correctness = %c, "correctness detected");
                c
            }
            None => {
                warn!(value = ?reply.correct, "unusable correctness verdict; assuming correct");
                Correctness::Correct
            }
        }
    }
}

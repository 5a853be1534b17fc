//! Model-backed responder.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{LlmError, ResponderError};
use crate::llm::costs;
use crate::llm::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};
use crate::responder::{OutputShape, Responder, ResponderContext};

const RESPONDER_TEMPERATURE: f32 = 0.4;
const RESPONDER_MAX_TOKENS: u32 = 1024;

/// Asks an [`LlmProvider`] for a JSON object matching the requested shape.
pub struct LlmResponder {
    llm: Arc<dyn LlmProvider>,
}

impl LlmResponder {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Responder for LlmResponder {
    async fn invoke(
        &self,
        context: &ResponderContext,
        shape: &OutputShape,
    ) -> Result<Value, ResponderError> {
        let system_prompt = format!(
            "{}\n\nRespond with a single JSON object and nothing else. \
             It must match this schema:\n{}",
            context.instructions,
            shape.to_schema()
        );

        let request = CompletionRequest::new(vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(context.render()),
        ])
        .with_temperature(RESPONDER_TEMPERATURE)
        .with_max_tokens(RESPONDER_MAX_TOKENS);

        let response = self.llm.complete(request).await.map_err(map_llm_error)?;

        debug!(
            shape = shape.name,
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost_usd = %costs::call_cost(self.llm.model_name(), response.input_tokens, response.output_tokens),
            "Responder call complete"
        );

        if response.finish_reason == FinishReason::NoContent {
            return Err(ResponderError::Blocked(format!(
                "{}: provider returned no content",
                shape.name
            )));
        }

        let Some(object) = json_object(&response.content) else {
            warn!(
                shape = shape.name,
                raw_response = %response.content,
                "No JSON object in responder output"
            );
            return Err(ResponderError::MalformedOutput(format!(
                "{}: no JSON object in output",
                shape.name
            )));
        };
        serde_json::from_str(object).map_err(|e| {
            warn!(
                shape = shape.name,
                raw_response = %response.content,
                error = %e,
                "Responder output was not valid JSON"
            );
            ResponderError::MalformedOutput(format!("{}: {e}", shape.name))
        })
    }
}

fn map_llm_error(e: LlmError) -> ResponderError {
    ResponderError::Unavailable(e.to_string())
}

/// The outermost `{...}` span of model text, with any code fence removed.
fn json_object(text: &str) -> Option<&str> {
    let mut body = text.trim();
    if let Some(fenced) = body.strip_prefix("```") {
        let fenced = fenced.strip_prefix("json").unwrap_or(fenced);
        body = fenced.strip_suffix("```").unwrap_or(fenced).trim();
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

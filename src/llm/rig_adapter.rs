//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{CompletionModel, Message};
use rig::message::AssistantContent;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split our flat message list into rig's preamble, history and prompt.
fn split_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<Message>, Option<Message>) {
    let mut preamble: Vec<String> = Vec::new();
    let mut history: Vec<Message> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => preamble.push(msg.content),
            Role::User => history.push(Message::user(msg.content)),
            Role::Assistant => history.push(Message::assistant(msg.content)),
        }
    }

    let prompt = history.pop();
    let preamble = if preamble.is_empty() {
        None
    } else {
        Some(preamble.join("\n\n"))
    };
    (preamble, history, prompt)
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = split_messages(request.messages);
        let prompt = prompt.ok_or_else(|| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: "request has no user or assistant message".to_string(),
        })?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder.send().await.map_err(|e| {
            let reason = e.to_string();
            if reason.contains("401") || reason.to_ascii_lowercase().contains("unauthorized") {
                LlmError::AuthFailed {
                    provider: self.model_name.clone(),
                }
            } else if reason.contains("429") {
                LlmError::RateLimited {
                    provider: self.model_name.clone(),
                    retry_after: None,
                }
            } else {
                LlmError::RequestFailed {
                    provider: self.model_name.clone(),
                    reason,
                }
            }
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = if content.trim().is_empty() {
            FinishReason::NoContent
        } else {
            FinishReason::Stop
        };

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason,
            response_id: None,
        })
    }
}

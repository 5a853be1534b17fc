//! Rapport-building phase.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::responder::{BoundedResponder, FieldKind, FieldSpec, OutputShape};
use crate::workflow::engine::{HandlerReport, PhaseHandler};
use crate::workflow::prompts;
use crate::workflow::state::PatientState;

#[derive(Debug, Deserialize)]
struct CompanionReply {
    agent_response: String,
    detected_emotional_state: String,
    transition_to_questionnaire: bool,
    #[serde(default)]
    intro_statement: Option<String>,
}

fn companion_shape() -> OutputShape {
    OutputShape::new(
        "companion_reply",
        vec![
            FieldSpec::required("agent_response", FieldKind::Text, "Reply to the patient"),
            FieldSpec::required(
                "detected_emotional_state",
                FieldKind::Text,
                "One or two lowercase words describing the patient's affect",
            ),
            FieldSpec::required(
                "transition_to_questionnaire",
                FieldKind::Flag,
                "True when the patient is ready for structured questions",
            ),
            FieldSpec::optional(
                "intro_statement",
                FieldKind::Text,
                "One sentence introducing the questions, when transitioning",
            ),
        ],
    )
}

pub struct CompanionHandler {
    responder: BoundedResponder,
    history_window: usize,
    shape: OutputShape,
}

impl CompanionHandler {
    pub fn new(responder: BoundedResponder, history_window: usize) -> Self {
        Self {
            responder,
            history_window,
            shape: companion_shape(),
        }
    }
}

#[async_trait]
impl PhaseHandler for CompanionHandler {
    async fn invoke(&self, state: &mut PatientState) -> Result<HandlerReport, DatabaseError> {
        let context = prompts::companion_context(state, self.history_window);

        let reply = match self.responder.call::<CompanionReply>(&context, &self.shape).await {
            Ok(reply) => reply,
            Err(e) => {
                state.push_assistant(prompts::COMPANION_FALLBACK);
                return Ok(HandlerReport::fallback(e));
            }
        };

        let emotion = reply.detected_emotional_state.trim();
        if !emotion.is_empty() {
            state.emotional_state = emotion.to_lowercase();
        }

        if !reply.transition_to_questionnaire {
            debug!(patient_id = %state.patient_id, emotional_state = %state.emotional_state, "Companion reply");
            state.push_assistant(reply.agent_response.trim());
            return Ok(HandlerReport::stay());
        }

        let intro = reply
            .intro_statement
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let text = match &intro {
            Some(intro) => format!("{}\n\n{intro}", reply.agent_response.trim()),
            None => reply.agent_response.trim().to_string(),
        };
        state.push_assistant(text);
        state.intro_statement = intro;

        info!(patient_id = %state.patient_id, emotional_state = %state.emotional_state, "Patient ready for questionnaire");
        Ok(HandlerReport::advance())
    }
}

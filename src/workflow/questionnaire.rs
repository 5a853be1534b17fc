//! Adaptive outcome questionnaire.
//!
//! Asks the canonical questions in order, letting the responder rephrase
//! them and extract structured outcomes from each answer. Completion is
//! decided here: an explicit signal from the responder, the question budget
//! running out, or the canonical list being exhausted.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::responder::{BoundedResponder, FieldKind, FieldSpec, OutputShape};
use crate::store::Record;
use crate::workflow::engine::{HandlerReport, PhaseHandler};
use crate::workflow::prompts::{self, CANONICAL_QUESTIONS};
use crate::workflow::state::{OutcomeValue, PatientState, PendingWrite, WorkflowPhase};

#[derive(Debug, Default, Deserialize)]
struct ExtractedOutcomes {
    #[serde(default)]
    pain_level: Option<i64>,
    #[serde(default)]
    fatigue_level: Option<i64>,
    #[serde(default)]
    mood_description: Option<String>,
    #[serde(default)]
    medication_adherence_issue: Option<bool>,
    #[serde(default)]
    general_wellbeing: Option<String>,
}

impl ExtractedOutcomes {
    /// Non-null, non-empty fields only.
    fn into_values(self) -> Vec<(&'static str, OutcomeValue)> {
        let text = |s: Option<String>| {
            s.map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .map(OutcomeValue::Text)
        };
        [
            ("pain_level", self.pain_level.map(OutcomeValue::Integer)),
            ("fatigue_level", self.fatigue_level.map(OutcomeValue::Integer)),
            ("mood_description", text(self.mood_description)),
            (
                "medication_adherence_issue",
                self.medication_adherence_issue.map(OutcomeValue::Flag),
            ),
            ("general_wellbeing", text(self.general_wellbeing)),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }
}

#[derive(Debug, Deserialize)]
struct QuestionnaireReply {
    #[serde(default)]
    next_question: Option<String>,
    detected_emotional_state: String,
    #[serde(default)]
    extracted: Option<ExtractedOutcomes>,
    is_complete: bool,
}

fn questionnaire_shape() -> OutputShape {
    let scale = FieldKind::Integer { min: 0, max: 10 };
    OutputShape::new(
        "questionnaire_turn",
        vec![
            FieldSpec::optional(
                "next_question",
                FieldKind::Text,
                "The next question, rephrased for this patient",
            ),
            FieldSpec::required(
                "detected_emotional_state",
                FieldKind::Text,
                "One or two lowercase words describing the patient's affect",
            ),
            FieldSpec::optional(
                "extracted",
                FieldKind::Object(vec![
                    FieldSpec::optional("pain_level", scale.clone(), "0 = no pain, 10 = worst pain"),
                    FieldSpec::optional("fatigue_level", scale, "0 = no fatigue, 10 = extreme fatigue"),
                    FieldSpec::optional("mood_description", FieldKind::Text, "Short description of mood"),
                    FieldSpec::optional(
                        "medication_adherence_issue",
                        FieldKind::Flag,
                        "True if the patient reports trouble taking medication",
                    ),
                    FieldSpec::optional(
                        "general_wellbeing",
                        FieldKind::Text,
                        "Overall feeling, e.g. good, fair, poor",
                    ),
                ]),
                "Outcome data found in the patient's answer",
            ),
            FieldSpec::required(
                "is_complete",
                FieldKind::Flag,
                "True when no further questions are needed",
            ),
        ],
    )
}

pub struct QuestionnaireHandler {
    responder: BoundedResponder,
    max_questions: u32,
    history_window: usize,
    shape: OutputShape,
}

impl QuestionnaireHandler {
    pub fn new(responder: BoundedResponder, max_questions: u32, history_window: usize) -> Self {
        Self {
            responder,
            max_questions,
            history_window,
            shape: questionnaire_shape(),
        }
    }

    /// The canonical question to ask next, if the budget allows one.
    fn next_canonical(&self, state: &PatientState) -> Option<&'static str> {
        if state.questions_asked >= self.max_questions {
            return None;
        }
        CANONICAL_QUESTIONS.get(state.questions_asked as usize).copied()
    }

    /// Close the cycle: queue the snapshot as a record and say goodbye.
    fn complete(&self, state: &mut PatientState, reason: &'static str) -> HandlerReport {
        let record = Record::new(
            state.patient_id.clone(),
            state.collected_data.clone(),
            WorkflowPhase::AdaptiveQuestionnaire,
        );
        state.outbox.push(PendingWrite::Record(record));
        state.last_question = None;
        state.push_assistant(prompts::QUESTIONNAIRE_CLOSING);

        info!(
            patient_id = %state.patient_id,
            questions_asked = state.questions_asked,
            fields = state.collected_data.len(),
            reason,
            "Questionnaire complete"
        );
        HandlerReport::advance()
    }
}

#[async_trait]
impl PhaseHandler for QuestionnaireHandler {
    async fn invoke(&self, state: &mut PatientState) -> Result<HandlerReport, DatabaseError> {
        let answer = state
            .pending_user_input
            .clone()
            .filter(|s| !s.trim().is_empty());
        let next = self.next_canonical(state);

        if answer.is_none() {
            if let Some(question) = state.last_question.clone() {
                // Unanswered question outstanding: ask it again.
                state.push_assistant(question);
                return Ok(HandlerReport::stay());
            }
            if next.is_none() {
                return Ok(self.complete(state, "budget_exhausted"));
            }
        }

        let context =
            prompts::questionnaire_context(state, self.history_window, answer.as_deref(), next);

        let reply = match self.responder.call::<QuestionnaireReply>(&context, &self.shape).await {
            Ok(reply) => reply,
            Err(e) => {
                state.push_assistant(prompts::CLARIFICATION_FALLBACK);
                return Ok(HandlerReport::fallback(e));
            }
        };

        let extracted = reply.extracted.unwrap_or_default().into_values();
        for (name, value) in extracted {
            debug!(patient_id = %state.patient_id, field = name, "Outcome collected");
            state.collected_data.insert(name.to_string(), value);
        }

        let emotion = reply.detected_emotional_state.trim();
        if !emotion.is_empty() {
            state.emotional_state = emotion.to_lowercase();
        }

        if reply.is_complete {
            return Ok(self.complete(state, "responder_signal"));
        }
        let Some(canonical) = next else {
            return Ok(self.complete(state, "budget_exhausted"));
        };

        let question = reply
            .next_question
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| canonical.to_string());
        state.push_assistant(question.clone());
        state.last_question = Some(question);
        state.questions_asked += 1;

        debug!(
            patient_id = %state.patient_id,
            questions_asked = state.questions_asked,
            "Questionnaire question asked"
        );
        Ok(HandlerReport::stay())
    }
}

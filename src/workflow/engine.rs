//! The check-in state machine.
//!
//! `WorkflowEngine::step` runs one turn against an in-memory
//! `PatientState`: it records the user's input, dispatches the handler for
//! the current phase, applies the transition the handler asks for and, if
//! the cascade policy allows, dispatches the newly entered phase once more.
//! Persisting the state is the caller's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{CascadePolicy, WorkflowConfig};
use crate::error::{DatabaseError, ResponderError, WorkflowError};
use crate::responder::{BoundedResponder, Responder};
use crate::store::RecordStore;
use crate::workflow::companion::CompanionHandler;
use crate::workflow::questionnaire::QuestionnaireHandler;
use crate::workflow::state::{PatientState, SpeakerRole, TurnOutcome, WorkflowPhase};
use crate::workflow::trend::TrendHandler;

/// What a handler decided during one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReport {
    /// The phase's exit condition was met.
    pub advance: bool,
    /// Set when the responder failed and a fixed reply was used instead.
    pub fallback: Option<ResponderError>,
}

impl HandlerReport {
    pub fn stay() -> Self {
        Self {
            advance: false,
            fallback: None,
        }
    }

    pub fn advance() -> Self {
        Self {
            advance: true,
            fallback: None,
        }
    }

    pub fn fallback(error: ResponderError) -> Self {
        Self {
            advance: false,
            fallback: Some(error),
        }
    }
}

/// One phase's behaviour. Handlers mutate the state but never change its phase.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn invoke(&self, state: &mut PatientState) -> Result<HandlerReport, DatabaseError>;
}

/// Summary of a `step` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub outcome: TurnOutcome,
    /// Phases whose handler ran, in order.
    pub dispatched: Vec<WorkflowPhase>,
    pub fallback: Option<ResponderError>,
}

impl StepReport {
    fn no_op() -> Self {
        Self {
            outcome: TurnOutcome::NoOp,
            dispatched: Vec::new(),
            fallback: None,
        }
    }
}

pub struct WorkflowEngine {
    companion: Arc<dyn PhaseHandler>,
    questionnaire: Arc<dyn PhaseHandler>,
    trend: Arc<dyn PhaseHandler>,
    cascade: CascadePolicy,
    replay_window: Duration,
}

impl WorkflowEngine {
    pub fn new(
        companion: Arc<dyn PhaseHandler>,
        questionnaire: Arc<dyn PhaseHandler>,
        trend: Arc<dyn PhaseHandler>,
    ) -> Self {
        let defaults = WorkflowConfig::default();
        Self {
            companion,
            questionnaire,
            trend,
            cascade: defaults.cascade,
            replay_window: defaults.replay_window,
        }
    }

    /// Wire the three standard handlers around one responder.
    pub fn build(
        responder: Arc<dyn Responder>,
        records: Arc<dyn RecordStore>,
        config: &WorkflowConfig,
    ) -> Self {
        let bounded = BoundedResponder::new(responder, config.responder_timeout);
        Self::new(
            Arc::new(CompanionHandler::new(bounded.clone(), config.history_window)),
            Arc::new(QuestionnaireHandler::new(
                bounded.clone(),
                config.max_questions,
                config.questionnaire_window,
            )),
            Arc::new(TrendHandler::new(bounded, records)),
        )
        .with_cascade(config.cascade)
        .with_replay_window(config.replay_window)
    }

    pub fn with_cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn with_replay_window(mut self, window: Duration) -> Self {
        self.replay_window = window;
        self
    }

    fn handler_for(&self, phase: WorkflowPhase) -> Option<&Arc<dyn PhaseHandler>> {
        match phase {
            WorkflowPhase::Companion => Some(&self.companion),
            WorkflowPhase::AdaptiveQuestionnaire => Some(&self.questionnaire),
            WorkflowPhase::TrendMonitoring => Some(&self.trend),
            WorkflowPhase::Initial | WorkflowPhase::Completed | WorkflowPhase::Error => None,
        }
    }

    /// Whether `input` repeats the last consumed input of a turn that
    /// already produced its reply.
    fn is_replay(&self, state: &PatientState, input: &str) -> bool {
        if state.last_consumed_input.as_deref() != Some(input) {
            return false;
        }
        if state.last_turn_outcome == Some(TurnOutcome::Fallback) {
            return false;
        }
        if state.last_entry().map(|e| e.role) != Some(SpeakerRole::Assistant) {
            return false;
        }
        match state.last_consumed_at {
            Some(at) => (Utc::now() - at).to_std().unwrap_or_default() <= self.replay_window,
            None => false,
        }
    }

    fn transition(&self, state: &mut PatientState, to: WorkflowPhase) -> Result<(), WorkflowError> {
        let from = state.phase;
        if !from.can_transition_to(to) {
            return Err(WorkflowError::InvalidTransition { from, to });
        }
        info!(patient_id = %state.patient_id, from = %from, to = %to, "Phase transition");
        state.phase = to;
        Ok(())
    }

    /// Run one turn.
    ///
    /// Responder failures are absorbed by the handlers and reported as a
    /// fallback. A store failure aborts the turn, leaves the in-memory
    /// phase at `Error`, and must not be saved.
    pub async fn step(&self, state: &mut PatientState, input: &str) -> Result<StepReport, WorkflowError> {
        let input = input.trim();

        if state.phase.is_terminal() {
            debug!(patient_id = %state.patient_id, phase = %state.phase, "Step on terminal phase");
            state.last_turn_outcome = Some(TurnOutcome::NoOp);
            return Ok(StepReport::no_op());
        }

        if !input.is_empty() {
            if self.is_replay(state, input) {
                info!(patient_id = %state.patient_id, phase = %state.phase, "Replayed input ignored");
                return Ok(StepReport::no_op());
            }

            let already_recorded = state
                .last_entry()
                .is_some_and(|e| e.role == SpeakerRole::User && e.text == input);
            if !already_recorded {
                state.push_user(input);
            }
            state.pending_user_input = Some(input.to_string());
            state.last_consumed_input = Some(input.to_string());
            state.last_consumed_at = Some(Utc::now());
        }

        if state.phase == WorkflowPhase::Initial {
            self.transition(state, WorkflowPhase::Companion)?;
        }

        let mut cascades_left = match self.cascade {
            CascadePolicy::Once => 1,
            CascadePolicy::Never => 0,
        };
        let mut report = StepReport::no_op();
        let mut advanced = false;

        loop {
            let phase = state.phase;
            let Some(handler) = self.handler_for(phase) else {
                break;
            };

            report.dispatched.push(phase);
            let outcome = match handler.invoke(state).await {
                Ok(outcome) => outcome,
                Err(source) => {
                    warn!(
                        patient_id = %state.patient_id,
                        phase = %phase,
                        kind = source.kind(),
                        error = %source,
                        "Store failure aborted turn"
                    );
                    state.phase = WorkflowPhase::Error;
                    return Err(WorkflowError::Store { phase, source });
                }
            };
            state.pending_user_input = None;

            if let Some(e) = &outcome.fallback {
                warn!(
                    patient_id = %state.patient_id,
                    phase = %phase,
                    kind = e.kind(),
                    error = %e,
                    "Responder failed, used fallback reply"
                );
                report.fallback = Some(e.clone());
            }

            if !outcome.advance {
                break;
            }

            let next = phase
                .next()
                .ok_or(WorkflowError::TerminalPhase { phase })?;
            self.transition(state, next)?;
            advanced = true;

            if next.is_terminal() || outcome.fallback.is_some() || cascades_left == 0 {
                break;
            }
            cascades_left -= 1;
        }

        report.outcome = if report.fallback.is_some() {
            TurnOutcome::Fallback
        } else if advanced {
            TurnOutcome::Advanced
        } else {
            TurnOutcome::NoOp
        };
        state.last_turn_outcome = Some(report.outcome);
        state.updated_at = Utc::now();

        debug!(
            patient_id = %state.patient_id,
            phase = %state.phase,
            outcome = %report.outcome,
            dispatched = report.dispatched.len(),
            "Step complete"
        );
        Ok(report)
    }
}

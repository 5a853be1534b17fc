//! Check-in workflow: state model, engine and phase handlers.

pub mod companion;
pub mod engine;
pub mod prompts;
pub mod questionnaire;
pub mod state;
pub mod trend;

pub use companion::CompanionHandler;
pub use engine::{HandlerReport, PhaseHandler, StepReport, WorkflowEngine};
pub use questionnaire::QuestionnaireHandler;
pub use state::{
    HistoryEntry, OutcomeValue, PatientState, PendingWrite, SpeakerRole, TurnOutcome,
    WorkflowPhase,
};
pub use trend::TrendHandler;

//! Error types for the check-in core.

use std::time::Duration;

use crate::workflow::WorkflowPhase;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// `NotFound`, `Conflict` and `Pool`/`Query` are the persistence failure
/// kinds a turn can surface to its caller.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Write conflict on {entity} {id}: expected version {expected}")]
    Conflict {
        entity: String,
        id: String,
        expected: u64,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Short label for logs and API surfaces.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not-found",
            Self::Conflict { .. } => "conflict",
            _ => "io-failure",
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Failures of the structured-output collaborator.
///
/// Always recovered inside the phase handler that made the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponderError {
    #[error("Responder timed out after {0:?}")]
    Timeout(Duration),

    #[error("Responder output blocked: {0}")]
    Blocked(String),

    #[error("Responder returned malformed output: {0}")]
    MalformedOutput(String),

    #[error("Responder unavailable: {0}")]
    Unavailable(String),
}

impl ResponderError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Blocked(_) => "blocked",
            Self::MalformedOutput(_) => "malformed-output",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Request rejected before the engine runs. No state is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing patient id")]
    MissingPatientId,

    #[error("Missing user id")]
    MissingUserId,

    #[error("Patient id must be a pseudonym, not a raw identifier")]
    RawIdentifier,

    #[error("Patient {patient_id} is not linked to this user")]
    UnauthorizedPatientLink { patient_id: String },
}

/// Errors raised by the workflow engine during a step.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition {
        from: WorkflowPhase,
        to: WorkflowPhase,
    },

    #[error("Phase {phase} has no successor")]
    TerminalPhase { phase: WorkflowPhase },

    #[error("Store failure during {phase}: {source}")]
    Store {
        phase: WorkflowPhase,
        #[source]
        source: DatabaseError,
    },
}

/// The only error a turn surfaces to its caller.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Workflow failure: {0}")]
    Workflow(#[from] WorkflowError),
}

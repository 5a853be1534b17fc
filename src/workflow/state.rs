//! Check-in state machine phases and the persisted per-patient state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PatientId;
use crate::store::{Alert, Record};

/// The phases of a check-in.
///
/// Progresses linearly: Initial → Companion → AdaptiveQuestionnaire →
/// TrendMonitoring → Completed. Error is reachable from any phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    #[default]
    Initial,
    Companion,
    AdaptiveQuestionnaire,
    TrendMonitoring,
    Completed,
    Error,
}

impl WorkflowPhase {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: WorkflowPhase) -> bool {
        use WorkflowPhase::*;
        matches!(
            (self, target),
            (Initial, Companion)
                | (Companion, AdaptiveQuestionnaire)
                | (AdaptiveQuestionnaire, TrendMonitoring)
                | (TrendMonitoring, Completed)
        ) || (target == Error && *self != Error)
    }

    /// Whether no handler runs in this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Get the next phase in the linear progression, if any.
    pub fn next(&self) -> Option<WorkflowPhase> {
        use WorkflowPhase::*;
        match self {
            Initial => Some(Companion),
            Companion => Some(AdaptiveQuestionnaire),
            AdaptiveQuestionnaire => Some(TrendMonitoring),
            TrendMonitoring => Some(Completed),
            Completed | Error => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Companion => "companion",
            Self::AdaptiveQuestionnaire => "adaptive_questionnaire",
            Self::TrendMonitoring => "trend_monitoring",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "companion" => Ok(Self::Companion),
            "adaptive_questionnaire" => Ok(Self::AdaptiveQuestionnaire),
            "trend_monitoring" => Ok(Self::TrendMonitoring),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown workflow phase '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    User,
    Assistant,
}

/// One entry of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: SpeakerRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// A collected outcome value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutcomeValue {
    Flag(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl std::fmt::Display for OutcomeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag(b) => write!(f, "{b}"),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Diagnostic summary of what the last turn did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Advanced,
    Fallback,
    NoOp,
}

impl std::fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Advanced => "advanced",
            Self::Fallback => "fallback",
            Self::NoOp => "no_op",
        };
        write!(f, "{s}")
    }
}

/// A record or alert produced during a turn, written after the state is saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingWrite {
    Record(Record),
    Alert(Alert),
}

/// Everything persisted for one patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientState {
    pub patient_id: PatientId,
    /// Owning user link; turns from any other user are rejected.
    pub user_id: String,
    pub phase: WorkflowPhase,
    pub conversation_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub pending_user_input: Option<String>,
    pub emotional_state: String,
    pub collected_data: BTreeMap<String, OutcomeValue>,
    pub questions_asked: u32,
    /// Question the next answer refers to.
    #[serde(default)]
    pub last_question: Option<String>,
    #[serde(default)]
    pub intro_statement: Option<String>,
    #[serde(default)]
    pub last_consumed_input: Option<String>,
    #[serde(default)]
    pub last_consumed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_turn_outcome: Option<TurnOutcome>,
    pub language_preference: String,
    /// Free-form needs such as `vision: large print`, shown to the responder.
    #[serde(default)]
    pub accessibility_needs: BTreeMap<String, String>,
    #[serde(default)]
    pub last_check_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outbox: Vec<PendingWrite>,
    /// Stored version this state was loaded at; 0 if never saved.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PatientState {
    pub fn new(patient_id: PatientId, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            patient_id,
            user_id: user_id.into(),
            phase: WorkflowPhase::Initial,
            conversation_history: Vec::new(),
            pending_user_input: None,
            emotional_state: "neutral".to_string(),
            collected_data: BTreeMap::new(),
            questions_asked: 0,
            last_question: None,
            intro_statement: None,
            last_consumed_input: None,
            last_consumed_at: None,
            last_turn_outcome: None,
            language_preference: "en".to_string(),
            accessibility_needs: BTreeMap::new(),
            last_check_in: None,
            outbox: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.conversation_history.push(HistoryEntry {
            role: SpeakerRole::User,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.conversation_history.push(HistoryEntry {
            role: SpeakerRole::Assistant,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.conversation_history.last()
    }

    /// Text of the most recent assistant entry.
    pub fn latest_assistant_text(&self) -> Option<&str> {
        self.conversation_history
            .iter()
            .rev()
            .find(|e| e.role == SpeakerRole::Assistant)
            .map(|e| e.text.as_str())
    }

    /// The last `n` history entries, oldest first.
    pub fn recent_history(&self, n: usize) -> &[HistoryEntry] {
        let start = self.conversation_history.len().saturating_sub(n);
        &self.conversation_history[start..]
    }

    /// Records produced this session but not yet flushed to the store.
    pub fn pending_records(&self) -> impl Iterator<Item = &Record> {
        self.outbox.iter().filter_map(|w| match w {
            PendingWrite::Record(r) => Some(r),
            PendingWrite::Alert(_) => None,
        })
    }
}

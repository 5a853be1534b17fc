//! Store traits for patient state, outcome records and alerts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::PatientId;
use crate::workflow::{OutcomeValue, PatientState, WorkflowPhase};

/// One flushed questionnaire snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub patient_id: PatientId,
    pub data: BTreeMap<String, OutcomeValue>,
    pub collected_at: DateTime<Utc>,
    pub source_phase: WorkflowPhase,
}

impl Record {
    pub fn new(patient_id: PatientId, data: BTreeMap<String, OutcomeValue>, source_phase: WorkflowPhase) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            data,
            collected_at: Utc::now(),
            source_phase,
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const LABELS: &'static [&'static str] = &["none", "low", "medium", "high", "critical"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Result of one trend analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub patient_id: PatientId,
    pub alert_type: String,
    pub severity: Severity,
    pub summary: String,
    pub triggered_by_phase: WorkflowPhase,
    pub triggered_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        patient_id: PatientId,
        alert_type: impl Into<String>,
        severity: Severity,
        summary: impl Into<String>,
        triggered_by_phase: WorkflowPhase,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            alert_type: alert_type.into(),
            severity,
            summary: summary.into(),
            triggered_by_phase,
            triggered_at: Utc::now(),
        }
    }
}

/// Durable home of one `PatientState` per patient.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the state, or `None` if the patient has never been seen.
    async fn load(&self, patient_id: &PatientId) -> Result<Option<PatientState>, DatabaseError>;

    /// Save the state if the stored version still equals `state.version`.
    ///
    /// Returns the new version. Fails with `DatabaseError::Conflict` when
    /// another writer saved first.
    async fn save(&self, state: &PatientState) -> Result<u64, DatabaseError>;
}

/// Append-only outcome records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append a record. Appending the same record id twice is a no-op.
    async fn append_record(&self, record: &Record) -> Result<(), DatabaseError>;

    /// All records for a patient, oldest first.
    async fn list_records(&self, patient_id: &PatientId) -> Result<Vec<Record>, DatabaseError>;
}

/// Append-only alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Append an alert. Appending the same alert id twice is a no-op.
    async fn append_alert(&self, alert: &Alert) -> Result<(), DatabaseError>;

    /// All alerts for a patient, newest first.
    async fn list_alerts(&self, patient_id: &PatientId) -> Result<Vec<Alert>, DatabaseError>;
}

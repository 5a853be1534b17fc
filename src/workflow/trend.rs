//! Trend analysis over the patient's outcome history.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::error::DatabaseError;
use crate::responder::{BoundedResponder, FieldKind, FieldSpec, OutputShape};
use crate::store::{Alert, RecordStore, Severity};
use crate::workflow::engine::{HandlerReport, PhaseHandler};
use crate::workflow::prompts;
use crate::workflow::state::{PatientState, PendingWrite, WorkflowPhase};

pub const ANALYSIS_UNAVAILABLE: &str = "analysis_unavailable";

#[derive(Debug, Deserialize)]
struct TrendReply {
    severity: Severity,
    alert_type: String,
    summary: String,
}

fn trend_shape() -> OutputShape {
    OutputShape::new(
        "trend_analysis",
        vec![
            FieldSpec::required(
                "severity",
                FieldKind::Label(Severity::LABELS),
                "Overall risk severity",
            ),
            FieldSpec::required("alert_type", FieldKind::Text, "snake_case tag for the main signal"),
            FieldSpec::required("summary", FieldKind::Text, "Short clinical summary"),
        ],
    )
}

/// Runs exactly one analysis pass and always finishes the check-in.
pub struct TrendHandler {
    responder: BoundedResponder,
    records: Arc<dyn RecordStore>,
    shape: OutputShape,
}

impl TrendHandler {
    pub fn new(responder: BoundedResponder, records: Arc<dyn RecordStore>) -> Self {
        Self {
            responder,
            records,
            shape: trend_shape(),
        }
    }
}

#[async_trait]
impl PhaseHandler for TrendHandler {
    async fn invoke(&self, state: &mut PatientState) -> Result<HandlerReport, DatabaseError> {
        let mut records = self.records.list_records(&state.patient_id).await?;
        for pending in state.pending_records() {
            if !records.iter().any(|r| r.id == pending.id) {
                records.push(pending.clone());
            }
        }

        let context = prompts::trend_context(&records, &state.collected_data);
        let (alert, fallback) = match self.responder.call::<TrendReply>(&context, &self.shape).await {
            Ok(reply) => (
                Alert::new(
                    state.patient_id.clone(),
                    reply.alert_type.trim(),
                    reply.severity,
                    reply.summary.trim(),
                    WorkflowPhase::TrendMonitoring,
                ),
                None,
            ),
            Err(e) => (
                Alert::new(
                    state.patient_id.clone(),
                    ANALYSIS_UNAVAILABLE,
                    Severity::None,
                    format!("Trend analysis could not be completed ({}).", e.kind()),
                    WorkflowPhase::TrendMonitoring,
                ),
                Some(e),
            ),
        };

        info!(
            patient_id = %state.patient_id,
            records = records.len(),
            severity = %alert.severity,
            alert_type = %alert.alert_type,
            "Trend analysis complete"
        );

        state.push_assistant(prompts::trend_closing(alert.severity));
        state.outbox.push(PendingWrite::Alert(alert));
        state.last_check_in = Some(Utc::now());

        Ok(HandlerReport {
            advance: true,
            fallback,
        })
    }
}

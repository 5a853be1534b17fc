//! TurnController: the externally facing check-in operations.
//!
//! A turn is validate → lock → load → authorize → flush leftover writes →
//! step → save → flush new writes → project. Records and alerts produced
//! by a turn are only written after the state that produced them has been
//! saved, and every write is idempotent, so a crash at any point can be
//! recovered by the next turn.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::config::WorkflowConfig;
use crate::error::{DatabaseError, TurnError};
use crate::identity::{self, PatientId};
use crate::responder::Responder;
use crate::store::{Alert, AlertSink, Record, RecordStore, SessionStore};
use crate::workflow::{PatientState, PendingWrite, TurnOutcome, WorkflowEngine, WorkflowPhase};

/// What a caller sees after a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Projection {
    pub patient_id: PatientId,
    pub assistant_text: String,
    pub emotional_state: String,
    pub phase: WorkflowPhase,
    pub outcome: Option<TurnOutcome>,
}

impl Projection {
    pub fn of(state: &PatientState) -> Self {
        Self {
            patient_id: state.patient_id.clone(),
            assistant_text: state.latest_assistant_text().unwrap_or_default().to_string(),
            emotional_state: state.emotional_state.clone(),
            phase: state.phase,
            outcome: state.last_turn_outcome,
        }
    }
}

/// One async mutex per patient, created on demand.
#[derive(Default)]
pub struct PatientLocks {
    inner: Mutex<HashMap<PatientId, Arc<Mutex<()>>>>,
}

impl PatientLocks {
    /// Wait for exclusive access to `patient_id`.
    pub async fn acquire(&self, patient_id: &PatientId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            // Drop entries nobody is holding or waiting on.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(patient_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

pub struct TurnController {
    sessions: Arc<dyn SessionStore>,
    records: Arc<dyn RecordStore>,
    alerts: Arc<dyn AlertSink>,
    engine: WorkflowEngine,
    locks: PatientLocks,
}

impl TurnController {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        records: Arc<dyn RecordStore>,
        alerts: Arc<dyn AlertSink>,
        engine: WorkflowEngine,
    ) -> Self {
        Self {
            sessions,
            records,
            alerts,
            engine,
            locks: PatientLocks::default(),
        }
    }

    /// Wire a controller around one backend that implements every store.
    pub fn from_store<S>(store: Arc<S>, responder: Arc<dyn Responder>, config: &WorkflowConfig) -> Self
    where
        S: SessionStore + RecordStore + AlertSink + 'static,
    {
        let engine = WorkflowEngine::build(responder, store.clone(), config);
        Self::new(store.clone(), store.clone(), store, engine)
    }

    /// Begin or resume a check-in.
    ///
    /// Without a patient id the caller's own pseudonym is used. A new
    /// patient gets a fresh state and an opening turn; an existing one gets
    /// its current projection back after any pending writes are flushed.
    pub async fn begin(&self, user_id: &str, patient_id: Option<&str>) -> Result<Projection, TurnError> {
        let user_id = identity::require_user(user_id)?;
        let patient_id = identity::resolve_patient(user_id, patient_id)?;

        let _guard = self.locks.acquire(&patient_id).await;
        let mut state = match self.sessions.load(&patient_id).await? {
            Some(mut state) => {
                identity::authorize(&state, user_id)?;
                if state.phase != WorkflowPhase::Initial {
                    info!(patient_id = %patient_id, phase = %state.phase, "Resuming check-in");
                    self.settle_outbox(&mut state).await?;
                    return Ok(Projection::of(&state));
                }
                state
            }
            None => {
                identity::authorize_new(&patient_id, user_id)?;
                info!(patient_id = %patient_id, "Starting new check-in");
                PatientState::new(patient_id, user_id)
            }
        };

        self.run_turn(&mut state, "").await
    }

    /// Feed one patient message into an existing check-in.
    pub async fn continue_turn(
        &self,
        user_id: &str,
        patient_id: &str,
        text: &str,
    ) -> Result<Projection, TurnError> {
        let user_id = identity::require_user(user_id)?;
        let patient_id = identity::resolve_patient(user_id, Some(patient_id))?;

        let _guard = self.locks.acquire(&patient_id).await;
        let mut state = self.load_authorized(&patient_id, user_id).await?;
        self.run_turn(&mut state, text).await
    }

    /// All flushed outcome records for a patient, oldest first.
    pub async fn record_history(
        &self,
        user_id: &str,
        patient_id: Option<&str>,
    ) -> Result<Vec<Record>, TurnError> {
        let user_id = identity::require_user(user_id)?;
        let patient_id = identity::resolve_patient(user_id, patient_id)?;
        self.load_authorized(&patient_id, user_id).await?;
        Ok(self.records.list_records(&patient_id).await?)
    }

    /// All alerts for a patient, newest first.
    pub async fn alert_history(
        &self,
        user_id: &str,
        patient_id: Option<&str>,
    ) -> Result<Vec<Alert>, TurnError> {
        let user_id = identity::require_user(user_id)?;
        let patient_id = identity::resolve_patient(user_id, patient_id)?;
        self.load_authorized(&patient_id, user_id).await?;
        Ok(self.alerts.list_alerts(&patient_id).await?)
    }

    async fn load_authorized(&self, patient_id: &PatientId, user_id: &str) -> Result<PatientState, TurnError> {
        let state = self
            .sessions
            .load(patient_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "patient_state".to_string(),
                id: patient_id.to_string(),
            })?;
        identity::authorize(&state, user_id)?;
        Ok(state)
    }

    /// Write what a previous turn left behind, then persist the emptied
    /// outbox. Used when resuming without running a turn.
    async fn settle_outbox(&self, state: &mut PatientState) -> Result<(), TurnError> {
        if state.outbox.is_empty() {
            return Ok(());
        }
        self.replay_outbox(state).await?;
        state.version = self.sessions.save(state).await.map_err(|e| {
            warn!(patient_id = %state.patient_id, kind = e.kind(), error = %e, "Failed to save patient state");
            e
        })?;
        Ok(())
    }

    async fn replay_outbox(&self, state: &mut PatientState) -> Result<(), DatabaseError> {
        if state.outbox.is_empty() {
            return Ok(());
        }
        self.flush(state).await.map_err(|e| {
            error!(patient_id = %state.patient_id, kind = e.kind(), error = %e, "Failed to replay pending writes");
            e
        })?;
        state.outbox.clear();
        Ok(())
    }

    async fn run_turn(&self, state: &mut PatientState, input: &str) -> Result<Projection, TurnError> {
        self.replay_outbox(state).await?;

        let report = self.engine.step(state, input).await.map_err(|e| {
            error!(patient_id = %state.patient_id, error = %e, "Turn aborted");
            e
        })?;

        state.version = self.sessions.save(state).await.map_err(|e| {
            warn!(patient_id = %state.patient_id, kind = e.kind(), error = %e, "Failed to save patient state");
            e
        })?;

        if !state.outbox.is_empty()
            && let Err(e) = self.flush(state).await
        {
            warn!(
                patient_id = %state.patient_id,
                kind = e.kind(),
                error = %e,
                "Pending writes not flushed, will retry next turn"
            );
        }

        info!(
            patient_id = %state.patient_id,
            phase = %state.phase,
            outcome = %report.outcome,
            version = state.version,
            "Turn complete"
        );
        Ok(Projection::of(state))
    }

    async fn flush(&self, state: &PatientState) -> Result<(), DatabaseError> {
        for write in &state.outbox {
            match write {
                PendingWrite::Record(record) => {
                    self.records.append_record(record).await?;
                    info!(patient_id = %record.patient_id, record_id = %record.id, "Outcome record written");
                }
                PendingWrite::Alert(alert) => {
                    self.alerts.append_alert(alert).await?;
                    info!(
                        patient_id = %alert.patient_id,
                        alert_id = %alert.id,
                        severity = %alert.severity,
                        "Alert written"
                    );
                }
            }
        }
        Ok(())
    }
}

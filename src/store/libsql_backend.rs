//! libSQL backend implementing the session, record and alert stores.
//!
//! Supports local file and in-memory databases. Patient state saves are
//! optimistically versioned: a save only lands if the stored version still
//! matches the version the state was loaded at.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::PatientId;
use crate::store::migrations;
use crate::store::traits::{Alert, AlertSink, Record, RecordStore, SessionStore, Severity};
use crate::workflow::{PatientState, WorkflowPhase};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so lexical order matches chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_phase(s: &str) -> Result<WorkflowPhase, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad id '{s}': {e}")))
}

fn row_to_record(row: &libsql::Row) -> Result<Record, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("row_to_record: {e}"));
    let id: String = row.get(0).map_err(read)?;
    let patient_id: String = row.get(1).map_err(read)?;
    let data: String = row.get(2).map_err(read)?;
    let collected_at: String = row.get(3).map_err(read)?;
    let source_phase: String = row.get(4).map_err(read)?;

    Ok(Record {
        id: parse_uuid(&id)?,
        patient_id: PatientId::parse(&patient_id)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        data: serde_json::from_str(&data)
            .map_err(|e| DatabaseError::Serialization(format!("record data: {e}")))?,
        collected_at: parse_datetime(&collected_at),
        source_phase: parse_phase(&source_phase)?,
    })
}

fn row_to_alert(row: &libsql::Row) -> Result<Alert, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("row_to_alert: {e}"));
    let id: String = row.get(0).map_err(read)?;
    let patient_id: String = row.get(1).map_err(read)?;
    let alert_type: String = row.get(2).map_err(read)?;
    let severity: String = row.get(3).map_err(read)?;
    let summary: String = row.get(4).map_err(read)?;
    let triggered_by_phase: String = row.get(5).map_err(read)?;
    let triggered_at: String = row.get(6).map_err(read)?;

    Ok(Alert {
        id: parse_uuid(&id)?,
        patient_id: PatientId::parse(&patient_id)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        alert_type,
        severity: severity
            .parse::<Severity>()
            .map_err(DatabaseError::Serialization)?,
        summary,
        triggered_by_phase: parse_phase(&triggered_by_phase)?,
        triggered_at: parse_datetime(&triggered_at),
    })
}

// ── SessionStore ────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn load(&self, patient_id: &PatientId) -> Result<Option<PatientState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT phase, state, version FROM patient_states WHERE patient_id = ?1",
                params![patient_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_state: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("load_state: {e}"))),
        };

        let read = |e: libsql::Error| DatabaseError::Query(format!("load_state: {e}"));
        let phase: String = row.get(0).map_err(read)?;
        let state_json: String = row.get(1).map_err(read)?;
        let version: i64 = row.get(2).map_err(read)?;

        let mut state: PatientState = serde_json::from_str(&state_json)
            .map_err(|e| DatabaseError::Serialization(format!("patient state: {e}")))?;
        state.phase = parse_phase(&phase)?;
        state.version = u64::try_from(version)
            .map_err(|_| DatabaseError::Serialization(format!("negative version {version}")))?;

        debug!(patient_id = %patient_id, phase = %state.phase, version = state.version, "Loaded patient state");
        Ok(Some(state))
    }

    async fn save(&self, state: &PatientState) -> Result<u64, DatabaseError> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let expected = i64::try_from(state.version)
            .map_err(|_| DatabaseError::Serialization(format!("version {} overflows", state.version)))?;
        let new_version = expected + 1;
        let now = format_datetime(&Utc::now());

        let affected = if state.version == 0 {
            self.conn()
                .execute(
                    "INSERT OR IGNORE INTO patient_states
                        (patient_id, user_id, phase, state, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        state.patient_id.as_str(),
                        state.user_id.as_str(),
                        state.phase.as_str(),
                        state_json,
                        new_version,
                        format_datetime(&state.created_at),
                        now
                    ],
                )
                .await
        } else {
            self.conn()
                .execute(
                    "UPDATE patient_states
                     SET user_id = ?2, phase = ?3, state = ?4, version = ?5, updated_at = ?6
                     WHERE patient_id = ?1 AND version = ?7",
                    params![
                        state.patient_id.as_str(),
                        state.user_id.as_str(),
                        state.phase.as_str(),
                        state_json,
                        new_version,
                        now,
                        expected
                    ],
                )
                .await
        }
        .map_err(|e| DatabaseError::Query(format!("save_state: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::Conflict {
                entity: "patient_state".to_string(),
                id: state.patient_id.to_string(),
                expected: state.version,
            });
        }

        debug!(patient_id = %state.patient_id, phase = %state.phase, version = new_version, "Saved patient state");
        Ok(new_version as u64)
    }
}

// ── RecordStore ─────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for LibSqlBackend {
    async fn append_record(&self, record: &Record) -> Result<(), DatabaseError> {
        let data = serde_json::to_string(&record.data)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT OR IGNORE INTO outcome_records
                    (id, patient_id, data, collected_at, source_phase)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.to_string(),
                    record.patient_id.as_str(),
                    data,
                    format_datetime(&record.collected_at),
                    record.source_phase.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_record: {e}")))?;

        Ok(())
    }

    async fn list_records(&self, patient_id: &PatientId) -> Result<Vec<Record>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, patient_id, data, collected_at, source_phase
                 FROM outcome_records WHERE patient_id = ?1
                 ORDER BY collected_at ASC, rowid ASC",
                params![patient_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_records: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_records: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

// ── AlertSink ───────────────────────────────────────────────────────

#[async_trait]
impl AlertSink for LibSqlBackend {
    async fn append_alert(&self, alert: &Alert) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO alerts
                    (id, patient_id, alert_type, severity, summary, triggered_by_phase, triggered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    alert.id.to_string(),
                    alert.patient_id.as_str(),
                    alert.alert_type.as_str(),
                    alert.severity.as_str(),
                    alert.summary.as_str(),
                    alert.triggered_by_phase.as_str(),
                    format_datetime(&alert.triggered_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_alert: {e}")))?;

        Ok(())
    }

    async fn list_alerts(&self, patient_id: &PatientId) -> Result<Vec<Alert>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, patient_id, alert_type, severity, summary, triggered_by_phase, triggered_at
                 FROM alerts WHERE patient_id = ?1
                 ORDER BY triggered_at DESC, rowid DESC",
                params![patient_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_alerts: {e}")))?;

        let mut alerts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_alerts: {e}")))?
        {
            alerts.push(row_to_alert(&row)?);
        }
        Ok(alerts)
    }
}

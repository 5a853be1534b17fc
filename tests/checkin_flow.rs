//! End-to-end check-in flows through `TurnController`.
//!
//! Every test runs against an in-memory libSQL database and a scripted
//! responder that returns queued results per output shape, so no test
//! touches the network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use pro_checkin::config::{CascadePolicy, WorkflowConfig};
use pro_checkin::error::{DatabaseError, ResponderError, TurnError, ValidationError, WorkflowError};
use pro_checkin::identity::{PatientId, pseudonymize};
use pro_checkin::responder::{OutputShape, Responder, ResponderContext};
use pro_checkin::store::{
    Alert, AlertSink, LibSqlBackend, Record, RecordStore, SessionStore, Severity,
};
use pro_checkin::workflow::prompts::{
    CANONICAL_QUESTIONS, CLARIFICATION_FALLBACK, COMPANION_FALLBACK, QUESTIONNAIRE_CLOSING,
};
use pro_checkin::workflow::{OutcomeValue, PatientState, SpeakerRole, TurnOutcome, WorkflowPhase};
use pro_checkin::{Projection, TurnController};

const COMPANION: &str = "companion_reply";
const QUESTIONNAIRE: &str = "questionnaire_turn";
const TREND: &str = "trend_analysis";

const USER: &str = "alice";

// ── Scripted responder ──────────────────────────────────────────────

/// Returns queued results per shape name, or a neutral default when the
/// queue for that shape is empty.
#[derive(Default)]
struct ScriptedResponder {
    queues: Mutex<HashMap<&'static str, VecDeque<Result<Value, ResponderError>>>>,
    calls: Mutex<HashMap<&'static str, u32>>,
    delay: Option<Duration>,
}

impl ScriptedResponder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    fn push(&self, shape: &'static str, result: Result<Value, ResponderError>) {
        self.queues
            .lock()
            .unwrap()
            .entry(shape)
            .or_default()
            .push_back(result);
    }

    fn calls(&self, shape: &str) -> u32 {
        self.calls.lock().unwrap().get(shape).copied().unwrap_or(0)
    }
}

fn default_reply(shape: &str) -> Value {
    match shape {
        COMPANION => greeting(),
        QUESTIONNAIRE => questionnaire_turn(json!(null), false),
        _ => json!({
            "severity": "low",
            "alert_type": "stable",
            "summary": "No concerning change."
        }),
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn invoke(
        &self,
        _context: &ResponderContext,
        shape: &OutputShape,
    ) -> Result<Value, ResponderError> {
        *self.calls.lock().unwrap().entry(shape.name).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self
            .queues
            .lock()
            .unwrap()
            .get_mut(shape.name)
            .and_then(|q| q.pop_front());
        queued.unwrap_or_else(|| Ok(default_reply(shape.name)))
    }
}

fn greeting() -> Value {
    json!({
        "agent_response": "Hi, how are you feeling today?",
        "detected_emotional_state": "neutral",
        "transition_to_questionnaire": false
    })
}

fn ready() -> Value {
    json!({
        "agent_response": "Thanks for being up for it.",
        "detected_emotional_state": "hopeful",
        "transition_to_questionnaire": true,
        "intro_statement": "I have a few short questions about your health."
    })
}

fn questionnaire_turn(extracted: Value, complete: bool) -> Value {
    json!({
        "next_question": null,
        "detected_emotional_state": "calm",
        "extracted": extracted,
        "is_complete": complete
    })
}

fn trend(severity: &str) -> Value {
    json!({
        "severity": severity,
        "alert_type": "pain_increase",
        "summary": "Pain is trending upward."
    })
}

// ── Fault-injecting store ───────────────────────────────────────────

/// Delegates to libSQL, with switches to fail individual operations.
struct FlakyStore {
    inner: LibSqlBackend,
    fail_save: AtomicBool,
    fail_list_records: AtomicBool,
    fail_appends: AtomicBool,
}

impl FlakyStore {
    async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_save: AtomicBool::new(false),
            fail_list_records: AtomicBool::new(false),
            fail_appends: AtomicBool::new(false),
        })
    }

    fn io_error(op: &str) -> DatabaseError {
        DatabaseError::Query(format!("{op}: disk I/O error"))
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn load(&self, patient_id: &PatientId) -> Result<Option<PatientState>, DatabaseError> {
        self.inner.load(patient_id).await
    }

    async fn save(&self, state: &PatientState) -> Result<u64, DatabaseError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(Self::io_error("save_state"));
        }
        self.inner.save(state).await
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn append_record(&self, record: &Record) -> Result<(), DatabaseError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Self::io_error("append_record"));
        }
        self.inner.append_record(record).await
    }

    async fn list_records(&self, patient_id: &PatientId) -> Result<Vec<Record>, DatabaseError> {
        if self.fail_list_records.load(Ordering::SeqCst) {
            return Err(Self::io_error("list_records"));
        }
        self.inner.list_records(patient_id).await
    }
}

#[async_trait]
impl AlertSink for FlakyStore {
    async fn append_alert(&self, alert: &Alert) -> Result<(), DatabaseError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Self::io_error("append_alert"));
        }
        self.inner.append_alert(alert).await
    }

    async fn list_alerts(&self, patient_id: &PatientId) -> Result<Vec<Alert>, DatabaseError> {
        self.inner.list_alerts(patient_id).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

fn config(cascade: CascadePolicy) -> WorkflowConfig {
    WorkflowConfig {
        cascade,
        ..WorkflowConfig::default()
    }
}

struct Harness {
    store: Arc<FlakyStore>,
    responder: Arc<ScriptedResponder>,
    controller: Arc<TurnController>,
}

impl Harness {
    async fn new(cascade: CascadePolicy) -> Self {
        Self::with_config(config(cascade), ScriptedResponder::new()).await
    }

    async fn with_config(config: WorkflowConfig, responder: Arc<ScriptedResponder>) -> Self {
        let store = FlakyStore::new().await;
        let controller = Arc::new(TurnController::from_store(
            store.clone(),
            responder.clone(),
            &config,
        ));
        Self {
            store,
            responder,
            controller,
        }
    }

    fn patient(&self) -> PatientId {
        pseudonymize(USER)
    }

    async fn begin(&self) -> Projection {
        self.controller.begin(USER, None).await.unwrap()
    }

    async fn say(&self, text: &str) -> Projection {
        self.controller
            .continue_turn(USER, self.patient().as_str(), text)
            .await
            .unwrap()
    }

    async fn try_say(&self, text: &str) -> Result<Projection, TurnError> {
        self.controller
            .continue_turn(USER, self.patient().as_str(), text)
            .await
    }

    async fn state(&self) -> PatientState {
        self.store.load(&self.patient()).await.unwrap().unwrap()
    }

    /// Begin, then answer the companion with readiness.
    async fn reach_questionnaire(&self) -> Projection {
        self.begin().await;
        self.responder.push(COMPANION, Ok(ready()));
        self.say("I'm ready").await
    }

    async fn reach_questionnaire_phase(&self) -> WorkflowPhase {
        self.responder.push(COMPANION, Ok(ready()));
        self.say("I'm ready").await.phase
    }
}

fn user_entries(state: &PatientState, text: &str) -> usize {
    state
        .conversation_history
        .iter()
        .filter(|e| e.role == SpeakerRole::User && e.text == text)
        .count()
}

const PHASE_ORDER: [WorkflowPhase; 5] = [
    WorkflowPhase::Initial,
    WorkflowPhase::Companion,
    WorkflowPhase::AdaptiveQuestionnaire,
    WorkflowPhase::TrendMonitoring,
    WorkflowPhase::Completed,
];

fn assert_monotonic(phases: &[WorkflowPhase]) {
    let rank = |p: &WorkflowPhase| PHASE_ORDER.iter().position(|q| q == p).unwrap();
    for pair in phases.windows(2) {
        assert!(
            rank(&pair[0]) <= rank(&pair[1]),
            "phase regressed: {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }
}

// ── Scenario ────────────────────────────────────────────────────────

#[tokio::test]
async fn greeting_then_ready_with_cascade_once() {
    let h = Harness::new(CascadePolicy::Once).await;

    let opening = h.begin().await;
    assert_eq!(opening.phase, WorkflowPhase::Companion);
    assert_eq!(opening.assistant_text, "Hi, how are you feeling today?");
    assert_eq!(h.state().await.conversation_history.len(), 1);

    h.responder.push(COMPANION, Ok(ready()));
    let projection = h.say("I'm ready").await;

    assert_eq!(projection.phase, WorkflowPhase::AdaptiveQuestionnaire);
    assert_eq!(projection.emotional_state, "calm");
    // The questionnaire ran once in the same turn and asked its first question.
    assert_eq!(projection.assistant_text, CANONICAL_QUESTIONS[0]);

    let state = h.state().await;
    assert_eq!(state.questions_asked, 1);
    let texts: Vec<&str> = state
        .conversation_history
        .iter()
        .map(|e| e.text.as_str())
        .collect();
    assert_eq!(
        texts,
        vec![
            "Hi, how are you feeling today?",
            "I'm ready",
            "Thanks for being up for it.\n\nI have a few short questions about your health.",
            CANONICAL_QUESTIONS[0],
        ]
    );
    assert_eq!(h.responder.calls(TREND), 0);
}

#[tokio::test]
async fn greeting_then_ready_with_cascade_never() {
    let h = Harness::new(CascadePolicy::Never).await;

    let projection = h.reach_questionnaire().await;
    assert_eq!(projection.phase, WorkflowPhase::AdaptiveQuestionnaire);
    assert_eq!(
        projection.assistant_text,
        "Thanks for being up for it.\n\nI have a few short questions about your health."
    );

    let state = h.state().await;
    assert_eq!(state.questions_asked, 0);
    assert_eq!(state.conversation_history.len(), 3);
    assert_eq!(h.responder.calls(QUESTIONNAIRE), 0);

    // The next message gets the first question.
    let next = h.say("ok, go ahead").await;
    assert_eq!(next.assistant_text, CANONICAL_QUESTIONS[0]);
    assert_eq!(h.state().await.questions_asked, 1);
}

#[tokio::test]
async fn begin_resumes_without_stepping() {
    let h = Harness::new(CascadePolicy::Once).await;

    let first = h.begin().await;
    let again = h.begin().await;

    assert_eq!(first, again);
    assert_eq!(h.responder.calls(COMPANION), 1);
    assert_eq!(h.state().await.version, 1);
}

// ── Idempotence and monotonicity ────────────────────────────────────

#[tokio::test]
async fn repeated_continue_does_not_duplicate_history() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.begin().await;

    let first = h.say("I slept badly").await;
    let len = h.state().await.conversation_history.len();
    let second = h.say("I slept badly").await;

    let state = h.state().await;
    assert_eq!(state.conversation_history.len(), len);
    assert_eq!(user_entries(&state, "I slept badly"), 1);
    assert_eq!(first.assistant_text, second.assistant_text);
    assert_eq!(second.outcome, Some(TurnOutcome::NoOp));
    assert_eq!(h.responder.calls(COMPANION), 2);
}

#[tokio::test]
async fn full_check_in_is_monotonic_and_writes_record_and_alert() {
    let h = Harness::new(CascadePolicy::Once).await;
    let mut phases = vec![WorkflowPhase::Initial];

    phases.push(h.begin().await.phase);
    phases.push(h.reach_questionnaire_phase().await);

    let answers = [
        (json!({ "pain_level": 6 }), "about a six"),
        (json!({ "fatigue_level": 7 }), "pretty drained"),
        (json!({ "mood_description": "low" }), "a bit down"),
        (json!({ "medication_adherence_issue": true }), "I missed some doses"),
        (json!({ "general_wellbeing": "fair" }), "managing, mostly"),
    ];
    h.responder.push(TREND, Ok(trend("high")));
    let mut last = None;
    for (extracted, answer) in answers {
        h.responder.push(QUESTIONNAIRE, Ok(questionnaire_turn(extracted, false)));
        let projection = h.say(answer).await;
        phases.push(projection.phase);
        last = Some(projection);
    }

    let last = last.unwrap();
    assert_eq!(last.phase, WorkflowPhase::Completed);
    assert!(last.assistant_text.contains("care team"));
    assert_monotonic(&phases);

    let state = h.state().await;
    let closing_at = state
        .conversation_history
        .iter()
        .position(|e| e.text == QUESTIONNAIRE_CLOSING)
        .unwrap();
    // Cascaded trend pass adds its own reply straight after the closing.
    assert_eq!(closing_at, state.conversation_history.len() - 2);
    assert!(state.last_check_in.is_some());

    let records = h.controller.record_history(USER, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data.len(), 5);
    assert_eq!(records[0].source_phase, WorkflowPhase::AdaptiveQuestionnaire);

    let alerts = h.controller.alert_history(USER, None).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::High);
    assert_eq!(alerts[0].triggered_by_phase, WorkflowPhase::TrendMonitoring);
}

#[tokio::test]
async fn completed_check_in_ignores_further_input() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.reach_questionnaire().await;
    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 2 }), true)));
    assert_eq!(h.say("all good").await.phase, WorkflowPhase::Completed);

    let before = h.state().await;
    let projection = h.say("one more thing").await;
    let after = h.state().await;

    assert_eq!(projection.phase, WorkflowPhase::Completed);
    assert_eq!(projection.outcome, Some(TurnOutcome::NoOp));
    assert_eq!(after.conversation_history, before.conversation_history);
    assert_eq!(h.responder.calls(TREND), 1);
    assert_eq!(h.controller.alert_history(USER, None).await.unwrap().len(), 1);
}

// ── Fallback ────────────────────────────────────────────────────────

#[tokio::test]
async fn companion_failure_keeps_phase() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.begin().await;
    h.responder
        .push(COMPANION, Err(ResponderError::Unavailable("overloaded".into())));

    let projection = h.say("I'm ready").await;
    assert_eq!(projection.phase, WorkflowPhase::Companion);
    assert_eq!(projection.assistant_text, COMPANION_FALLBACK);
    assert_eq!(projection.outcome, Some(TurnOutcome::Fallback));
    assert_eq!(projection.emotional_state, "neutral");

    // Retrying the same text after a fallback is a fresh attempt.
    h.responder.push(COMPANION, Ok(ready()));
    let retry = h.say("I'm ready").await;
    assert_eq!(retry.phase, WorkflowPhase::AdaptiveQuestionnaire);
}

#[tokio::test]
async fn questionnaire_failure_keeps_phase_and_data() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.reach_questionnaire().await;
    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 3 }), false)));
    h.say("three").await;
    let before = h.state().await;

    h.responder
        .push(QUESTIONNAIRE, Err(ResponderError::Blocked("safety".into())));
    let projection = h.say("hmm, not sure").await;
    let after = h.state().await;

    assert_eq!(projection.phase, before.phase);
    assert_eq!(projection.assistant_text, CLARIFICATION_FALLBACK);
    assert_eq!(after.collected_data, before.collected_data);
    assert_eq!(after.questions_asked, before.questions_asked);
    assert_eq!(after.last_question, before.last_question);
}

#[tokio::test]
async fn responder_timeout_is_a_fallback() {
    let config = WorkflowConfig {
        responder_timeout: Duration::from_millis(50),
        ..WorkflowConfig::default()
    };
    let h = Harness::with_config(config, ScriptedResponder::slow(Duration::from_millis(500))).await;

    let projection = tokio::time::timeout(Duration::from_secs(2), h.begin())
        .await
        .expect("turn must not hang on a slow responder");

    assert_eq!(projection.phase, WorkflowPhase::Companion);
    assert_eq!(projection.assistant_text, COMPANION_FALLBACK);
    assert_eq!(projection.outcome, Some(TurnOutcome::Fallback));
}

// ── Accumulation and forced completion ──────────────────────────────

#[tokio::test]
async fn five_answers_accumulate_then_budget_forces_trend() {
    let h = Harness::new(CascadePolicy::Never).await;
    h.reach_questionnaire().await;

    let fields = [
        json!({ "pain_level": 5 }),
        json!({ "fatigue_level": 4 }),
        json!({ "mood_description": "okay" }),
        json!({ "medication_adherence_issue": false }),
        json!({ "general_wellbeing": "good" }),
    ];
    for (i, extracted) in fields.into_iter().enumerate() {
        h.responder.push(QUESTIONNAIRE, Ok(questionnaire_turn(extracted, false)));
        let projection = h.say(&format!("answer {i}")).await;
        assert_eq!(projection.phase, WorkflowPhase::AdaptiveQuestionnaire);
    }

    let state = h.state().await;
    assert_eq!(state.questions_asked, 5);
    assert_eq!(state.collected_data.len(), 5);
    assert_eq!(state.collected_data["pain_level"], OutcomeValue::Integer(5));
    assert_eq!(
        state.collected_data["medication_adherence_issue"],
        OutcomeValue::Flag(false)
    );

    // Sixth turn: no completion signal, but the budget is spent.
    let sixth = h.say("that's it").await;
    assert_eq!(sixth.phase, WorkflowPhase::TrendMonitoring);
    assert_eq!(sixth.assistant_text, QUESTIONNAIRE_CLOSING);
    assert_eq!(h.responder.calls(TREND), 0);

    let done = h.say("thanks").await;
    assert_eq!(done.phase, WorkflowPhase::Completed);
    assert_eq!(h.controller.record_history(USER, None).await.unwrap()[0].data.len(), 5);
}

// ── Trend resilience ────────────────────────────────────────────────

#[tokio::test]
async fn trend_failure_still_completes_with_degraded_alert() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.reach_questionnaire().await;
    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 4 }), true)));
    h.responder
        .push(TREND, Err(ResponderError::MalformedOutput("not json".into())));

    let projection = h.say("pain is about four").await;
    assert_eq!(projection.phase, WorkflowPhase::Completed);
    assert_eq!(projection.outcome, Some(TurnOutcome::Fallback));

    let alerts = h.controller.alert_history(USER, None).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::None);
    assert_eq!(alerts[0].alert_type, "analysis_unavailable");
    assert_eq!(h.controller.record_history(USER, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn trend_sees_every_prior_record() {
    let h = Harness::new(CascadePolicy::Once).await;
    let earlier = Record::new(h.patient(), Default::default(), WorkflowPhase::AdaptiveQuestionnaire);
    h.store.append_record(&earlier).await.unwrap();

    h.reach_questionnaire().await;
    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 9 }), true)));
    h.say("nine").await;

    let records = h.controller.record_history(USER, None).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, earlier.id);
    assert_eq!(records[1].data["pain_level"], OutcomeValue::Integer(9));
}

// ── Validation ──────────────────────────────────────────────────────

#[tokio::test]
async fn missing_ids_are_rejected() {
    let h = Harness::new(CascadePolicy::Once).await;

    let err = h.controller.continue_turn(USER, "  ", "hi").await.unwrap_err();
    assert!(matches!(err, TurnError::Validation(ValidationError::MissingPatientId)));

    let err = h.controller.begin("", None).await.unwrap_err();
    assert!(matches!(err, TurnError::Validation(ValidationError::MissingUserId)));
}

#[tokio::test]
async fn raw_identifier_is_rejected() {
    let h = Harness::new(CascadePolicy::Once).await;
    let err = h.controller.begin(USER, Some(USER)).await.unwrap_err();
    assert!(matches!(err, TurnError::Validation(ValidationError::RawIdentifier)));

    let err = h
        .controller
        .begin(USER, Some("bob.smith@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::Validation(ValidationError::RawIdentifier)));
    assert_eq!(h.responder.calls(COMPANION), 0);
}

#[tokio::test]
async fn another_users_pseudonym_cannot_be_claimed() {
    let h = Harness::new(CascadePolicy::Once).await;
    let bob = pseudonymize("bob");

    let err = h
        .controller
        .begin("mallory", Some(bob.as_str()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TurnError::Validation(ValidationError::UnauthorizedPatientLink { .. })
    ));
    assert!(h.store.load(&bob).await.unwrap().is_none());

    let opening = h.controller.begin("bob", None).await.unwrap();
    assert_eq!(opening.patient_id, bob);
    assert_eq!(opening.phase, WorkflowPhase::Companion);

    // The owner may also name their own pseudonym explicitly.
    let again = h.controller.begin("bob", Some(bob.as_str())).await.unwrap();
    assert_eq!(again, opening);
}

#[tokio::test]
async fn other_users_cannot_touch_a_patient() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.begin().await;
    let before = h.state().await;

    let err = h
        .controller
        .continue_turn("mallory", h.patient().as_str(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TurnError::Validation(ValidationError::UnauthorizedPatientLink { .. })
    ));

    let err = h
        .controller
        .alert_history("mallory", Some(h.patient().as_str()))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::Validation(_)));

    let after = h.state().await;
    assert_eq!(after.version, before.version);
    assert_eq!(after.conversation_history, before.conversation_history);
    assert_eq!(h.responder.calls(COMPANION), 1);
}

#[tokio::test]
async fn continue_without_begin_is_not_found() {
    let h = Harness::new(CascadePolicy::Once).await;
    let err = h.try_say("hello").await.unwrap_err();
    assert!(matches!(
        err,
        TurnError::Persistence(DatabaseError::NotFound { .. })
    ));
}

// ── Persistence failures ────────────────────────────────────────────

#[tokio::test]
async fn failed_save_fails_turn_without_external_writes() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.reach_questionnaire().await;
    let before = h.state().await;

    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 1 }), true)));
    h.store.fail_save.store(true, Ordering::SeqCst);
    let err = h.try_say("all done").await.unwrap_err();
    assert!(matches!(err, TurnError::Persistence(_)));

    h.store.fail_save.store(false, Ordering::SeqCst);
    let after = h.state().await;
    assert_eq!(after.version, before.version);
    assert_eq!(after.phase, WorkflowPhase::AdaptiveQuestionnaire);
    assert!(h.controller.record_history(USER, None).await.unwrap().is_empty());
    assert!(h.controller.alert_history(USER, None).await.unwrap().is_empty());

    // Retrying the whole turn succeeds.
    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 1 }), true)));
    let projection = h.say("all done").await;
    assert_eq!(projection.phase, WorkflowPhase::Completed);
    assert_eq!(h.controller.record_history(USER, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn record_store_failure_aborts_trend_turn() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.reach_questionnaire().await;
    let before = h.state().await;

    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 7 }), true)));
    h.store.fail_list_records.store(true, Ordering::SeqCst);
    let err = h.try_say("done").await.unwrap_err();
    assert!(matches!(
        err,
        TurnError::Workflow(WorkflowError::Store {
            phase: WorkflowPhase::TrendMonitoring,
            ..
        })
    ));

    let after = h.state().await;
    assert_eq!(after.phase, WorkflowPhase::AdaptiveQuestionnaire);
    assert_eq!(after.version, before.version);
}

#[tokio::test]
async fn unflushed_writes_are_replayed_next_turn() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.reach_questionnaire().await;

    h.store.fail_appends.store(true, Ordering::SeqCst);
    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 5 }), true)));
    let projection = h.say("five").await;
    assert_eq!(projection.phase, WorkflowPhase::Completed);
    assert!(h.controller.record_history(USER, None).await.unwrap().is_empty());
    assert_eq!(h.state().await.outbox.len(), 2);

    // Still failing: the replay fails the turn.
    assert!(matches!(
        h.try_say("hello?").await.unwrap_err(),
        TurnError::Persistence(_)
    ));

    h.store.fail_appends.store(false, Ordering::SeqCst);
    h.say("thanks").await;
    assert!(h.state().await.outbox.is_empty());
    assert_eq!(h.controller.record_history(USER, None).await.unwrap().len(), 1);
    assert_eq!(h.controller.alert_history(USER, None).await.unwrap().len(), 1);

    h.say("bye").await;
    assert_eq!(h.controller.record_history(USER, None).await.unwrap().len(), 1);
    assert_eq!(h.controller.alert_history(USER, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn resuming_a_completed_check_in_writes_what_was_left_behind() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.reach_questionnaire().await;

    h.store.fail_appends.store(true, Ordering::SeqCst);
    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 6 }), true)));
    assert_eq!(h.say("six").await.phase, WorkflowPhase::Completed);
    let before = h.state().await;
    assert_eq!(before.outbox.len(), 2);

    h.store.fail_appends.store(false, Ordering::SeqCst);
    let resumed = h.begin().await;

    assert_eq!(resumed.phase, WorkflowPhase::Completed);
    let after = h.state().await;
    assert!(after.outbox.is_empty());
    assert_eq!(after.version, before.version + 1);
    assert_eq!(after.conversation_history, before.conversation_history);
    assert_eq!(h.controller.record_history(USER, None).await.unwrap().len(), 1);
    assert_eq!(h.controller.alert_history(USER, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn resume_with_failing_writes_is_an_error() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.reach_questionnaire().await;

    h.store.fail_appends.store(true, Ordering::SeqCst);
    h.responder
        .push(QUESTIONNAIRE, Ok(questionnaire_turn(json!({ "pain_level": 6 }), true)));
    h.say("six").await;

    let err = h.controller.begin(USER, None).await.unwrap_err();
    assert!(matches!(err, TurnError::Persistence(_)));
    assert_eq!(h.state().await.outbox.len(), 2);
}

// ── Concurrency ─────────────────────────────────────────────────────

/// Blocks its first call until released, then behaves like the default.
struct GatedResponder {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    gated: AtomicBool,
}

#[async_trait]
impl Responder for GatedResponder {
    async fn invoke(
        &self,
        _context: &ResponderContext,
        shape: &OutputShape,
    ) -> Result<Value, ResponderError> {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(default_reply(shape.name))
    }
}

#[tokio::test]
async fn concurrent_writers_from_two_processes_conflict() {
    let store = FlakyStore::new().await;
    let cfg = WorkflowConfig::default();
    let process_b = TurnController::from_store(store.clone(), ScriptedResponder::new(), &cfg);

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gated = Arc::new(GatedResponder {
        entered: entered.clone(),
        release: release.clone(),
        gated: AtomicBool::new(true),
    });
    let process_a = Arc::new(TurnController::from_store(store.clone(), gated, &cfg));

    let opening = process_b.begin(USER, None).await.unwrap();
    let patient = opening.patient_id.to_string();

    let slow_turn = {
        let process_a = process_a.clone();
        let patient = patient.clone();
        tokio::spawn(async move { process_a.continue_turn(USER, &patient, "from A").await })
    };

    entered.notified().await;
    process_b.continue_turn(USER, &patient, "from B").await.unwrap();
    release.notify_one();

    let err = slow_turn.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        TurnError::Persistence(DatabaseError::Conflict { .. })
    ));

    let state = store.load(&opening.patient_id).await.unwrap().unwrap();
    assert_eq!(user_entries(&state, "from B"), 1);
    assert_eq!(user_entries(&state, "from A"), 0);

    // The losing writer retries from a fresh load.
    process_a.continue_turn(USER, &patient, "from A").await.unwrap();
    let state = store.load(&opening.patient_id).await.unwrap().unwrap();
    assert_eq!(user_entries(&state, "from A"), 1);
    assert_eq!(state.version, 3);
}

#[tokio::test]
async fn concurrent_turns_in_one_process_are_serialized() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.begin().await;

    let patient = h.patient().to_string();
    let turns: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|text| {
            let controller = h.controller.clone();
            let patient = patient.clone();
            tokio::spawn(async move { controller.continue_turn(USER, &patient, text).await })
        })
        .collect();
    for turn in turns {
        turn.await.unwrap().unwrap();
    }

    let state = h.state().await;
    assert_eq!(state.version, 3);
    assert_eq!(user_entries(&state, "first"), 1);
    assert_eq!(user_entries(&state, "second"), 1);
    assert_eq!(state.conversation_history.len(), 5);
}

#[tokio::test]
async fn patients_do_not_share_state() {
    let h = Harness::new(CascadePolicy::Once).await;
    h.begin().await;
    let bob = h.controller.begin("bob", None).await.unwrap();

    assert_ne!(bob.patient_id, h.patient());
    h.say("only alice said this").await;

    let bob_state = h.store.load(&bob.patient_id).await.unwrap().unwrap();
    assert_eq!(bob_state.conversation_history.len(), 1);
    assert_eq!(bob_state.user_id, "bob");
}

//! Instructions, fixed texts and responder context builders for each phase.

use std::collections::BTreeMap;

use crate::responder::ResponderContext;
use crate::store::{Record, Severity};
use crate::workflow::state::{HistoryEntry, OutcomeValue, PatientState, SpeakerRole};

/// Default questionnaire, asked in order. Phrasing may be adapted per patient.
pub const CANONICAL_QUESTIONS: &[&str] = &[
    "How would you describe your overall pain level today on a scale of 0 to 10, where 0 is no pain and 10 is the worst pain imaginable?",
    "Have you experienced any changes in your energy levels recently? If so, what kind of changes?",
    "How has your condition affected your mood and daily activities over the past week?",
    "Are there any symptoms or concerns bothering you today, including any trouble taking your medication as prescribed?",
    "On a scale of 0 to 10, how well do you feel you are managing your condition today?",
];

pub const COMPANION_FALLBACK: &str =
    "I'm sorry, I'm having trouble connecting right now. Could you tell me a little more about how you're feeling?";

pub const CLARIFICATION_FALLBACK: &str =
    "I'm sorry, I didn't quite catch that. Could you please rephrase?";

pub const QUESTIONNAIRE_CLOSING: &str =
    "Thank you, that's all my questions for today. Let me take a moment to look over how you've been doing.";

pub const COMPANION_INSTRUCTIONS: &str = "\
You are a warm, supportive health companion checking in with a patient who lives \
with a chronic condition. Build rapport, acknowledge how they feel, and keep replies \
short (two or three sentences). Never give medical advice or a diagnosis.

Decide whether the patient is ready to answer a few structured questions about their \
health today. Set `transition_to_questionnaire` to true only when they have indicated \
they are willing. When true, also provide a one-sentence `intro_statement` that \
introduces the questions.

Reply in the patient's preferred language and adapt your wording to any \
accessibility needs listed.

Label the patient's current emotional state in one or two lowercase words \
(for example: neutral, anxious, tired, hopeful, frustrated).";

pub const QUESTIONNAIRE_INSTRUCTIONS: &str = "\
You are conducting a short patient-reported outcome check-in. If the patient answered \
the previous question, extract any outcome data from the answer into `extracted`, \
leaving fields you cannot determine as null. Pain and fatigue are integers from 0 to 10.

Then rephrase the next question so it fits the patient's emotional state and the flow \
of the conversation, without changing what it asks. Return it as `next_question`.

Set `is_complete` to true only if the patient has clearly already covered everything \
the remaining questions would ask, or has asked to stop.";

pub const TREND_INSTRUCTIONS: &str = "\
You review a patient's patient-reported outcome history for risk signals. Compare the \
latest snapshot with earlier records and look for worsening pain or fatigue, low mood, \
and medication adherence problems.

Classify the overall severity as one of none, low, medium, high or critical. Give a \
short snake_case `alert_type` naming the main signal (for example pain_increase, \
stable, adherence_issue) and a two or three sentence clinical `summary`.";

/// Closing message shown after the trend pass.
pub fn trend_closing(severity: Severity) -> String {
    match severity {
        Severity::High | Severity::Critical => "Thank you for checking in today. Some of what you shared \
             suggests things may be getting harder, so I've flagged it for your care team to review."
            .to_string(),
        _ => "Thank you for checking in today. Your responses have been recorded.".to_string(),
    }
}

pub fn format_history(entries: &[HistoryEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let speaker = match e.role {
                SpeakerRole::User => "Patient",
                SpeakerRole::Assistant => "Assistant",
            };
            format!("{speaker}: {}", e.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_data(data: &BTreeMap<String, OutcomeValue>) -> String {
    data.iter()
        .map(|(k, v)| format!("- {k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_needs(needs: &BTreeMap<String, String>) -> String {
    if needs.is_empty() {
        return "(none)".to_string();
    }
    needs
        .iter()
        .map(|(k, v)| format!("- {k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn companion_context(state: &PatientState, window: usize) -> ResponderContext {
    ResponderContext::new(COMPANION_INSTRUCTIONS)
        .with_section("Emotional state", state.emotional_state.as_str())
        .with_section("Language", state.language_preference.as_str())
        .with_section("Accessibility needs", format_needs(&state.accessibility_needs))
        .with_section("Recent conversation", format_history(state.recent_history(window)))
        .with_section(
            "Patient message",
            state.pending_user_input.as_deref().unwrap_or_default(),
        )
}

pub fn questionnaire_context(
    state: &PatientState,
    window: usize,
    answer: Option<&str>,
    next_question: Option<&str>,
) -> ResponderContext {
    let mut ctx = ResponderContext::new(QUESTIONNAIRE_INSTRUCTIONS)
        .with_section("Emotional state", state.emotional_state.as_str())
        .with_section("Language", state.language_preference.as_str())
        .with_section("Accessibility needs", format_needs(&state.accessibility_needs))
        .with_section("Recent conversation", format_history(state.recent_history(window)))
        .with_section("Collected so far", format_data(&state.collected_data));

    if let Some(intro) = &state.intro_statement {
        ctx = ctx.with_section("Introduction given", intro.as_str());
    }
    if let Some(answer) = answer {
        ctx = ctx
            .with_section(
                "Previous question",
                state.last_question.as_deref().unwrap_or_default(),
            )
            .with_section("Patient answer", answer);
    }
    match next_question {
        Some(q) => ctx.with_section("Next question", q),
        None => ctx.with_section(
            "Next question",
            "None. All questions have been asked; set is_complete to true.",
        ),
    }
}

pub fn trend_context(records: &[Record], snapshot: &BTreeMap<String, OutcomeValue>) -> ResponderContext {
    let history = records
        .iter()
        .map(|r| {
            let fields = r
                .data
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}: {fields}", r.collected_at.format("%Y-%m-%d %H:%M"))
        })
        .collect::<Vec<_>>()
        .join("\n");

    ResponderContext::new(TREND_INSTRUCTIONS)
        .with_section("Record history (oldest first)", history)
        .with_section("Latest snapshot", format_data(snapshot))
}

//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// How far a single turn may run past an explicit phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadePolicy {
    /// Dispatch only the phase the turn started in.
    Never,
    /// After an advance out of companion or questionnaire, dispatch the
    /// newly entered phase once more in the same turn.
    #[default]
    Once,
}

impl std::str::FromStr for CascadePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" | "none" => Ok(Self::Never),
            "once" => Ok(Self::Once),
            other => Err(format!("expected 'once' or 'never', got '{other}'")),
        }
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Questions asked before the questionnaire is forced to complete.
    pub max_questions: u32,
    /// Upper bound on a single responder call.
    pub responder_timeout: Duration,
    /// History entries shown to the companion.
    pub history_window: usize,
    /// History entries shown to the questionnaire.
    pub questionnaire_window: usize,
    pub cascade: CascadePolicy,
    /// An identical input repeated within this window of the previous one
    /// is treated as a retried request.
    pub replay_window: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_questions: 5,
            responder_timeout: Duration::from_secs(30),
            history_window: 5,
            questionnaire_window: 7,
            cascade: CascadePolicy::Once,
            replay_window: Duration::from_secs(10),
        }
    }
}

impl WorkflowConfig {
    /// Build from process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_questions = parse_or(&lookup, "PRO_CHECKIN_MAX_QUESTIONS", defaults.max_questions)?;
        if max_questions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PRO_CHECKIN_MAX_QUESTIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let timeout_secs = parse_or(
            &lookup,
            "PRO_CHECKIN_RESPONDER_TIMEOUT_SECS",
            defaults.responder_timeout.as_secs(),
        )?;

        Ok(Self {
            max_questions,
            responder_timeout: Duration::from_secs(timeout_secs.max(1)),
            history_window: parse_or(&lookup, "PRO_CHECKIN_HISTORY_WINDOW", defaults.history_window)?,
            questionnaire_window: parse_or(
                &lookup,
                "PRO_CHECKIN_QUESTIONNAIRE_WINDOW",
                defaults.questionnaire_window,
            )?,
            cascade: parse_or(&lookup, "PRO_CHECKIN_CASCADE", defaults.cascade)?,
            replay_window: Duration::from_secs(parse_or(
                &lookup,
                "PRO_CHECKIN_REPLAY_WINDOW_SECS",
                defaults.replay_window.as_secs(),
            )?),
        })
    }
}

/// Full application configuration for the binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub workflow: WorkflowConfig,
    pub db_path: PathBuf,
    pub llm: LlmConfig,
    /// Caller identity used by the REPL.
    pub user_id: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let workflow = WorkflowConfig::from_lookup(&lookup)?;

        let db_path = lookup("PRO_CHECKIN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/pro-checkin.db"));

        let backend = match lookup("PRO_CHECKIN_LLM_BACKEND").as_deref() {
            None | Some("anthropic") => LlmBackend::Anthropic,
            Some("openai") => LlmBackend::OpenAi,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "PRO_CHECKIN_LLM_BACKEND".to_string(),
                    message: format!("unknown backend '{other}'"),
                });
            }
        };

        let key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = lookup(key_var)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(key_var.to_string()))?;

        let model = lookup("PRO_CHECKIN_MODEL").unwrap_or_else(|| match backend {
            LlmBackend::Anthropic => "claude-sonnet-4-20250514".to_string(),
            LlmBackend::OpenAi => "gpt-4o".to_string(),
        });

        let user_id = lookup("PRO_CHECKIN_USER").unwrap_or_else(|| "local-user".to_string());

        Ok(Self {
            workflow,
            db_path,
            llm: LlmConfig {
                backend,
                api_key: SecretString::from(api_key),
                model,
            },
            user_id,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

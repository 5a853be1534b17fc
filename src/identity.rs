//! Pseudonymous patient identifiers and user links.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::workflow::PatientState;

/// Namespace for deriving patient pseudonyms from user ids.
const PSEUDONYM_NAMESPACE: Uuid = Uuid::from_u128(0x6d1c_4b3e_8f0a_4e57_9a21_5c7e_b2d4_f613);

const PSEUDONYM_PREFIX: &str = "synth_";

/// Opaque, pseudonymous patient identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(String);

impl PatientId {
    /// Accept a caller-supplied id. Blank ids are rejected.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingPatientId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_derived(&self) -> bool {
        self.0.starts_with(PSEUDONYM_PREFIX)
    }
}

impl std::fmt::Display for PatientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable pseudonym for a user id. Same input, same output, in every process.
pub fn pseudonymize(user_id: &str) -> PatientId {
    let id = Uuid::new_v5(&PSEUDONYM_NAMESPACE, user_id.as_bytes());
    PatientId(format!("{PSEUDONYM_PREFIX}{}", id.simple()))
}

/// Validate the caller's user id.
pub fn require_user(user_id: &str) -> Result<&str, ValidationError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingUserId);
    }
    Ok(trimmed)
}

/// Resolve the patient a turn addresses.
///
/// With no explicit id the user's own pseudonym is used. An explicit id
/// must itself be a pseudonym; raw identifiers such as the user id or an
/// email address are refused.
pub fn resolve_patient(user_id: &str, patient_id: Option<&str>) -> Result<PatientId, ValidationError> {
    let user_id = require_user(user_id)?;
    match patient_id {
        None => Ok(pseudonymize(user_id)),
        Some(raw) => {
            let id = PatientId::parse(raw)?;
            if id.as_str() == user_id || !id.is_derived() {
                return Err(ValidationError::RawIdentifier);
            }
            Ok(id)
        }
    }
}

/// Check that `user_id` may open a new check-in under `patient_id`.
///
/// A fresh state can only be created under the user's own pseudonym, so
/// nobody can claim another user's id before that user shows up.
pub fn authorize_new(patient_id: &PatientId, user_id: &str) -> Result<(), ValidationError> {
    if *patient_id != pseudonymize(user_id) {
        return Err(ValidationError::UnauthorizedPatientLink {
            patient_id: patient_id.to_string(),
        });
    }
    Ok(())
}

/// Check that `user_id` owns the loaded state.
pub fn authorize(state: &PatientState, user_id: &str) -> Result<(), ValidationError> {
    if state.user_id != user_id {
        return Err(ValidationError::UnauthorizedPatientLink {
            patient_id: state.patient_id.to_string(),
        });
    }
    Ok(())
}

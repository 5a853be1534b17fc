//! The structured-output collaborator used by every phase handler.
//!
//! A [`Responder`] receives a rendered context plus a declared
//! [`OutputShape`] and returns a JSON value. [`BoundedResponder`] wraps any
//! responder with a timeout, shape validation and typed decoding, so phase
//! handlers only ever see a decoded value or a [`ResponderError`].

mod llm;
pub mod shape;

pub use llm::LlmResponder;
pub use shape::{FieldKind, FieldSpec, OutputShape};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ResponderError;

/// Everything a responder is given for one call.
#[derive(Debug, Clone, Default)]
pub struct ResponderContext {
    pub instructions: String,
    pub sections: Vec<(String, String)>,
}

impl ResponderContext {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            sections: Vec::new(),
        }
    }

    pub fn with_section(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        self.sections.push((title.into(), body.into()));
        self
    }

    /// Body of a section by title, if present.
    pub fn section(&self, title: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(t, _)| t == title)
            .map(|(_, body)| body.as_str())
    }

    /// Flatten the sections into a single prompt body.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (title, body) in &self.sections {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str("## ");
            out.push_str(title);
            out.push('\n');
            out.push_str(if body.is_empty() { "(none)" } else { body });
        }
        out
    }
}

/// Produces a structured value for a declared shape.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn invoke(
        &self,
        context: &ResponderContext,
        shape: &OutputShape,
    ) -> Result<Value, ResponderError>;
}

/// A responder call with a deadline, shape checking and decoding.
#[derive(Clone)]
pub struct BoundedResponder {
    inner: Arc<dyn Responder>,
    timeout: Duration,
}

impl BoundedResponder {
    pub fn new(inner: Arc<dyn Responder>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Invoke, validate against `shape`, then decode into `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        context: &ResponderContext,
        shape: &OutputShape,
    ) -> Result<T, ResponderError> {
        let value = tokio::time::timeout(self.timeout, self.inner.invoke(context, shape))
            .await
            .map_err(|_| ResponderError::Timeout(self.timeout))??;

        shape.validate(&value).map_err(ResponderError::MalformedOutput)?;

        serde_json::from_value(value)
            .map_err(|e| ResponderError::MalformedOutput(format!("{}: {e}", shape.name)))
    }
}

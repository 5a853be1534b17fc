//! PRO check-in: a resumable, persisted, phase-based conversation core for
//! collecting patient-reported outcomes.

pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod llm;
pub mod responder;
pub mod store;
pub mod workflow;

pub use controller::{Projection, TurnController};

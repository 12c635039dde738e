//! Fixtures and fakes for testing optrun.
//!
//! - [`fixtures`] builds experiment specs, seeded stores and assignments.
//! - [`evaluator`] provides scripted [`optrun::TrialEvaluator`]s: recording,
//!   gated and failing.
//! - [`backend`] wraps a real backend to inject start failures or to
//!   observe how many runs it holds.

pub mod backend;
pub mod evaluator;
pub mod fixtures;

pub use backend::{FlakyBackend, ObservedBackend};
pub use evaluator::{EvaluationRecord, FailingEvaluator, GatedEvaluator, MockEvaluator};
pub use fixtures::*;

//! Experimentation — A/B experiment registry and deterministic variant
//! assignment.

pub mod engine;

pub use engine::{ExperimentEngine, SignificanceResult};

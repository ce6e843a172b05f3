//! Batch execution harness for parameterized simulations
//!
//! Given a base configuration and a sweep declaration, this crate enumerates
//! concrete task configurations, runs a caller-supplied simulation entry
//! point for each one (serially or on a bounded worker pool) and persists
//! every result under a stable task name. Individual task failures are
//! recorded and never abort the batch.
//!
//! Sweep strategies:
//! - `matrix`: Cartesian product of several value lists
//! - `sequence`: one explicit value list
//! - `sobol`: quasi-random samples of continuous ranges
//! - legacy `{entry, values}` single-axis shorthand
//!
//! # Example
//!
//! ```ignore
//! use simbatch::{Handler, simulation_fn};
//!
//! let handler = Handler::from_yaml("batch.yaml")?;
//! let sim = simulation_fn(|config, _output| {
//!     let sleep = config.get("sleep").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!     let mut payload = simbatch::Payload::new();
//!     payload.insert("sleep".into(), sleep.into());
//!     Ok(payload)
//! });
//! let results = handler.run_parallel(&sim, Some(4));
//! ```

#![warn(clippy::all)]

// ============================================================================
// Core modules
// ============================================================================

pub mod config;
pub mod error;
pub mod handler;
pub mod output;
pub mod space;
pub mod strategy;

// ============================================================================
// Ambient modules
// ============================================================================

pub mod logging;

// ============================================================================
// Test modules
// ============================================================================

#[cfg(test)]
mod tests;

// ============================================================================
// Public re-exports for convenience
// ============================================================================

pub use config::{Configuration, Payload};
pub use error::{
    BoxError, ConfigurationError, FailureKind, OutputError, PersistenceError, SimulationError,
    StateError,
};
pub use handler::{
    BatchSummary, Handler, HandlerConfig, Simulation, TaskFailure, TaskResult, simulation_fn,
};
pub use output::{
    ArtifactMetadata, Output, OutputFormat, OutputSettings, TaskOutput, TaskStatus,
};
pub use strategy::{Strategy, Task, TaskNaming, VariationSpec, convert_legacy};

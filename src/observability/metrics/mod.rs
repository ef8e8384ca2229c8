//! # Metrics Module
//!
//! Prometheus metrics for monitoring the operator, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup and registration
//! - `controller_metrics` - Engine metrics (passes, errors, requeues, phase transitions)
//! - `component_metrics` - Per-kind action metrics (child writes, trees, recovery restarts)

pub mod component_metrics;
pub mod controller_metrics;
pub mod registry;

pub use component_metrics::*;
pub use controller_metrics::*;
pub use registry::*;

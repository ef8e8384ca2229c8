//! # Observability
//!
//! Prometheus metrics exposed on the probe server.

pub mod metrics;

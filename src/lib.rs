//! Securesign Operator Library
//!
//! Reconciliation engine and component pipelines for the Securesign
//! operator. Tests live next to the code they cover.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;

// Re-export CRD types for convenience
pub use crd::*;

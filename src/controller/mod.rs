//! # Controller
//!
//! Reconciliation machinery for the Securesign components.
//!
//! - `action` - the action abstraction, pipelines and the generic actions
//! - `components` - one pipeline per managed kind
//! - `reconciler` - the engine that walks a pipeline once per event
//! - `client`, `events`, `tree` - seams to the cluster, the event sink and Trillian

pub mod action;
pub mod backoff;
pub mod client;
pub mod components;
pub mod events;
pub mod keys;
pub mod kubernetes;
pub mod reconciler;
pub mod server;
pub mod tree;

//! # Runtime Module
//!
//! Process bootstrap, one kube-runtime controller per managed kind, and the
//! error policy shared by all of them.

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;

pub use error_policy::*;
pub use initialization::*;
pub use watch_loop::*;

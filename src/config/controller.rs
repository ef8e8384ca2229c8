//! # Controller Configuration
//!
//! Reconciliation tunables loaded from environment variables.

use super::env_var_or_default;
use std::time::Duration;

/// Reconciliation tunables shared by every managed kind
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Error-recovery restart budget per resource
    pub allowed_restarts: u32,
    /// Deadline of a single reconciliation pass (seconds)
    pub reconcile_timeout_secs: u64,
    /// Deadline of a Trillian `CreateTree` call (seconds)
    pub tree_create_timeout_secs: u64,
    /// Delay before re-checking a dependency that is not ready (seconds)
    pub dependency_requeue_secs: u64,
    /// Resources of one kind reconciled concurrently
    pub reconcile_concurrency: u16,
    /// Restrict watches to one namespace; all namespaces when unset
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            allowed_restarts: DEFAULT_ALLOWED_RESTARTS,
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
            tree_create_timeout_secs: DEFAULT_TREE_CREATE_TIMEOUT_SECS,
            dependency_requeue_secs: DEFAULT_DEPENDENCY_REQUEUE_SECS,
            reconcile_concurrency: DEFAULT_RECONCILE_CONCURRENCY,
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            allowed_restarts: env_var_or_default("ALLOWED_RESTARTS", DEFAULT_ALLOWED_RESTARTS),
            reconcile_timeout_secs: env_var_or_default(
                "RECONCILE_TIMEOUT_SECS",
                DEFAULT_RECONCILE_TIMEOUT_SECS,
            ),
            tree_create_timeout_secs: env_var_or_default(
                "TREE_CREATE_TIMEOUT_SECS",
                DEFAULT_TREE_CREATE_TIMEOUT_SECS,
            ),
            dependency_requeue_secs: env_var_or_default(
                "DEPENDENCY_REQUEUE_SECS",
                DEFAULT_DEPENDENCY_REQUEUE_SECS,
            ),
            reconcile_concurrency: env_var_or_default(
                "RECONCILE_CONCURRENCY",
                DEFAULT_RECONCILE_CONCURRENCY,
            )
            .max(1),
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.trim().is_empty()),
        }
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn tree_create_timeout(&self) -> Duration {
        Duration::from_secs(self.tree_create_timeout_secs)
    }

    pub fn dependency_requeue(&self) -> Duration {
        Duration::from_secs(self.dependency_requeue_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.allowed_restarts, 3);
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(60));
        assert_eq!(config.tree_create_timeout(), Duration::from_secs(30));
        assert_eq!(config.dependency_requeue(), Duration::from_secs(10));
        assert!(config.watch_namespace.is_none());
    }
}

//! # Constants
//!
//! Shared names, ports, images and defaults used across the operator.

/// API group shared by all managed resources and by the labels the operator sets
pub const LABEL_NAMESPACE: &str = "rhtas.redhat.com";

/// Field manager / reporting component name
pub const OPERATOR_NAME: &str = "securesign-operator";

/// Annotation that pauses reconciliation of a single resource
pub const PAUSED_RECONCILIATION_ANNOTATION: &str = "rhtas.redhat.com/pausedReconciliation";

/// Condition type that carries the lifecycle phase
pub const READY: &str = "Ready";

/// Default restart budget of the error-recovery action
pub const DEFAULT_ALLOWED_RESTARTS: u32 = 3;

/// Default per-pass deadline (seconds)
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 60;

/// Default deadline for creating a Trillian tree (seconds)
pub const DEFAULT_TREE_CREATE_TIMEOUT_SECS: u64 = 30;

/// Default delay before re-checking a dependency that is not ready yet (seconds)
pub const DEFAULT_DEPENDENCY_REQUEUE_SECS: u64 = 10;

/// Default number of resources of one kind reconciled concurrently
pub const DEFAULT_RECONCILE_CONCURRENCY: u16 = 4;

/// Default HTTP port for metrics and probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default time to wait for the probe server to bind (seconds)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default probe server readiness poll interval (milliseconds)
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Minimum error-policy backoff (seconds)
pub const DEFAULT_ERROR_BACKOFF_MIN_SECS: u64 = 1;

/// Maximum error-policy backoff (seconds)
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// Server-side watch timeout (seconds); must stay below the client read timeout
pub const WATCH_TIMEOUT_SECS: u32 = 25;

// Trillian
pub const TRILLIAN_DB_NAME: &str = "trillian-db";
pub const TRILLIAN_LOGSERVER_NAME: &str = "trillian-logserver";
pub const TRILLIAN_LOGSIGNER_NAME: &str = "trillian-logsigner";
pub const TRILLIAN_GRPC_PORT: i32 = 8091;
pub const TRILLIAN_METRICS_PORT: i32 = 8090;
pub const TRILLIAN_DB_PORT: i32 = 3306;

// Images
pub const TRILLIAN_LOGSIGNER_IMAGE: &str = "ghcr.io/sigstore/trillian-logsigner:v1.6.1";
pub const TRILLIAN_LOGSERVER_IMAGE: &str = "ghcr.io/sigstore/trillian-logserver:v1.6.1";
pub const TRILLIAN_DB_IMAGE: &str = "ghcr.io/sigstore/trillian-db:v1.6.1";
pub const CTLOG_IMAGE: &str = "ghcr.io/sigstore/certificate-transparency-go:v1.3.1";
pub const REKOR_SERVER_IMAGE: &str = "ghcr.io/sigstore/rekor-server:v1.3.6";
pub const TUF_SERVER_IMAGE: &str = "ghcr.io/sigstore/tuf-server:v0.7.2";
pub const TUF_INIT_IMAGE: &str = "ghcr.io/sigstore/tuf-repo-init:v0.7.2";
pub const TSA_SERVER_IMAGE: &str = "ghcr.io/sigstore/timestamp-server:v1.2.2";

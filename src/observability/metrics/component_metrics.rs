//! # Component Metrics
//!
//! Metrics emitted by component actions.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::IntCounterVec;
use std::sync::LazyLock;

static CHILD_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "securesign_child_writes_total",
            "Child resources ensured, by outcome (created, updated, unchanged)",
        ),
        &["kind", "child", "outcome"],
    )
    .expect("Failed to create CHILD_WRITES_TOTAL metric - this should never happen")
});

static TREES_CREATED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "securesign_trillian_trees_created_total",
            "Total number of Trillian trees created",
        ),
        &["kind"],
    )
    .expect("Failed to create TREES_CREATED_TOTAL metric - this should never happen")
});

static RECOVERY_RESTARTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "securesign_recovery_restarts_total",
            "Total number of restarts performed by the error handler",
        ),
        &["kind"],
    )
    .expect("Failed to create RECOVERY_RESTARTS_TOTAL metric - this should never happen")
});

pub(crate) fn register_component_metrics() -> Result<()> {
    REGISTRY.register(Box::new(CHILD_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TREES_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECOVERY_RESTARTS_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_child_writes(kind: &str, child: &str, outcome: &str) {
    CHILD_WRITES_TOTAL
        .with_label_values(&[kind, child, outcome])
        .inc();
}

pub fn increment_trees_created(kind: &str) {
    TREES_CREATED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_recovery_restarts(kind: &str) {
    RECOVERY_RESTARTS_TOTAL.with_label_values(&[kind]).inc();
}

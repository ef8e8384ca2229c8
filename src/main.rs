//! # Securesign Operator
//!
//! A Kubernetes operator that converges the components of a Sigstore
//! signing and transparency-log stack (Trillian, CTlog, Rekor, TUF, timestamp authority) from
//! their custom resources.
//!
//! ## Overview
//!
//! 1. **Watching custom resources** - one controller per managed kind
//! 2. **Walking a pipeline** - one action per pass, status persisted once
//! 3. **Owning child objects** - Deployments, Services, Secrets, PVCs and Jobs
//! 4. **Recovering from failures** - bounded restarts back to `Pending`
//!
//! Metrics and probes are served on `METRICS_PORT`.

use anyhow::Result;
use securesign_operator::runtime::initialization::initialize;
use securesign_operator::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init_result = initialize().await?;

    run_watch_loop(init_result).await?;

    Ok(())
}

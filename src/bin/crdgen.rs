//! Print the CustomResourceDefinitions of every managed kind as one YAML stream
//!
//! `cargo run --bin crdgen > config/crd/securesign.yaml`

use kube::CustomResourceExt;
use securesign_operator::crd::{CTlog, Rekor, TimestampAuthority, Trillian, Tuf};

fn main() -> anyhow::Result<()> {
    let crds = [
        Trillian::crd(),
        CTlog::crd(),
        Rekor::crd(),
        Tuf::crd(),
        TimestampAuthority::crd(),
    ];
    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", documents.join("---\n"));
    Ok(())
}

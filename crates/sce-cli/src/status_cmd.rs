//! `sce status` command: show per-spec metadata and lifecycle status.

use std::path::Path;

use anyhow::Result;

use sce_store::MetadataStore;

pub async fn run(root: &Path) -> Result<()> {
    let store = MetadataStore::new(root);
    let all = store.list_all().await?;

    if all.is_empty() {
        println!("No specs found under {}", store.specs_dir().display());
        return Ok(());
    }

    println!(
        "{:<28} {:<8} {:<12} {:<12} {}",
        "SPEC", "TYPE", "STATUS", "LIFECYCLE", "DEPENDENCIES"
    );
    for (name, collab) in &all {
        let lifecycle = store.read_lifecycle(name).await?;
        let deps = collab
            .dependencies
            .iter()
            .map(|d| format!("{} ({})", d.spec, d.kind))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<28} {:<8} {:<12} {:<12} {}",
            name,
            collab.spec_type.to_string(),
            collab.status.current.to_string(),
            lifecycle.status.to_string(),
            deps
        );
    }

    Ok(())
}

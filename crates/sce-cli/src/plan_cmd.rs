//! `sce plan` command: print the computed batches for a set of specs.

use std::path::Path;

use anyhow::Result;

use sce_core::DependencyResolver;
use sce_store::MetadataStore;

pub async fn run(root: &Path, specs: Vec<String>) -> Result<()> {
    let store = MetadataStore::new(root);

    let specs = if specs.is_empty() {
        store
            .list_all()
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
    } else {
        specs
    };
    if specs.is_empty() {
        anyhow::bail!("no specs found under {}", store.specs_dir().display());
    }

    let resolver = DependencyResolver::new(store);
    let plan = resolver.plan(&specs).await?;

    if plan.has_cycle {
        let path = plan.cycle_path.unwrap_or_default();
        println!("Dependency cycle detected: {}", path.join(" -> "));
        std::process::exit(1);
    }

    println!("Execution plan for {} spec(s):", plan.specs.len());
    for (index, batch) in plan.batches.iter().enumerate() {
        println!("  batch {index}: {}", batch.join(", "));
    }

    let placed: usize = plan.batches.iter().map(Vec::len).sum();
    if placed < plan.specs.len() {
        println!(
            "  ({} spec(s) could not be placed; check their dependencies)",
            plan.specs.len() - placed
        );
    }

    Ok(())
}

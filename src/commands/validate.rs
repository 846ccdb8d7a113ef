use anyhow::Result;
use converge::{EdgeKind, NodeKind};
use std::collections::BTreeMap;
use std::path::Path;

use crate::Context;
use crate::document::load_dag;
use crate::ui;

pub fn run(ctx: &Context, graph: &Path) -> Result<()> {
    let registry = super::registry(ctx);
    let dag = load_dag(graph, &registry)?;

    let mut kinds: BTreeMap<NodeKind, usize> = BTreeMap::new();
    for node in dag.nodes() {
        *kinds.entry(node.kind).or_default() += 1;
    }
    let inferred = dag.edges().filter(|(_, _, kind)| *kind == EdgeKind::Inferred).count();

    ui::success(&format!(
        "{} is valid: {} nodes, {} edges",
        graph.display(),
        dag.len(),
        dag.edge_count()
    ));
    if ctx.quiet {
        return Ok(());
    }
    for (kind, count) in kinds {
        ui::kv(&kind.to_string(), &count.to_string());
    }
    ui::kv("inferred edges", &inferred.to_string());

    if ctx.verbose > 0 {
        for (before, after, kind) in dag.edges() {
            let kind = match kind {
                EdgeKind::Explicit => "explicit",
                EdgeKind::Inferred => "inferred",
            };
            ui::dim(&format!("{before} -> {after} ({kind})"));
        }
    }

    for node in dag.nodes() {
        if !registry.supports(node.kind, &node.resource_type) {
            ui::warn(&format!(
                "{}: no collaborator for {} '{}'",
                node.key, node.kind, node.resource_type
            ));
        }
    }
    Ok(())
}

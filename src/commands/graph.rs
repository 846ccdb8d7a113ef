use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use crate::Context;
use crate::document::load_dag;

pub fn run(ctx: &Context, graph: &Path, dot: bool) -> Result<()> {
    let registry = super::registry(ctx);
    let dag = load_dag(graph, &registry)?;

    if dot {
        print!("{}", dag.to_dot());
        return Ok(());
    }

    for (i, key) in dag.topological_order().iter().enumerate() {
        let Some(node) = dag.node(key.as_str()) else {
            continue;
        };
        let deps: Vec<&str> = dag.dependencies(key.as_str()).map(|k| k.as_str()).collect();
        let after = if deps.is_empty() {
            String::new()
        } else {
            format!("after {}", deps.join(", "))
        };
        println!(
            "{:>3}. {} {} {}",
            i + 1,
            key.as_str().bold(),
            format!("({})", node.resource_type).dimmed(),
            after.dimmed()
        );
    }
    Ok(())
}

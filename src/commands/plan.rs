use anyhow::{Context as AnyhowContext, Result};
use converge::{PlanOptions, plan, plan_destroy};
use ledger::StateStore;
use std::fs;

use crate::Context;
use crate::cli::PlanArgs;
use crate::document::load_dag;
use crate::{render, ui};

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let state = super::store(ctx).load().map_err(converge::Error::from)?;
    let options = PlanOptions::with_targets(args.targets);

    let plan = match (&args.graph, args.destroy) {
        (graph, true) => {
            if let Some(graph) = graph {
                log::debug!("Destroy plans read only state; ignoring {}", graph.display());
            }
            plan_destroy(&state, &options)?
        }
        (Some(graph), false) => {
            let registry = super::registry(ctx);
            let dag = load_dag(graph, &registry)?;
            plan(&dag, &state, &options)?
        }
        (None, false) => anyhow::bail!("a graph document is required unless --destroy is set"),
    };

    render::display_plan(&plan);

    if let Some(out) = args.out {
        let json = plan.to_json()?;
        fs::write(&out, json).with_context(|| format!("Could not write {}", out.display()))?;
        ui::info(&format!(
            "Saved plan to {}; run `terrace apply --plan {}` to execute it",
            out.display(),
            out.display()
        ));
    }
    Ok(())
}

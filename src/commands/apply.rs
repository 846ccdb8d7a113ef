use anyhow::{Context as AnyhowContext, Result};
use converge::{Plan, PlanOptions, plan};
use std::fs;

use super::RunOptions;
use crate::Context;
use crate::cli::ApplyArgs;
use crate::document::load_dag;

pub async fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let registry = super::registry(ctx);
    let store = super::store(ctx);

    let saved = match &args.plan {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
            Some(Plan::from_json(&json).with_context(|| format!("Invalid plan file {}", path.display()))?)
        }
        None => None,
    };
    let dag = match (&saved, &args.graph) {
        (None, Some(graph)) => Some(load_dag(graph, &registry)?),
        _ => None,
    };

    let mut session = super::open_session(&store)?;
    let plan = match (saved, dag) {
        (Some(saved), _) => saved,
        (None, Some(dag)) => plan(&dag, session.state(), &PlanOptions::with_targets(args.targets))?,
        (None, None) => anyhow::bail!("a graph document or --plan is required"),
    };

    let options = RunOptions {
        jobs: args.jobs,
        yes: args.yes,
        dry_run: args.dry_run,
    };
    let report = super::confirm_and_execute(ctx, &registry, &plan, &mut session, &options, "Apply these changes?").await?;
    super::check_report(report.as_ref())
}

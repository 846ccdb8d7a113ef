use anyhow::Result;
use converge::{PlanOptions, plan_destroy};

use super::RunOptions;
use crate::Context;
use crate::cli::DestroyArgs;
use crate::ui;

pub async fn run(ctx: &Context, args: DestroyArgs) -> Result<()> {
    let registry = super::registry(ctx);
    let store = super::store(ctx);
    let mut session = super::open_session(&store)?;

    if session.state().is_empty() {
        ui::info("Nothing recorded in state; nothing to destroy");
        return Ok(());
    }

    let plan = plan_destroy(session.state(), &PlanOptions::with_targets(args.targets))?;
    let options = RunOptions {
        jobs: args.jobs,
        yes: args.yes,
        dry_run: args.dry_run,
    };
    let report = super::confirm_and_execute(
        ctx,
        &registry,
        &plan,
        &mut session,
        &options,
        "Destroy these resources? This cannot be undone",
    )
    .await?;
    super::check_report(report.as_ref())
}

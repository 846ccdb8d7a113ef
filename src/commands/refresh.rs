use anyhow::Result;
use converge::Executor;

use crate::Context;
use crate::{render, ui};

pub async fn run(ctx: &Context) -> Result<()> {
    let registry = super::registry(ctx);
    let store = super::store(ctx);
    let mut session = super::open_session(&store)?;

    if session.state().is_empty() {
        ui::info("Nothing recorded in state");
        return Ok(());
    }

    let executor = Executor::new(&registry).with_options(ctx.settings.execute_options(None, false));
    let report = executor.refresh(&mut session).await?;
    render::print_refresh(&report);

    if !report.errors.is_empty() {
        anyhow::bail!("{} resources could not be read", report.errors.len());
    }
    Ok(())
}

//! Subcommand implementations

pub mod apply;
pub mod destroy;
pub mod graph;
pub mod plan;
pub mod refresh;
pub mod state;
pub mod validate;

use anyhow::{Context as AnyhowContext, Result};
use converge::{CollaboratorRegistry, ExecutionReport, Executor, Plan};
use ledger::{FileStore, Session};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::Context;
use crate::progress::RunProgress;
use crate::{collaborators, render, ui};

/// State store named by the settings
pub fn store(ctx: &Context) -> FileStore {
    FileStore::new(&ctx.settings.state_path)
}

pub fn registry(ctx: &Context) -> CollaboratorRegistry {
    collaborators::registry(&ctx.settings)
}

pub fn open_session<'a>(store: &'a FileStore) -> Result<Session<'a>> {
    Session::open(store).with_context(|| format!("Could not open state {}", store.path().display()))
}

/// Token cancelled on Ctrl-C
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ui::warn("Interrupted: letting running steps stop, starting nothing new");
            trigger.cancel();
        }
    });
    token
}

/// Options shared by apply and destroy
pub struct RunOptions {
    pub jobs: Option<usize>,
    pub yes: bool,
    pub dry_run: bool,
}

/// Show the plan, confirm, execute it, and print the outcome
///
/// Returns `None` when there was nothing to do or the user declined.
pub async fn confirm_and_execute(
    ctx: &Context,
    registry: &CollaboratorRegistry,
    plan: &Plan,
    session: &mut Session<'_>,
    options: &RunOptions,
    prompt: &str,
) -> Result<Option<ExecutionReport>> {
    if !ctx.quiet {
        render::display_plan(plan);
    }

    if !plan.has_changes() {
        if !plan.blocked.is_empty() {
            anyhow::bail!("{} nodes are blocked by unhealthy dependencies outside the targets", plan.blocked.len());
        }
        return Ok(None);
    }

    if !options.dry_run && !ui::confirm(prompt, options.yes)? {
        println!();
        println!("  Aborted");
        return Ok(None);
    }

    let progress = Arc::new(RunProgress::new(ctx.quiet));
    let executor = Executor::new(registry)
        .with_options(ctx.settings.execute_options(options.jobs, options.dry_run))
        .with_progress(progress.clone())
        .with_cancellation(interrupt_token());

    let report = executor.run(plan, session).await;
    progress.finish();
    let report = report?;

    if !ctx.quiet {
        render::print_report(&report);
    }
    Ok(Some(report))
}

/// Non-zero exit for anything but a clean run
pub fn check_report(report: Option<&ExecutionReport>) -> Result<()> {
    match report {
        Some(report) if !report.is_success() => {
            let summary = report.summary();
            anyhow::bail!(
                "run {}: {} failed, {} blocked, {} cancelled",
                report.status,
                summary.failed,
                summary.blocked,
                summary.cancelled
            )
        }
        _ => Ok(()),
    }
}

use anyhow::Result;
use colored::Colorize;
use ledger::{RecordStatus, StateStore};

use crate::Context;
use crate::cli::StateCommand;
use crate::ui;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    match cmd {
        StateCommand::List => list(ctx),
        StateCommand::Show { key } => show(ctx, &key),
        StateCommand::Rm { key } => edit(ctx, &key, "Forgot", |state, key| {
            state.remove(key).map(|_| ()).ok_or_else(|| ledger::Error::UnknownRecord(key.to_string()))
        }),
        StateCommand::Taint { key } => edit(ctx, &key, "Tainted", ledger::State::taint),
        StateCommand::Untaint { key } => edit(ctx, &key, "Untainted", ledger::State::untaint),
        StateCommand::Unlock => unlock(ctx),
    }
}

fn list(ctx: &Context) -> Result<()> {
    let store = super::store(ctx);
    let state = store.load()?;

    if state.is_empty() {
        ui::info(&format!("No records in {}", store.path().display()));
        return Ok(());
    }

    ui::header(&format!("State {} (serial {})", store.path().display(), state.serial));
    for record in state.iter() {
        let status = match record.status {
            RecordStatus::Healthy if record.drifted => "drifted".yellow(),
            RecordStatus::Healthy => "healthy".green(),
            RecordStatus::Tainted => "tainted".yellow(),
            RecordStatus::Failed => "failed".red(),
        };
        println!(
            "  {:<40} {:<28} {:<8} {}",
            ui::truncate(&record.key, 40),
            ui::truncate(&record.resource_type, 28),
            status,
            record.updated_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    Ok(())
}

fn show(ctx: &Context, key: &str) -> Result<()> {
    let state = super::store(ctx).load()?;
    let record = state
        .get(key)
        .ok_or_else(|| ledger::Error::UnknownRecord(key.to_string()))?;
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

fn edit(
    ctx: &Context,
    key: &str,
    done: &str,
    change: impl FnOnce(&mut ledger::State, &str) -> ledger::Result<()>,
) -> Result<()> {
    let store = super::store(ctx);
    let mut session = super::open_session(&store)?;
    session.update(|state| change(state, key))??;
    ui::success(&format!("{done} {key}"));
    Ok(())
}

fn unlock(ctx: &Context) -> Result<()> {
    let store = super::store(ctx);
    if store.force_unlock()? {
        ui::success(&format!("Removed {}", store.lock_path().display()));
    } else {
        ui::info("State is not locked");
    }
    Ok(())
}

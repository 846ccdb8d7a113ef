//! Plan and report display

use colored::{ColoredString, Colorize};
use converge::diff::{DiffSummary, group_by_type};
use converge::duration::format_duration;
use converge::{Action, ExecutionReport, Plan, PlanMode, RefreshReport, RunStatus, StepStatus};

use crate::ui;

fn symbol(action: Action) -> ColoredString {
    match action {
        Action::Create => "+".green(),
        Action::Update => "~".yellow(),
        Action::Destroy => "-".red(),
        Action::Wait(_) => "⏱".cyan(),
        Action::NoOp => " ".normal(),
    }
}

/// One line per changing step, grouped by resource type
pub fn display_plan(plan: &Plan) {
    let summary = plan.summary();
    if !summary.has_changes() && plan.blocked.is_empty() {
        println!();
        println!("  {} No changes. State matches the graph.", "✓".green());
        return;
    }

    let title = match plan.mode {
        PlanMode::Apply => "Execution Plan",
        PlanMode::Destroy => "Destroy Plan",
    };

    println!();
    println!("┌─ {} ─────────────────────────────────────────┐", title.bold());
    println!("│");

    for (resource_type, steps) in group_by_type(plan) {
        println!("│ {}", resource_type.bold());
        for step in steps {
            let detail = match step.action {
                Action::Wait(d) => format!("wait {} before continuing teardown", format_duration(d)),
                _ => step.reason.to_string(),
            };
            println!(
                "│   {} {:<40} {}",
                symbol(step.action),
                ui::truncate(step.key.as_str(), 40),
                detail.dimmed()
            );
        }
        println!("│");
    }

    if !plan.blocked.is_empty() {
        println!("│ {}", "Blocked".red().bold());
        for blocked in &plan.blocked {
            println!(
                "│   {} {:<40} {}",
                "!".red(),
                ui::truncate(blocked.key.as_str(), 40),
                format!("needs {} (not healthy and not targeted)", blocked.dependency).dimmed()
            );
        }
        println!("│");
    }

    println!("├─────────────────────────────────────────────────────┤");
    println!("│ {}", summary_line(&summary));
    println!("└─────────────────────────────────────────────────────┘");
}

pub fn summary_line(summary: &DiffSummary) -> String {
    let mut line = format!(
        "Plan: {} to add, {} to change, {} to destroy",
        summary.additions.to_string().green(),
        summary.modifications.to_string().yellow(),
        summary.removals.to_string().red()
    );
    if summary.waits > 0 {
        line.push_str(&format!(", {} timed waits", summary.waits));
    }
    if summary.blocked > 0 {
        line.push_str(&format!(", {} blocked", summary.blocked.to_string().red()));
    }
    line
}

/// Failed and blocked steps, then totals
pub fn print_report(report: &ExecutionReport) {
    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        println!();
        for step in &failures {
            let error = step.error.as_ref().map(ToString::to_string).unwrap_or_default();
            let mark = match step.status {
                StepStatus::Blocked => "○".yellow(),
                _ => "✗".red(),
            };
            println!("  {} {} {}: {}", mark, step.action, step.key, error.dimmed());
        }
    }

    let summary = report.summary();
    println!();
    match report.status {
        RunStatus::Succeeded => println!("  {} Run complete", "✓".green().bold()),
        RunStatus::Failed => println!("  {} Run finished with errors", "⚠".yellow().bold()),
        RunStatus::Cancelled => println!("  {} Run cancelled", "✗".red().bold()),
    }

    let lines = [
        (summary.created, "created"),
        (summary.updated, "updated"),
        (summary.destroyed, "destroyed"),
        (summary.waited, "timed waits elapsed"),
        (summary.skipped, "skipped (dry run)"),
        (summary.failed, "failed"),
        (summary.blocked, "blocked"),
        (summary.cancelled, "cancelled"),
    ];
    for (count, label) in lines {
        if count > 0 {
            println!("    • {count} {label}");
        }
    }
}

pub fn print_refresh(report: &RefreshReport) {
    for key in &report.drifted {
        println!("  {} {} {}", "~".yellow(), key, "changed outside terrace".dimmed());
    }
    for key in &report.vanished {
        println!("  {} {} {}", "-".red(), key, "no longer exists".dimmed());
    }
    for (key, error) in &report.errors {
        println!("  {} {} {}", "✗".red(), key, error.to_string().dimmed());
    }

    println!();
    if report.has_drift() {
        ui::warn(&format!(
            "{} drifted, {} vanished, {} unchanged; run `terrace apply` to converge",
            report.drifted.len(),
            report.vanished.len(),
            report.unchanged.len()
        ));
    } else {
        ui::success(&format!("No drift across {} resources", report.unchanged.len()));
    }
}

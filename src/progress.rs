//! Progress bar for plan execution

use colored::Colorize;
use converge::{CollaboratorError, NodeKey, PlanStep, ProgressCallback, StepReport, StepStatus};
use indicatif::{ProgressBar, ProgressStyle};

/// Reports step progress on an indicatif bar
pub struct RunProgress {
    bar: ProgressBar,
}

impl RunProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {elapsed_precise} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressCallback for RunProgress {
    fn on_run_start(&self, steps: usize) {
        self.bar.set_length(steps as u64);
        self.bar.set_position(0);
    }

    fn on_step_start(&self, step: &PlanStep) {
        self.bar.set_message(format!("{} {}", step.action, step.key));
    }

    fn on_step_retry(&self, key: &NodeKey, attempt: u32, max_attempts: u32, error: &CollaboratorError) {
        self.bar.println(format!(
            "  {} {} attempt {attempt}/{max_attempts} failed: {}",
            "↻".yellow(),
            key,
            error.to_string().dimmed()
        ));
    }

    fn on_step_complete(&self, report: &StepReport) {
        let mark = match report.status {
            StepStatus::Succeeded => "✓".green(),
            StepStatus::Skipped => "·".dimmed(),
            StepStatus::Blocked => "○".yellow(),
            StepStatus::Cancelled => "✗".dimmed(),
            _ => "✗".red(),
        };
        if report.action.is_change() || !report.status.is_success() {
            self.bar
                .println(format!("  {} {} {}", mark, report.action, report.key));
        }
        self.bar.inc(1);
    }
}

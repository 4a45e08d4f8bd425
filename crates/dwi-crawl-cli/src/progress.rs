use dwi_crawl_core::pipeline::{StageResult, SyncReport};
use dwi_crawl_core::{ProgressReporter, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Sync phases: spinner
/// - Stage runs: progress bar over the submitted commands
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICK_CHARS);
    pb.set_style(style);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

impl ProgressReporter for CliReporter {
    fn on_sync_start(&self, phase: &str) {
        self.set_bar(spinner(format!("Syncing {}...", phase)));
    }

    fn on_sync_complete(&self, phase: &str, report: &SyncReport) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m {}: {} inserted, {} updated, {} deleted, {} unchanged",
            phase, report.inserted, report.updated, report.deleted, report.unchanged
        );
    }

    fn on_stage_start(&self, stage: Stage, commands: usize) {
        let pb = ProgressBar::new(commands as u64);
        let style = ProgressStyle::with_template(
            "  {spinner:.cyan} {prefix} [{bar:30.cyan/dim}] {pos}/{len} commands ({elapsed})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICK_CHARS);
        pb.set_style(style);
        pb.set_prefix(stage.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_command_complete(&self, finished: usize, _total: usize) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                pb.set_position(finished as u64);
            }
        }
    }

    fn on_stage_complete(&self, stage: Stage, result: &StageResult) {
        self.finish_bar();
        let mark = if result.failed == 0 {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        eprintln!(
            "  {} {}: {} submitted, {} succeeded, {} failed, {} newly processed",
            mark, stage, result.submitted, result.succeeded, result.failed, result.newly_processed
        );
    }
}

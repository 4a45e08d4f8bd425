use crate::pipeline::{Stage, StageResult, SyncReport};

/// Trait for reporting crawl progress.
///
/// The CLI implements it with indicatif. All methods have default no-op
/// implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_sync_start(&self, _phase: &str) {}
    fn on_sync_complete(&self, _phase: &str, _report: &SyncReport) {}
    fn on_stage_start(&self, _stage: Stage, _commands: usize) {}
    fn on_command_complete(&self, _finished: usize, _total: usize) {}
    fn on_stage_complete(&self, _stage: Stage, _result: &StageResult) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

use rayon::prelude::*;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, warn};

use super::command::MaterializedCommand;
use crate::error::Error;
use crate::progress::ProgressReporter;

const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_BYTES: usize = 4096;

/// How one command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub tracker_id: i64,
    pub session: String,
    /// `None` when the process never started or was killed by a signal.
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
    /// Set when the shell could not be spawned at all.
    pub submit_error: Option<String>,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run every command through `sh -c` on a pool of `pool_size` workers and
/// wait for all of them. Submission failures are appended to `caselist`.
///
/// Only building the pool can fail, and that happens before any command runs.
pub fn run_commands(
    commands: &[MaterializedCommand],
    pool_size: usize,
    caselist: &Path,
    reporter: &dyn ProgressReporter,
) -> Result<Vec<CommandOutcome>, Error> {
    if commands.is_empty() {
        return Ok(Vec::new());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(pool_size.max(1))
        .thread_name(|idx| format!("dwi-crawl-worker-{}", idx))
        .build()?;

    let total = commands.len();
    let done = AtomicUsize::new(0);

    let outcomes: Vec<CommandOutcome> = pool.install(|| {
        commands
            .par_iter()
            .map(|command| {
                let outcome = execute(command);
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                reporter.on_command_complete(finished, total);
                outcome
            })
            .collect()
    });

    record_submit_errors(caselist, &outcomes);
    Ok(outcomes)
}

/// Append submission failures to the caselist. A caselist that cannot be
/// written is logged; the outcomes stand either way.
fn record_submit_errors(caselist: &Path, outcomes: &[CommandOutcome]) -> bool {
    let submit_errors: Vec<&CommandOutcome> = outcomes
        .iter()
        .filter(|outcome| outcome.submit_error.is_some())
        .collect();
    if submit_errors.is_empty() {
        return true;
    }
    match append_caselist(caselist, &submit_errors) {
        Ok(()) => true,
        Err(err) => {
            error!(
                "could not append {} submission errors to {}: {}",
                submit_errors.len(),
                caselist.display(),
                err
            );
            false
        }
    }
}

fn execute(command: &MaterializedCommand) -> CommandOutcome {
    debug!("[{}] {}: {}", command.stage, command.session, command.line);

    match Command::new("sh").arg("-c").arg(&command.line).output() {
        Ok(output) => {
            let exit_code = output.status.code();
            if !output.status.success() {
                warn!(
                    "[{}] {} exited with {:?}",
                    command.stage, command.session, exit_code
                );
            }
            CommandOutcome {
                tracker_id: command.tracker_id,
                session: command.session.clone(),
                exit_code,
                stderr_tail: stderr_tail(&output.stderr),
                submit_error: None,
            }
        }
        Err(err) => {
            error!(
                "[{}] failed to submit command for {}: {}",
                command.stage, command.session, err
            );
            CommandOutcome {
                tracker_id: command.tracker_id,
                session: command.session.clone(),
                exit_code: None,
                stderr_tail: Some(err.to_string()),
                submit_error: Some(err.to_string()),
            }
        }
    }
}

/// Last few lines of stderr, capped in size. `None` when stderr was empty.
pub fn stderr_tail(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.trim().is_empty() {
        return None;
    }

    if tail.len() <= STDERR_TAIL_BYTES {
        return Some(tail);
    }
    let mut cut = tail.len() - STDERR_TAIL_BYTES;
    while !tail.is_char_boundary(cut) {
        cut += 1;
    }
    Some(tail[cut..].to_string())
}

/// Append `{session}: {error}` lines to the error caselist.
fn append_caselist(path: &Path, failures: &[&CommandOutcome]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for failure in failures {
        if let Some(err) = &failure.submit_error {
            writeln!(file, "{}: {}", failure.session, err)?;
        }
    }
    Ok(())
}

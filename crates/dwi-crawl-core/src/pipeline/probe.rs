use std::path::Path;

use super::Stage;
use crate::storage::models::StageTarget;

/// Whether the stage's output for `target` exists right now.
///
/// Touches only the filesystem. A file still being written by a running
/// tool may read as missing; the next pass sees it.
pub fn probe(stage: Stage, target: &StageTarget) -> bool {
    output_exists(stage.output_path(target))
}

/// File probe for a tracker row already resolved to its output path.
pub fn output_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().is_file()
}

/// Directory probe used by the QQC sync.
pub fn dir_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().is_dir()
}

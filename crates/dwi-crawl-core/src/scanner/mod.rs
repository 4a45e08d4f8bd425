pub mod archives;
pub mod manifest;
pub mod scans;
pub mod sessions;

pub use archives::{parse_archive_name, sync_archives, ArchiveName};
pub use manifest::{read_manifest, sync_subjects, ManifestEntry};
pub use scans::{check_full_data, discover_dwi, parse_scan_name};
pub use sessions::{probe_qqc, sync_sessions};

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

use dwi_crawl_core::storage::models::{Direction, StageState};
use dwi_crawl_core::{AppConfig, CrawlEngine, SilentReporter, Stage};

const SESSION: &str = "ses-202301011";

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    engine: CrawlEngine,
}

impl Fixture {
    fn config(&self) -> &AppConfig {
        self.engine.config()
    }

    fn archive_dir(&self) -> PathBuf {
        self.root.join("phoenix/Pronet/AB/raw/AB12345/mri")
    }

    fn rawdata_dwi_dir(&self) -> PathBuf {
        self.root
            .join("mri/rawdata/sub-AB12345")
            .join(SESSION)
            .join("dwi")
    }

    fn output_dir(&self) -> PathBuf {
        self.root
            .join("mri/derivatives/dwipreproc/sub-AB12345")
            .join(SESSION)
    }

    fn write_output(&self, name: &str) {
        let path = self.output_dir().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"nifti").unwrap();
    }

    fn count(&self, table: &str) -> i64 {
        self.engine
            .open_database()
            .unwrap()
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    fn sync(&self) {
        self.engine.sync_sources(&SilentReporter).unwrap();
        self.engine.discover(&SilentReporter).unwrap();
    }
}

fn write_scans(dwi_dir: &Path, ap_runs: i64, pa_runs: i64) {
    fs::create_dir_all(dwi_dir).unwrap();
    for run in 1..=ap_runs {
        let name = format!("sub-AB12345_{}_acq-176_dir-AP_run-{}_dwi.nii.gz", SESSION, run);
        fs::write(dwi_dir.join(name), b"nifti").unwrap();
    }
    for run in 1..=pa_runs {
        let name = format!("sub-AB12345_{}_acq-126_dir-PA_run-{}_dwi.nii.gz", SESSION, run);
        fs::write(dwi_dir.join(name), b"nifti").unwrap();
    }
    // sidecars are not scans
    fs::write(
        dwi_dir.join(format!("sub-AB12345_{}_acq-176_dir-AP_run-1_dwi.json", SESSION)),
        b"{}",
    )
    .unwrap();
}

/// Subject AB12345 with one archive for 2023-01-01 and the given
/// number of AP and PA runs under rawdata.
///
///   tmp/
///     subjects.csv
///     phoenix/Pronet/AB/raw/AB12345/mri/AB12345_MR_2023_01_01_1.zip
///     mri/rawdata/sub-AB12345/ses-202301011/dwi/*.nii.gz
fn fixture(ap_runs: i64, pa_runs: i64) -> Fixture {
    let tmp = tempdir().unwrap();
    let root = tmp.path().to_path_buf();

    let manifest = root.join("subjects.csv");
    fs::write(&manifest, "subject,site,network\nAB12345,AB,Pronet\n").unwrap();

    let mut config = AppConfig::with_roots(root.join("mri"), root.join("phoenix"));
    config.manifest_path = manifest;
    config.error_caselist = root.join("error_caselist.txt");
    config.tools.unring = PathBuf::from("cp");
    config.tools.denoise = PathBuf::from("false");

    let db_path = root.join("dwi_crawl.db");
    let engine = CrawlEngine::new(config).with_db_path(db_path.to_str().unwrap());
    let fixture = Fixture {
        _tmp: tmp,
        root,
        engine,
    };

    fs::create_dir_all(fixture.archive_dir()).unwrap();
    fs::write(fixture.archive_dir().join("AB12345_MR_2023_01_01_1.zip"), b"PK").unwrap();
    write_scans(&fixture.rawdata_dwi_dir(), ap_runs, pa_runs);
    fixture
}

#[test]
fn test_discovery_builds_full_session() {
    let fx = fixture(2, 1);
    let summary = fx.engine.sync_sources(&SilentReporter).unwrap();
    let discovered = fx.engine.discover(&SilentReporter).unwrap();

    // subject, zip, session date, session num, qqc
    assert_eq!(summary.total().inserted, 5);
    // dwi row and three scans
    assert_eq!(discovered.inserted, 4);

    let db = fx.engine.open_database().unwrap();
    let contexts = db.list_qqc_contexts().unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(
        PathBuf::from(&contexts[0].qqc.rawdata_dir),
        fx.root.join("mri/rawdata/sub-AB12345").join(SESSION)
    );

    let dwi = db.find_dwi_by_qqc(contexts[0].qqc.id).unwrap().unwrap();
    assert!(dwi.full_data);
    assert!(!dwi.extra_data);
    assert_eq!(PathBuf::from(&dwi.output_dir), fx.output_dir());
    assert_eq!(db.list_scans(dwi.id, Direction::Ap).unwrap().len(), 2);
    assert_eq!(db.list_usable_scans(dwi.id).unwrap().len(), 3);
}

#[test]
fn test_partial_session_is_never_scheduled() {
    let fx = fixture(1, 1);
    fx.sync();

    for stage in Stage::ALL {
        let plan = fx.engine.plan(stage).unwrap();
        assert!(plan.commands.is_empty(), "{} should have nothing to run", stage);
    }
    assert_eq!(fx.count("dwi_ap"), 1);
    assert_eq!(fx.count("dwi_ap_unring"), 0);
}

#[test]
fn test_existing_output_marks_row_processed() {
    let fx = fixture(2, 1);
    fx.sync();
    fx.write_output("sub-AB12345_dwi_unring.nii.gz");

    let plan = fx.engine.plan(Stage::PaUnring).unwrap();
    assert_eq!(plan.sync.inserted, 1);
    assert_eq!(plan.processed, 1);
    assert!(plan.commands.is_empty());

    let ap = fx.engine.plan(Stage::ApUnring).unwrap();
    assert_eq!(ap.commands.len(), 2);
    assert!(ap.commands[0].line.contains("dir-AP_run-1_dwi.nii.gz"));
}

#[test]
fn test_repeated_passes_are_idempotent() {
    let fx = fixture(2, 1);
    fx.sync();
    fx.write_output("sub-AB12345_dwi_blip_unring1.nii.gz");
    for stage in Stage::ALL {
        fx.engine.plan(stage).unwrap();
    }

    let summary = fx.engine.sync_sources(&SilentReporter).unwrap();
    assert_eq!(summary.total().changes(), 0);
    assert_eq!(fx.engine.discover(&SilentReporter).unwrap().changes(), 0);
    for stage in Stage::ALL {
        let plan = fx.engine.plan(stage).unwrap();
        assert_eq!(plan.sync.changes(), 0, "{} changed on a second pass", stage);
    }
}

#[test]
fn test_probe_follows_output_both_ways() {
    let fx = fixture(2, 1);
    fx.sync();

    fx.write_output("hifi_b0.nii.gz");
    let plan = fx.engine.plan(Stage::Topup).unwrap();
    assert_eq!(plan.processed, 1);

    fs::remove_file(fx.output_dir().join("hifi_b0.nii.gz")).unwrap();
    let plan = fx.engine.plan(Stage::Topup).unwrap();
    assert_eq!(plan.sync.updated, 1);
    assert_eq!(plan.processed, 0);
    // unring and denoise outputs are still missing
    assert_eq!(plan.not_ready, 1);

    let db = fx.engine.open_database().unwrap();
    let rows = db.list_tracker_rows(Stage::Topup).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].processed);
}

#[test]
fn test_rows_outside_target_set_follow_output() {
    let fx = fixture(2, 1);
    fx.sync();
    fx.write_output("sub-AB12345_dwi_unring.nii.gz");
    let plan = fx.engine.plan(Stage::PaUnring).unwrap();
    assert_eq!(plan.processed, 1);

    // a third AP run drops the session out of full data
    let name = format!("sub-AB12345_{}_acq-176_dir-AP_run-3_dwi.nii.gz", SESSION);
    fs::write(fx.rawdata_dwi_dir().join(name), b"nifti").unwrap();
    fx.sync();

    fs::remove_file(fx.output_dir().join("sub-AB12345_dwi_unring.nii.gz")).unwrap();
    let plan = fx.engine.plan(Stage::PaUnring).unwrap();
    assert!(plan.commands.is_empty());
    assert_eq!(plan.sync.updated, 1);

    let db = fx.engine.open_database().unwrap();
    let rows = db.list_tracker_rows(Stage::PaUnring).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].processed);

    let plan = fx.engine.plan(Stage::PaUnring).unwrap();
    assert_eq!(plan.sync.changes(), 0);
}

#[test]
fn test_freewater_waits_for_mask() {
    let fx = fixture(2, 1);
    fx.sync();
    for name in [
        "sub-AB12345_dwi_blip_unring1.nii.gz",
        "sub-AB12345_dwi_blip_unring2.nii.gz",
        "sub-AB12345_dwi_unring.nii.gz",
        "sub-AB12345_dwi_blip_denoise1.nii.gz",
        "sub-AB12345_dwi_blip_denoise2.nii.gz",
        "sub-AB12345_dwi_denoise.nii.gz",
        "hifi_b0.nii.gz",
        "sub-AB12345_eddy_out.nii.gz",
    ] {
        fx.write_output(name);
    }
    for stage in &Stage::ALL[..7] {
        fx.engine.plan(*stage).unwrap();
    }

    let masking = fx.engine.plan(Stage::CnnMasking).unwrap();
    assert_eq!(masking.commands.len(), 1);
    let freewater = fx.engine.plan(Stage::Freewater).unwrap();
    assert_eq!(freewater.not_ready, 1);
    assert!(freewater.commands.is_empty());

    fx.write_output("mask_cnn.nii.gz");
    fx.engine.plan(Stage::CnnMasking).unwrap();
    let freewater = fx.engine.plan(Stage::Freewater).unwrap();
    assert_eq!(freewater.commands.len(), 1);
    assert!(freewater.commands[0].line.contains("mask_cnn.nii.gz"));

    let skeleton = fx.engine.plan(Stage::Skeletonization).unwrap();
    assert_eq!(skeleton.not_ready, 1);
}

#[test]
fn test_run_stage_records_outcomes() {
    let fx = fixture(2, 1);
    fx.sync();
    fs::create_dir_all(fx.output_dir()).unwrap();

    // `cp raw out` writes the unring output
    let unring = fx.engine.run_stage(Stage::ApUnring, &SilentReporter).unwrap();
    assert_eq!(unring.submitted, 2);
    assert_eq!(unring.succeeded, 2);
    assert_eq!(unring.newly_processed, 2);
    assert!(fx.output_dir().join("sub-AB12345_dwi_blip_unring2.nii.gz").is_file());

    // `false raw out` fails and leaves nothing behind
    let denoise = fx.engine.run_stage(Stage::ApDenoise, &SilentReporter).unwrap();
    assert_eq!(denoise.submitted, 2);
    assert_eq!(denoise.failed, 2);
    assert_eq!(denoise.newly_processed, 0);

    let db = fx.engine.open_database().unwrap();
    for row in db.list_tracker_rows(Stage::ApDenoise).unwrap() {
        assert_eq!(row.state(), StageState::Failed);
        assert_eq!(row.exit_code, Some(1));
        assert!(row.attempted_at.is_some());
        assert_eq!(row.claim_owner, None);
    }
    for row in db.list_tracker_rows(Stage::ApUnring).unwrap() {
        assert_eq!(row.state(), StageState::Processed);
        assert_eq!(row.exit_code, Some(0));
    }

    let status = fx.engine.status().unwrap();
    let denoise_status = status.iter().find(|s| s.stage == "ap-denoise").unwrap();
    assert_eq!(denoise_status.failed, 2);

    // a failed row is retried on the next run
    let retry = fx.engine.plan(Stage::ApDenoise).unwrap();
    assert_eq!(retry.commands.len(), 2);
    assert!(!fx.config().error_caselist.exists());
}

#[test]
fn test_live_claim_blocks_second_run() {
    let fx = fixture(2, 1);
    fx.sync();
    fx.engine.plan(Stage::PaUnring).unwrap();

    let db = fx.engine.open_database().unwrap();
    let rows = db.list_tracker_rows(Stage::PaUnring).unwrap();
    let row = &rows[0];
    let now = chrono::Utc::now().timestamp();
    assert!(db.try_claim(Stage::PaUnring, row.id, "other-host", now, 3600).unwrap());

    let plan = fx.engine.plan(Stage::PaUnring).unwrap();
    assert_eq!(plan.in_flight, 1);
    assert!(plan.commands.is_empty());

    let result = fx.engine.run_stage(Stage::PaUnring, &SilentReporter).unwrap();
    assert_eq!(result.submitted, 0);
    assert_eq!(fx.engine.release_stale().unwrap(), 0);
}

#[test]
fn test_removed_subject_cascades() {
    let fx = fixture(2, 1);
    fx.sync();
    fx.engine.plan(Stage::ApUnring).unwrap();
    assert_eq!(fx.count("dwi_ap_unring"), 2);

    fs::write(&fx.config().manifest_path, "subject,site,network\n").unwrap();
    let summary = fx.engine.sync_sources(&SilentReporter).unwrap();
    assert_eq!(summary.total().deleted, 1);

    for table in ["subject", "mri_zip", "session_date", "qqc", "dwi", "dwi_ap", "dwi_ap_unring"] {
        assert_eq!(fx.count(table), 0, "{} should be empty", table);
    }
}

#[test]
fn test_malformed_archives_create_no_sessions() {
    let fx = fixture(2, 1);
    fs::remove_file(fx.archive_dir().join("AB12345_MR_2023_01_01_1.zip")).unwrap();
    for name in [
        "AB12345_MR_2023_13_01_1.zip",
        "AB12345_scan.zip",
        "CD00001_MR_2023_01_01_1.zip",
    ] {
        fs::write(fx.archive_dir().join(name), b"PK").unwrap();
    }
    fs::write(fx.archive_dir().join("AB12345.Run_sheet_mri_1.csv"), b"x").unwrap();

    fx.sync();
    assert_eq!(fx.count("mri_zip"), 3);
    let wrong: i64 = fx
        .engine
        .open_database()
        .unwrap()
        .connection()
        .query_row("SELECT COUNT(*) FROM mri_zip WHERE wrong_format = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(wrong, 3);
    assert_eq!(fx.count("session_date"), 0);
    assert_eq!(fx.count("dwi"), 0);
}

#[test]
fn test_vanished_archive_is_flagged_then_restored() {
    let fx = fixture(2, 1);
    fx.sync();
    let archive = fx.archive_dir().join("AB12345_MR_2023_01_01_1.zip");

    fs::remove_file(&archive).unwrap();
    fx.engine.sync_sources(&SilentReporter).unwrap();
    let db = fx.engine.open_database().unwrap();
    let zips = db.list_mri_zips("AB12345").unwrap();
    assert_eq!(zips.len(), 1);
    assert!(zips[0].removed);
    assert_eq!(fx.count("session_date"), 1);

    fs::write(&archive, b"PK").unwrap();
    fx.engine.sync_sources(&SilentReporter).unwrap();
    let zips = db.list_mri_zips("AB12345").unwrap();
    assert!(!zips[0].removed);
}

#[test]
fn test_qqc_flags_follow_filesystem() {
    let fx = fixture(2, 1);
    fx.sync();
    let derivative_dir = fx
        .root
        .join("mri/derivatives/quick_qc/sub-AB12345")
        .join(SESSION);
    fs::create_dir_all(&derivative_dir).unwrap();
    fs::write(derivative_dir.join("qqc_summary.csv"), b"ok").unwrap();
    fs::write(fx.archive_dir().join("AB12345.AB.Run_sheet_mri_1.csv"), b"x").unwrap();

    let summary = fx.engine.sync_sources(&SilentReporter).unwrap();
    assert_eq!(summary.total().updated, 1);

    let db = fx.engine.open_database().unwrap();
    let contexts = db.list_qqc_contexts().unwrap();
    let qqc = &contexts[0].qqc;
    assert!(qqc.qqc_executed);
    assert!(qqc.qqc_completed);
    assert!(qqc.run_sheet_exists);
}

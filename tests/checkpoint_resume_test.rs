//! Crash/resume semantics of the durable checkpoints.

use verdex::checkpoint::{ProgressCheckpoint, TimingCheckpoint};
use verdex::core::types::{DownloadOutcome, JudgmentRecord, WorkerAssignment};

fn record(n: usize) -> JudgmentRecord {
    JudgmentRecord {
        row_number: n,
        case_title: format!("State v. Accused {n}"),
        judge: "Hon'ble Justice Example".to_string(),
        cnr: format!("DLHC0100{n:04}2023"),
        decision_date: "15-03-2023".to_string(),
        decision_year: Some(2023),
        trigger_id: format!("link_{n}"),
        filename: format!("State_v._Accused_{n}_CNR_DLHC0100{n:04}2023_link_{n}.pdf"),
    }
}

fn assignment() -> WorkerAssignment {
    WorkerAssignment {
        worker_id: 1,
        start_page: 10,
        end_page: Some(50),
        description: "test range".to_string(),
    }
}

#[test]
fn progress_survives_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("progress_w1.json");

    let mut cp = ProgressCheckpoint::load(&path);
    assert_eq!(cp.current_page, 1, "missing file starts fresh at page 1");

    let r1 = record(1);
    let r2 = record(2);
    cp.record_success(
        DownloadOutcome::success(&r1, tmp.path().join(&r1.filename), 3.2),
        12,
    );
    cp.record_failure(DownloadOutcome::failure(&r2, "http 403", 1.1));
    cp.mark_page_complete(12);
    cp.save(&path).unwrap();

    // simulated restart
    let reloaded = ProgressCheckpoint::load(&path);
    assert_eq!(reloaded.current_page, 12);
    assert_eq!(reloaded.total_files_downloaded, 1);
    assert_eq!(reloaded.downloaded_files.len(), 1);
    assert_eq!(reloaded.failed_downloads.len(), 1);
    assert!(reloaded.pages_completed.contains(&12));
    assert_eq!(reloaded.yearly_counts.get("2023"), Some(&1));
    assert!(reloaded.contains_filename(&r1.filename));
    assert!(!reloaded.contains_filename(&r2.filename));
}

#[test]
fn resume_page_respects_the_assigned_range() {
    let mut cp = ProgressCheckpoint::default();
    // fresh checkpoint sits behind the range → start at the range start
    assert_eq!(cp.resume_page(&assignment()), 10);

    cp.mark_page_complete(23);
    assert_eq!(cp.resume_page(&assignment()), 23);
}

#[test]
fn uploaded_flags_flip_after_a_verified_flush() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cp = ProgressCheckpoint::default();
    let r1 = record(1);
    let r2 = record(2);
    let mut o1 = DownloadOutcome::success(&r1, tmp.path().join(&r1.filename), 2.0);
    o1.storage_key = Some(format!("judgements/{}", r1.filename));
    cp.record_success(o1, 10);
    let mut o2 = DownloadOutcome::success(&r2, tmp.path().join(&r2.filename), 2.0);
    o2.storage_key = Some(format!("judgements/{}", r2.filename));
    cp.record_success(o2, 10);

    cp.mark_uploaded(&[r1.filename.clone()]);

    let f1 = cp
        .downloaded_files
        .iter()
        .find(|f| f.filename == r1.filename)
        .unwrap();
    let f2 = cp
        .downloaded_files
        .iter()
        .find(|f| f.filename == r2.filename)
        .unwrap();
    assert!(f1.uploaded);
    assert!(f1.local_path.is_none(), "uploaded file sheds its local path");
    // the durable record keeps the object key even after the local copy goes
    assert_eq!(
        f1.storage_key.as_deref(),
        Some(format!("judgements/{}", r1.filename).as_str())
    );
    assert!(!f2.uploaded);
}

#[test]
fn timing_checkpoint_accumulates_across_sessions() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("timing_w1.json");

    let mut timing = TimingCheckpoint::load(&path);
    let r1 = record(1);
    timing.record(&DownloadOutcome::success(
        &r1,
        tmp.path().join(&r1.filename),
        4.0,
    ));
    timing.record(&DownloadOutcome::failure(&record(2), "timeout", 30.0));
    timing.save(&path).unwrap();

    let mut reloaded = TimingCheckpoint::load(&path);
    assert_eq!(reloaded.total_files_processed, 2);
    assert_eq!(reloaded.total_successful_downloads, 1);
    assert_eq!(reloaded.total_failed_downloads, 1);
    // the failed attempt's 30s must not drag the success-only average
    assert_eq!(reloaded.average_time_per_file, 4.0);

    let r3 = record(3);
    reloaded.record(&DownloadOutcome::success(
        &r3,
        tmp.path().join(&r3.filename),
        2.0,
    ));
    assert_eq!(reloaded.total_files_processed, 3);
    assert_eq!(reloaded.average_time_per_file, 3.0);
    assert_eq!(reloaded.fastest_download.as_ref().unwrap().time, 2.0);
    assert_eq!(reloaded.slowest_download.as_ref().unwrap().time, 4.0);
}

#[test]
fn corrupt_checkpoint_starts_fresh_instead_of_crashing() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("progress_w1.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let cp = ProgressCheckpoint::load(&path);
    assert_eq!(cp.current_page, 1);
    assert!(cp.downloaded_files.is_empty());
}

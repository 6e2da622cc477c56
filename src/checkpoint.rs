//! Durable progress/timing checkpoints — the sole basis for resumption.
//!
//! Both files are rewritten wholesale on every mutation (write to a sibling
//! temp file, then rename) so a crash loses at most the one in-flight
//! download. Nothing else is trusted across restarts: the worker derives its
//! resume page, dedup set and counters exclusively from these two files.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::types::{DownloadOutcome, WorkerAssignment};

// ─────────────────────────────────────────────────────────────────────────────
// Progress
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    pub current_page: u64,
    pub total_files_downloaded: u64,
    pub start_time: Option<String>,
    pub downloaded_files: Vec<DownloadOutcome>,
    pub failed_downloads: Vec<DownloadOutcome>,
    pub pages_completed: Vec<u64>,
    /// Success counts keyed by decision year (stringly keyed for JSON parity
    /// with older checkpoint files).
    pub yearly_counts: BTreeMap<String, u64>,
    pub last_updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}

impl Default for ProgressCheckpoint {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_files_downloaded: 0,
            start_time: None,
            downloaded_files: Vec::new(),
            failed_downloads: Vec::new(),
            pages_completed: Vec::new(),
            yearly_counts: BTreeMap::new(),
            last_updated: None,
            completion_time: None,
        }
    }
}

impl ProgressCheckpoint {
    /// Load from `path`, or start empty when the file is missing/unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(cp) => cp,
                Err(e) => {
                    tracing::error!("progress checkpoint parse error at {}: {e} — starting fresh", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist synchronously. Temp-file + rename keeps the previous
    /// checkpoint intact if the process dies mid-write.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_updated = Some(Utc::now().to_rfc3339());
        write_json_atomic(path, self)
    }

    /// The page this worker should resume extraction at.
    ///
    /// A checkpoint behind the assigned range starts at `start_page`; one
    /// inside the range resumes where it left off.
    pub fn resume_page(&self, assignment: &WorkerAssignment) -> u64 {
        if self.current_page < assignment.start_page {
            assignment.start_page
        } else {
            self.current_page
        }
    }

    /// Whether `filename` was already downloaded in a previous run.
    pub fn contains_filename(&self, filename: &str) -> bool {
        self.downloaded_files.iter().any(|f| f.filename == filename)
    }

    /// Record one verified-or-pending successful download.
    ///
    /// Keeps the invariant `total_files_downloaded == downloaded_files.len()`.
    pub fn record_success(&mut self, outcome: DownloadOutcome, page: u64) {
        if let Some(year) = outcome.decision_year {
            *self.yearly_counts.entry(year.to_string()).or_insert(0) += 1;
        }
        self.downloaded_files.push(outcome);
        self.total_files_downloaded = self.downloaded_files.len() as u64;
        self.current_page = page;
    }

    pub fn record_failure(&mut self, outcome: DownloadOutcome) {
        self.failed_downloads.push(outcome);
    }

    pub fn mark_page_complete(&mut self, page: u64) {
        if !self.pages_completed.contains(&page) {
            self.pages_completed.push(page);
        }
        self.current_page = page;
    }

    /// Flip the `uploaded` flag for every outcome whose filename appears in
    /// `filenames` (called after a verified batch flush).
    pub fn mark_uploaded(&mut self, filenames: &[String]) {
        for outcome in &mut self.downloaded_files {
            if filenames.iter().any(|f| f == &outcome.filename) {
                outcome.uploaded = true;
                outcome.local_path = None;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTiming {
    pub filename: String,
    /// Title truncated to 50 chars — logs and checkpoints stay readable.
    pub case_title: String,
    pub download_time_seconds: f64,
    pub success: bool,
    pub timestamp: String,
    pub cnr: String,
    pub decision_year: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingRecord {
    pub filename: String,
    pub time: f64,
    pub case_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub worker_id: u32,
    pub session_start: Option<String>,
    pub session_end: Option<String>,
    pub total_files_processed: u64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub session_duration_seconds: f64,
    pub average_time_per_file: f64,
    pub pages_processed: u64,
    pub start_page: u64,
    pub end_page: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimingCheckpoint {
    pub session_start: Option<String>,
    pub session_end: Option<String>,
    pub total_files_processed: u64,
    pub total_successful_downloads: u64,
    pub total_failed_downloads: u64,
    pub total_time_seconds: f64,
    pub average_time_per_file: f64,
    pub individual_file_times: Vec<FileTiming>,
    pub session_statistics: Vec<SessionSummary>,
    pub fastest_download: Option<TimingRecord>,
    pub slowest_download: Option<TimingRecord>,
    pub last_updated: Option<String>,
}

impl TimingCheckpoint {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::error!("timing checkpoint parse error at {}: {e} — starting fresh", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_updated = Some(Utc::now().to_rfc3339());
        write_json_atomic(path, self)
    }

    /// Fold one download attempt into the running statistics.
    ///
    /// The average covers successful downloads only; fastest/slowest track
    /// successes as well. Failure attempts still bump the processed counter.
    pub fn record(&mut self, outcome: &DownloadOutcome) {
        let title_prefix: String = outcome.case_title.chars().take(50).collect();
        self.individual_file_times.push(FileTiming {
            filename: outcome.filename.clone(),
            case_title: title_prefix.clone(),
            download_time_seconds: round2(outcome.duration_secs),
            success: outcome.success,
            timestamp: Utc::now().to_rfc3339(),
            cnr: outcome.cnr.clone(),
            decision_year: outcome.decision_year,
        });

        self.total_files_processed += 1;
        if outcome.success {
            self.total_successful_downloads += 1;

            let secs = round2(outcome.duration_secs);
            let beats_fastest = self
                .fastest_download
                .as_ref()
                .map(|r| secs < r.time)
                .unwrap_or(true);
            if beats_fastest {
                self.fastest_download = Some(TimingRecord {
                    filename: outcome.filename.clone(),
                    time: secs,
                    case_title: title_prefix.clone(),
                });
            }
            let beats_slowest = self
                .slowest_download
                .as_ref()
                .map(|r| secs > r.time)
                .unwrap_or(true);
            if beats_slowest {
                self.slowest_download = Some(TimingRecord {
                    filename: outcome.filename.clone(),
                    time: secs,
                    case_title: title_prefix,
                });
            }
        } else {
            self.total_failed_downloads += 1;
        }

        let successes: Vec<f64> = self
            .individual_file_times
            .iter()
            .filter(|t| t.success)
            .map(|t| t.download_time_seconds)
            .collect();
        if !successes.is_empty() {
            self.average_time_per_file =
                round2(successes.iter().sum::<f64>() / successes.len() as f64);
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::JudgmentRecord;
    use chrono::Utc;

    fn record(filename: &str) -> JudgmentRecord {
        JudgmentRecord {
            row_number: 1,
            case_title: "State vs Example".to_string(),
            judge: "Hon. Judge".to_string(),
            cnr: "ABCD010123452021".to_string(),
            decision_date: "17-03-2021".to_string(),
            decision_year: Some(2021),
            trigger_id: "link_1".to_string(),
            filename: filename.to_string(),
        }
    }

    fn success_outcome(filename: &str, secs: f64) -> DownloadOutcome {
        DownloadOutcome {
            success: true,
            filename: filename.to_string(),
            case_title: "State vs Example".to_string(),
            cnr: "ABCD010123452021".to_string(),
            decision_date: "17-03-2021".to_string(),
            decision_year: Some(2021),
            local_path: None,
            storage_key: Some(format!("judgements/{filename}")),
            uploaded: false,
            downloaded_at: Utc::now(),
            duration_secs: secs,
            error: None,
        }
    }

    /// `total_files_downloaded` must always equal the succeeded-list length.
    #[test]
    fn test_success_count_matches_list_length() {
        let mut cp = ProgressCheckpoint::default();
        cp.record_success(success_outcome("a.pdf", 1.0), 5);
        cp.record_success(success_outcome("b.pdf", 2.0), 5);
        cp.record_failure(DownloadOutcome::failure(&record("c.pdf"), "http 403", 0.4));
        assert_eq!(cp.total_files_downloaded, 2);
        assert_eq!(cp.downloaded_files.len() as u64, cp.total_files_downloaded);
        assert_eq!(cp.failed_downloads.len(), 1);
        assert_eq!(cp.yearly_counts.get("2021"), Some(&2));
    }

    /// Resuming with a checkpoint behind the assignment snaps to start_page;
    /// one inside the range resumes in place.
    #[test]
    fn test_resume_page_respects_assignment() {
        let assignment = WorkerAssignment {
            worker_id: 3,
            start_page: 100,
            end_page: Some(200),
            description: String::new(),
        };
        let mut cp = ProgressCheckpoint::default();
        assert_eq!(cp.resume_page(&assignment), 100);
        cp.current_page = 150;
        assert_eq!(cp.resume_page(&assignment), 150);
    }

    #[test]
    fn test_contains_filename_dedups_resume() {
        let mut cp = ProgressCheckpoint::default();
        cp.record_success(success_outcome("dup.pdf", 1.0), 2);
        assert!(cp.contains_filename("dup.pdf"));
        assert!(!cp.contains_filename("new.pdf"));
    }

    #[test]
    fn test_mark_page_complete_is_idempotent() {
        let mut cp = ProgressCheckpoint::default();
        cp.mark_page_complete(100);
        cp.mark_page_complete(100);
        cp.mark_page_complete(101);
        assert_eq!(cp.pages_completed, vec![100, 101]);
        assert_eq!(cp.current_page, 101);
    }

    #[test]
    fn test_timing_running_average_counts_successes_only() {
        let mut t = TimingCheckpoint::default();
        t.record(&success_outcome("a.pdf", 2.0));
        t.record(&success_outcome("b.pdf", 4.0));
        t.record(&DownloadOutcome::failure(&record("c.pdf"), "timeout", 60.0));
        assert_eq!(t.total_files_processed, 3);
        assert_eq!(t.total_successful_downloads, 2);
        assert_eq!(t.total_failed_downloads, 1);
        assert!((t.average_time_per_file - 3.0).abs() < f64::EPSILON);
        assert_eq!(t.fastest_download.as_ref().unwrap().filename, "a.pdf");
        assert_eq!(t.slowest_download.as_ref().unwrap().filename, "b.pdf");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let mut cp = ProgressCheckpoint::default();
        cp.record_success(success_outcome("a.pdf", 1.2), 100);
        cp.mark_page_complete(100);
        cp.save(&path).unwrap();

        let loaded = ProgressCheckpoint::load(&path);
        assert_eq!(loaded.current_page, 100);
        assert_eq!(loaded.total_files_downloaded, 1);
        assert!(loaded.contains_filename("a.pdf"));
        assert!(loaded.last_updated.is_some());
    }
}

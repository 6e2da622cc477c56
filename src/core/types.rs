use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One extracted result-table row.
///
/// Created during page extraction, read-only afterwards, and discarded once
/// its batch has been flushed — only the derived [`DownloadOutcome`] survives
/// in the progress checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentRecord {
    /// 1-based position within the page, for log context only.
    pub row_number: usize,
    pub case_title: String,
    pub judge: String,
    /// Case Number Record. Empty string when the row carries none.
    pub cnr: String,
    /// Raw decision-date substring as shown on the portal (e.g. `17-03-2021`).
    pub decision_date: String,
    /// Year parsed from the trailing 4 digits of `decision_date`, when digits.
    pub decision_year: Option<i32>,
    /// DOM id of the button that opens the PDF viewer modal for this row.
    pub trigger_id: String,
    /// Sanitized, collision-free local filename (always `.pdf`).
    pub filename: String,
}

/// Result of attempting to materialize one record's PDF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub success: bool,
    pub filename: String,
    pub case_title: String,
    pub cnr: String,
    #[serde(default)]
    pub decision_date: String,
    pub decision_year: Option<i32>,
    /// Local staging path while the file awaits batch upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Object-storage key the file is (or will be) uploaded under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    /// Set to `true` only after the upload has been existence-verified.
    pub uploaded: bool,
    pub downloaded_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Human-readable classification on failure (`http 403`, `not a pdf`, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadOutcome {
    pub fn success(record: &JudgmentRecord, local_path: PathBuf, duration_secs: f64) -> Self {
        Self {
            success: true,
            filename: record.filename.clone(),
            case_title: record.case_title.clone(),
            cnr: record.cnr.clone(),
            decision_date: record.decision_date.clone(),
            decision_year: record.decision_year,
            local_path: Some(local_path),
            storage_key: None,
            uploaded: false,
            downloaded_at: Utc::now(),
            duration_secs,
            error: None,
        }
    }

    pub fn failure(record: &JudgmentRecord, error: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            success: false,
            filename: record.filename.clone(),
            case_title: record.case_title.clone(),
            cnr: record.cnr.clone(),
            decision_date: record.decision_date.clone(),
            decision_year: record.decision_year,
            local_path: None,
            storage_key: None,
            uploaded: false,
            downloaded_at: Utc::now(),
            duration_secs,
            error: Some(error.into()),
        }
    }
}

/// A downloaded file staged on local disk, waiting for its batch flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFile {
    pub filename: String,
    pub local_path: PathBuf,
    pub storage_key: String,
}

/// Immutable per-worker page-range assignment, read once at startup from the
/// shared assignment config. Never mutated by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub worker_id: u32,
    pub start_page: u64,
    /// `None` means unbounded — run until the portal has no further pages.
    #[serde(default)]
    pub end_page: Option<u64>,
    #[serde(default)]
    pub description: String,
}

impl WorkerAssignment {
    /// Whether `page` lies beyond this worker's assigned ceiling.
    pub fn past_end(&self, page: u64) -> bool {
        matches!(self.end_page, Some(end) if page > end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_past_end_bounded_and_unbounded() {
        let bounded = WorkerAssignment {
            worker_id: 7,
            start_page: 100,
            end_page: Some(102),
            description: String::new(),
        };
        assert!(!bounded.past_end(102));
        assert!(bounded.past_end(103));

        let unbounded = WorkerAssignment {
            worker_id: 7,
            start_page: 1,
            end_page: None,
            description: String::new(),
        };
        assert!(!unbounded.past_end(u64::MAX));
    }
}

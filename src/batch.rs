//! Batched uploads from the local staging directory.
//!
//! Downloads accumulate on disk and are flushed to object storage in fixed
//! size batches. Disk, not memory, is the buffer: files that were staged but
//! never flushed (crash, kill -9) are rediscovered and re-staged on the next
//! startup, giving at-least-once upload semantics. Files whose upload cannot
//! be completed or verified are moved to a quarantine directory and never
//! deleted.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::types::StagedFile;
use crate::storage::ObjectStore;

const QUARANTINE_DIR: &str = "failed_uploads";

/// What a flush did with each file in the batch. Every file ends up in
/// exactly one of the two lists.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub uploaded: Vec<StagedFile>,
    pub quarantined: Vec<StagedFile>,
}

pub struct BatchUploader {
    store: Arc<dyn ObjectStore>,
    staging_dir: PathBuf,
    key_prefix: String,
    capacity: usize,
    pending: Vec<StagedFile>,
}

impl BatchUploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        staging_dir: PathBuf,
        key_prefix: String,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            staging_dir,
            key_prefix,
            capacity: capacity.max(1),
            pending: Vec::new(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn storage_key(&self, filename: &str) -> String {
        format!("{}{filename}", self.key_prefix)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Stage a downloaded file for the next flush. Returns `true` when the
    /// batch has reached capacity and must be flushed.
    pub fn push(&mut self, filename: &str, local_path: PathBuf) -> bool {
        self.pending.push(StagedFile {
            filename: filename.to_string(),
            local_path,
            storage_key: self.storage_key(filename),
        });
        self.pending.len() >= self.capacity
    }

    /// Re-stage leftover PDFs from a previous run that downloaded files but
    /// never flushed them. Called once at startup, before any new downloads.
    pub fn rediscover(&mut self) -> Result<usize> {
        if !self.staging_dir.exists() {
            return Ok(0);
        }
        let mut found = 0;
        for entry in std::fs::read_dir(&self.staging_dir).context("reading staging dir")? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.to_ascii_lowercase().ends_with(".pdf") {
                continue;
            }
            self.pending.push(StagedFile {
                filename: name.to_string(),
                local_path: path.clone(),
                storage_key: self.storage_key(name),
            });
            found += 1;
        }
        if found > 0 {
            info!(found, "re-staged leftover files from a previous run");
        }
        Ok(found)
    }

    /// Upload everything pending and verify each object landed.
    ///
    /// Per-file outcomes are independent: one failure quarantines that file
    /// and the rest of the batch proceeds. The local copy is deleted only
    /// after the object's existence has been confirmed.
    pub async fn flush(&mut self) -> FlushReport {
        let batch = std::mem::take(&mut self.pending);
        if batch.is_empty() {
            return FlushReport::default();
        }
        info!(files = batch.len(), "flushing upload batch");

        let mut report = FlushReport::default();
        for staged in batch {
            match self.upload_and_verify(&staged).await {
                Ok(()) => {
                    if let Err(e) = std::fs::remove_file(&staged.local_path) {
                        warn!(
                            file = %staged.filename,
                            "uploaded but local delete failed: {e}"
                        );
                    }
                    report.uploaded.push(staged);
                }
                Err(e) => {
                    warn!(file = %staged.filename, "upload failed, quarantining: {e:#}");
                    self.quarantine(&staged);
                    report.quarantined.push(staged);
                }
            }
        }
        info!(
            uploaded = report.uploaded.len(),
            quarantined = report.quarantined.len(),
            "batch flush complete"
        );
        report
    }

    async fn upload_and_verify(&self, staged: &StagedFile) -> Result<()> {
        let body = std::fs::read(&staged.local_path)
            .with_context(|| format!("reading {}", staged.local_path.display()))?;
        self.store
            .put(&staged.storage_key, body, "application/pdf")
            .await?;
        // put() returning Ok is not proof the object exists; verify.
        if !self.store.exists(&staged.storage_key).await? {
            anyhow::bail!("object missing after upload: {}", staged.storage_key);
        }
        Ok(())
    }

    /// Move a file whose upload failed into the quarantine directory so it
    /// survives for manual retry. If even the move fails the file stays put
    /// in staging, which is equally safe.
    fn quarantine(&self, staged: &StagedFile) {
        let dir = self.staging_dir.join(QUARANTINE_DIR);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("could not create quarantine dir: {e}");
            return;
        }
        let dest = dir.join(&staged.filename);
        if let Err(e) = std::fs::rename(&staged.local_path, &dest) {
            warn!(
                file = %staged.filename,
                "could not move to quarantine (leaving in staging): {e}"
            );
        }
    }

    /// Remove the staging directory if nothing is left in it. Quarantined
    /// files keep the directory alive deliberately.
    pub fn cleanup(&self) {
        let Ok(mut entries) = std::fs::read_dir(&self.staging_dir) else {
            return;
        };
        if entries.next().is_none() {
            if let Err(e) = std::fs::remove_dir(&self.staging_dir) {
                warn!("could not remove empty staging dir: {e}");
            }
        }
    }
}

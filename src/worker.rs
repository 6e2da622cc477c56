//! The per-worker scraping loop.
//!
//! One `Worker` owns one browser session, one page range, one pair of
//! checkpoint files and one staging directory. The loop is built to survive
//! the portal, not to trust it: every outcome is checkpointed before the
//! next row starts, and any session fault escalates through the recovery
//! ladder instead of crashing the run.

use anyhow::Context;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::batch::BatchUploader;
use crate::browser::{SessionManager, WorkerSession};
use crate::captcha::CaptchaSolver;
use crate::checkpoint::{ProgressCheckpoint, SessionSummary, TimingCheckpoint};
use crate::core::config::Settings;
use crate::core::types::WorkerAssignment;
use crate::core::{Selectors, WorkerError};
use crate::download::PdfDownloader;
use crate::extract::Extractor;
use crate::notify::{EventKind, Notifier};
use crate::pagination::{PageSeek, Paginator};
use crate::recovery::RecoveryState;
use crate::storage::ObjectStore;

/// Full teardown-and-rebuild rounds before the worker gives up on a page.
const MAX_RECOVERY_ROUNDS: u32 = 3;

/// What processing one page concluded.
enum PageStep {
    /// Page done, advance to the next one.
    Advanced { next: u64 },
    /// Result set or assigned range exhausted; the run is complete.
    Finished,
    /// A full batch was flushed mid-page; refresh the session before
    /// reprocessing the page (dedup skips the rows already taken).
    MidPageRefresh,
    /// The shutdown flag was raised between rows.
    ShutdownRequested,
}

pub struct Worker {
    worker_id: u32,
    assignment: WorkerAssignment,
    mgr: SessionManager,
    solver: CaptchaSolver,
    paginator: Paginator,
    extractor: Extractor,
    downloader: PdfDownloader,
    uploader: BatchUploader,
    notifier: Notifier,
    selectors: Selectors,
    progress: ProgressCheckpoint,
    timing: TimingCheckpoint,
    progress_path: PathBuf,
    timing_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    // per-session statistics for the final summary
    session_started: chrono::DateTime<Utc>,
    session_success: u64,
    session_failed: u64,
    pages_processed: u64,
}

impl Worker {
    pub fn new(
        worker_id: u32,
        settings: &Settings,
        assignment: WorkerAssignment,
        store: Arc<dyn ObjectStore>,
        shutdown: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let selectors = Selectors::default();
        let data_dir = settings.resolve_data_dir();
        std::fs::create_dir_all(&data_dir).context("creating data dir")?;

        let progress_path = data_dir.join(format!("progress_w{worker_id}.json"));
        let timing_path = data_dir.join(format!("timing_w{worker_id}.json"));
        let staging_dir = data_dir.join(format!("staging_w{worker_id}"));

        let mgr = SessionManager::new(
            worker_id,
            settings.resolve_portal_url(),
            settings.resolve_debug_port_base(),
            data_dir.clone(),
        );
        let solver = CaptchaSolver::new(&settings.vision, selectors.clone())?;
        let uploader = BatchUploader::new(
            store,
            staging_dir,
            settings.storage.resolve_key_prefix(),
            settings.resolve_batch_size(),
        );

        Ok(Self {
            worker_id,
            assignment,
            mgr,
            solver,
            paginator: Paginator::new(selectors.clone(), settings.resolve_page_size() as u64),
            extractor: Extractor::new(selectors.clone()),
            downloader: PdfDownloader::new(selectors.clone())?,
            uploader,
            notifier: Notifier::new(settings.resolve_notify_webhook_url(), worker_id),
            selectors,
            progress: ProgressCheckpoint::load(&progress_path),
            timing: TimingCheckpoint::load(&timing_path),
            progress_path,
            timing_path,
            shutdown,
            session_started: Utc::now(),
            session_success: 0,
            session_failed: 0,
            pages_processed: 0,
        })
    }

    fn page_size(settings: &Settings) -> u32 {
        settings.resolve_page_size()
    }

    // ── Run ──────────────────────────────────────────────────────────────────

    /// Drive the whole assignment to completion. Exit is `Ok(())` for both a
    /// completed range and a graceful shutdown; only exhausted recovery or a
    /// truly fatal condition returns `Err`.
    pub async fn run(&mut self, settings: &Settings) -> Result<(), WorkerError> {
        info!(
            worker = self.worker_id,
            start = self.assignment.start_page,
            end = ?self.assignment.end_page,
            "worker starting: {}",
            self.assignment.description
        );
        if self.progress.start_time.is_none() {
            self.progress.start_time = Some(Utc::now().to_rfc3339());
        }
        if self.timing.session_start.is_none() {
            self.timing.session_start = Some(Utc::now().to_rfc3339());
        }

        // At-least-once: files downloaded but not flushed by a previous run
        // go out before anything new is scraped.
        let leftover = self
            .uploader
            .rediscover()
            .map_err(|e| WorkerError::Fatal(format!("staging rediscovery failed: {e:#}")))?;
        if leftover > 0 {
            let report = self.uploader.flush().await;
            self.apply_flush_report(&report);
        }

        let page_size = Self::page_size(settings);
        let mut session = match self.establish_session(page_size).await {
            Ok(s) => s,
            Err(e) => return self.end_without_session(e).await,
        };

        let mut page = self.progress.resume_page(&self.assignment);
        info!(page, "resuming extraction");
        match self.paginator.seek(&session, page).await {
            Ok(PageSeek::Reached) => {}
            Ok(PageSeek::Exhausted { stopped_at }) => {
                info!(stopped_at, "nothing left to do for this assignment");
                self.finish(session, true).await;
                return Ok(());
            }
            Err(e) => {
                // A failed initial seek goes straight through the ladder.
                session = match self.recover(session, page, page_size, e).await {
                    Ok(s) => s,
                    Err(e) => return self.end_without_session(e).await,
                };
            }
        }

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.graceful_shutdown(session).await;
                return Ok(());
            }

            match self.process_page(&session, page).await {
                Ok(PageStep::Advanced { next }) => {
                    self.pages_processed += 1;
                    page = next;
                }
                Ok(PageStep::Finished) => {
                    self.pages_processed += 1;
                    self.finish(session, true).await;
                    return Ok(());
                }
                Ok(PageStep::MidPageRefresh) => {
                    session = match self.refresh_session(session, page, page_size).await {
                        Ok(s) => s,
                        Err(e) => return self.end_without_session(e).await,
                    };
                }
                Ok(PageStep::ShutdownRequested) => {
                    self.graceful_shutdown(session).await;
                    return Ok(());
                }
                Err(e) if e.needs_recovery() => {
                    warn!(page, "page processing failed, entering recovery: {e}");
                    session = match self.recover(session, page, page_size, e).await {
                        Ok(s) => s,
                        Err(e) => return self.end_without_session(e).await,
                    };
                }
                Err(e) => {
                    error!(page, "fatal error: {e}");
                    self.notifier
                        .send(EventKind::Error, "fatal error", &e.to_string())
                        .await;
                    self.finish(session, false).await;
                    return Err(e);
                }
            }
        }
    }

    // ── Page processing ──────────────────────────────────────────────────────

    async fn process_page(
        &mut self,
        session: &WorkerSession,
        page: u64,
    ) -> Result<PageStep, WorkerError> {
        self.paginator
            .wait_for_table(session)
            .await
            .map_err(|e| WorkerError::session(e.to_string()))?;
        let records = self
            .extractor
            .extract_page(session, page)
            .await
            .map_err(|e| WorkerError::session(e.to_string()))?;

        let total = records.len();
        let mut taken = 0usize;
        for (idx, record) in records.iter().enumerate() {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(PageStep::ShutdownRequested);
            }
            if self.progress.contains_filename(&record.filename) {
                continue;
            }
            taken += 1;

            // One immediate retry absorbs transient viewer/network hiccups;
            // anything beyond that is recorded as a failed row.
            let mut outcome = self
                .downloader
                .download(session, record, self.uploader.staging_dir())
                .await;
            if !outcome.success {
                tokio::time::sleep(Duration::from_secs(2)).await;
                outcome = self
                    .downloader
                    .download(session, record, self.uploader.staging_dir())
                    .await;
            }

            self.timing.record(&outcome);
            let batch_full = if outcome.success {
                self.session_success += 1;
                let local_path = outcome.local_path.clone().ok_or_else(|| {
                    WorkerError::Fatal("successful outcome without a local path".into())
                })?;
                outcome.storage_key = Some(self.uploader.storage_key(&outcome.filename));
                let full = self.uploader.push(&outcome.filename, local_path);
                self.progress.record_success(outcome, page);
                full
            } else {
                self.session_failed += 1;
                self.progress.record_failure(outcome);
                false
            };
            self.save_checkpoints();

            if batch_full {
                let report = self.uploader.flush().await;
                self.apply_flush_report(&report);
                if idx + 1 < total {
                    // Long pages outlive the portal's session patience; a
                    // fresh session mid-page keeps downloads from 403ing.
                    info!(page, "batch flushed mid-page, refreshing session");
                    return Ok(PageStep::MidPageRefresh);
                }
            }
        }

        if taken > 0 {
            info!(page, rows = taken, "page complete");
        }
        self.progress.mark_page_complete(page);
        self.save_checkpoints();

        let next = page + 1;
        if self.assignment.past_end(next) {
            info!(page, "assigned range complete");
            return Ok(PageStep::Finished);
        }
        let advanced = self
            .paginator
            .next_page(session)
            .await
            .map_err(|e| WorkerError::session(e.to_string()))?;
        if advanced {
            Ok(PageStep::Advanced { next })
        } else {
            info!(page, "result set exhausted");
            Ok(PageStep::Finished)
        }
    }

    // ── Session lifecycle ────────────────────────────────────────────────────

    /// Fresh session from nothing: launch, solve the CAPTCHA (bounded), wait
    /// for the results surface and apply the page size.
    async fn establish_session(&mut self, page_size: u32) -> Result<WorkerSession, WorkerError> {
        let session = self.mgr.initialize().await?;
        if let Err(e) = self.solver.solve(&self.mgr, &session).await {
            self.notifier
                .send(EventKind::Error, "CAPTCHA exhausted", &e.to_string())
                .await;
            self.mgr.teardown(session).await;
            return Err(e);
        }
        self.wait_for_results(&session).await?;
        self.probe_total_results(&session).await;
        self.paginator
            .set_page_size(&session, page_size)
            .await
            .map_err(|e| WorkerError::session(e.to_string()))?;
        Ok(session)
    }

    /// Post-CAPTCHA: wait for the results container and a populated table,
    /// then drop a diagnostic screenshot beside the checkpoints.
    async fn wait_for_results(&self, session: &WorkerSession) -> Result<(), WorkerError> {
        session
            .wait_for_element(self.selectors.results_container, Duration::from_secs(30))
            .await
            .map_err(|e| WorkerError::session(format!("results never appeared: {e}")))?;
        self.paginator
            .wait_for_table(session)
            .await
            .map_err(|e| WorkerError::session(e.to_string()))?;
        session.save_screenshot(&self.mgr.artifact_path("results")).await;
        Ok(())
    }

    async fn probe_total_results(&self, session: &WorkerSession) {
        match self.extractor.total_results(session).await {
            Ok(Some(total)) => info!(total, "portal reports total results"),
            Ok(None) => {}
            Err(e) => warn!("total-results probe failed: {e}"),
        }
    }

    /// Planned in-place refresh (mid-page batch boundary): reload, re-solve,
    /// seek back. Escalates to full recovery if the reload itself fails.
    async fn refresh_session(
        &mut self,
        session: WorkerSession,
        page: u64,
        page_size: u32,
    ) -> Result<WorkerSession, WorkerError> {
        match self.reinit_in_place(&session, page, page_size).await {
            Ok(()) => Ok(session),
            Err(e) if e.is_interrupt() => {
                self.mgr.teardown(session).await;
                Err(e)
            }
            Err(e) => {
                warn!("in-place refresh failed, escalating: {e}");
                self.recover(session, page, page_size, e).await
            }
        }
    }

    async fn reinit_in_place(
        &mut self,
        session: &WorkerSession,
        page: u64,
        page_size: u32,
    ) -> Result<(), WorkerError> {
        self.mgr
            .navigate_to_portal(session)
            .await
            .map_err(|e| WorkerError::session(e.to_string()))?;
        self.solver
            .solve_until(&self.mgr, session, &self.shutdown)
            .await?;
        self.wait_for_results(session).await?;
        self.paginator
            .set_page_size(session, page_size)
            .await
            .map_err(|e| WorkerError::session(e.to_string()))?;
        match self.paginator.seek(session, page).await? {
            PageSeek::Reached => Ok(()),
            PageSeek::Exhausted { stopped_at } => Err(WorkerError::session(format!(
                "result set shrank during refresh (stopped at {stopped_at}, wanted {page})"
            ))),
        }
    }

    /// The recovery ladder. Consumes the broken session and either returns a
    /// healthy one positioned at `page` or exhausts its rounds.
    async fn recover(
        &mut self,
        session: WorkerSession,
        page: u64,
        page_size: u32,
        cause: WorkerError,
    ) -> Result<WorkerSession, WorkerError> {
        self.notifier
            .send(EventKind::Error, "session recovery", &cause.to_string())
            .await;

        let mut state = RecoveryState::Healthy.on_operation_failure();
        state = state.after_probe(session.is_responsive().await);

        if state == RecoveryState::SessionReinitRequested {
            info!(page, "attempting in-place session reinit");
            let ok = self.reinit_in_place(&session, page, page_size).await.is_ok();
            state = state.after_reinit(ok);
            if state == RecoveryState::Healthy {
                info!("session reinit succeeded");
                return Ok(session);
            }
        }

        // Full recovery: the old session is garbage either way.
        self.mgr.teardown(session).await;
        let mut rounds_left = MAX_RECOVERY_ROUNDS;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(WorkerError::Interrupted);
            }
            rounds_left -= 1;
            info!(page, rounds_left, "attempting full session recovery");

            match self.rebuild_session(page, page_size).await {
                Ok(session) => {
                    state = state.after_full_recovery(true, rounds_left);
                    debug_assert_eq!(state, RecoveryState::Healthy);
                    info!("full recovery succeeded");
                    return Ok(session);
                }
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    warn!("full recovery round failed: {e}");
                    state = state.after_full_recovery(false, rounds_left);
                    if state == RecoveryState::Failed {
                        // The caller persists final state and notifies.
                        return Err(WorkerError::Fatal(format!(
                            "recovery exhausted after {MAX_RECOVERY_ROUNDS} rounds: {e}"
                        )));
                    }
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }
    }

    async fn rebuild_session(
        &mut self,
        page: u64,
        page_size: u32,
    ) -> Result<WorkerSession, WorkerError> {
        let session = self.mgr.initialize().await?;
        let positioned = async {
            self.solver
                .solve_until(&self.mgr, &session, &self.shutdown)
                .await?;
            self.wait_for_results(&session).await?;
            self.paginator
                .set_page_size(&session, page_size)
                .await
                .map_err(|e| WorkerError::session(e.to_string()))?;
            match self.paginator.seek(&session, page).await? {
                PageSeek::Reached => Ok(()),
                PageSeek::Exhausted { stopped_at } => Err(WorkerError::session(format!(
                    "result set shrank during recovery (stopped at {stopped_at}, wanted {page})"
                ))),
            }
        }
        .await;
        match positioned {
            Ok(()) => Ok(session),
            Err(e) => {
                self.mgr.teardown(session).await;
                Err(e)
            }
        }
    }

    // ── Bookkeeping and exit paths ───────────────────────────────────────────

    fn apply_flush_report(&mut self, report: &crate::batch::FlushReport) {
        if !report.uploaded.is_empty() {
            let names: Vec<String> = report
                .uploaded
                .iter()
                .map(|f| f.filename.clone())
                .collect();
            self.progress.mark_uploaded(&names);
        }
        self.save_checkpoints();
    }

    fn save_checkpoints(&mut self) {
        if let Err(e) = self.progress.save(&self.progress_path) {
            error!("progress checkpoint save failed: {e:#}");
        }
        if let Err(e) = self.timing.save(&self.timing_path) {
            error!("timing checkpoint save failed: {e:#}");
        }
    }

    /// Terminal tail for runs whose session is already gone (recovery
    /// exhausted, interrupted mid-recovery, startup failure): flush whatever
    /// is staged, persist both checkpoints and the session summary, then map
    /// the cause to the process outcome — an interrupt exits cleanly,
    /// anything else is a failure.
    async fn end_without_session(&mut self, cause: WorkerError) -> Result<(), WorkerError> {
        let report = self.uploader.flush().await;
        self.apply_flush_report(&report);
        self.append_session_summary();
        self.save_checkpoints();

        if cause.is_interrupt() {
            info!("interrupted, state persisted for resume");
            self.notifier
                .send(
                    EventKind::Shutdown,
                    "interrupted",
                    &format!("resuming at page {}", self.progress.current_page),
                )
                .await;
            Ok(())
        } else {
            error!("worker stopping: {cause}");
            self.notifier
                .send(EventKind::Error, "worker failed", &cause.to_string())
                .await;
            Err(cause)
        }
    }

    async fn graceful_shutdown(&mut self, session: WorkerSession) {
        info!("shutdown requested, flushing and exiting cleanly");
        let report = self.uploader.flush().await;
        self.apply_flush_report(&report);
        self.append_session_summary();
        self.save_checkpoints();
        self.notifier
            .send(
                EventKind::Shutdown,
                "graceful shutdown",
                &format!(
                    "{} downloads this session, resuming at page {}",
                    self.session_success, self.progress.current_page
                ),
            )
            .await;
        self.mgr.teardown(session).await;
    }

    /// Common tail for completed and failed runs: final flush, summary,
    /// notification, teardown.
    async fn finish(&mut self, session: WorkerSession, completed: bool) {
        let report = self.uploader.flush().await;
        self.apply_flush_report(&report);
        if completed {
            self.progress.completion_time = Some(Utc::now().to_rfc3339());
        }
        self.append_session_summary();
        self.save_checkpoints();
        self.uploader.cleanup();

        if completed {
            let summary = format!(
                "pages: {}, downloads: {}, failures: {}, lifetime total: {}",
                self.pages_processed,
                self.session_success,
                self.session_failed,
                self.progress.total_files_downloaded,
            );
            info!("🏁 assignment complete — {summary}");
            self.notifier
                .send(EventKind::Completion, "assignment complete", &summary)
                .await;
        }
        self.mgr.teardown(session).await;
    }

    fn append_session_summary(&mut self) {
        let now = Utc::now();
        let duration = (now - self.session_started).num_milliseconds() as f64 / 1000.0;
        let avg = if self.session_success > 0 {
            duration / self.session_success as f64
        } else {
            0.0
        };
        self.timing.session_end = Some(now.to_rfc3339());
        self.timing.session_statistics.push(SessionSummary {
            worker_id: self.worker_id,
            session_start: Some(self.session_started.to_rfc3339()),
            session_end: Some(now.to_rfc3339()),
            total_files_processed: self.session_success + self.session_failed,
            successful_downloads: self.session_success,
            failed_downloads: self.session_failed,
            session_duration_seconds: duration,
            average_time_per_file: avg,
            pages_processed: self.pages_processed,
            start_page: self.assignment.start_page,
            end_page: self.assignment.end_page,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ObjectStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ObjectStore for MemStore {
        async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }
    }

    fn test_worker(data_dir: &Path, store: Arc<MemStore>) -> Worker {
        let settings = Settings {
            data_dir: Some(data_dir.to_string_lossy().to_string()),
            ..Settings::default()
        };
        let assignment = WorkerAssignment {
            worker_id: 7,
            start_page: 1,
            end_page: Some(5),
            description: "test".to_string(),
        };
        Worker::new(
            7,
            &settings,
            assignment,
            store,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    fn stage_leftover(data_dir: &Path) -> std::path::PathBuf {
        let staging = data_dir.join("staging_w7");
        std::fs::create_dir_all(&staging).unwrap();
        let path = staging.join("left_over.pdf");
        std::fs::write(&path, b"%PDF-1.7 leftover").unwrap();
        path
    }

    /// An interrupt with no session left must still flush staged files,
    /// persist both checkpoints and exit as a success.
    #[tokio::test]
    async fn interrupt_without_session_flushes_and_exits_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        let staged = stage_leftover(tmp.path());

        let mut worker = test_worker(tmp.path(), store.clone());
        worker.uploader.rediscover().unwrap();

        let out = worker.end_without_session(WorkerError::Interrupted).await;
        assert!(out.is_ok(), "interrupt is a clean exit, not a failure");

        assert!(store.exists("judgements/left_over.pdf").await.unwrap());
        assert!(!staged.exists());
        assert!(tmp.path().join("progress_w7.json").exists());
        assert!(tmp.path().join("timing_w7.json").exists());
        assert_eq!(worker.timing.session_statistics.len(), 1);
        assert!(worker.timing.session_end.is_some());
    }

    /// Exhausted recovery is an error exit, but the staged batch and the
    /// final checkpoints must land before the error surfaces.
    #[tokio::test]
    async fn exhausted_recovery_still_persists_state_before_erroring() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        stage_leftover(tmp.path());

        let mut worker = test_worker(tmp.path(), store.clone());
        worker.uploader.rediscover().unwrap();

        let out = worker
            .end_without_session(WorkerError::Fatal("recovery exhausted".into()))
            .await;
        assert!(out.is_err());

        assert!(store.exists("judgements/left_over.pdf").await.unwrap());
        assert!(tmp.path().join("progress_w7.json").exists());
        assert_eq!(worker.timing.session_statistics.len(), 1);
    }
}

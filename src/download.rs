//! PDF acquisition.
//!
//! The portal renders judgments inside a viewer modal whose `<object>` tag
//! carries the real document URL. Fetching that URL directly through an HTTP
//! client reusing the browser's cookies, user agent and referer is far faster
//! and more reliable than printing the viewer, so that is the only path.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::browser::{WorkerSession, ELEMENT_WAIT};
use crate::core::types::{DownloadOutcome, JudgmentRecord};
use crate::core::Selectors;

/// Documents served via relative `tmp/` paths live on the services host, not
/// the search portal host.
const DOCUMENT_BASE: &str = "https://services.ecourts.gov.in";

pub struct PdfDownloader {
    http: reqwest::Client,
    selectors: Selectors,
}

impl PdfDownloader {
    pub fn new(selectors: Selectors) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building download HTTP client")?;
        Ok(Self { http, selectors })
    }

    /// Download one judgment PDF into `staging_dir`.
    ///
    /// Never panics and never returns `Err`: every failure mode is folded
    /// into a failed [`DownloadOutcome`] so the caller's bookkeeping is
    /// uniform. The viewer modal is closed on every path, success or not,
    /// because a lingering modal blocks the next row's trigger.
    pub async fn download(
        &self,
        session: &WorkerSession,
        record: &JudgmentRecord,
        staging_dir: &Path,
    ) -> DownloadOutcome {
        let started = Instant::now();
        let result = self.try_download(session, record, staging_dir).await;
        if let Err(e) = self.close_viewer(session).await {
            debug!("viewer close failed (non-fatal): {e}");
        }
        let duration = started.elapsed().as_secs_f64();
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(row = record.row_number, file = %record.filename, "download failed: {e:#}");
                DownloadOutcome::failure(record, format!("{e:#}"), duration)
            }
        }
    }

    async fn try_download(
        &self,
        session: &WorkerSession,
        record: &JudgmentRecord,
        staging_dir: &Path,
    ) -> Result<DownloadOutcome> {
        let started = Instant::now();

        // A viewer left open by a previous row hides the trigger buttons.
        self.close_viewer(session).await.ok();

        self.open_viewer(session, record).await?;
        let src = self.viewer_source(session).await?;
        let page_url = session
            .page
            .url()
            .await
            .map_err(|e| anyhow!("could not read page url: {e}"))?
            .unwrap_or_default();
        let url = resolve_document_url(&src, &page_url)
            .ok_or_else(|| anyhow!("viewer source not a document url: {src:?}"))?;
        debug!(row = record.row_number, %url, "fetching document");

        let cookies = self.cookie_header(session).await?;
        let response = self
            .http
            .get(&url)
            .header("Cookie", cookies)
            .header("User-Agent", session.user_agent.clone())
            .header("Referer", page_url)
            .send()
            .await
            .context("document fetch failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("http {}", status.as_u16()));
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = response.bytes().await.context("document body read failed")?;
        if !is_pdf_payload(&content_type, &bytes) {
            return Err(anyhow!("not a pdf ({}, {} bytes)", content_type, bytes.len()));
        }

        std::fs::create_dir_all(staging_dir).context("creating staging dir")?;
        let local_path = staging_dir.join(&record.filename);
        std::fs::write(&local_path, &bytes)
            .with_context(|| format!("writing {}", local_path.display()))?;

        let duration = started.elapsed().as_secs_f64();
        info!(
            row = record.row_number,
            file = %record.filename,
            bytes = bytes.len(),
            "📄 downloaded in {duration:.1}s"
        );
        Ok(DownloadOutcome::success(record, local_path, duration))
    }

    /// Click the row's trigger and wait for the viewer modal to render.
    async fn open_viewer(&self, session: &WorkerSession, record: &JudgmentRecord) -> Result<()> {
        let trigger_sel = format!("#{}", record.trigger_id);
        match session.page.find_element(trigger_sel.as_str()).await {
            Ok(el) => {
                if el.click().await.is_err() {
                    // Click can be intercepted by layout shifts; fall back to
                    // a direct DOM click.
                    self.js_click(session, &trigger_sel).await?;
                }
            }
            Err(_) => self.js_click(session, &trigger_sel).await?,
        }

        session
            .wait_for_element(self.selectors.viewer_modal, ELEMENT_WAIT)
            .await
            .context("viewer modal did not open")?;
        // The object tag is injected after the modal frame appears.
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            if session
                .page
                .find_element(self.selectors.viewer_object)
                .await
                .is_ok()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("viewer opened without a document object"));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn js_click(&self, session: &WorkerSession, selector: &str) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.click();
                return true;
            }})()"#,
            sel = serde_json::to_string(selector)?,
        );
        let clicked = session.eval_json(&script).await?.as_bool().unwrap_or(false);
        if clicked {
            Ok(())
        } else {
            Err(anyhow!("trigger element {selector} not found"))
        }
    }

    async fn viewer_source(&self, session: &WorkerSession) -> Result<String> {
        let el = session
            .page
            .find_element(self.selectors.viewer_object)
            .await
            .map_err(|e| anyhow!("viewer object missing: {e}"))?;
        for attr in ["data", "src"] {
            if let Ok(Some(value)) = el.attribute(attr).await {
                if !value.trim().is_empty() {
                    return Ok(value);
                }
            }
        }
        Err(anyhow!("viewer source missing"))
    }

    async fn close_viewer(&self, session: &WorkerSession) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const modal = document.querySelector('{modal}');
                if (modal === null || modal.offsetParent === null) return false;
                const close = document.querySelector('{close}');
                if (close) close.click();
                return true;
            }})()"#,
            modal = self.selectors.viewer_modal,
            close = self.selectors.viewer_close,
        );
        if session.eval_json(&script).await?.as_bool().unwrap_or(false) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(())
    }

    /// Current session cookies as a single `Cookie:` header value.
    async fn cookie_header(&self, session: &WorkerSession) -> Result<String> {
        let cookies = session
            .page
            .get_cookies()
            .await
            .map_err(|e| anyhow!("could not read cookies: {e}"))?;
        Ok(cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; "))
    }
}

// ── Pure helpers ─────────────────────────────────────────────────────────────

/// Resolve the viewer's `data`/`src` attribute to an absolute document URL.
///
/// Absolute URLs pass through; relative paths resolve against the document
/// host. Only paths that plausibly address a document (`.pdf` suffix or a
/// `tmp/` segment, the portal's transient-document convention) are accepted.
pub fn resolve_document_url(src: &str, _page_url: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() {
        return None;
    }
    let absolute = if src.starts_with("http://") || src.starts_with("https://") {
        src.to_string()
    } else if let Some(stripped) = src.strip_prefix('/') {
        format!("{DOCUMENT_BASE}/{stripped}")
    } else {
        format!("{DOCUMENT_BASE}/{src}")
    };

    let parsed = url::Url::parse(&absolute).ok()?;
    let path = parsed.path().to_ascii_lowercase();
    if path.ends_with(".pdf") || path.contains("/tmp/") || path.starts_with("/tmp") {
        Some(absolute)
    } else {
        None
    }
}

/// A payload counts as a PDF when the server says so or the magic bytes do.
/// Portals love serving HTML error pages with status 200; those fail both
/// checks and are rejected.
pub fn is_pdf_payload(content_type: &str, bytes: &[u8]) -> bool {
    if content_type
        .to_ascii_lowercase()
        .trim_start()
        .starts_with("application/pdf")
    {
        return true;
    }
    bytes.starts_with(b"%PDF")
}

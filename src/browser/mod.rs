//! Browser session lifecycle for one worker.
//!
//! Each worker owns exactly one Chromium instance with fully isolated
//! filesystem state: profile, disk cache and crash-dump directories named by
//! `(worker id, launch millis, random salt)` so simultaneous startup of many
//! workers never collides. Teardown and the pre-launch sweep match on this
//! worker's signature prefix only — other workers' browsers and the
//! operator's own browser are never touched.

pub mod stealth;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::element::Element;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::WorkerError;

const MAX_LAUNCH_ATTEMPTS: u32 = 5;

/// Default wait ceiling for element presence, mirroring the portal's slow
/// post-CAPTCHA table refreshes.
pub const ELEMENT_WAIT: Duration = Duration::from_secs(10);
const ELEMENT_POLL: Duration = Duration::from_millis(250);

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var (explicit override)
/// 2. PATH scan — finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/brave-browser",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Session ──────────────────────────────────────────────────────────────────

/// A live, isolated browser session owned by one worker.
pub struct WorkerSession {
    pub page: Page,
    browser: Browser,
    handler: JoinHandle<()>,
    pub user_agent: String,
    profile_dir: PathBuf,
    cache_dir: PathBuf,
    crash_dir: PathBuf,
    pub debug_port: u16,
}

impl WorkerSession {
    /// Cheap liveness probe: a trivial script evaluation with a short
    /// timeout. `false` means the driver has wedged and in-place session
    /// reinit must not be attempted.
    pub async fn is_responsive(&self) -> bool {
        let probe = self.page.evaluate("1 + 1");
        matches!(
            tokio::time::timeout(Duration::from_secs(5), probe).await,
            Ok(Ok(_))
        )
    }

    /// Poll for an element until present or `timeout` elapses.
    pub async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<Element> {
        let start = std::time::Instant::now();
        loop {
            match self.page.find_element(selector).await {
                Ok(el) => return Ok(el),
                Err(_) if start.elapsed() < timeout => {
                    tokio::time::sleep(ELEMENT_POLL).await;
                }
                Err(e) => {
                    return Err(anyhow!("element `{selector}` not present after {timeout:?}: {e}"))
                }
            }
        }
    }

    /// Evaluate `expr` and deserialize its JSON result.
    pub async fn eval_json(&self, expr: &str) -> Result<serde_json::Value> {
        let value = self
            .page
            .evaluate(expr)
            .await
            .map_err(|e| anyhow!("script evaluation failed: {e}"))?
            .into_value::<serde_json::Value>()
            .map_err(|e| anyhow!("script result not deserializable: {e}"))?;
        Ok(value)
    }

    /// Full-page screenshot artifact (diagnostic only, best effort).
    pub async fn save_screenshot(&self, path: &Path) {
        match self
            .page
            .screenshot(chromiumoxide::page::ScreenshotParams::builder().build())
            .await
        {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!("could not write screenshot {}: {e}", path.display());
                }
            }
            Err(e) => debug!("screenshot failed (non-fatal): {e}"),
        }
    }
}

// ── Session manager ──────────────────────────────────────────────────────────

/// Owns creation and teardown of [`WorkerSession`]s for one worker id.
pub struct SessionManager {
    worker_id: u32,
    portal_url: String,
    debug_port: u16,
    data_dir: PathBuf,
}

impl SessionManager {
    pub fn new(worker_id: u32, portal_url: String, debug_port_base: u16, data_dir: PathBuf) -> Self {
        Self {
            worker_id,
            portal_url,
            debug_port: debug_port_base.saturating_add(worker_id as u16),
            data_dir,
        }
    }

    /// Filesystem signature prefix unique to this worker. The sweep and
    /// teardown only ever touch entries carrying this prefix.
    fn signature(&self, kind: &str) -> String {
        format!("verdex_{kind}_w{}_", self.worker_id)
    }

    /// Launch an isolated browser, apply stealth, navigate to the portal and
    /// wait for the CAPTCHA image to appear.
    ///
    /// Retries instance creation up to a fixed ceiling with increasing
    /// backoff and a stale-resource sweep between attempts; on exhaustion the
    /// error is fatal for the run.
    pub async fn initialize(&self) -> Result<WorkerSession, WorkerError> {
        let exe = find_chrome_executable().ok_or_else(|| WorkerError::BrowserInit {
            attempts: 0,
            message: "no Chromium-family browser found; set CHROME_EXECUTABLE".to_string(),
        })?;

        self.sweep_stale_resources();

        let mut last_err = String::new();
        for attempt in 1..=MAX_LAUNCH_ATTEMPTS {
            match self.launch_once(&exe).await {
                Ok(session) => {
                    info!(
                        worker = self.worker_id,
                        attempt,
                        port = session.debug_port,
                        profile = %session.profile_dir.display(),
                        "browser session ready"
                    );
                    return Ok(session);
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!(
                        worker = self.worker_id,
                        attempt, "browser launch failed: {last_err}"
                    );
                    if attempt < MAX_LAUNCH_ATTEMPTS {
                        let jitter: f64 = rand::rng().random_range(0.0..2.0);
                        let delay = Duration::from_secs_f64(5.0 + (attempt as f64) * 3.0 + jitter);
                        tokio::time::sleep(delay).await;
                        self.sweep_stale_resources();
                    }
                }
            }
        }

        Err(WorkerError::BrowserInit {
            attempts: MAX_LAUNCH_ATTEMPTS,
            message: last_err,
        })
    }

    async fn launch_once(&self, exe: &str) -> Result<WorkerSession> {
        let salt: u32 = rand::rng().random_range(1000..10_000);
        let millis = chrono::Utc::now().timestamp_millis();
        let temp = std::env::temp_dir();
        let profile_dir = temp.join(format!("{}{millis}_{salt}", self.signature("profile")));
        let cache_dir = temp.join(format!("{}{millis}_{salt}", self.signature("cache")));
        let crash_dir = temp.join(format!("{}{millis}_{salt}", self.signature("crashes")));
        std::fs::create_dir_all(&profile_dir).context("creating profile dir")?;

        let user_agent = stealth::random_user_agent().to_string();

        let mut builder = BrowserConfig::builder()
            .chrome_executable(exe)
            .window_size(1920, 1080)
            .request_timeout(Duration::from_secs(60))
            .user_data_dir(&profile_dir)
            .arg(format!("--remote-debugging-port={}", self.debug_port))
            .arg(format!("--disk-cache-dir={}", cache_dir.display()))
            .arg("--disk-cache-size=104857600") // 100MB
            .arg(format!("--crash-dumps-dir={}", crash_dir.display()))
            .arg(format!("--user-agent={user_agent}"));
        for flag in stealth::stealth_args() {
            builder = builder.arg(flag);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow!("failed to launch browser ({exe}): {e}"))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let msg = e.to_string();
                    // Chrome emits CDP events chromiumoxide doesn't model;
                    // those deserialize errors are benign.
                    if msg.contains("data did not match any variant") {
                        debug!("suppressed benign CDP deserialize error");
                    } else {
                        warn!("CDP handler error: {msg}");
                    }
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("failed to open page: {e}"))?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
            stealth::stealth_script(),
        ))
        .await
        .map_err(|e| anyhow!("failed to inject stealth script: {e}"))?;

        let session = WorkerSession {
            page,
            browser,
            handler: handler_task,
            user_agent,
            profile_dir,
            cache_dir,
            crash_dir,
            debug_port: self.debug_port,
        };

        self.navigate_to_portal(&session).await?;
        Ok(session)
    }

    /// Navigate (or re-navigate) to the portal entry page and wait for the
    /// CAPTCHA image — the precondition of every solve attempt.
    pub async fn navigate_to_portal(&self, session: &WorkerSession) -> Result<()> {
        info!("navigating to {}", self.portal_url);
        session
            .page
            .goto(self.portal_url.as_str())
            .await
            .map_err(|e| anyhow!("portal navigation failed: {e}"))?;
        session
            .wait_for_element("#captcha_image", ELEMENT_WAIT)
            .await
            .context("portal page loaded without a CAPTCHA image")?;
        Ok(())
    }

    /// Tear down the session and remove every filesystem resource it owned.
    /// Idempotent: repeated calls (and calls after a crashed browser) are
    /// safe and touch only this worker's directories.
    pub async fn teardown(&self, mut session: WorkerSession) {
        info!(worker = self.worker_id, "tearing down browser session");
        if let Err(e) = session.browser.close().await {
            warn!("browser close error (continuing teardown): {e}");
        }
        // Give the process a moment to release profile locks.
        let _ = tokio::time::timeout(Duration::from_secs(5), session.browser.wait()).await;
        session.handler.abort();

        for dir in [&session.profile_dir, &session.cache_dir, &session.crash_dir] {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    debug!("could not remove {}: {e}", dir.display());
                }
            }
        }
    }

    /// Cmdline substring identifying browser processes launched for this
    /// worker: every Chrome child carries `--user-data-dir=<temp>/<prefix>…`.
    fn stale_process_pattern(&self) -> String {
        self.signature("profile")
    }

    /// Kill leftover browser processes from a previous run of *this* worker.
    /// A wedged Chrome holds the profile lock and the worker's debug port,
    /// which would defeat every launch retry. Best effort; matching is on
    /// the worker-scoped profile signature so no other worker's browser (or
    /// the operator's own) is ever touched.
    #[cfg(unix)]
    fn kill_stale_browsers(&self) {
        let pattern = self.stale_process_pattern();
        match std::process::Command::new("pkill")
            .arg("-f")
            .arg(&pattern)
            .status()
        {
            // exit 0: at least one process matched and was signalled
            Ok(status) if status.success() => {
                warn!(worker = self.worker_id, "killed stale browser processes");
                std::thread::sleep(Duration::from_millis(500));
            }
            Ok(_) => {} // exit 1: nothing matched
            Err(e) => debug!("pkill unavailable, skipping process sweep: {e}"),
        }
    }

    #[cfg(not(unix))]
    fn kill_stale_browsers(&self) {}

    /// Remove leftover profile/cache/crash directories from previous runs of
    /// *this* worker. Entries not carrying this worker's signature are never
    /// touched. Stale processes go first: a live Chrome would respawn its
    /// profile lock right after the directory sweep.
    pub fn sweep_stale_resources(&self) {
        self.kill_stale_browsers();
        let temp = std::env::temp_dir();
        let prefixes = [
            self.signature("profile"),
            self.signature("cache"),
            self.signature("crashes"),
        ];
        let Ok(entries) = std::fs::read_dir(&temp) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                let path = entry.path();
                if path.is_dir() {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => debug!("swept stale dir {}", path.display()),
                        Err(e) => debug!("could not sweep {}: {e}", path.display()),
                    }
                }
            }
        }
    }

    /// Artifact path inside this worker's data dir (screenshots etc).
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}_w{}.png", self.worker_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_worker_scoped() {
        let a = SessionManager::new(3, "http://x/".into(), 9222, PathBuf::from("."));
        let b = SessionManager::new(30, "http://x/".into(), 9222, PathBuf::from("."));
        assert!(a.signature("profile").starts_with("verdex_profile_w3_"));
        // Worker 3's prefix must not match worker 30's directories.
        assert!(!b.signature("profile").starts_with(&a.signature("profile")));
        assert_eq!(a.debug_port, 9225);
    }

    #[test]
    fn test_stale_process_pattern_matches_only_own_profiles() {
        let mgr = SessionManager::new(4, "http://x/".into(), 9222, PathBuf::from("."));
        let pattern = mgr.stale_process_pattern();
        assert_eq!(pattern, "verdex_profile_w4_");
        // the substring Chrome carries in --user-data-dir for this worker
        assert!("verdex_profile_w4_1724000000000_5123".starts_with(&pattern));
        // never another worker's browser
        assert!(!"verdex_profile_w40_1724000000000_5123".starts_with(&pattern));
    }

    #[test]
    fn test_sweep_only_removes_own_signature() {
        let mgr = SessionManager::new(91, "http://x/".into(), 9222, PathBuf::from("."));
        let temp = std::env::temp_dir();
        let mine = temp.join("verdex_profile_w91_123_456");
        let other = temp.join("verdex_profile_w910_123_456");
        std::fs::create_dir_all(&mine).unwrap();
        std::fs::create_dir_all(&other).unwrap();

        mgr.sweep_stale_resources();
        assert!(!mine.exists());
        assert!(other.exists());
        std::fs::remove_dir_all(&other).unwrap();
    }
}

//! CAPTCHA recognition and submission.
//!
//! The portal gates its search form behind a distorted-text CAPTCHA. We
//! screenshot the image element, send it to an OpenAI-compatible vision
//! endpoint, type the answer and submit. A wrong answer surfaces as a
//! validation modal; we dismiss it, refresh the image and try again.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::{SessionManager, WorkerSession, ELEMENT_WAIT};
use crate::core::config::VisionConfig;
use crate::core::{Selectors, WorkerError};

/// Attempt ceiling for normal operation. Recovery paths use
/// [`CaptchaSolver::solve_until`] instead, which is bounded only by the
/// shutdown flag.
const MAX_SOLVE_ATTEMPTS: u32 = 15;

const PROMPT: &str = "What text is shown in this image? Reply with only the \
characters you see, no explanation, no punctuation.";

pub struct CaptchaSolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    selectors: Selectors,
}

impl CaptchaSolver {
    pub fn new(vision: &VisionConfig, selectors: Selectors) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(vision.resolve_request_timeout_secs()))
            .build()
            .context("building vision HTTP client")?;
        Ok(Self {
            http,
            base_url: vision.resolve_base_url(),
            api_key: vision.resolve_api_key().unwrap_or_default(),
            models: vision.resolve_models(),
            selectors,
        })
    }

    // ── Recognition ──────────────────────────────────────────────────────────

    /// Send the CAPTCHA image to the configured vision models in order and
    /// return the first non-empty answer. Per-model failures are logged and
    /// the next model is tried; only full exhaustion is an error.
    pub async fn recognize(&self, png: &[u8]) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let data_url = format!("data:image/png;base64,{encoded}");

        for model in &self.models {
            match self.ask_model(model, &data_url).await {
                Ok(answer) => {
                    let answer = normalize_answer(&answer);
                    if answer.is_empty() {
                        warn!(model, "vision model returned empty answer, trying next");
                        continue;
                    }
                    debug!(model, "vision model answered");
                    return Ok(answer);
                }
                Err(e) => {
                    warn!(model, "vision request failed: {e}");
                }
            }
        }
        Err(anyhow!("all vision models failed to read the CAPTCHA"))
    }

    async fn ask_model(&self, model: &str, data_url: &str) -> Result<String> {
        let body = json!({
            "model": model,
            "max_tokens": 30,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }]
        });

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut req = self.http.post(&url).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await.context("vision endpoint unreachable")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("vision endpoint returned {status}: {text}"));
        }

        let payload: serde_json::Value = resp.json().await.context("invalid vision response")?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("vision response missing message content"))
    }

    // ── Solving loop ─────────────────────────────────────────────────────────

    /// Solve the CAPTCHA currently shown in `session`, bounded at
    /// [`MAX_SOLVE_ATTEMPTS`]. Returns [`WorkerError::Fatal`] on exhaustion.
    pub async fn solve(&self, mgr: &SessionManager, session: &WorkerSession) -> Result<(), WorkerError> {
        for attempt in 1..=MAX_SOLVE_ATTEMPTS {
            match self.attempt_once(mgr, session, attempt).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => warn!(attempt, "CAPTCHA attempt errored: {e}"),
            }
        }
        Err(WorkerError::Fatal(format!(
            "CAPTCHA unsolved after {MAX_SOLVE_ATTEMPTS} attempts"
        )))
    }

    /// Unbounded solve used during session recovery, where giving up means
    /// losing the whole worker. Loops until solved or `shutdown` is raised.
    pub async fn solve_until(
        &self,
        mgr: &SessionManager,
        session: &WorkerSession,
        shutdown: &AtomicBool,
    ) -> Result<(), WorkerError> {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(WorkerError::Interrupted);
            }
            attempt += 1;
            match self.attempt_once(mgr, session, attempt).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => warn!(attempt, "CAPTCHA recovery attempt errored: {e}"),
            }
        }
    }

    /// One full attempt: screenshot, recognize, fill, submit, check.
    /// `Ok(true)` means accepted; `Ok(false)` means the portal rejected the
    /// answer and the image has been refreshed for the next attempt.
    async fn attempt_once(
        &self,
        mgr: &SessionManager,
        session: &WorkerSession,
        attempt: u32,
    ) -> Result<bool> {
        let image = session
            .wait_for_element(self.selectors.captcha_image, ELEMENT_WAIT)
            .await
            .context("CAPTCHA image not present")?;
        let png = image
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| anyhow!("CAPTCHA screenshot failed: {e}"))?;

        // Keep the latest image on disk for operator inspection.
        let artifact = mgr.artifact_path("captcha");
        if let Err(e) = std::fs::write(&artifact, &png) {
            debug!("could not save CAPTCHA artifact: {e}");
        }

        let answer = self.recognize(&png).await?;
        info!(attempt, "submitting CAPTCHA answer ({} chars)", answer.len());

        self.fill_and_submit(session, &answer).await?;
        tokio::time::sleep(Duration::from_secs(3)).await;

        if self.rejection_shown(session).await? {
            warn!(attempt, "CAPTCHA answer rejected, refreshing");
            self.dismiss_rejection(session).await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(false)
        } else {
            info!("✅ CAPTCHA accepted");
            Ok(true)
        }
    }

    /// Set the input value via script and dispatch input events so the
    /// portal's own validation sees the change, then click search.
    async fn fill_and_submit(&self, session: &WorkerSession, answer: &str) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const input = document.querySelector('{input}');
                if (!input) return false;
                input.value = {answer};
                input.dispatchEvent(new Event('input', {{ bubbles: true }}));
                input.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            input = self.selectors.captcha_input,
            answer = serde_json::to_string(answer)?,
        );
        let filled = session
            .eval_json(&script)
            .await?
            .as_bool()
            .unwrap_or(false);
        if !filled {
            return Err(anyhow!("CAPTCHA input field not found"));
        }

        let button = session
            .wait_for_element(self.selectors.captcha_submit, ELEMENT_WAIT)
            .await
            .context("search button not present")?;
        button
            .click()
            .await
            .map_err(|e| anyhow!("search button click failed: {e}"))?;
        Ok(())
    }

    /// The rejection modal exists in the DOM permanently; only a rendered
    /// (offsetParent != null) modal counts as a rejection.
    async fn rejection_shown(&self, session: &WorkerSession) -> Result<bool> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('{sel}');
                return el !== null && el.offsetParent !== null;
            }})()"#,
            sel = self.selectors.captcha_error_modal
        );
        Ok(session.eval_json(&script).await?.as_bool().unwrap_or(false))
    }

    async fn dismiss_rejection(&self, session: &WorkerSession) -> Result<()> {
        if let Ok(close) = session.page.find_element(self.selectors.captcha_error_close).await {
            if close.click().await.is_ok() {
                return Ok(());
            }
        }
        // Close button can be unclickable mid-animation; hide it directly.
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('{sel}');
                if (el) el.style.display = 'none';
                return true;
            }})()"#,
            sel = self.selectors.captcha_error_modal
        );
        session.eval_json(&script).await?;
        Ok(())
    }
}

/// The portal compares answers exactly, so whitespace an OCR model sneaks in
/// must go. Everything else is preserved as recognized.
pub fn normalize_answer(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_all_whitespace() {
        assert_eq!(normalize_answer(" aB 3x\n9 "), "aB3x9");
        assert_eq!(normalize_answer("abc123"), "abc123");
        assert_eq!(normalize_answer("  \t\n"), "");
    }

    #[test]
    fn test_normalize_preserves_case_and_symbols() {
        assert_eq!(normalize_answer("Xy Z9"), "XyZ9");
        assert_eq!(normalize_answer("a-b"), "a-b");
    }
}

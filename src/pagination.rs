//! Result-table pagination.
//!
//! The portal's results table is a DataTables instance: no URL-addressable
//! pages, only a Next button. Reaching page N therefore means clicking Next
//! N-1 times from the post-CAPTCHA page-1 state, and the authoritative
//! current position is re-derived from the pagination info text rather than
//! trusted from a counter we keep ourselves.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::{WorkerSession, ELEMENT_WAIT};
use crate::core::{Selectors, WorkerError};

/// Outcome of an absolute seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSeek {
    /// The table now shows the requested page.
    Reached,
    /// The result set ended before the requested page.
    Exhausted { stopped_at: u64 },
}

pub struct Paginator {
    selectors: Selectors,
    page_size: u64,
}

impl Paginator {
    pub fn new(selectors: Selectors, page_size: u64) -> Self {
        Self {
            selectors,
            page_size: page_size.max(1),
        }
    }

    // ── Position ─────────────────────────────────────────────────────────────

    /// Current page number as the DOM reports it.
    pub async fn current_page(&self, session: &WorkerSession) -> Result<u64> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('{sel}');
                return el ? el.textContent : '';
            }})()"#,
            sel = self.selectors.page_info
        );
        let text = session
            .eval_json(&script)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        parse_page_from_info(&text, self.page_size)
            .ok_or_else(|| anyhow!("pagination info not parseable: {text:?}"))
    }

    /// Rows-per-page control. Applied once after every (re)initialization;
    /// changing it resets the table to page 1.
    pub async fn set_page_size(&self, session: &WorkerSession, size: u32) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const sel = document.querySelector("{sel}");
                if (!sel) return false;
                sel.value = '{size}';
                sel.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = self.selectors.page_length,
        );
        let ok = session.eval_json(&script).await?.as_bool().unwrap_or(false);
        if !ok {
            return Err(anyhow!("page-size selector not found"));
        }
        self.wait_for_table(session).await?;
        debug!(size, "page size applied");
        Ok(())
    }

    // ── Movement ─────────────────────────────────────────────────────────────

    /// Advance one page. `Ok(false)` means the Next control is disabled, i.e.
    /// the last page has been consumed.
    pub async fn next_page(&self, session: &WorkerSession) -> Result<bool> {
        if self.next_disabled(session).await? {
            return Ok(false);
        }
        let next = session
            .wait_for_element(self.selectors.next_button, ELEMENT_WAIT)
            .await
            .context("next button missing")?;
        next.click()
            .await
            .map_err(|e| anyhow!("next-page click failed: {e}"))?;
        self.wait_for_table(session).await?;
        Ok(true)
    }

    /// Seek from the current (freshly initialized, page-1) state to an
    /// absolute target page by repeated Next clicks.
    ///
    /// Exhaustion of the result set before the target is a normal terminal
    /// outcome, not an error. A click that persistently fails to advance the
    /// reported page is a session fault and surfaces as
    /// [`WorkerError::Session`] so the caller can escalate recovery.
    pub async fn seek(&self, session: &WorkerSession, target: u64) -> Result<PageSeek, WorkerError> {
        let mut current = self
            .current_page(session)
            .await
            .map_err(|e| WorkerError::session(e.to_string()))?;
        if current >= target {
            return Ok(PageSeek::Reached);
        }
        info!(from = current, to = target, "seeking through result pages");

        loop {
            let advanced = self
                .advance_with_retry(session)
                .await
                .map_err(|e| WorkerError::session(e.to_string()))?;
            let reported = if advanced {
                self.current_page(session)
                    .await
                    .map_err(|e| WorkerError::session(e.to_string()))?
            } else {
                current
            };
            match evaluate_seek_step(advanced, current, reported, target) {
                SeekStep::Continue(now) => {
                    current = now;
                    if current % 25 == 0 {
                        debug!(current, target, "seek progress");
                    }
                }
                SeekStep::Done(outcome) => {
                    if let PageSeek::Exhausted { stopped_at } = outcome {
                        info!(stopped_at, target, "result set exhausted during seek");
                    }
                    return Ok(outcome);
                }
                SeekStep::Stuck(at) => {
                    return Err(WorkerError::session(format!(
                        "page did not advance (stuck at {at})"
                    )));
                }
            }
        }
    }

    /// One Next click with a couple of in-place retries for transient DOM
    /// staleness before giving up.
    async fn advance_with_retry(&self, session: &WorkerSession) -> Result<bool> {
        let mut last_err = None;
        for attempt in 1..=3u32 {
            match self.next_page(session).await {
                Ok(advanced) => return Ok(advanced),
                Err(e) => {
                    warn!(attempt, "next-page attempt failed: {e}");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("next-page failed")))
    }

    async fn next_disabled(&self, session: &WorkerSession) -> Result<bool> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('{sel}');
                if (!el) return true;
                return el.classList.contains('disabled');
            }})()"#,
            sel = self.selectors.next_button
        );
        Ok(session.eval_json(&script).await?.as_bool().unwrap_or(true))
    }

    /// Wait for the loading overlay to clear and the table body to be
    /// populated after any action that redraws the table.
    pub async fn wait_for_table(&self, session: &WorkerSession) -> Result<()> {
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        let script = format!(
            r#"(() => {{
                const overlay = document.querySelector('{overlay}');
                const busy = overlay !== null && overlay.offsetParent !== null;
                const body = document.querySelector('{body}');
                const rows = body ? body.querySelectorAll('tr').length : 0;
                return !busy && rows > 0;
            }})()"#,
            overlay = self.selectors.loading_overlay,
            body = self.selectors.table_body,
        );
        loop {
            if session.eval_json(&script).await?.as_bool().unwrap_or(false) {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(anyhow!("results table did not settle within 30s"));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// Verdict of one step of an absolute seek, decided from what the click and
/// the info line reported. Pure so the termination rules are testable
/// without a live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStep {
    /// Advanced to this page; keep clicking.
    Continue(u64),
    /// Terminal: target reached, or Next disabled before the target.
    Done(PageSeek),
    /// The click claimed to advance but the table still reports this page.
    Stuck(u64),
}

/// A disabled Next control before the target is exhaustion (a normal
/// outcome, never an error); a page number that fails to move is a wedged
/// session.
pub fn evaluate_seek_step(advanced: bool, before: u64, reported: u64, target: u64) -> SeekStep {
    if !advanced {
        return SeekStep::Done(PageSeek::Exhausted { stopped_at: before });
    }
    if reported <= before {
        return SeekStep::Stuck(before);
    }
    if reported >= target {
        SeekStep::Done(PageSeek::Reached)
    } else {
        SeekStep::Continue(reported)
    }
}

/// Derive the current page number from DataTables' info line, e.g.
/// `"Showing 101 to 200 of 54,321 entries"` with 100 rows per page is page 2.
///
/// `page_size` is the configured rows-per-page value; the final page may
/// show a shorter window, so `from` is the authoritative coordinate and it
/// must sit exactly on a page boundary for that size.
pub fn parse_page_from_info(text: &str, page_size: u64) -> Option<u64> {
    let page_size = page_size.max(1);
    let digits: Vec<u64> = extract_numbers(text);
    // "Showing X to Y of Z entries" → need at least X and Y.
    if digits.len() < 2 {
        return None;
    }
    let (from, to) = (digits[0], digits[1]);
    if from == 0 || to < from {
        return None;
    }
    let window = to - from + 1;
    if window > page_size || (from - 1) % page_size != 0 {
        return None;
    }
    Some((from - 1) / page_size + 1)
}

fn extract_numbers(text: &str) -> Vec<u64> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if c == ',' && !current.is_empty() {
            // thousands separator inside a number
        } else if !current.is_empty() {
            if let Ok(n) = current.parse() {
                out.push(n);
            }
            current.clear();
        }
    }
    if let Ok(n) = current.parse() {
        out.push(n);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page_first_page() {
        assert_eq!(
            parse_page_from_info("Showing 1 to 100 of 54,321 entries", 100),
            Some(1)
        );
        assert_eq!(
            parse_page_from_info("Showing 1 to 7 of 7 entries", 100),
            Some(1)
        );
    }

    #[test]
    fn test_parse_page_full_pages() {
        assert_eq!(
            parse_page_from_info("Showing 101 to 200 of 54,321 entries", 100),
            Some(2)
        );
        assert_eq!(
            parse_page_from_info("Showing 1,201 to 1,300 of 54,321 entries", 100),
            Some(13)
        );
        assert_eq!(
            parse_page_from_info("Showing 26 to 50 of 900 entries", 25),
            Some(2)
        );
    }

    #[test]
    fn test_parse_page_short_final_page() {
        // 543 full pages of 100, then 21 leftovers on page 544.
        assert_eq!(
            parse_page_from_info("Showing 54,301 to 54,321 of 54,321 entries", 100),
            Some(544)
        );
        // Same window with a configured size of 50 is a different page —
        // the configured size decides, not a guess from the window width.
        assert_eq!(
            parse_page_from_info("Showing 101 to 107 of 107 entries", 50),
            Some(3)
        );
        assert_eq!(
            parse_page_from_info("Showing 101 to 107 of 107 entries", 100),
            Some(2)
        );
    }

    #[test]
    fn test_parse_page_garbage() {
        assert_eq!(parse_page_from_info("", 100), None);
        assert_eq!(parse_page_from_info("Loading...", 100), None);
        assert_eq!(parse_page_from_info("Showing 0 to 0 of 0 entries", 100), None);
        // a window wider than the configured size is inconsistent
        assert_eq!(
            parse_page_from_info("Showing 1 to 100 of 200 entries", 50),
            None
        );
    }

    #[test]
    fn test_seek_exhaustion_is_distinguishable_not_an_error() {
        // Next disabled before the target → Exhausted carrying the stop page.
        assert_eq!(
            evaluate_seek_step(false, 41, 41, 100),
            SeekStep::Done(PageSeek::Exhausted { stopped_at: 41 })
        );
        // Disabled on the very first click from page 1.
        assert_eq!(
            evaluate_seek_step(false, 1, 1, 100),
            SeekStep::Done(PageSeek::Exhausted { stopped_at: 1 })
        );
    }

    #[test]
    fn test_seek_steps_toward_the_target() {
        assert_eq!(evaluate_seek_step(true, 1, 2, 100), SeekStep::Continue(2));
        assert_eq!(
            evaluate_seek_step(true, 99, 100, 100),
            SeekStep::Done(PageSeek::Reached)
        );
    }

    #[test]
    fn test_seek_detects_a_wedged_table() {
        // The click "worked" but the info line still reports the old page.
        assert_eq!(evaluate_seek_step(true, 7, 7, 100), SeekStep::Stuck(7));
        assert_eq!(evaluate_seek_step(true, 7, 3, 100), SeekStep::Stuck(7));
    }
}

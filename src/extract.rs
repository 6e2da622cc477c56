//! Metadata extraction from the results table.
//!
//! One script evaluation pulls every row's raw fields out of the table in a
//! single round trip; the Rust side then parses each row in isolation so one
//! malformed row never poisons its page.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::browser::WorkerSession;
use crate::core::types::JudgmentRecord;
use crate::core::Selectors;

/// Raw per-row fields as scraped from the DOM, before parsing.
#[derive(Debug, Deserialize)]
struct RawRow {
    title: String,
    judge: String,
    details: String,
    button_id: String,
}

pub struct Extractor {
    selectors: Selectors,
}

impl Extractor {
    pub fn new(selectors: Selectors) -> Self {
        Self { selectors }
    }

    /// Scrape the visible result rows into [`JudgmentRecord`]s.
    ///
    /// Rows whose title or download trigger is missing are logged and
    /// skipped; an empty table is an error (the caller expects a settled,
    /// populated page).
    pub async fn extract_page(&self, session: &WorkerSession, page: u64) -> Result<Vec<JudgmentRecord>> {
        let script = format!(
            r#"(() => {{
                const body = document.querySelector('{body}');
                if (!body) return [];
                return Array.from(body.querySelectorAll('tr')).map(tr => {{
                    const btn = tr.querySelector('{trigger}');
                    const cells = Array.from(tr.querySelectorAll('td'));
                    const text = cells.map(td => td.innerText || '').join('\n');
                    const lines = text.split('\n').map(s => s.trim()).filter(s => s.length > 0);
                    return {{
                        title: btn ? (btn.innerText || '').trim() : '',
                        judge: lines.length > 1 ? lines[1] : '',
                        details: lines.filter(l => l.includes('CNR') || l.includes('Decision Date')).join(' | '),
                        button_id: btn ? (btn.id || '') : ''
                    }};
                }});
            }})()"#,
            body = self.selectors.table_body,
            trigger = self.selectors.row_trigger,
        );

        let raw: Vec<RawRow> = serde_json::from_value(session.eval_json(&script).await?)
            .map_err(|e| anyhow!("row scrape result malformed: {e}"))?;
        if raw.is_empty() {
            return Err(anyhow!("results table empty on page {page}"));
        }

        let mut records = Vec::with_capacity(raw.len());
        for (idx, row) in raw.into_iter().enumerate() {
            let row_number = idx + 1;
            if row.title.is_empty() || row.button_id.is_empty() {
                warn!(page, row_number, "skipping row without title or trigger");
                continue;
            }
            let cnr = parse_cnr(&row.details);
            let (decision_date, decision_year) = parse_decision_date(&row.details);
            let filename = derive_filename(&row.title, &cnr, &row.button_id);
            records.push(JudgmentRecord {
                row_number,
                case_title: row.title,
                judge: row.judge,
                cnr,
                decision_date,
                decision_year,
                trigger_id: row.button_id,
                filename,
            });
        }
        debug!(page, rows = records.len(), "page extracted");
        Ok(records)
    }

    /// Read the approximate total-results count from the banner above the
    /// table, e.g. `"About 54,321 results"`. Missing or unparseable banners
    /// are not an error; the count is informational only.
    pub async fn total_results(&self, session: &WorkerSession) -> Result<Option<u64>> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('{sel}');
                return el ? el.textContent : '';
            }})()"#,
            sel = self.selectors.results_banner
        );
        let text = session
            .eval_json(&script)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(parse_total_results(&text))
    }
}

// ── Pure field parsers ───────────────────────────────────────────────────────

/// CNR: the text between `"CNR :"` and the next `"|"`. Both markers must be
/// present; a truncated details string yields an empty CNR rather than a
/// guess at where the field ends. The record is still valid either way.
pub fn parse_cnr(details: &str) -> String {
    let Some(start) = details.find("CNR :") else {
        return String::new();
    };
    let rest = &details[start + "CNR :".len()..];
    let Some(end) = rest.find('|') else {
        return String::new();
    };
    rest[..end].trim().to_string()
}

/// Decision date: the text after `"Decision Date :"` up to the next `"|"`.
/// The year is the trailing 4 characters when they are all digits.
pub fn parse_decision_date(details: &str) -> (String, Option<i32>) {
    let Some(start) = details.find("Decision Date :") else {
        return (String::new(), None);
    };
    let rest = &details[start + "Decision Date :".len()..];
    let end = rest.find('|').unwrap_or(rest.len());
    let date = rest[..end].trim().to_string();
    let year = decision_year(&date);
    (date, year)
}

fn decision_year(date: &str) -> Option<i32> {
    if date.len() < 4 {
        return None;
    }
    let tail: String = date.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if tail.chars().all(|c| c.is_ascii_digit()) {
        tail.parse().ok()
    } else {
        None
    }
}

/// Make a case title safe as a filename across filesystems:
/// `< > : " / \ | ? *` become `_`, whitespace runs collapse to a single `_`,
/// the result is capped at 200 chars and never empty.
pub fn sanitize_filename(raw: &str) -> String {
    const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for c in raw.chars() {
        let mapped = if INVALID.contains(&c) {
            Some('_')
        } else if c.is_whitespace() {
            Some('_')
        } else {
            None
        };
        match mapped {
            Some(sep) => {
                if !last_was_sep {
                    out.push(sep);
                }
                last_was_sep = true;
            }
            None => {
                out.push(c);
                last_was_sep = false;
            }
        }
    }
    let mut out: String = out.trim_matches('_').to_string();
    if out.len() > 200 {
        out.truncate(200);
        // truncation may land mid multi-byte char boundary; back off to one
        while !out.is_char_boundary(out.len()) {
            out.pop();
        }
        out = out.trim_end_matches('_').to_string();
    }
    if out.is_empty() {
        out = "judgment".to_string();
    }
    out
}

/// Deterministic target filename: sanitized title, CNR when present, and the
/// row's trigger id as a uniqueness token.
pub fn derive_filename(title: &str, cnr: &str, trigger_id: &str) -> String {
    let base = sanitize_filename(title);
    let token = sanitize_filename(trigger_id);
    if cnr.is_empty() {
        format!("{base}_{token}.pdf")
    } else {
        format!("{base}_CNR_{}_{token}.pdf", sanitize_filename(cnr))
    }
}

/// `"About 54,321 results"` → 54321. Any other shape → `None`.
pub fn parse_total_results(text: &str) -> Option<u64> {
    let re = regex::Regex::new(r"About\s+([\d,]+)\s+results").ok()?;
    let caps = re.captures(text)?;
    caps[1].replace(',', "").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAILS: &str =
        "CNR : DLHC010012342023 | Decision Date : 15-03-2023 | Disposal Nature : Dismissed";

    #[test]
    fn test_parse_cnr() {
        assert_eq!(parse_cnr(DETAILS), "DLHC010012342023");
        assert_eq!(parse_cnr("CNR : ABC123 | x"), "ABC123");
        assert_eq!(parse_cnr("Decision Date : 15-03-2023"), "");
        // truncated details (marker without a closing pipe) yield no CNR
        assert_eq!(parse_cnr("CNR : ABC123"), "");
    }

    #[test]
    fn test_parse_decision_date() {
        let (date, year) = parse_decision_date(DETAILS);
        assert_eq!(date, "15-03-2023");
        assert_eq!(year, Some(2023));
    }

    #[test]
    fn test_decision_year_rejects_non_numeric_tail() {
        let (date, year) = parse_decision_date("Decision Date : March 15th");
        assert_eq!(date, "March 15th");
        assert_eq!(year, None);
    }

    #[test]
    fn test_sanitize_filename_invalid_chars() {
        assert_eq!(sanitize_filename(r#"A<B>C:D"E/F\G|H?I*J"#), "A_B_C_D_E_F_G_H_I_J");
    }

    #[test]
    fn test_sanitize_filename_whitespace_runs() {
        assert_eq!(sanitize_filename("State  of \t Kerala \n v.  Joseph"), "State_of_Kerala_v._Joseph");
    }

    #[test]
    fn test_sanitize_filename_properties() {
        // For any input: non-empty, <= 200 chars, no invalid chars.
        let inputs = [
            "",
            "   ",
            "///",
            &"x".repeat(500),
            "Normal Title v. Other Party",
        ];
        for input in inputs {
            let out = sanitize_filename(input);
            assert!(!out.is_empty(), "empty output for {input:?}");
            assert!(out.len() <= 200);
            assert!(!out.contains(|c: char| "<>:\"/\\|?*".contains(c) || c.is_whitespace()));
        }
    }

    #[test]
    fn test_derive_filename() {
        assert_eq!(
            derive_filename("A v. B", "CNR001", "link_7"),
            "A_v._B_CNR_CNR001_link_7.pdf"
        );
        assert_eq!(derive_filename("A v. B", "", "link_7"), "A_v._B_link_7.pdf");
    }

    #[test]
    fn test_parse_total_results() {
        assert_eq!(parse_total_results("About 54,321 results"), Some(54321));
        assert_eq!(parse_total_results("About 7 results"), Some(7));
        assert_eq!(parse_total_results("no banner"), None);
    }
}

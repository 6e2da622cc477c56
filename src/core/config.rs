use std::path::{Path, PathBuf};

use crate::core::types::WorkerAssignment;

// ---------------------------------------------------------------------------
// Settings — file-based config loader (verdex.json) with env-var fallback
// ---------------------------------------------------------------------------

/// Vision/LLM sub-config (mirrors the `vision` key in verdex.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct VisionConfig {
    /// OpenAI-compatible endpoint — e.g. `https://api.openai.com/v1` or
    /// `http://localhost:11434/v1` (Ollama). Image understanding required.
    pub base_url: Option<String>,
    /// API key. Never logged. Leave blank for key-less local endpoints.
    pub api_key: Option<String>,
    /// Ordered model fallback list. The solver walks this list on timeout,
    /// malformed response, or explicit rejection.
    pub models: Option<Vec<String>>,
    /// Per-request timeout in seconds. Default: 30.
    pub request_timeout_secs: Option<u64>,
}

impl VisionConfig {
    /// API key: JSON field → `OPENAI_API_KEY` env var → `None`.
    ///
    /// An explicit empty string means "no key required" (local endpoint).
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.trim().to_string());
        }
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    /// Endpoint: JSON field → `OPENAI_BASE_URL` env var → OpenAI default.
    pub fn resolve_base_url(&self) -> String {
        if let Some(u) = &self.base_url {
            if !u.trim().is_empty() {
                return u.clone();
            }
        }
        std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
    }

    /// Model fallback order: JSON field → `VERDEX_VISION_MODELS` (comma
    /// separated) → a single sensible default.
    pub fn resolve_models(&self) -> Vec<String> {
        if let Some(m) = &self.models {
            if !m.is_empty() {
                return m.clone();
            }
        }
        if let Ok(v) = std::env::var("VERDEX_VISION_MODELS") {
            let models: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !models.is_empty() {
                return models;
            }
        }
        vec!["gpt-4o-mini".to_string()]
    }

    pub fn resolve_request_timeout_secs(&self) -> u64 {
        if let Some(n) = self.request_timeout_secs {
            return n;
        }
        std::env::var("VERDEX_VISION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30)
    }
}

/// Object-storage sub-config (mirrors the `storage` key in verdex.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct StorageConfig {
    pub bucket: Option<String>,
    /// Flat key prefix the derived filenames land under. Default: `judgements/`.
    pub key_prefix: Option<String>,
}

impl StorageConfig {
    pub fn resolve_bucket(&self) -> Option<String> {
        if let Some(b) = &self.bucket {
            if !b.trim().is_empty() {
                return Some(b.clone());
            }
        }
        std::env::var("VERDEX_S3_BUCKET")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    pub fn resolve_key_prefix(&self) -> String {
        if let Some(p) = &self.key_prefix {
            if !p.trim().is_empty() {
                return p.clone();
            }
        }
        std::env::var("VERDEX_S3_PREFIX")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "judgements/".to_string())
    }
}

/// Top-level config loaded from `verdex.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct Settings {
    /// Search portal entry URL.
    pub portal_url: Option<String>,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Files per upload batch. Default: 25.
    pub batch_size: Option<usize>,
    /// Results-per-page selector value applied after every (re)init. Default: 100.
    pub page_size: Option<u32>,
    /// Base remote-debugging port; the worker id is added on top. Default: 9222.
    pub debug_port_base: Option<u16>,
    /// Directory for checkpoints, staging and artifacts. Default: cwd.
    pub data_dir: Option<String>,
    /// Optional webhook receiving error/completion/shutdown notifications.
    pub notify_webhook_url: Option<String>,
}

impl Settings {
    pub fn resolve_portal_url(&self) -> String {
        if let Some(u) = &self.portal_url {
            if !u.trim().is_empty() {
                return u.clone();
            }
        }
        std::env::var("VERDEX_PORTAL_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://judgments.ecourts.gov.in/pdfsearch/index.php".to_string())
    }

    pub fn resolve_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(25).max(1)
    }

    pub fn resolve_page_size(&self) -> u32 {
        self.page_size.unwrap_or(100)
    }

    pub fn resolve_debug_port_base(&self) -> u16 {
        self.debug_port_base.unwrap_or(9222)
    }

    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(d) = &self.data_dir {
            if !d.trim().is_empty() {
                return PathBuf::from(d);
            }
        }
        std::env::var("VERDEX_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn resolve_notify_webhook_url(&self) -> Option<String> {
        if let Some(u) = &self.notify_webhook_url {
            if !u.trim().is_empty() {
                return Some(u.clone());
            }
        }
        std::env::var("VERDEX_NOTIFY_WEBHOOK")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

/// Load `verdex.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `VERDEX_CONFIG` env var path
/// 2. `./verdex.json` (process cwd)
/// 3. `../verdex.json` (repo root when running from a subdir)
/// 4. `<user config dir>/verdex/verdex.json`
///
/// Missing file → `Settings::default()` (silent, all env-var fallbacks apply).
/// Parse error → log a warning, return `Settings::default()`.
pub fn load_settings() -> Settings {
    let candidates: Vec<PathBuf> = {
        let mut v = vec![
            PathBuf::from("verdex.json"),
            PathBuf::from("../verdex.json"),
        ];
        if let Some(config_dir) = dirs::config_dir() {
            v.push(config_dir.join("verdex").join("verdex.json"));
        }
        if let Ok(env_path) = std::env::var("VERDEX_CONFIG") {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(cfg) => {
                    tracing::info!("verdex.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "verdex.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return Settings::default();
                }
            },
            Err(_) => continue, // not found at this path — try next
        }
    }

    Settings::default()
}

// ---------------------------------------------------------------------------
// Worker assignment config (shared, read-only)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
struct AssignmentFile {
    workers: Vec<WorkerAssignment>,
}

/// Read the per-worker page-range assignment from the shared config file.
///
/// Returns `None` when the file is missing or holds no entry for this worker;
/// the caller decides whether to fall back to an unbounded full-range run.
pub fn load_assignment(path: &Path, worker_id: u32) -> anyhow::Result<Option<WorkerAssignment>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => {
            tracing::warn!("assignment config not found: {}", path.display());
            return Ok(None);
        }
    };
    let file: AssignmentFile = serde_json::from_str(&contents)?;
    Ok(file.workers.into_iter().find(|w| w.worker_id == worker_id))
}

// ---------------------------------------------------------------------------
// Portal DOM selectors
// ---------------------------------------------------------------------------

/// CSS selectors for the portal's interactive surface, collected in one place
/// so a markup change is a one-file fix.
#[derive(Debug, Clone)]
pub struct Selectors {
    pub captcha_image: &'static str,
    pub captcha_input: &'static str,
    pub captcha_submit: &'static str,
    pub captcha_error_modal: &'static str,
    pub captcha_error_close: &'static str,
    pub loading_overlay: &'static str,
    pub results_container: &'static str,
    pub results_banner: &'static str,
    pub table_body: &'static str,
    pub row_trigger: &'static str,
    pub next_button: &'static str,
    pub page_info: &'static str,
    pub page_length: &'static str,
    pub viewer_modal: &'static str,
    pub viewer_close: &'static str,
    pub viewer_object: &'static str,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            captcha_image: "#captcha_image",
            captcha_input: "#captcha",
            captcha_submit: "#main_search",
            captcha_error_modal: "#validateError",
            captcha_error_close: "#validateError button.btn-close",
            loading_overlay: "#loadMe",
            results_container: "#div_container",
            results_banner: "#search_timer",
            table_body: "#report_body",
            row_trigger: "button.btn-link",
            next_button: "#example_pdf_next",
            page_info: ".dataTables_info",
            page_length: "select[name='example_pdf_length']",
            viewer_modal: "#viewFiles",
            viewer_close: "#modal_close",
            viewer_object: "#viewFiles-body object, #viewFiles-body embed",
        }
    }
}

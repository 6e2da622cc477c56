use thiserror::Error;

/// Failure taxonomy for the scraping worker.
///
/// * `Transient` — retried locally within the owning component, never escalates.
/// * `Session`   — the browser session is suspect; routed through the recovery
///   protocol (reinit first, full re-creation on escalation).
/// * `DataQuality` — a single row/response is bad; recorded and skipped.
/// * `Interrupted` — the shutdown signal was raised mid-operation; final
///   checkpoint flush, then clean exit 0.
/// * `BrowserInit` / `Fatal` — terminal for the run: final checkpoint flush,
///   shutdown notification, exit 1.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("browser failed to start after {attempts} attempts: {message}")]
    BrowserInit { attempts: u32, message: String },

    #[error("interrupted by shutdown signal")]
    Interrupted,

    #[error("session error: {0}")]
    Session(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("bad row data: {0}")]
    DataQuality(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkerError {
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether this error should be routed through the recovery protocol
    /// rather than handled (or recorded) in place.
    pub fn needs_recovery(&self) -> bool {
        matches!(self, Self::Session(_))
    }

    /// A user-requested stop, not a failure. Maps to exit code 0.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

//! verdex — resilient bulk retrieval of court-judgment PDFs.
//!
//! A fleet of independent workers, each owning one isolated browser session
//! and one page range of the portal's result set, downloads judgment PDFs
//! and ships them to object storage in verified batches. Durable JSON
//! checkpoints make every worker resumable after crash, kill or reboot, and
//! a tiered recovery ladder keeps a worker alive through the portal's
//! instability.

pub mod batch;
pub mod browser;
pub mod captcha;
pub mod checkpoint;
pub mod core;
pub mod download;
pub mod extract;
pub mod notify;
pub mod pagination;
pub mod recovery;
pub mod storage;
pub mod worker;

pub use crate::core::{load_assignment, load_settings, Selectors, Settings, WorkerError};
pub use crate::worker::Worker;

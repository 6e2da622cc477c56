pub mod config;
pub mod error;
pub mod types;

pub use config::{load_assignment, load_settings, Selectors, Settings};
pub use error::WorkerError;

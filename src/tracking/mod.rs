//! File-backed experiment tracking: runs, experiments, parameters, metrics,
//! tags, artifacts, and a versioned model registry.
//!
//! The store keeps everything under one root directory:
//!
//! ```text
//! <root>/<experiment_id>/meta.json
//! <root>/<experiment_id>/<run_id>/{meta.json, params/, metrics/, tags/, artifacts/}
//! <root>/models/<name>/meta.json
//! ```
//!
//! Parameters are write-once per key, metrics are append-only time series,
//! tags are mutable. A run is sealed when its handle goes out of scope,
//! whether training finished or failed.

mod registry;
mod run;
mod store;
mod summary;

pub use registry::{ModelRegistry, ModelVersion, RegisteredModel};
pub use run::{ActiveRun, RunStatus};
pub use store::{RunData, TrackingStore};
pub use summary::{filtered_tags, print_run_info, RESERVED_TAG_PREFIX};

use thiserror::Error;

/// Errors raised by the tracking store and model registry.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to read or write store metadata: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("registered model '{0}' already exists")]
    ResourceAlreadyExists(String),
    #[error("registered model '{0}' does not exist")]
    ModelNotFound(String),
    #[error("run '{0}' does not exist")]
    RunNotFound(String),
    #[error("parameter '{key}' is already logged with value '{existing}'")]
    ParamAlreadyLogged { key: String, existing: String },
}

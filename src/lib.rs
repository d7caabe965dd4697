//! Trains a small two-layer MNIST classifier with [burn] and records
//! parameters, metrics, and model artifacts for each run in a file-backed
//! experiment-tracking store.
//!
//! The pieces:
//! - [`data`]: dataset splits, flatten/normalize, one-hot encoding, batching
//! - [`model`]: the fixed Dense(512, relu) → Dense(10, softmax) architecture
//! - [`training`]: fit/evaluate orchestration and logging-mode selection
//! - [`inference`]: prediction-input dispatch by file suffix
//! - [`tracking`]: runs, experiments, artifacts, and the model registry

pub mod data;
pub mod inference;
pub mod model;
pub mod tracking;
pub mod training;

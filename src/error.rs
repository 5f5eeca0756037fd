//! Error types for the blending engine

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum BlendError {
    #[error("Unsupported metric: {0}")]
    UnsupportedMetric(String),

    #[error("At least one model is required, got {0}")]
    InsufficientModels(usize),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    #[error("Stacking failed: {0}")]
    Stacking(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
}

pub type Result<T> = std::result::Result<T, BlendError>;

//! Error types for turbcast-rs.
//!
//! Three failure classes come out of the forecasting core:
//! - [`TurbcastError::Configuration`] for unrecognized modes or invalid sizes at construction
//! - [`TurbcastError::ShapeMismatch`] for tensor rank/extent preconditions
//! - [`TurbcastError::StateIndex`] for hidden-state depth requested out of order
//!
//! Everything else wraps the underlying substrate (candle, IO, serde).
//!
//! # Example
//!
//! ```rust
//! use turbcast_rs::{Result, TurbcastError};
//!
//! fn check_layers(num_layers: usize) -> Result<()> {
//!     if num_layers == 0 {
//!         return Err(TurbcastError::configuration("num_layers must be > 0"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_layers(0).is_err());
//! assert!(check_layers(2).is_ok());
//! ```

use thiserror::Error;

/// Result type alias for turbcast-rs operations.
pub type Result<T> = std::result::Result<T, TurbcastError>;

/// Errors that can occur in turbcast-rs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TurbcastError {
    /// Unrecognized mode tag or invalid size at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tensor rank or extent precondition violated.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// What the operation required.
        expected: String,
        /// What it was given.
        got: String,
    },

    /// Hidden-state depth requested beyond the next representable layer.
    #[error(
        "hidden state index error: requested layer {requested} with depth {depth} (capacity {capacity})"
    )]
    StateIndex {
        /// Layer index that was requested.
        requested: usize,
        /// Number of layers currently represented.
        depth: usize,
        /// Maximum number of layers the state can hold.
        capacity: usize,
    },

    /// Tensor operation failed.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid YAML configuration file.
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Checkpoint save/load error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Dataset error.
    #[error("data error: {0}")]
    Data(String),

    /// Training loop error.
    #[error("training error: {0}")]
    Training(String),
}

impl TurbcastError {
    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}

//! Discrete spatio-temporal forecasting of turbulence with a convolutional LSTM
//!
//! Velocity fields are compressed by an external vector-quantized autoencoder
//! into integer code fields. This crate learns to predict future code fields
//! from a history of past ones and checks the physics of the decoded result:
//! - Code embedding with masked prediction horizon ([`assembly`])
//! - 3×3×3 convolution blocks and gated ConvLSTM layers ([`conv`], [`cell`])
//! - Explicit hidden-state lifecycle across truncated-history windows ([`state`])
//! - Cross-entropy training, stateless evaluation and cyclic rollout ([`trainer`])
//! - Energy spectra, PDFs and velocity-gradient invariants ([`diagnostics`])
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use turbcast_rs::{ConvLstm, ConvLstmConfig, ForecastInput};
//!
//! # fn main() -> turbcast_rs::Result<()> {
//! let config = ConvLstmConfig::test();
//! let device = Device::Cpu;
//! let mut model = ConvLstm::new(&config, &device)?;
//!
//! let input = ForecastInput {
//!     code: Tensor::zeros((1, config.bptt, 4, 4, 4), DType::U32, &device)?,
//!     ncode: Tensor::zeros((1, config.pred_length, 4, 4, 4), DType::U32, &device)?,
//! };
//! let output = model.forward(&input, None, false)?;
//! assert_eq!(output.code.dims(), &[1, config.pred_length, 4, 4, 4]);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod assembly;
pub mod autoencoder;
pub mod cell;
pub mod checkpoint;
pub mod config;
pub mod conv;
pub mod data;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod model;
pub mod norm;
pub mod optimizer;
pub mod running_stats;
pub mod scheduler;
pub mod spectral;
pub mod state;
pub mod trainer;

pub use activation::ActivationMode;
pub use autoencoder::{CodeAutoencoder, CodebookAutoencoder};
pub use config::{ConvLstmConfig, DiagnosticsConfig, EvaluationConfig, TrainingConfig, TurbcastConfig};
pub use diagnostics::{DiagnosticsReport, Pdf1d, Pdf2d, VgStatistics};
pub use error::{Result, TurbcastError};
pub use model::{ConvLstm, ForecastInput, ForecastOutput};
pub use norm::NormalizationMode;
pub use running_stats::RunningStats;
pub use state::{HiddenState, LayerState, StatePhase};
pub use trainer::{rollout, PhysicsTargets, Rollout, Trainer};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::autoencoder::CodeAutoencoder;
    pub use crate::config::{ConvLstmConfig, TurbcastConfig};
    pub use crate::error::{Result, TurbcastError};
    pub use crate::model::{ConvLstm, ForecastInput, ForecastOutput};
    pub use crate::state::HiddenState;
    pub use crate::trainer::Trainer;
}

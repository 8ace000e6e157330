//! Configuration parsing and validation.
//!
//! The model core only ever sees [`ConvLstmConfig`], captured at
//! construction; the remaining sections drive the training/evaluation
//! loops, the diagnostics and the CLI.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::activation::ActivationMode;
use crate::error::{Result, TurbcastError};
use crate::norm::NormalizationMode;
use crate::scheduler::SchedulerKind;

/// Top-level configuration.
///
/// # Example
///
/// ```rust
/// use turbcast_rs::TurbcastConfig;
///
/// # fn main() -> turbcast_rs::Result<()> {
/// let config = TurbcastConfig::from_preset("test")?;
/// config.validate()?;
/// assert_eq!(config.model.num_layers, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurbcastConfig {
    /// Forecasting model.
    pub model: ConvLstmConfig,

    /// Training loop.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Turbulence diagnostics.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Evaluation loop.
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Code sequence files.
    #[serde(default)]
    pub data: DataConfig,

    /// Output directory for checkpoints and reports.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./output".into()
}

fn default_seed() -> u64 {
    0
}

/// ConvLSTM hyper-parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvLstmConfig {
    /// Number of stacked recurrent layers.
    pub num_layers: usize,
    /// Channels entering layer 0 (must equal `embedding_size`).
    pub input_size: usize,
    /// Hidden/cell channels of every layer.
    pub output_size: usize,
    /// Width of the code embedding.
    pub embedding_size: usize,
    /// Vocabulary size of the autoencoder codebook.
    pub num_embedding: usize,
    /// Known history steps per call.
    pub bptt: usize,
    /// Predicted steps per call.
    pub pred_length: usize,
    /// Normalization inside gate convolutions.
    #[serde(default)]
    pub normalization: NormalizationMode,
    /// Cell-candidate and hidden-output nonlinearity.
    #[serde(default)]
    pub activation: ActivationMode,
}

impl ConvLstmConfig {
    /// Small configuration for unit tests.
    #[must_use]
    pub fn test() -> Self {
        Self {
            num_layers: 2,
            input_size: 4,
            output_size: 4,
            embedding_size: 4,
            num_embedding: 8,
            bptt: 2,
            pred_length: 1,
            normalization: NormalizationMode::None,
            activation: ActivationMode::Tanh,
        }
    }

    /// Sequence length seen by the recurrence (`bptt + pred_length`).
    #[must_use]
    pub fn window_length(&self) -> usize {
        self.bptt + self.pred_length
    }

    /// Check structural constraints.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(TurbcastError::configuration("model.num_layers must be > 0"));
        }
        if self.output_size == 0 {
            return Err(TurbcastError::configuration("model.output_size must be > 0"));
        }
        if self.embedding_size == 0 {
            return Err(TurbcastError::configuration("model.embedding_size must be > 0"));
        }
        if self.input_size != self.embedding_size {
            return Err(TurbcastError::configuration(format!(
                "model.input_size ({}) must equal model.embedding_size ({})",
                self.input_size, self.embedding_size
            )));
        }
        if self.num_embedding == 0 {
            return Err(TurbcastError::configuration("model.num_embedding must be > 0"));
        }
        if self.pred_length == 0 {
            return Err(TurbcastError::configuration("model.pred_length must be > 0"));
        }
        Ok(())
    }
}

/// Training loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// AdamW weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Global gradient-norm clip.
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,

    /// Learning rate schedule, stepped once per epoch.
    #[serde(default)]
    pub scheduler: SchedulerKind,

    /// Fraction of an epoch between progress log lines.
    #[serde(default = "default_log_interval")]
    pub log_interval: f64,
}

fn default_epochs() -> usize {
    200
}
fn default_lr() -> f64 {
    1e-3
}
fn default_grad_norm() -> f64 {
    1.0
}
fn default_log_interval() -> f64 {
    0.25
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            learning_rate: default_lr(),
            weight_decay: 0.0,
            max_grad_norm: default_grad_norm(),
            scheduler: SchedulerKind::default(),
            log_interval: default_log_interval(),
        }
    }
}

/// Turbulence diagnostics settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Required grid extent of velocity-gradient fields.
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,

    /// Bins of the 1D PDFs.
    #[serde(default = "default_num_bins")]
    pub num_bins: usize,

    /// Bin width of the R-Q joint PDF.
    #[serde(default = "default_binwidth")]
    pub pdf2d_binwidth: f64,
}

fn default_grid_size() -> usize {
    128
}
fn default_num_bins() -> usize {
    1500
}
fn default_binwidth() -> f64 {
    12.0
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            grid_size: default_grid_size(),
            num_bins: default_num_bins(),
            pdf2d_binwidth: default_binwidth(),
        }
    }
}

/// Evaluation loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Feed predicted codes back as the next window's history.
    #[serde(default = "default_true")]
    pub cyclic_prediction: bool,

    /// Temporal subsampling of the evaluated sequence.
    #[serde(default = "default_increment")]
    pub data_increment: usize,
}

fn default_true() -> bool {
    true
}
fn default_increment() -> usize {
    1
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            cyclic_prediction: true,
            data_increment: 1,
        }
    }
}

/// Locations of encoded code sequences (safetensors, key `code`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Training codes `[B, T, d, h, w]`.
    #[serde(default)]
    pub train_codes: String,

    /// Test codes `[B, T, d, h, w]`.
    #[serde(default)]
    pub test_codes: String,
}

impl TurbcastConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"turb"` - 128³ isotropic turbulence encoded to a 32³ code field
    /// - `"test"` - tiny model for tests and smoke runs
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "turb" => Ok(Self::turb_preset()),
            "test" => Ok(Self::test_preset()),
            _ => Err(TurbcastError::configuration(format!("Unknown preset: {preset}"))),
        }
    }

    /// Preset for the 128³ turbulence data set.
    #[must_use]
    pub fn turb_preset() -> Self {
        Self {
            model: ConvLstmConfig {
                num_layers: 2,
                input_size: 64,
                output_size: 64,
                embedding_size: 64,
                num_embedding: 512,
                bptt: 4,
                pred_length: 1,
                normalization: NormalizationMode::None,
                activation: ActivationMode::Tanh,
            },
            training: TrainingConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            evaluation: EvaluationConfig::default(),
            data: DataConfig {
                train_codes: "./output/code/train.safetensors".into(),
                test_codes: "./output/code/test.safetensors".into(),
            },
            output_dir: default_output_dir(),
            seed: default_seed(),
        }
    }

    /// Preset with a tiny model.
    #[must_use]
    pub fn test_preset() -> Self {
        Self {
            model: ConvLstmConfig::test(),
            training: TrainingConfig {
                epochs: 2,
                ..Default::default()
            },
            diagnostics: DiagnosticsConfig {
                grid_size: 8,
                num_bins: 32,
                pdf2d_binwidth: 1.0,
            },
            evaluation: EvaluationConfig::default(),
            data: DataConfig::default(),
            output_dir: "./output/test".into(),
            seed: 0,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;

        if self.training.learning_rate <= 0.0 {
            return Err(TurbcastError::configuration("training.learning_rate must be > 0"));
        }
        if self.training.max_grad_norm <= 0.0 {
            return Err(TurbcastError::configuration("training.max_grad_norm must be > 0"));
        }
        if self.diagnostics.num_bins == 0 {
            return Err(TurbcastError::configuration("diagnostics.num_bins must be > 0"));
        }
        if self.diagnostics.pdf2d_binwidth <= 0.0 {
            return Err(TurbcastError::configuration(
                "diagnostics.pdf2d_binwidth must be > 0",
            ));
        }
        if self.evaluation.data_increment == 0 {
            return Err(TurbcastError::configuration(
                "evaluation.data_increment must be > 0",
            ));
        }
        Ok(())
    }
}

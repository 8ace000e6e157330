//! Normalization modes for volumetric feature maps.
//!
//! Inputs are laid out `[batch, channels, depth, height, width]`. Instance and
//! layer normalization are written with basic tensor ops (mean, variance,
//! broadcast) so they run on every backend candle supports; batch
//! normalization delegates to `candle_nn::BatchNorm`, which tracks running
//! statistics for evaluation.

use std::fmt;
use std::str::FromStr;

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurbcastError};

const NORM_EPS: f64 = 1e-5;

/// Normalization mode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NormalizationMode {
    /// No normalization.
    #[default]
    None,
    /// Batch normalization over `(batch, *spatial)` per channel (`bn`).
    Batch,
    /// Instance normalization over `*spatial` per sample and channel (`in`).
    Instance,
    /// Layer normalization over channels per sample and location (`ln`).
    Layer,
}

impl NormalizationMode {
    /// Tag used in configuration files.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Batch => "bn",
            Self::Instance => "in",
            Self::Layer => "ln",
        }
    }
}

impl FromStr for NormalizationMode {
    type Err = TurbcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "bn" => Ok(Self::Batch),
            "in" => Ok(Self::Instance),
            "ln" => Ok(Self::Layer),
            other => Err(TurbcastError::configuration(format!(
                "not a valid normalization: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for NormalizationMode {
    type Error = TurbcastError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NormalizationMode> for String {
    fn from(mode: NormalizationMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layer normalization across the channel axis of a `[B, C, ...]` tensor.
///
/// y = (x - mean_c(x)) / sqrt(var_c(x) + eps) * weight + bias
#[derive(Debug, Clone)]
pub struct ChannelLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl ChannelLayerNorm {
    /// Create a channel layer norm with unit weight and zero bias.
    pub fn new(channels: usize, eps: f64, vb: VarBuilder) -> CandleResult<Self> {
        let weight = vb.get_with_hints(channels, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let channels = self.weight.dim(0)?;
        let mut affine_shape = vec![1; x.rank()];
        affine_shape[1] = channels;

        let mean = x.mean_keepdim(1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(1)?;
        let normalized = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;

        normalized
            .broadcast_mul(&self.weight.reshape(affine_shape.as_slice())?)?
            .broadcast_add(&self.bias.reshape(affine_shape.as_slice())?)
    }
}

/// Instance normalization without affine parameters.
///
/// Each `(sample, channel)` slice is standardized over its spatial extent.
pub fn instance_norm(x: &Tensor, eps: f64) -> CandleResult<Tensor> {
    let (batch, channels) = (x.dim(0)?, x.dim(1)?);
    let flat = x.flatten_from(2)?;

    let mean = flat.mean_keepdim(2)?;
    let centered = flat.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(2)?;
    let normalized = centered.broadcast_div(&(var + eps)?.sqrt()?)?;

    let mut dims = vec![batch, channels];
    dims.extend_from_slice(&x.dims()[2..]);
    normalized.reshape(dims)
}

/// Resolved normalization strategy.
#[derive(Debug, Clone)]
pub enum Normalization {
    /// Pass-through.
    Identity,
    /// Batch statistics in training, running statistics in evaluation.
    Batch(BatchNorm),
    /// Per-sample per-channel spatial standardization.
    Instance,
    /// Per-location channel standardization with learned affine.
    Layer(ChannelLayerNorm),
}

impl Normalization {
    /// Resolve a mode into a strategy sized for `channels` features.
    pub fn new(mode: NormalizationMode, channels: usize, vb: VarBuilder) -> CandleResult<Self> {
        let norm = match mode {
            NormalizationMode::None => Self::Identity,
            NormalizationMode::Batch => {
                let config = BatchNormConfig {
                    eps: NORM_EPS,
                    ..BatchNormConfig::default()
                };
                Self::Batch(candle_nn::batch_norm(channels, config, vb)?)
            }
            NormalizationMode::Instance => Self::Instance,
            NormalizationMode::Layer => Self::Layer(ChannelLayerNorm::new(channels, NORM_EPS, vb)?),
        };
        Ok(norm)
    }
}

impl ModuleT for Normalization {
    fn forward_t(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Batch(bn) => bn.forward_t(x, train),
            Self::Instance => instance_norm(x, NORM_EPS),
            Self::Layer(ln) => ln.forward(x),
        }
    }
}

//! Activation modes and their resolved strategies.
//!
//! The mode tag is a closed enumeration parsed once (from config or a string);
//! [`Activation::new`] resolves it into a concrete strategy that owns any
//! learned parameter (only PReLU has one). Unknown tags fail at parse time.

use std::fmt;
use std::str::FromStr;

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::{Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurbcastError};

const SELU_ALPHA: f64 = 1.673_263_242_354_377_3;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;
const PRELU_INIT: f64 = 0.25;

/// Activation mode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActivationMode {
    /// Identity.
    None,
    /// Hyperbolic tangent.
    #[default]
    Tanh,
    /// `clamp(x, -1, 1)`.
    HardTanh,
    /// Rectified linear unit.
    Relu,
    /// ReLU with a learned negative slope (single parameter).
    Prelu,
    /// Exponential linear unit, alpha = 1.
    Elu,
    /// Scaled ELU.
    Selu,
    /// Continuously differentiable ELU, alpha = 1.
    Celu,
    /// Logistic sigmoid.
    Sigmoid,
    /// Softmax over the channel axis.
    Softmax,
}

impl ActivationMode {
    /// Tag used in configuration files.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tanh => "tanh",
            Self::HardTanh => "hardtanh",
            Self::Relu => "relu",
            Self::Prelu => "prelu",
            Self::Elu => "elu",
            Self::Selu => "selu",
            Self::Celu => "celu",
            Self::Sigmoid => "sigmoid",
            Self::Softmax => "softmax",
        }
    }
}

impl FromStr for ActivationMode {
    type Err = TurbcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "tanh" => Ok(Self::Tanh),
            "hardtanh" => Ok(Self::HardTanh),
            "relu" => Ok(Self::Relu),
            "prelu" => Ok(Self::Prelu),
            "elu" => Ok(Self::Elu),
            "selu" => Ok(Self::Selu),
            "celu" => Ok(Self::Celu),
            "sigmoid" => Ok(Self::Sigmoid),
            "softmax" => Ok(Self::Softmax),
            other => Err(TurbcastError::configuration(format!(
                "not a valid activation: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for ActivationMode {
    type Error = TurbcastError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ActivationMode> for String {
    fn from(mode: ActivationMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved activation strategy.
#[derive(Debug, Clone)]
pub enum Activation {
    /// Pass-through.
    Identity,
    /// `tanh(x)`.
    Tanh,
    /// `clamp(x, -1, 1)`.
    HardTanh,
    /// `max(x, 0)`.
    Relu,
    /// `max(x, 0) + a * min(x, 0)` with learned `a`.
    Prelu {
        /// Negative slope, shape `[1]`.
        weight: Tensor,
    },
    /// ELU with the given alpha, optionally scaled (SELU).
    Elu {
        /// Negative saturation value.
        alpha: f64,
        /// Output scale (1.0 for ELU/CELU).
        scale: f64,
    },
    /// `1 / (1 + exp(-x))`.
    Sigmoid,
    /// Softmax along dim 1.
    Softmax,
}

impl Activation {
    /// Resolve a mode into a strategy. Only PReLU allocates a parameter.
    pub fn new(mode: ActivationMode, vb: VarBuilder) -> CandleResult<Self> {
        let activation = match mode {
            ActivationMode::None => Self::Identity,
            ActivationMode::Tanh => Self::Tanh,
            ActivationMode::HardTanh => Self::HardTanh,
            ActivationMode::Relu => Self::Relu,
            ActivationMode::Prelu => {
                let weight = vb.get_with_hints(1, "weight", candle_nn::Init::Const(PRELU_INIT))?;
                Self::Prelu { weight }
            }
            ActivationMode::Elu | ActivationMode::Celu => Self::Elu {
                alpha: 1.0,
                scale: 1.0,
            },
            ActivationMode::Selu => Self::Elu {
                alpha: SELU_ALPHA,
                scale: SELU_SCALE,
            },
            ActivationMode::Sigmoid => Self::Sigmoid,
            ActivationMode::Softmax => Self::Softmax,
        };
        Ok(activation)
    }

    /// Parameter-free strategy for modes that need no learned state.
    ///
    /// Used for the LSTM gate nonlinearities, which are always sigmoid.
    #[must_use]
    pub fn sigmoid() -> Self {
        Self::Sigmoid
    }
}

/// ELU built from basic ops: `scale * (relu(x) + alpha * (exp(min(x, 0)) - 1))`.
///
/// Taking `min(x, 0)` before `exp` keeps the positive branch finite.
fn elu(x: &Tensor, alpha: f64, scale: f64) -> CandleResult<Tensor> {
    let positive = x.relu()?;
    let negative = x.minimum(0f32)?.exp()?.affine(alpha, -alpha)?;
    (positive + negative)?.affine(scale, 0.0)
}

impl Module for Activation {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Tanh => x.tanh(),
            Self::HardTanh => x.clamp(-1f32, 1f32),
            Self::Relu => x.relu(),
            Self::Prelu { weight } => {
                let negative = x.minimum(0f32)?.broadcast_mul(weight)?;
                x.relu()? + negative
            }
            Self::Elu { alpha, scale } => elu(x, *alpha, *scale),
            Self::Sigmoid => candle_nn::ops::sigmoid(x),
            Self::Softmax => candle_nn::ops::softmax(x, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(mode: ActivationMode) -> Activation {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Activation::new(mode, vb).unwrap()
    }

    fn apply(mode: ActivationMode, values: &[f32]) -> Vec<f32> {
        let x = Tensor::new(values, &Device::Cpu).unwrap();
        build(mode).forward(&x).unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_parse_all_modes() {
        for tag in [
            "none", "tanh", "hardtanh", "relu", "prelu", "elu", "selu", "celu", "sigmoid",
            "softmax",
        ] {
            let mode: ActivationMode = tag.parse().unwrap();
            assert_eq!(mode.as_str(), tag);
        }
    }

    #[test]
    fn test_parse_unknown_mode() {
        let err = "swish".parse::<ActivationMode>().unwrap_err();
        assert!(matches!(err, TurbcastError::Configuration(_)));
    }

    #[test]
    fn test_hardtanh_and_relu() {
        assert_eq!(
            apply(ActivationMode::HardTanh, &[-3.0, -0.5, 0.5, 3.0]),
            vec![-1.0, -0.5, 0.5, 1.0]
        );
        assert_eq!(apply(ActivationMode::Relu, &[-2.0, 0.0, 2.0]), vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_prelu_negative_slope() {
        let out = apply(ActivationMode::Prelu, &[-4.0, 2.0]);
        assert!((out[0] + 1.0).abs() < 1e-6);
        assert!((out[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_elu_and_selu() {
        let out = apply(ActivationMode::Elu, &[-1.0, 1.0]);
        assert!((out[0] - ((-1.0f32).exp() - 1.0)).abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);

        let out = apply(ActivationMode::Selu, &[1.0]);
        assert!((out[0] - SELU_SCALE as f32).abs() < 1e-5);
    }

    #[test]
    fn test_softmax_over_channels() {
        let x = Tensor::randn(0f32, 1.0, (2, 4, 3), &Device::Cpu).unwrap();
        let y = build(ActivationMode::Softmax).forward(&x).unwrap();
        let sums: Vec<Vec<f32>> = y.sum(1).unwrap().to_vec2().unwrap();
        for row in sums {
            for v in row {
                assert!((v - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_serde_roundtrip_tag() {
        let yaml = serde_yaml::to_string(&ActivationMode::HardTanh).unwrap();
        assert_eq!(yaml.trim(), "hardtanh");
        assert!(serde_yaml::from_str::<ActivationMode>("bogus").is_err());
    }
}

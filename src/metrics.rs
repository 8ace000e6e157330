//! Per-window evaluation metrics and a weighted running logger.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurbcastError};
use crate::model::{ForecastInput, ForecastOutput};
use crate::spectral::spectral_derivative_3d;

/// Mean cross-entropy of the predicted horizon.
pub const LOSS: &str = "Loss";
/// Fraction of predicted codes equal to the target.
pub const ACCURACY: &str = "Accuracy";
/// Velocity MSE after decoding.
pub const MSE: &str = "MSE";
/// Velocity-gradient MSE after decoding.
pub const D_MSE: &str = "D_MSE";

/// Named scalar metrics of one window.
pub type Evaluation = BTreeMap<String, f64>;

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Code-level metrics: [`LOSS`] and [`ACCURACY`].
pub fn evaluate_codes(input: &ForecastInput, output: &ForecastOutput) -> Result<Evaluation> {
    let target = input.ncode.to_dtype(DType::U32)?;
    if output.code.dims() != target.dims() {
        return Err(TurbcastError::shape_mismatch(
            format!("{:?}", target.dims()),
            format!("{:?}", output.code.dims()),
        ));
    }
    let hits = output.code.eq(&target)?.to_dtype(DType::F64)?.mean_all()?;

    let mut evaluation = Evaluation::new();
    evaluation.insert(LOSS.into(), scalar(&output.loss)?);
    evaluation.insert(ACCURACY.into(), scalar(&hits)?);
    Ok(evaluation)
}

/// Physics metrics between decoded and true `[N, 3, G, G, G]` velocities.
///
/// Adds [`MSE`] and [`D_MSE`]; gradients are spectral derivatives of both.
pub fn evaluate_fields(predicted: &Tensor, target: &Tensor) -> Result<Evaluation> {
    if predicted.dims() != target.dims() {
        return Err(TurbcastError::shape_mismatch(
            format!("{:?}", target.dims()),
            format!("{:?}", predicted.dims()),
        ));
    }
    let predicted = predicted.to_dtype(DType::F64)?;
    let target = target.to_dtype(DType::F64)?;
    let mse = (&predicted - &target)?.sqr()?.mean_all()?;

    let d_predicted = spectral_derivative_3d(&predicted)?;
    let d_target = spectral_derivative_3d(&target)?;
    let d_mse = (d_predicted - d_target)?.sqr()?.mean_all()?;

    let mut evaluation = Evaluation::new();
    evaluation.insert(MSE.into(), scalar(&mse)?);
    evaluation.insert(D_MSE.into(), scalar(&d_mse)?);
    Ok(evaluation)
}

/// Running sample-weighted means of named metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricLogger {
    totals: BTreeMap<String, (f64, f64)>,
}

impl MetricLogger {
    /// Create an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one evaluation counted `n` times.
    pub fn append(&mut self, evaluation: &Evaluation, n: usize) {
        let weight = n as f64;
        for (name, value) in evaluation {
            let entry = self.totals.entry(name.clone()).or_insert((0.0, 0.0));
            entry.0 += value * weight;
            entry.1 += weight;
        }
    }

    /// Weighted mean of `name`, if it was ever appended.
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.totals
            .get(name)
            .filter(|(_, weight)| *weight > 0.0)
            .map(|(sum, weight)| sum / weight)
    }

    /// Weighted means of every metric.
    pub fn means(&self) -> BTreeMap<String, f64> {
        self.totals
            .keys()
            .filter_map(|name| self.mean(name).map(|m| (name.clone(), m)))
            .collect()
    }

    /// One-line summary, e.g. `Loss: 1.2345, Accuracy: 0.5000`.
    pub fn summary(&self) -> String {
        self.means()
            .iter()
            .map(|(name, value)| format!("{name}: {value:.4}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.totals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_accuracy_counts_matches() {
        let device = Device::Cpu;
        let input = ForecastInput {
            code: Tensor::zeros((1, 1, 1, 1, 2), DType::U32, &device).unwrap(),
            ncode: Tensor::new(&[1u32, 2], &device).unwrap().reshape((1, 1, 1, 1, 2)).unwrap(),
        };
        let output = ForecastOutput {
            score: Tensor::zeros((1, 4, 1, 1, 1, 2), DType::F32, &device).unwrap(),
            loss: Tensor::new(0.5f32, &device).unwrap(),
            code: Tensor::new(&[1u32, 3], &device).unwrap().reshape((1, 1, 1, 1, 2)).unwrap(),
            state_depth: 1,
        };
        let evaluation = evaluate_codes(&input, &output).unwrap();
        assert_eq!(evaluation[LOSS], 0.5);
        assert_eq!(evaluation[ACCURACY], 0.5);
    }

    #[test]
    fn test_field_metrics_zero_for_identical_fields() {
        let field = Tensor::randn(0f32, 1.0, (1, 3, 4, 4, 4), &Device::Cpu).unwrap();
        let evaluation = evaluate_fields(&field, &field).unwrap();
        assert_eq!(evaluation[MSE], 0.0);
        assert!(evaluation[D_MSE].abs() < 1e-20);
    }

    #[test]
    fn test_field_metrics_constant_offset() {
        let a = Tensor::zeros((1, 3, 4, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::ones((1, 3, 4, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let evaluation = evaluate_fields(&b, &a).unwrap();
        assert!((evaluation[MSE] - 1.0).abs() < 1e-12);
        // A uniform shift has no gradient
        assert!(evaluation[D_MSE].abs() < 1e-20);
    }

    #[test]
    fn test_logger_weighted_mean() {
        let mut logger = MetricLogger::new();
        logger.append(&Evaluation::from([(LOSS.to_string(), 1.0)]), 1);
        logger.append(&Evaluation::from([(LOSS.to_string(), 4.0)]), 3);
        assert_eq!(logger.mean(LOSS), Some(3.25));
        assert_eq!(logger.mean(ACCURACY), None);
        assert_eq!(logger.summary(), "Loss: 3.2500");

        logger.reset();
        assert!(logger.means().is_empty());
    }
}

//! Mergeable per-channel mean and standard deviation.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurbcastError};

/// Running per-channel statistics over a stream of batches.
///
/// Batches are merged with the pooled-variance formula, so the result is
/// independent of how the stream was split. A batch with a single sample
/// contributes zero variance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    /// Samples seen so far (one per position outside the channel axis).
    pub n_samples: usize,
    /// Per-channel mean.
    pub mean: Vec<f64>,
    /// Per-channel standard deviation.
    pub std: Vec<f64>,
}

impl RunningStats {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels, zero before the first update.
    pub fn num_features(&self) -> usize {
        self.mean.len()
    }

    /// Merge `data`, with channels along `dim`.
    pub fn update(&mut self, data: &Tensor, dim: usize) -> Result<()> {
        let rank = data.rank();
        if dim >= rank {
            return Err(TurbcastError::shape_mismatch(
                format!("channel dim < {rank}"),
                format!("dim {dim}"),
            ));
        }
        let channels = data.dim(dim)?;
        if self.n_samples > 0 && channels != self.num_features() {
            return Err(TurbcastError::shape_mismatch(
                format!("{} channels", self.num_features()),
                format!("{channels} channels"),
            ));
        }

        let flat = data
            .to_dtype(DType::F64)?
            .transpose(dim, rank - 1)?
            .contiguous()?
            .reshape(((), channels))?;
        let n = flat.dim(0)?;
        if n == 0 {
            return Ok(());
        }

        let batch_mean = flat.mean(0)?;
        let batch_std: Vec<f64> = if n == 1 {
            vec![0.0; channels]
        } else {
            // Unbiased estimate
            flat.broadcast_sub(&batch_mean)?
                .sqr()?
                .sum(0)?
                .affine(1.0 / (n - 1) as f64, 0.0)?
                .sqrt()?
                .to_vec1()?
        };
        let batch_mean: Vec<f64> = batch_mean.to_vec1()?;

        if self.n_samples == 0 {
            self.n_samples = n;
            self.mean = batch_mean;
            self.std = batch_std;
            return Ok(());
        }

        let m = self.n_samples as f64;
        let nf = n as f64;
        let total = m + nf;
        for c in 0..channels {
            let (old_mean, old_std) = (self.mean[c], self.std[c]);
            let (new_mean, new_std) = (batch_mean[c], batch_std[c]);
            self.mean[c] = m / total * old_mean + nf / total * new_mean;
            self.std[c] = (m / total * old_std.powi(2)
                + nf / total * new_std.powi(2)
                + m * nf / total.powi(2) * (old_mean - new_mean).powi(2))
            .sqrt();
        }
        self.n_samples += n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_single_batch() {
        // [2 samples, 2 channels]
        let data = Tensor::new(&[[1.0f32, 10.0], [3.0, 10.0]], &Device::Cpu).unwrap();
        let mut stats = RunningStats::new();
        stats.update(&data, 1).unwrap();

        assert_eq!(stats.n_samples, 2);
        assert_eq!(stats.mean, vec![2.0, 10.0]);
        assert!((stats.std[0] - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.std[1], 0.0);
    }

    #[test]
    fn test_channel_axis_in_the_middle() {
        // [1, 2, 2]: channel 0 holds 0 and 2, channel 1 holds 4 and 6
        let data = Tensor::new(&[[[0.0f32, 2.0], [4.0, 6.0]]], &Device::Cpu).unwrap();
        let mut stats = RunningStats::new();
        stats.update(&data, 1).unwrap();
        assert_eq!(stats.mean, vec![1.0, 5.0]);
    }

    #[test]
    fn test_merge_matches_pooled_formula() {
        let a = Tensor::new(&[[0.0f32], [2.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[4.0f32], [6.0]], &Device::Cpu).unwrap();
        let mut stats = RunningStats::new();
        stats.update(&a, 1).unwrap();
        stats.update(&b, 1).unwrap();

        assert_eq!(stats.n_samples, 4);
        assert!((stats.mean[0] - 3.0).abs() < 1e-12);
        // 0.5 * 2 + 0.5 * 2 + 0.25 * 16 = 6
        assert!((stats.std[0] - 6f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_single_sample_batch_adds_no_variance() {
        let a = Tensor::new(&[[1.0f32], [1.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap();
        let mut stats = RunningStats::new();
        stats.update(&a, 1).unwrap();
        stats.update(&b, 1).unwrap();
        assert_eq!(stats.n_samples, 3);
        assert_eq!(stats.std, vec![0.0]);
        assert_eq!(stats.mean, vec![1.0]);
    }

    #[test]
    fn test_channel_count_checked() {
        let mut stats = RunningStats::new();
        stats.update(&Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(), 1).unwrap();
        let err = stats
            .update(&Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap(), 1)
            .unwrap_err();
        assert!(matches!(err, TurbcastError::ShapeMismatch { .. }));
    }
}

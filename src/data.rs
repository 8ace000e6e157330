//! Code-sequence storage and truncated-history windows.
//!
//! A code sequence is a `[B, T, d, h, w]` `u32` tensor. [`CodeWindows`]
//! slices it along `T` into forecasting calls of `bptt` history steps plus
//! `pred_length` target steps.
//!
//! # Example
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use turbcast_rs::data::CodeWindows;
//!
//! # fn main() -> turbcast_rs::Result<()> {
//! let codes = Tensor::zeros((1, 7, 2, 2, 2), DType::U32, &Device::Cpu)?;
//! let windows = CodeWindows::new(&codes, 2, 1)?;
//! assert_eq!(windows.len(), 3);
//! for window in windows {
//!     let window = window?;
//!     assert_eq!(window.code.dims(), &[1, 2, 2, 2, 2]);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, TurbcastError};
use crate::model::ForecastInput;

/// Safetensors key holding a code sequence.
pub const CODE_KEY: &str = "code";

/// Safetensors key holding a velocity sequence.
pub const UVW_KEY: &str = "uvw";

fn load_key(path: &Path, key: &str, device: &Device) -> Result<Tensor> {
    if !path.exists() {
        return Err(TurbcastError::data(format!("path does not exist: {}", path.display())));
    }
    let mut tensors = candle_core::safetensors::load(path, device)?;
    tensors
        .remove(key)
        .ok_or_else(|| TurbcastError::data(format!("no `{key}` tensor in {}", path.display())))
}

/// Load a `[B, T, d, h, w]` code sequence.
pub fn load_codes(path: &Path, device: &Device) -> Result<Tensor> {
    let codes = load_key(path, CODE_KEY, device)?;
    check_sequence(&codes)?;
    Ok(codes.to_dtype(DType::U32)?)
}

/// Save a code sequence under [`CODE_KEY`].
pub fn save_codes(codes: &Tensor, path: &Path) -> Result<()> {
    check_sequence(codes)?;
    let tensors = HashMap::from([(CODE_KEY.to_string(), codes.to_dtype(DType::U32)?)]);
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Load a velocity tensor stored under [`UVW_KEY`].
pub fn load_uvw(path: &Path, device: &Device) -> Result<Tensor> {
    Ok(load_key(path, UVW_KEY, device)?.to_dtype(DType::F32)?)
}

/// Save a velocity tensor under [`UVW_KEY`].
pub fn save_uvw(uvw: &Tensor, path: &Path) -> Result<()> {
    let tensors = HashMap::from([(UVW_KEY.to_string(), uvw.clone())]);
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

fn check_sequence(codes: &Tensor) -> Result<()> {
    if codes.rank() != 5 {
        return Err(TurbcastError::shape_mismatch(
            "[batch, time, d, h, w] codes",
            format!("{:?}", codes.dims()),
        ));
    }
    Ok(())
}

/// Keep every `increment`-th step along the time axis (dim 1).
pub fn subsample(sequence: &Tensor, increment: usize) -> Result<Tensor> {
    if increment == 0 {
        return Err(TurbcastError::configuration("data_increment must be > 0"));
    }
    if increment == 1 {
        return Ok(sequence.clone());
    }
    let steps = sequence.dim(1)?;
    let index: Vec<u32> = (0..steps).step_by(increment).map(|t| t as u32).collect();
    let index = Tensor::new(index.as_slice(), sequence.device())?;
    Ok(sequence.index_select(&index, 1)?)
}

/// Iterator over truncated-history windows of a code sequence.
///
/// Window `k` covers steps `[k * stride, k * stride + bptt + pred_length)`.
/// The default stride is `bptt`, so consecutive windows tile the sequence
/// the way a hidden state carried between them expects.
#[derive(Debug, Clone)]
pub struct CodeWindows<'a> {
    codes: &'a Tensor,
    bptt: usize,
    pred_length: usize,
    stride: usize,
    next: usize,
    count: usize,
}

impl<'a> CodeWindows<'a> {
    /// Windows with stride `bptt` (stride 1 when `bptt` is zero).
    pub fn new(codes: &'a Tensor, bptt: usize, pred_length: usize) -> Result<Self> {
        Self::with_stride(codes, bptt, pred_length, bptt.max(1))
    }

    /// Windows with an explicit stride.
    pub fn with_stride(
        codes: &'a Tensor,
        bptt: usize,
        pred_length: usize,
        stride: usize,
    ) -> Result<Self> {
        check_sequence(codes)?;
        if pred_length == 0 {
            return Err(TurbcastError::configuration("pred_length must be > 0"));
        }
        if stride == 0 {
            return Err(TurbcastError::configuration("window stride must be > 0"));
        }
        let steps = codes.dim(1)?;
        let window = bptt + pred_length;
        let count = if steps < window {
            0
        } else {
            (steps - window) / stride + 1
        };
        Ok(Self {
            codes,
            bptt,
            pred_length,
            stride,
            next: 0,
            count,
        })
    }

    /// Batch size of every window.
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.codes.dim(0)?)
    }

    /// Spatial extent `(d, h, w)` of the code field.
    pub fn spatial_dims(&self) -> Result<(usize, usize, usize)> {
        let (_, _, d, h, w) = self.codes.dims5()?;
        Ok((d, h, w))
    }

    /// Window starting at time step `start`.
    pub fn window_at(&self, start: usize) -> Result<ForecastInput> {
        let code = self.codes.narrow(1, start, self.bptt)?;
        let ncode = self.codes.narrow(1, start + self.bptt, self.pred_length)?;
        Ok(ForecastInput { code, ncode })
    }
}

impl Iterator for CodeWindows<'_> {
    type Item = Result<ForecastInput>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let start = self.next * self.stride;
        self.next += 1;
        Some(self.window_at(start))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for CodeWindows<'_> {}

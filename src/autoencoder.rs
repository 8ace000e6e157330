//! Boundary to the vector-quantized autoencoder that produces code fields.
//!
//! The forecaster never looks inside the autoencoder; it only needs the
//! vocabulary size, the spatial downsampling factor and a way to turn
//! predicted codes back into velocity fields for physics metrics.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, TurbcastError};

/// Encode/decode service over a fixed codebook.
pub trait CodeAutoencoder {
    /// `[N, 3, G, G, G]` velocity fields to `[N, g, g, g]` codes (`u32`).
    fn encode(&self, field: &Tensor) -> Result<Tensor>;

    /// `[N, g, g, g]` codes to `[N, 3, G, G, G]` velocity fields.
    fn decode(&self, code: &Tensor) -> Result<Tensor>;

    /// Vocabulary size, excluding the mask symbol.
    fn num_embedding(&self) -> usize;

    /// Ratio between field and code extents.
    fn downsampling(&self) -> usize;

    /// Code extent for a cubic field of side `grid_size`.
    fn code_extent(&self, grid_size: usize) -> usize {
        grid_size / self.downsampling().max(1)
    }
}

/// Non-learned codebook quantizer.
///
/// Encoding averages `factor³` blocks and snaps each block to its nearest
/// codebook velocity; decoding repeats the codebook velocity over the block.
/// Useful as a stand-in autoencoder for smoke runs and tests.
#[derive(Debug, Clone)]
pub struct CodebookAutoencoder {
    /// `[num_embedding, 3]`
    codebook: Tensor,
    factor: usize,
}

impl CodebookAutoencoder {
    /// Wrap a `[V, 3]` codebook with block size `factor`.
    pub fn new(codebook: Tensor, factor: usize) -> Result<Self> {
        let dims = codebook.dims();
        if dims.len() != 2 || dims[1] != 3 || dims[0] == 0 {
            return Err(TurbcastError::shape_mismatch("[V, 3] codebook", format!("{dims:?}")));
        }
        if factor == 0 {
            return Err(TurbcastError::configuration("downsampling factor must be > 0"));
        }
        Ok(Self {
            codebook: codebook.to_dtype(DType::F32)?,
            factor,
        })
    }

    /// Codebook of `num_embedding` velocities drawn from `N(0, 1)`.
    pub fn random(num_embedding: usize, factor: usize, device: &Device) -> Result<Self> {
        let codebook = Tensor::randn(0f32, 1.0, (num_embedding, 3), device)?;
        Self::new(codebook, factor)
    }

    /// The `[V, 3]` codebook.
    pub fn codebook(&self) -> &Tensor {
        &self.codebook
    }
}

impl CodeAutoencoder for CodebookAutoencoder {
    fn encode(&self, field: &Tensor) -> Result<Tensor> {
        let dims = field.dims().to_vec();
        let f = self.factor;
        if dims.len() != 5 || dims[1] != 3 || dims[2..].iter().any(|&s| s % f != 0) {
            return Err(TurbcastError::shape_mismatch(
                format!("[N, 3, G, G, G] with G divisible by {f}"),
                format!("{dims:?}"),
            ));
        }
        let (n, d, h, w) = (dims[0], dims[2] / f, dims[3] / f, dims[4] / f);

        let pooled = field
            .to_dtype(DType::F32)?
            .reshape(vec![n, 3, d, f, h, f, w, f])?
            .mean(7)?
            .mean(5)?
            .mean(3)?;
        let points = pooled.permute([0, 2, 3, 4, 1])?.contiguous()?.reshape(((), 3))?;

        // |x - c|² up to the per-point constant |x|²
        let cross = points.matmul(&self.codebook.t()?.contiguous()?)?;
        let norms = self.codebook.sqr()?.sum(1)?.unsqueeze(0)?;
        let distance = norms.broadcast_sub(&(cross * 2.0)?)?;
        Ok(distance.argmin(1)?.reshape((n, d, h, w))?)
    }

    fn decode(&self, code: &Tensor) -> Result<Tensor> {
        let dims = code.dims().to_vec();
        if dims.len() != 4 {
            return Err(TurbcastError::shape_mismatch("[N, g, g, g] codes", format!("{dims:?}")));
        }
        let (n, d, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        let f = self.factor;

        let index = code.to_dtype(DType::U32)?.flatten_all()?;
        let velocity = self
            .codebook
            .index_select(&index, 0)?
            .reshape((n, d, h, w, 3))?
            .permute([0, 4, 1, 2, 3])?
            .contiguous()?;
        let field = velocity
            .reshape(vec![n, 3, d, 1, h, 1, w, 1])?
            .broadcast_as(vec![n, 3, d, f, h, f, w, f])?
            .contiguous()?
            .reshape((n, 3, d * f, h * f, w * f))?;
        Ok(field)
    }

    fn num_embedding(&self) -> usize {
        self.codebook.dims()[0]
    }

    fn downsampling(&self) -> usize {
        self.factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn autoencoder() -> CodebookAutoencoder {
        let codebook = Tensor::new(
            &[[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, -1.0, 2.0]],
            &Device::Cpu,
        )
        .unwrap();
        CodebookAutoencoder::new(codebook, 2).unwrap()
    }

    #[test]
    fn test_decode_then_encode_recovers_codes() {
        let ae = autoencoder();
        let code = Tensor::new(&[[[[0u32, 1], [2, 1]], [[2, 2], [0, 1]]]], &Device::Cpu).unwrap();

        let field = ae.decode(&code).unwrap();
        assert_eq!(field.dims(), &[1, 3, 4, 4, 4]);

        let again = ae.encode(&field).unwrap();
        assert_eq!(
            again.flatten_all().unwrap().to_vec1::<u32>().unwrap(),
            code.flatten_all().unwrap().to_vec1::<u32>().unwrap()
        );
    }

    #[test]
    fn test_code_extent() {
        let ae = autoencoder();
        assert_eq!(ae.num_embedding(), 3);
        assert_eq!(ae.code_extent(128), 64);
    }

    #[test]
    fn test_encode_rejects_indivisible_grid() {
        let ae = autoencoder();
        let field = Tensor::zeros((1, 3, 3, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(ae.encode(&field), Err(TurbcastError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_bad_codebook() {
        let codebook = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(CodebookAutoencoder::new(codebook, 2).is_err());
    }
}

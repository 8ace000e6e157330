//! History/mask assembly and the code vocabulary embedding.
//!
//! A forecasting call sees `bptt` known code fields followed by `pred_length`
//! placeholder fields holding the reserved mask symbol (`num_embedding`), so
//! the whole horizon is predicted in one masked fill-in pass.

use candle_core::{DType, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

use crate::error::{Result, TurbcastError};

/// Append `pred_length` mask fields to a `[B, T, *spatial]` code sequence.
///
/// Returns `[B, T + pred_length, *spatial]` (`u32`). An empty history
/// (`T == 0`) yields the mask fields alone.
pub fn append_mask(code: &Tensor, pred_length: usize, mask_id: u32) -> Result<Tensor> {
    if code.rank() < 3 {
        return Err(TurbcastError::shape_mismatch(
            "[batch, time, *spatial]",
            format!("{:?}", code.dims()),
        ));
    }
    if pred_length == 0 {
        return Err(TurbcastError::configuration("pred_length must be > 0"));
    }

    let mut mask_shape = code.dims().to_vec();
    mask_shape[1] = pred_length;
    let mask = Tensor::full(mask_id, mask_shape, code.device())?;

    if code.dim(1)? == 0 {
        return Ok(mask);
    }
    let code = code.to_dtype(DType::U32)?;
    Ok(Tensor::cat(&[&code, &mask], 1)?)
}

/// Embedding table of `num_embedding + 1` rows (the last row is the mask).
#[derive(Debug, Clone)]
pub struct CodeEmbedding {
    embedding: Embedding,
    num_embedding: usize,
    embedding_size: usize,
}

impl CodeEmbedding {
    /// Create the table under `vb`.
    pub fn new(num_embedding: usize, embedding_size: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(num_embedding + 1, embedding_size, vb)?;
        Ok(Self {
            embedding,
            num_embedding,
            embedding_size,
        })
    }

    /// Index of the reserved mask symbol.
    pub fn mask_id(&self) -> u32 {
        self.num_embedding as u32
    }

    /// Real vocabulary size (mask excluded).
    pub fn num_embedding(&self) -> usize {
        self.num_embedding
    }

    /// Width of each embedded vector.
    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    /// Embed `[B, T, d, h, w]` codes into `[B, T, E, d, h, w]`.
    pub fn embed(&self, codes: &Tensor) -> Result<Tensor> {
        if codes.rank() != 5 {
            return Err(TurbcastError::shape_mismatch(
                "[batch, time, depth, height, width]",
                format!("{:?}", codes.dims()),
            ));
        }
        let embedded = self.embedding.forward(codes)?;
        Ok(embedded.permute([0, 1, 5, 2, 3, 4])?)
    }

    /// Append the mask horizon and embed in one go.
    pub fn assemble(&self, history: &Tensor, pred_length: usize) -> Result<Tensor> {
        let codes = append_mask(history, pred_length, self.mask_id())?;
        self.embed(&codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn history() -> Tensor {
        Tensor::full(3u32, (2, 4, 2, 2, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_append_mask_positions() {
        let out = append_mask(&history(), 2, 16).unwrap();
        assert_eq!(out.dims(), &[2, 6, 2, 2, 2]);

        let known: Vec<u32> = out.narrow(1, 0, 4).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(known.iter().all(|&c| c == 3));
        let masked: Vec<u32> = out.narrow(1, 4, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(masked.iter().all(|&c| c == 16));
    }

    #[test]
    fn test_append_mask_empty_history() {
        let empty = Tensor::zeros((1, 0, 2, 2, 2), DType::U32, &Device::Cpu).unwrap();
        let out = append_mask(&empty, 3, 8).unwrap();
        assert_eq!(out.dims(), &[1, 3, 2, 2, 2]);
    }

    #[test]
    fn test_append_mask_rejects_zero_horizon() {
        assert!(matches!(
            append_mask(&history(), 0, 16),
            Err(TurbcastError::Configuration(_))
        ));
    }

    #[test]
    fn test_assemble_layout() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let emb = CodeEmbedding::new(16, 5, vb).unwrap();
        assert_eq!(emb.mask_id(), 16);

        let x = emb.assemble(&history(), 2).unwrap();
        assert_eq!(x.dims(), &[2, 6, 5, 2, 2, 2]);

        // All history positions share one symbol so every history vector matches
        let first: Vec<f32> = x.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let last: Vec<f32> = x.narrow(1, 3, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(first, last);
    }

    #[test]
    fn test_embed_rejects_bad_rank() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let emb = CodeEmbedding::new(4, 2, vb).unwrap();
        let codes = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            emb.embed(&codes),
            Err(TurbcastError::ShapeMismatch { .. })
        ));
    }
}

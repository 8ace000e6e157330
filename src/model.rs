//! ConvLSTM forecast driver.
//!
//! Implements the full model with:
//! - Code embedding with the appended mask horizon
//! - A stack of ConvLSTM layers threaded through a [`HiddenState`]
//! - A pointwise classifier to vocabulary logits
//! - Cross-entropy loss and greedy decoding over the predicted horizon

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

use crate::assembly::CodeEmbedding;
use crate::cell::{ConvLstmLayer, ConvLstmLayerConfig};
use crate::config::ConvLstmConfig;
use crate::error::{Result, TurbcastError};
use crate::state::{HiddenState, LayerState};

/// One forecasting call's inputs.
#[derive(Debug, Clone)]
pub struct ForecastInput {
    /// Known history `[B, bptt, d, h, w]` (`u32`).
    pub code: Tensor,
    /// Ground-truth future codes `[B, pred_length, d, h, w]` (`u32`).
    pub ncode: Tensor,
}

/// One forecasting call's outputs.
#[derive(Debug, Clone)]
pub struct ForecastOutput {
    /// Logits `[B, num_embedding, pred_length, d, h, w]`.
    pub score: Tensor,
    /// Mean cross-entropy (scalar).
    pub loss: Tensor,
    /// Greedy prediction `[B, pred_length, d, h, w]` (`u32`).
    pub code: Tensor,
    /// Hidden-state depth reached during the call.
    pub state_depth: usize,
}

/// Discrete spatio-temporal ConvLSTM forecaster.
pub struct ConvLstm {
    embedding: CodeEmbedding,
    layers: Vec<ConvLstmLayer>,
    classifier: Linear,
    /// State used when the caller supplies none; released after every call.
    hidden: HiddenState,
    config: ConvLstmConfig,
    device: Device,
    var_map: VarMap,
}

impl ConvLstm {
    /// Create a new model with random initialization.
    pub fn new(config: &ConvLstmConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb, device, var_map)
    }

    /// Create a model whose parameters live in `var_map` under `vb`.
    pub fn from_varbuilder(
        config: &ConvLstmConfig,
        vb: VarBuilder,
        device: &Device,
        var_map: VarMap,
    ) -> Result<Self> {
        config.validate()?;

        let embedding =
            CodeEmbedding::new(config.num_embedding, config.embedding_size, vb.pp("embedding"))?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let input_size = if i == 0 {
                config.input_size
            } else {
                config.output_size
            };
            let layer = ConvLstmLayer::new(
                ConvLstmLayerConfig {
                    input_size,
                    output_size: config.output_size,
                    normalization: config.normalization,
                    activation: config.activation,
                },
                vb.pp(format!("layers.{i}")),
            )?;
            layers.push(layer);
        }

        let classifier = linear(config.output_size, config.num_embedding, vb.pp("classifier"))?;

        Ok(Self {
            embedding,
            layers,
            classifier,
            hidden: HiddenState::new(config.num_layers),
            config: config.clone(),
            device: device.clone(),
            var_map,
        })
    }

    /// Run one forecasting call.
    ///
    /// With `state = None` the model's own state is zero-initialized layer by
    /// layer and released before returning. With `Some(state)` the caller's
    /// state is extended on demand, used as the initial `(h, c)` of every
    /// layer, overwritten with the final `(h, c)`, and never released. A
    /// call that fails leaves the caller's state untouched.
    ///
    /// `train` selects batch statistics in batch-normalized gate convolutions.
    ///
    /// # Errors
    ///
    /// Returns [`TurbcastError::ShapeMismatch`] if a held layer state does not
    /// match this call's batch and spatial extent, or if `ncode` disagrees
    /// with the predicted horizon.
    pub fn forward(
        &mut self,
        input: &ForecastInput,
        state: Option<&mut HiddenState>,
        train: bool,
    ) -> Result<ForecastOutput> {
        let pred_length = self.config.pred_length;
        let output_size = self.config.output_size;

        // [B, T, E, d, h, w] with T = bptt + pred_length
        let x = self.embedding.assemble(&input.code, pred_length)?;
        let steps = x.dim(1)?;
        let mut sequence = Vec::with_capacity(steps);
        for t in 0..steps {
            sequence.push(x.narrow(1, t, 1)?.squeeze(1)?);
        }

        // Caller-owned state is only replaced once the whole call succeeded
        let mut pending = None;
        let (result, state_depth) = match state {
            Some(state) => {
                let mut working = state.clone();
                let result = run_layers(&self.layers, &mut working, sequence, output_size, train);
                let depth = working.depth();
                pending = Some((state, working));
                (result, depth)
            }
            None => {
                let result = run_layers(&self.layers, &mut self.hidden, sequence, output_size, train);
                let depth = self.hidden.depth();
                self.hidden.release();
                (result, depth)
            }
        };
        let sequence = result?;

        // Only the masked horizon is scored
        let horizon = Tensor::stack(&sequence[steps - pred_length..], 1)?;
        let score = self.classify(&horizon)?;
        let loss = self.loss(&score, &input.ncode)?;
        let code = Self::decode(&score)?;

        if let Some((state, working)) = pending {
            *state = working;
        }
        Ok(ForecastOutput {
            score,
            loss,
            code,
            state_depth,
        })
    }

    /// Pointwise projection `[B, P, O, d, h, w] -> [B, V, P, d, h, w]`.
    fn classify(&self, hidden: &Tensor) -> Result<Tensor> {
        let dims = hidden.dims().to_vec();
        let (channels, vocab) = (dims[2], self.config.num_embedding);
        let points: usize = dims.iter().product::<usize>() / channels;

        let flat = hidden
            .permute([0, 1, 3, 4, 5, 2])?
            .contiguous()?
            .reshape((points, channels))?;
        let logits = self.classifier.forward(&flat)?;

        let mut shape = dims.clone();
        shape.remove(2);
        shape.push(vocab);
        Ok(logits.reshape(shape)?.permute([0, 5, 1, 2, 3, 4])?)
    }

    /// Mean cross-entropy between `score` `[B, V, P, *s]` and `ncode` `[B, P, *s]`.
    pub fn loss(&self, score: &Tensor, ncode: &Tensor) -> Result<Tensor> {
        let dims = score.dims();
        let mut expected = vec![dims[0]];
        expected.extend_from_slice(&dims[2..]);
        if ncode.dims() != expected.as_slice() {
            return Err(TurbcastError::shape_mismatch(
                format!("ncode {expected:?}"),
                format!("{:?}", ncode.dims()),
            ));
        }

        let vocab = dims[1];
        let logits = score
            .permute([0, 2, 3, 4, 5, 1])?
            .contiguous()?
            .reshape(((), vocab))?;
        let targets = ncode.to_dtype(DType::U32)?.flatten_all()?;
        Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
    }

    /// Greedy decode: arg-max over the vocabulary axis.
    pub fn decode(score: &Tensor) -> Result<Tensor> {
        Ok(score.argmax(1)?)
    }

    /// Model configuration.
    pub fn config(&self) -> &ConvLstmConfig {
        &self.config
    }

    /// Device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of recurrent layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Depth of the model-owned state (zero between calls).
    pub fn internal_state_depth(&self) -> usize {
        self.hidden.depth()
    }

    /// Total number of learned scalars.
    pub fn parameter_count(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Parameters for optimizers and checkpoints.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Save model weights (safetensors format).
    pub fn save(&self, path: &Path) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Build a model and load its weights from a safetensors file.
    pub fn load(config: &ConvLstmConfig, path: &Path, device: &Device) -> Result<Self> {
        let mut model = Self::new(config, device)?;
        model.load_weights(path)?;
        Ok(model)
    }

    /// Overwrite existing weights in place from a safetensors file.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.var_map.load(path).map_err(|e| {
            TurbcastError::checkpoint(format!("failed to load {}: {e}", path.display()))
        })?;
        Ok(())
    }
}

/// Thread `sequence` through every layer, reading and writing `state`.
fn run_layers(
    layers: &[ConvLstmLayer],
    state: &mut HiddenState,
    mut sequence: Vec<Tensor>,
    output_size: usize,
    train: bool,
) -> Result<Vec<Tensor>> {
    for (index, layer) in layers.iter().enumerate() {
        let mut current: Option<LayerState> = None;
        let mut outputs = Vec::with_capacity(sequence.len());

        for x_t in &sequence {
            let gates = layer.input_gates(x_t, train)?;
            let previous = match current.take() {
                Some(previous) => previous,
                None => {
                    // First real activation of this layer fixes the state shape
                    let mut shape = gates.dims().to_vec();
                    shape[1] = output_size;
                    state.ensure_layer(index, &shape, gates.dtype(), gates.device())?;
                    state.layer(index)?.clone()
                }
            };
            let next = layer.update(&gates, &previous, train)?;
            outputs.push(next.hidden.clone());
            current = Some(next);
        }

        if let Some(last) = current {
            state.set_layer(index, last)?;
        }
        sequence = outputs;
    }
    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StatePhase;

    fn input(config: &ConvLstmConfig, batch: usize, side: usize, symbol: u32) -> ForecastInput {
        let device = Device::Cpu;
        ForecastInput {
            code: Tensor::full(symbol, (batch, config.bptt, side, side, side), &device).unwrap(),
            ncode: Tensor::zeros((batch, config.pred_length, side, side, side), DType::U32, &device)
                .unwrap(),
        }
    }

    #[test]
    fn test_model_forward_shapes() {
        let config = ConvLstmConfig::test();
        let mut model = ConvLstm::new(&config, &Device::Cpu).unwrap();

        let out = model.forward(&input(&config, 2, 3, 1), None, true).unwrap();
        assert_eq!(out.score.dims(), &[2, config.num_embedding, config.pred_length, 3, 3, 3]);
        assert_eq!(out.code.dims(), &[2, config.pred_length, 3, 3, 3]);
        assert_eq!(out.loss.dims(), &[] as &[usize]);

        let codes: Vec<u32> = out.code.flatten_all().unwrap().to_vec1().unwrap();
        assert!(codes.iter().all(|&c| (c as usize) < config.num_embedding));
    }

    #[test]
    fn test_internal_state_released() {
        let config = ConvLstmConfig::test();
        let mut model = ConvLstm::new(&config, &Device::Cpu).unwrap();

        let out = model.forward(&input(&config, 1, 2, 0), None, false).unwrap();
        assert_eq!(out.state_depth, config.num_layers);
        assert_eq!(model.internal_state_depth(), 0);
    }

    #[test]
    fn test_external_state_kept_and_grown() {
        let config = ConvLstmConfig::test();
        let mut model = ConvLstm::new(&config, &Device::Cpu).unwrap();

        let mut state = HiddenState::new(config.num_layers);
        let out = model
            .forward(&input(&config, 1, 2, 0), Some(&mut state), false)
            .unwrap();
        assert_eq!(out.state_depth, config.num_layers);
        assert_eq!(state.depth(), config.num_layers);
        assert_eq!(state.phase(), StatePhase::Active);
        assert_eq!(state.layer(0).unwrap().dims(), &[1, config.output_size, 2, 2, 2]);
    }

    #[test]
    fn test_external_state_shape_checked() {
        let config = ConvLstmConfig::test();
        let mut model = ConvLstm::new(&config, &Device::Cpu).unwrap();

        let mut state =
            HiddenState::zeros(config.num_layers, &[1, config.output_size, 4, 4, 4], DType::F32, &Device::Cpu)
                .unwrap();
        let err = model
            .forward(&input(&config, 1, 2, 0), Some(&mut state), false)
            .unwrap_err();
        assert!(matches!(err, TurbcastError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_loss_shape_mismatch() {
        let config = ConvLstmConfig::test();
        let mut model = ConvLstm::new(&config, &Device::Cpu).unwrap();

        let mut bad = input(&config, 1, 2, 0);
        bad.ncode = Tensor::zeros((1, config.pred_length, 3, 3, 3), DType::U32, &Device::Cpu).unwrap();
        let err = model.forward(&bad, None, false).unwrap_err();
        assert!(matches!(err, TurbcastError::ShapeMismatch { .. }));
        // Released even on the failing path
        assert_eq!(model.internal_state_depth(), 0);
    }

    #[test]
    fn test_deterministic_logits() {
        let config = ConvLstmConfig::test();
        let mut model = ConvLstm::new(&config, &Device::Cpu).unwrap();
        let x = input(&config, 1, 2, 3);

        let a: Vec<f32> = model.forward(&x, None, false).unwrap().score.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = model.forward(&x, None, false).unwrap().score.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_save_and_load() {
        let config = ConvLstmConfig::test();
        let mut model = ConvLstm::new(&config, &Device::Cpu).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        model.save(&path).unwrap();

        let mut loaded = ConvLstm::load(&config, &path, &Device::Cpu).unwrap();
        assert_eq!(loaded.parameter_count(), model.parameter_count());

        let x = input(&config, 1, 2, 5);
        let a: Vec<f32> = model.forward(&x, None, false).unwrap().score.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = loaded.forward(&x, None, false).unwrap().score.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}

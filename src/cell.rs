//! One gated ConvLSTM layer.
//!
//! Every gate transform is a learned 3×3×3 convolution instead of a dense
//! matrix multiply:
//!
//! ```text
//! gates      = in(x_t) + hidden(h)
//! i, f, g, o = chunk(gates, 4, channel)
//! c'         = sigmoid(f) * c + sigmoid(i) * act(g)
//! h'         = sigmoid(o) * act(c')
//! ```

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::activation::{Activation, ActivationMode};
use crate::conv::{ConvBlock, ConvBlockConfig};
use crate::norm::NormalizationMode;
use crate::state::LayerState;

/// Number of LSTM gates packed along the channel axis.
pub const NUM_GATES: usize = 4;

/// Construction parameters for a [`ConvLstmLayer`].
#[derive(Debug, Clone, Copy)]
pub struct ConvLstmLayerConfig {
    /// Channels of the layer input (embedding size at layer 0).
    pub input_size: usize,
    /// Channels of `h` and `c`.
    pub output_size: usize,
    /// Normalization inside both gate convolutions.
    pub normalization: NormalizationMode,
    /// Nonlinearity for the cell candidate and the hidden output.
    pub activation: ActivationMode,
}

/// A single ConvLSTM layer.
#[derive(Debug, Clone)]
pub struct ConvLstmLayer {
    input_gates: ConvBlock,
    hidden_gates: ConvBlock,
    candidate_activation: Activation,
    output_activation: Activation,
    gate_activation: Activation,
    output_size: usize,
}

impl ConvLstmLayer {
    /// Create the layer; parameters live under `in`, `hidden` and `activation.{0,1}`.
    pub fn new(config: ConvLstmLayerConfig, vb: VarBuilder) -> CandleResult<Self> {
        let gate_channels = NUM_GATES * config.output_size;
        let input_gates = ConvBlock::new(
            ConvBlockConfig {
                input_size: config.input_size,
                output_size: gate_channels,
                normalization: config.normalization,
                activation: ActivationMode::None,
            },
            vb.pp("in"),
        )?;
        let hidden_gates = ConvBlock::new(
            ConvBlockConfig {
                input_size: config.output_size,
                output_size: gate_channels,
                normalization: config.normalization,
                activation: ActivationMode::None,
            },
            vb.pp("hidden"),
        )?;
        let candidate_activation = Activation::new(config.activation, vb.pp("activation.0"))?;
        let output_activation = Activation::new(config.activation, vb.pp("activation.1"))?;

        Ok(Self {
            input_gates,
            hidden_gates,
            candidate_activation,
            output_activation,
            gate_activation: Activation::sigmoid(),
            output_size: config.output_size,
        })
    }

    /// Channels of `h` and `c`.
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Input contribution to the gates, `[B, 4*out, *spatial]`.
    ///
    /// Split out of [`Self::step`] so the driver can size a fresh state from
    /// the first real activation of the layer.
    pub fn input_gates(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        self.input_gates.apply(x, train)
    }

    /// Complete the update given the precomputed input contribution.
    pub fn update(
        &self,
        input_gates: &Tensor,
        state: &LayerState,
        train: bool,
    ) -> CandleResult<LayerState> {
        let gates = (input_gates + self.hidden_gates.apply(&state.hidden, train)?)?;
        let chunks = gates.chunk(NUM_GATES, 1)?;
        let (i, f, g, o) = match chunks.as_slice() {
            [i, f, g, o] => (i, f, g, o),
            _ => candle_core::bail!("expected {NUM_GATES} gate chunks, got {}", chunks.len()),
        };

        let i = self.gate_activation.forward(i)?;
        let f = self.gate_activation.forward(f)?;
        let o = self.gate_activation.forward(o)?;
        let g = self.candidate_activation.forward(g)?;

        let cell = ((f * &state.cell)? + (i * g)?)?;
        let hidden = (o * self.output_activation.forward(&cell)?)?;
        Ok(LayerState { hidden, cell })
    }

    /// One timestep: `(x_t, h, c) -> (h', c')`.
    pub fn step(&self, x: &Tensor, state: &LayerState, train: bool) -> CandleResult<LayerState> {
        let gates = self.input_gates(x, train)?;
        self.update(&gates, state, train)
    }
}

//! Spatial convolution block: 3×3×3 conv → normalization → activation.
//!
//! candle ships 1D and 2D convolutions only, so [`Conv3d`] is assembled from
//! three `conv2d` passes, one per depth tap of the kernel, over a
//! depth-padded input whose depth axis has been folded into the batch axis.
//! Gradients flow through the standard `conv2d` backward.

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::{Module, ModuleT, VarBuilder};

use crate::activation::{Activation, ActivationMode};
use crate::norm::{Normalization, NormalizationMode};

/// Kernel extent along every spatial axis.
pub const KERNEL_SIZE: usize = 3;

/// Stride-1, same-padding 3D convolution with a 3×3×3 kernel and bias.
#[derive(Debug, Clone)]
pub struct Conv3d {
    /// `[out, in, 3, 3, 3]`
    weight: Tensor,
    /// `[out]`
    bias: Tensor,
    in_channels: usize,
    out_channels: usize,
}

impl Conv3d {
    /// Create a conv layer with Kaiming-style weight init and uniform bias.
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> CandleResult<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, KERNEL_SIZE, KERNEL_SIZE, KERNEL_SIZE),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let fan_in = (in_channels * KERNEL_SIZE.pow(3)) as f64;
        let bound = 1.0 / fan_in.sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            candle_nn::Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
        })
    }

    /// Build directly from tensors (used for deterministic fixtures).
    pub fn from_tensors(weight: Tensor, bias: Tensor) -> CandleResult<Self> {
        let (out_channels, in_channels, kd, kh, kw) = weight.dims5()?;
        if (kd, kh, kw) != (KERNEL_SIZE, KERNEL_SIZE, KERNEL_SIZE) {
            candle_core::bail!("conv3d kernel must be 3x3x3, got {kd}x{kh}x{kw}")
        }
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
        })
    }

    /// Input channel count.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Output channel count.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl Module for Conv3d {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let (batch, channels, depth, height, width) = x.dims5()?;
        if channels != self.in_channels {
            candle_core::bail!(
                "conv3d expects {} input channels, got {channels}",
                self.in_channels
            )
        }

        // Zero-pad depth once; H and W padding is done by conv2d itself
        let padded = x.pad_with_zeros(2, 1, 1)?;

        let mut acc: Option<Tensor> = None;
        for tap in 0..KERNEL_SIZE {
            // [B, C, D, H, W] window starting at this depth tap -> [B*D, C, H, W]
            let slab = padded
                .narrow(2, tap, depth)?
                .permute((0, 2, 1, 3, 4))?
                .reshape((batch * depth, channels, height, width))?;
            let kernel = self.weight.narrow(2, tap, 1)?.squeeze(2)?.contiguous()?;
            let y = slab.conv2d(&kernel, 1, 1, 1, 1)?;
            acc = Some(match acc {
                None => y,
                Some(prev) => (prev + y)?,
            });
        }

        let acc = match acc {
            Some(acc) => acc,
            None => candle_core::bail!("conv3d kernel has no depth taps"),
        };
        let out = acc
            .reshape((batch, depth, self.out_channels, height, width))?
            .permute((0, 2, 1, 3, 4))?;
        out.broadcast_add(&self.bias.reshape((1, self.out_channels, 1, 1, 1))?)
    }
}

/// Construction parameters for a [`ConvBlock`].
#[derive(Debug, Clone, Copy)]
pub struct ConvBlockConfig {
    /// Input channels.
    pub input_size: usize,
    /// Output channels.
    pub output_size: usize,
    /// Normalization applied after the convolution.
    pub normalization: NormalizationMode,
    /// Activation applied after normalization.
    pub activation: ActivationMode,
}

/// `activation(normalization(conv3d(x)))`
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: Conv3d,
    normalization: Normalization,
    activation: Activation,
}

impl ConvBlock {
    /// Create the block; parameters live under `main`, `normalization`, `activation`.
    pub fn new(config: ConvBlockConfig, vb: VarBuilder) -> CandleResult<Self> {
        let conv = Conv3d::new(config.input_size, config.output_size, vb.pp("main"))?;
        let normalization = Normalization::new(
            config.normalization,
            config.output_size,
            vb.pp("normalization"),
        )?;
        let activation = Activation::new(config.activation, vb.pp("activation"))?;
        Ok(Self {
            conv,
            normalization,
            activation,
        })
    }

    /// Apply the block; `train` selects batch statistics for batch norm.
    pub fn apply(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let y = self.conv.forward(x)?;
        let y = self.normalization.forward_t(&y, train)?;
        self.activation.forward(&y)
    }

    /// Output channel count.
    pub fn output_size(&self) -> usize {
        self.conv.out_channels()
    }
}

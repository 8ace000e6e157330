//! Per-layer hidden/cell state and its lifecycle.
//!
//! A [`HiddenState`] holds a fixed-capacity array of `(hidden, cell)` slots,
//! one per recurrent layer, plus a depth cursor. Growth is explicit and
//! bounds-checked: a layer can only be added directly after the deepest one
//! already represented.
//!
//! # State Machine
//!
//! ```text
//! UNINITIALIZED ──(ensure_layer)──▶ ACTIVE ──(detach)──▶ DETACHED
//!                                     ▲                     │
//!                                     └──(set_layer)────────┘
//!
//! any ──(release)──▶ RELEASED ──(ensure_layer)──▶ ACTIVE
//! ```
//!
//! Detaching keeps every value and cuts the autodiff lineage, so a training
//! loop can backpropagate through one truncated window at a time while the
//! physical state carries across windows. Releasing empties the slots.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurbcastError};

/// Lifecycle phase of a [`HiddenState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatePhase {
    /// No layer has been materialized yet.
    Uninitialized,
    /// At least one layer is held and may carry gradient history.
    Active,
    /// All held layers were stripped of gradient history.
    Detached,
    /// Storage was discarded at the end of a call.
    Released,
}

impl StatePhase {
    /// Whether the state currently holds any layer.
    #[must_use]
    pub fn holds_layers(&self) -> bool {
        matches!(self, Self::Active | Self::Detached)
    }
}

/// Hidden and cell activations for one layer, `[batch, channels, *spatial]`.
#[derive(Debug, Clone)]
pub struct LayerState {
    /// Hidden activation `h`.
    pub hidden: Tensor,
    /// Cell activation `c`.
    pub cell: Tensor,
}

impl LayerState {
    /// All-zero state of the given shape.
    pub fn zeros(shape: &[usize], dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self {
            hidden: Tensor::zeros(shape, dtype, device)?,
            cell: Tensor::zeros(shape, dtype, device)?,
        })
    }

    /// Same values, no gradient history.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self {
            hidden: self.hidden.detach(),
            cell: self.cell.detach(),
        }
    }

    /// Shape of the hidden (and cell) tensor.
    pub fn dims(&self) -> &[usize] {
        self.hidden.dims()
    }
}

/// Fixed-capacity per-layer recurrent state with a depth cursor.
#[derive(Debug, Clone)]
pub struct HiddenState {
    layers: Vec<LayerState>,
    capacity: usize,
    phase: StatePhase,
}

impl HiddenState {
    /// Empty state able to hold `capacity` layers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            layers: Vec::with_capacity(capacity),
            capacity,
            phase: StatePhase::Uninitialized,
        }
    }

    /// State with every layer materialized as zeros of `shape`.
    ///
    /// This is how a training driver prepares caller-owned state before the
    /// first window of an epoch.
    pub fn zeros(capacity: usize, shape: &[usize], dtype: DType, device: &Device) -> Result<Self> {
        let mut state = Self::new(capacity);
        for index in 0..capacity {
            state.ensure_layer(index, shape, dtype, device)?;
        }
        Ok(state)
    }

    /// Number of layers currently represented.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Maximum number of layers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> StatePhase {
        self.phase
    }

    /// Whether no layer is represented.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Make sure layer `index` exists with shape `shape`.
    ///
    /// - `index < depth`: the held layer must already have `shape`.
    /// - `index == depth`: one zero layer is appended.
    /// - otherwise: [`TurbcastError::StateIndex`].
    pub fn ensure_layer(
        &mut self,
        index: usize,
        shape: &[usize],
        dtype: DType,
        device: &Device,
    ) -> Result<()> {
        let depth = self.depth();
        if index < depth {
            let held = self.layers[index].dims();
            if held != shape {
                return Err(TurbcastError::shape_mismatch(
                    format!("layer {index} state {shape:?}"),
                    format!("{held:?}"),
                ));
            }
            return Ok(());
        }
        if index > depth || index >= self.capacity {
            return Err(TurbcastError::StateIndex {
                requested: index,
                depth,
                capacity: self.capacity,
            });
        }

        self.layers.push(LayerState::zeros(shape, dtype, device)?);
        self.phase = StatePhase::Active;
        tracing::debug!(layer = index, ?shape, "hidden state extended");
        Ok(())
    }

    /// Borrow layer `index`.
    pub fn layer(&self, index: usize) -> Result<&LayerState> {
        self.layers.get(index).ok_or(TurbcastError::StateIndex {
            requested: index,
            depth: self.layers.len(),
            capacity: self.capacity,
        })
    }

    /// Replace layer `index`, which must already be represented.
    pub fn set_layer(&mut self, index: usize, state: LayerState) -> Result<()> {
        let depth = self.layers.len();
        let capacity = self.capacity;
        let slot = self.layers.get_mut(index).ok_or(TurbcastError::StateIndex {
            requested: index,
            depth,
            capacity,
        })?;
        *slot = state;
        self.phase = StatePhase::Active;
        Ok(())
    }

    /// Cut gradient history of every held tensor, keeping values.
    pub fn detach(&mut self) {
        if self.layers.is_empty() {
            return;
        }
        for layer in &mut self.layers {
            *layer = layer.detach();
        }
        self.phase = StatePhase::Detached;
    }

    /// Drop all held layers.
    pub fn release(&mut self) {
        self.layers.clear();
        self.phase = StatePhase::Released;
        tracing::debug!("hidden state released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    const SHAPE: [usize; 5] = [1, 2, 2, 2, 2];

    #[test]
    fn test_new_is_uninitialized() {
        let state = HiddenState::new(3);
        assert_eq!(state.phase(), StatePhase::Uninitialized);
        assert_eq!(state.depth(), 0);
        assert_eq!(state.capacity(), 3);
        assert!(!state.phase().holds_layers());
    }

    #[test]
    fn test_grows_one_layer_at_a_time() {
        let mut state = HiddenState::new(3);
        state.ensure_layer(0, &SHAPE, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(state.depth(), 1);
        assert_eq!(state.phase(), StatePhase::Active);

        // Already represented: no growth
        state.ensure_layer(0, &SHAPE, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(state.depth(), 1);

        let err = state.ensure_layer(2, &SHAPE, DType::F32, &Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            TurbcastError::StateIndex {
                requested: 2,
                depth: 1,
                capacity: 3
            }
        ));

        state.ensure_layer(1, &SHAPE, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(state.depth(), 2);
    }

    #[test]
    fn test_capacity_bound() {
        let mut state = HiddenState::zeros(2, &SHAPE, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(state.depth(), 2);
        let err = state.ensure_layer(2, &SHAPE, DType::F32, &Device::Cpu).unwrap_err();
        assert!(matches!(err, TurbcastError::StateIndex { .. }));
    }

    #[test]
    fn test_shape_checked_on_existing_layer() {
        let mut state = HiddenState::zeros(1, &SHAPE, DType::F32, &Device::Cpu).unwrap();
        let err = state
            .ensure_layer(0, &[2, 2, 2, 2, 2], DType::F32, &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, TurbcastError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_release_then_regrow() {
        let mut state = HiddenState::zeros(2, &SHAPE, DType::F32, &Device::Cpu).unwrap();
        state.release();
        assert_eq!(state.phase(), StatePhase::Released);
        assert!(state.is_empty());
        assert!(state.layer(0).is_err());

        state.ensure_layer(0, &SHAPE, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(state.phase(), StatePhase::Active);
    }

    #[test]
    fn test_detach_keeps_values_and_cuts_gradient() {
        let device = Device::Cpu;
        let w = Var::new(&[2.0f32, -3.0], &device).unwrap();
        let x = Tensor::new(&[1.5f32, 0.5], &device).unwrap();

        let mut state = HiddenState::new(1);
        state.ensure_layer(0, &[2], DType::F32, &device).unwrap();
        let hidden = w.as_tensor().mul(&x).unwrap();
        let cell = hidden.sqr().unwrap();
        state
            .set_layer(0, LayerState { hidden, cell })
            .unwrap();

        // Before detaching, the held tensors reach `w`
        let before = state.layer(0).unwrap().hidden.sum_all().unwrap();
        let grads = before.backward().unwrap();
        assert!(grads.get(w.as_tensor()).is_some());
        let values_before: Vec<f32> = state.layer(0).unwrap().cell.to_vec1().unwrap();

        state.detach();
        assert_eq!(state.phase(), StatePhase::Detached);

        let values_after: Vec<f32> = state.layer(0).unwrap().cell.to_vec1().unwrap();
        assert_eq!(values_before, values_after);

        // After detaching, they do not
        let after = state.layer(0).unwrap().hidden.sum_all().unwrap();
        let grads = after.backward().unwrap();
        assert!(grads.get(w.as_tensor()).is_none());
    }

    #[test]
    fn test_detach_empty_is_noop() {
        let mut state = HiddenState::new(2);
        state.detach();
        assert_eq!(state.phase(), StatePhase::Uninitialized);
    }
}

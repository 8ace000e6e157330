//! AdamW with global gradient-norm clipping.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::error::{Result, TurbcastError};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Clip the global gradient norm to this value (`None` disables clipping)
    pub max_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
            max_grad_norm: Some(1.0),
        }
    }
}

impl OptimizerConfig {
    /// Create an AdamW optimizer over every variable in `varmap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_adamw(&self, varmap: &VarMap) -> Result<AdamWOptimizer> {
        let vars = varmap.all_vars();
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };

        let inner = candle_nn::AdamW::new(vars.clone(), params)
            .map_err(|e| TurbcastError::training(format!("Failed to create AdamW: {e}")))?;

        Ok(AdamWOptimizer {
            inner,
            vars,
            max_grad_norm: self.max_grad_norm,
        })
    }
}

/// AdamW optimizer wrapper.
pub struct AdamWOptimizer {
    inner: candle_nn::AdamW,
    vars: Vec<Var>,
    max_grad_norm: Option<f64>,
}

impl AdamWOptimizer {
    /// Backpropagate `loss`, clip, and apply one update.
    ///
    /// Returns the global gradient norm before clipping.
    ///
    /// # Errors
    ///
    /// Returns an error if backpropagation fails, the gradient norm is not
    /// finite, or the update cannot be applied.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f64> {
        let mut grads = loss.backward()?;
        let norm = global_grad_norm(&grads, &self.vars)?;
        if let Some(max_norm) = self.max_grad_norm {
            clip_grad_norm(&mut grads, &self.vars, norm, max_norm)?;
        }
        self.inner
            .step(&grads)
            .map_err(|e| TurbcastError::training(format!("Optimizer step failed: {e}")))?;
        Ok(norm)
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}

/// `sqrt(sum ||g||²)` over the gradients of `vars` that received one.
///
/// # Errors
///
/// Returns an error if a gradient cannot be reduced to a scalar.
pub fn global_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    Ok(total.sqrt())
}

/// Rescale gradients so their global norm is at most `max_norm`.
///
/// # Errors
///
/// Returns [`TurbcastError::Training`] if `norm` is not finite.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], norm: f64, max_norm: f64) -> Result<()> {
    if !norm.is_finite() {
        return Err(TurbcastError::training(format!("non-finite gradient norm {norm}")));
    }
    if norm <= max_norm {
        return Ok(());
    }
    let scale = max_norm / (norm + 1e-6);
    for var in vars {
        if let Some(grad) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), grad.affine(scale, 0.0)?);
        }
    }
    Ok(())
}

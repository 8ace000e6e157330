//! Learning rate schedulers, stepped once per epoch.

use serde::{Deserialize, Serialize};

use crate::optimizer::AdamWOptimizer;

/// Learning rate schedule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Constant learning rate.
    #[default]
    Constant,
    /// Multiply by `gamma` every `step_size` epochs.
    Step {
        /// Epochs between decays.
        step_size: usize,
        /// Decay factor.
        gamma: f64,
    },
    /// Multiply by `gamma` at each listed epoch.
    MultiStep {
        /// Epochs at which to decay.
        milestones: Vec<usize>,
        /// Decay factor.
        gamma: f64,
    },
    /// Multiply by `gamma` every epoch.
    Exponential {
        /// Decay factor.
        gamma: f64,
    },
    /// Cosine annealing from the base rate down to `min_lr` over `total_epochs`.
    Cosine {
        /// Length of the annealing period.
        total_epochs: usize,
        /// Floor of the schedule.
        #[serde(default)]
        min_lr: f64,
    },
    /// Multiply by `factor` once the monitored loss stops improving.
    Plateau {
        /// Decay factor.
        factor: f64,
        /// Non-improving epochs tolerated before decaying.
        patience: usize,
        /// Relative improvement that counts as progress.
        #[serde(default = "default_threshold")]
        threshold: f64,
        /// Floor of the schedule.
        #[serde(default)]
        min_lr: f64,
    },
}

fn default_threshold() -> f64 {
    1e-4
}

/// Learning rate scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LRScheduler {
    kind: SchedulerKind,
    base_lr: f64,
    current_lr: f64,
    epoch: usize,
    /// Best monitored value so far (plateau only).
    best: Option<f64>,
    /// Epochs since `best` last improved (plateau only).
    bad_epochs: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    pub fn new(kind: SchedulerKind, base_lr: f64) -> Self {
        Self {
            kind,
            base_lr,
            current_lr: base_lr,
            epoch: 0,
            best: None,
            bad_epochs: 0,
        }
    }

    /// Learning rate for the current epoch.
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    /// Number of completed steps.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Advance one epoch and update the optimizer.
    ///
    /// `metric` is the monitored loss; only the plateau schedule reads it.
    pub fn step(&mut self, metric: Option<f64>, optimizer: &mut AdamWOptimizer) {
        let lr = self.advance(metric);
        optimizer.set_learning_rate(lr);
    }

    /// Advance one epoch and return the new rate.
    pub fn advance(&mut self, metric: Option<f64>) -> f64 {
        self.epoch += 1;
        let epoch = self.epoch;
        self.current_lr = match &self.kind {
            SchedulerKind::Constant => self.base_lr,
            SchedulerKind::Step { step_size, gamma } => {
                let decays = epoch / (*step_size).max(1);
                self.base_lr * gamma.powi(decays as i32)
            }
            SchedulerKind::MultiStep { milestones, gamma } => {
                let decays = milestones.iter().filter(|&&m| m <= epoch).count();
                self.base_lr * gamma.powi(decays as i32)
            }
            SchedulerKind::Exponential { gamma } => self.base_lr * gamma.powi(epoch as i32),
            SchedulerKind::Cosine {
                total_epochs,
                min_lr,
            } => {
                let progress = (epoch as f64 / (*total_epochs).max(1) as f64).min(1.0);
                let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                min_lr + (self.base_lr - min_lr) * cosine
            }
            SchedulerKind::Plateau {
                factor,
                patience,
                threshold,
                min_lr,
            } => {
                let (factor, patience, threshold, min_lr) = (*factor, *patience, *threshold, *min_lr);
                self.plateau(metric, factor, patience, threshold, min_lr)
            }
        };
        self.current_lr
    }

    fn plateau(
        &mut self,
        metric: Option<f64>,
        factor: f64,
        patience: usize,
        threshold: f64,
        min_lr: f64,
    ) -> f64 {
        let Some(value) = metric else {
            return self.current_lr;
        };
        if self.best.map_or(true, |best| value < best * (1.0 - threshold)) {
            self.best = Some(value);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }
        if self.bad_epochs > patience {
            self.bad_epochs = 0;
            let reduced = (self.current_lr * factor).max(min_lr);
            tracing::info!("Reducing learning rate to {reduced:.3e}");
            reduced
        } else {
            self.current_lr
        }
    }
}

//! Training and evaluation loops.
//!
//! Training threads one externally owned [`HiddenState`] through the
//! truncated-history windows of an epoch: it starts at zero for every layer,
//! is detached before each window so gradients stop at the window boundary,
//! and carries its values into the next window. Evaluation and rollout are
//! stateless: every call starts from a fresh zero state that the model
//! releases on return.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use crate::autoencoder::CodeAutoencoder;
use crate::checkpoint::{self, EpochRecord, TrainingState};
use crate::config::{DiagnosticsConfig, EvaluationConfig, TurbcastConfig};
use crate::data::{subsample, CodeWindows};
use crate::diagnostics::DiagnosticsReport;
use crate::error::{Result, TurbcastError};
use crate::metrics::{self, MetricLogger, LOSS};
use crate::model::{ConvLstm, ForecastInput};
use crate::optimizer::{AdamWOptimizer, OptimizerConfig};
use crate::scheduler::LRScheduler;
use crate::state::HiddenState;

/// Epoch driver for a [`ConvLstm`].
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use std::path::Path;
/// use turbcast_rs::{data, Trainer, TurbcastConfig};
///
/// # fn main() -> turbcast_rs::Result<()> {
/// let config = TurbcastConfig::from_file("config.yaml")?;
/// let train = data::load_codes(Path::new(&config.data.train_codes), &Device::Cpu)?;
/// let test = data::load_codes(Path::new(&config.data.test_codes), &Device::Cpu)?;
///
/// let mut trainer = Trainer::new(config, &Device::Cpu)?;
/// trainer.fit(&train, Some(&test))?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: TurbcastConfig,
    model: ConvLstm,
    optimizer: AdamWOptimizer,
    state: TrainingState,
}

impl Trainer {
    /// Build a fresh model and optimizer for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation or the model cannot be built.
    pub fn new(config: TurbcastConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        if !device.is_cpu() {
            device.set_seed(config.seed)?;
        }

        let model = ConvLstm::new(&config.model, device)?;
        let optimizer = OptimizerConfig {
            learning_rate: config.training.learning_rate,
            weight_decay: config.training.weight_decay,
            max_grad_norm: Some(config.training.max_grad_norm),
            ..OptimizerConfig::default()
        }
        .build_adamw(model.var_map())?;
        tracing::info!(
            "Initialized ConvLSTM with {} parameters, lr={}",
            model.parameter_count(),
            optimizer.learning_rate()
        );

        let scheduler = LRScheduler::new(
            config.training.scheduler.clone(),
            config.training.learning_rate,
        );
        Ok(Self {
            config,
            model,
            optimizer,
            state: TrainingState::new(scheduler),
        })
    }

    /// Restore parameters, epoch counter and schedule from a checkpoint.
    ///
    /// AdamW moments and step count are not stored in checkpoints, so the
    /// optimizer restarts from zero moments and bias correction. A resumed
    /// run is therefore not equivalent to an uninterrupted one.
    ///
    /// # Errors
    ///
    /// Returns [`TurbcastError::Checkpoint`] if the checkpoint cannot be read.
    pub fn resume_from(&mut self, dir: &Path) -> Result<()> {
        self.state = checkpoint::resume(dir, &mut self.model)?;
        self.optimizer.set_learning_rate(self.state.learning_rate);
        Ok(())
    }

    /// The model being trained.
    pub fn model(&self) -> &ConvLstm {
        &self.model
    }

    /// Mutable access for evaluation outside the trainer.
    pub fn model_mut(&mut self) -> &mut ConvLstm {
        &mut self.model
    }

    /// Epoch counter, pivot and history.
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Run configuration.
    pub fn config(&self) -> &TurbcastConfig {
        &self.config
    }

    /// Directory the latest checkpoint is written to.
    pub fn checkpoint_dir(&self) -> PathBuf {
        checkpoint::latest_dir(Path::new(&self.config.output_dir))
    }

    /// Directory the best checkpoint is copied to.
    pub fn best_dir(&self) -> PathBuf {
        checkpoint::best_dir(Path::new(&self.config.output_dir))
    }

    /// Train one epoch over `codes` `[B, T, d, h, w]`.
    ///
    /// # Errors
    ///
    /// Returns [`TurbcastError::Data`] if `codes` is shorter than one window,
    /// or any error raised by the forward pass or the optimizer step.
    pub fn train_epoch(&mut self, codes: &Tensor) -> Result<MetricLogger> {
        let model_config = self.config.model.clone();
        let windows = CodeWindows::new(codes, model_config.bptt, model_config.pred_length)?;
        let num_windows = windows.len();
        if num_windows == 0 {
            return Err(TurbcastError::data(format!(
                "sequence of {} steps is shorter than one window ({})",
                codes.dim(1)?,
                model_config.window_length()
            )));
        }

        let batch = windows.batch_size()?;
        let (d, h, w) = windows.spatial_dims()?;
        let mut hidden = HiddenState::zeros(
            model_config.num_layers,
            &[batch, model_config.output_size, d, h, w],
            DType::F32,
            self.model.device(),
        )?;

        let pb = ProgressBar::new(num_windows as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")
                .map_err(|e| TurbcastError::training(format!("progress bar template: {e}")))?
                .progress_chars("#>-"),
        );

        let log_every = (num_windows as f64 * self.config.training.log_interval) as usize + 1;
        let mut logger = MetricLogger::new();
        for (i, window) in windows.enumerate() {
            let window = window?;
            hidden.detach();

            let output = self.model.forward(&window, Some(&mut hidden), true)?;
            let grad_norm = self.optimizer.backward_step(&output.loss)?;

            let evaluation = metrics::evaluate_codes(&window, &output)?;
            logger.append(&evaluation, batch);
            pb.set_message(format!("{:.4}", evaluation[LOSS]));
            pb.inc(1);

            if i % log_every == 0 {
                tracing::info!(
                    "Train Epoch {} ({:.0}%), Loss: {:.4}, GradNorm: {:.4}, LR: {:.2e}",
                    self.state.epoch + 1,
                    100.0 * i as f64 / num_windows as f64,
                    evaluation[LOSS],
                    grad_norm,
                    self.optimizer.learning_rate()
                );
            }
        }
        pb.finish_and_clear();
        Ok(logger)
    }

    /// Stateless evaluation over `codes` `[B, T, d, h, w]`.
    ///
    /// # Errors
    ///
    /// Returns an error if `codes` is not a code sequence or a forward pass fails.
    pub fn evaluate(&mut self, codes: &Tensor) -> Result<MetricLogger> {
        evaluate(&mut self.model, codes)
    }

    /// Train until `training.epochs`, checkpointing after every epoch.
    ///
    /// The plateau schedule monitors the training loss; the best checkpoint
    /// follows the test loss (the training loss when `test_codes` is `None`).
    ///
    /// # Errors
    ///
    /// Returns an error if an epoch fails or a checkpoint cannot be written.
    pub fn fit(&mut self, train_codes: &Tensor, test_codes: Option<&Tensor>) -> Result<&TrainingState> {
        let epochs = self.config.training.epochs;
        tracing::info!("Starting training at epoch {} of {}", self.state.epoch + 1, epochs);
        let latest = self.checkpoint_dir();
        let best = self.best_dir();

        while self.state.epoch < epochs {
            let epoch = self.state.epoch + 1;
            let learning_rate = self.optimizer.learning_rate();

            let train = self.train_epoch(train_codes)?;
            let test = match test_codes {
                Some(codes) => self.evaluate(codes)?,
                None => MetricLogger::new(),
            };
            let train_loss = train.mean(LOSS);
            let pivot_loss = test.mean(LOSS).or(train_loss);
            tracing::info!("Epoch {epoch}/{epochs} train: {}", train.summary());
            if test_codes.is_some() {
                tracing::info!("Epoch {epoch}/{epochs} test: {}", test.summary());
            }

            self.state.scheduler.step(train_loss, &mut self.optimizer);
            self.state.history.push(EpochRecord {
                epoch,
                learning_rate,
                train: train.means(),
                test: test.means(),
            });
            self.state.epoch = epoch;
            self.state.learning_rate = self.optimizer.learning_rate();
            let improved = pivot_loss.map_or(false, |loss| self.state.improve_pivot(loss));

            checkpoint::save(&latest, &self.model, &self.state, &self.config)?;
            if improved {
                checkpoint::copy(&latest, &best)?;
            }
        }
        Ok(&self.state)
    }
}

/// Stateless evaluation of `model` over `codes` windows with stride `bptt`.
///
/// # Errors
///
/// Returns an error if `codes` is not a code sequence or a forward pass fails.
pub fn evaluate(model: &mut ConvLstm, codes: &Tensor) -> Result<MetricLogger> {
    let (bptt, pred_length) = (model.config().bptt, model.config().pred_length);
    let windows = CodeWindows::new(codes, bptt, pred_length)?;
    let batch = windows.batch_size()?;

    let mut logger = MetricLogger::new();
    for window in windows {
        let window = window?;
        let output = model.forward(&window, None, false)?;
        logger.append(&metrics::evaluate_codes(&window, &output)?, batch);
    }
    Ok(logger)
}

/// Decoder and ground-truth velocities for physics metrics during a rollout.
pub struct PhysicsTargets<'a> {
    /// Maps predicted codes back to velocity fields.
    pub autoencoder: &'a dyn CodeAutoencoder,
    /// True velocities `[B, T, 3, G, G, G]` aligned with the code sequence.
    pub uvw: &'a Tensor,
}

/// Output of [`rollout`].
#[derive(Debug)]
pub struct Rollout {
    /// Metric means over all windows.
    pub metrics: MetricLogger,
    /// Predicted codes of every window, concatenated along time.
    pub predicted: Tensor,
    /// `(true, decoded)` velocities `[B * P, 3, G, G, G]` of the last window.
    pub last_fields: Option<(Tensor, Tensor)>,
}

impl Rollout {
    /// Diagnostics of the last window's true vs. decoded velocities.
    ///
    /// `None` when the rollout ran without physics targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the fields do not match `config.grid_size`.
    pub fn diagnostics(&self, config: &DiagnosticsConfig) -> Result<Option<DiagnosticsReport>> {
        match &self.last_fields {
            Some((original, reconstructed)) => {
                Ok(Some(DiagnosticsReport::compute(original, reconstructed, config)?))
            }
            None => Ok(None),
        }
    }
}

/// Multi-window forecast over `codes` `[B, T, d, h, w]`.
///
/// The sequence is first subsampled by `data_increment`. Windows advance by
/// `pred_length`, so with `cyclic_prediction` the codes predicted by one
/// window replace the true codes at those steps and become history for the
/// windows that follow. Without it every window sees true history.
///
/// # Errors
///
/// Returns [`TurbcastError::Data`] if the subsampled sequence is shorter than
/// one window, and [`TurbcastError::ShapeMismatch`] if the physics targets do
/// not line up with `codes`.
pub fn rollout(
    model: &mut ConvLstm,
    codes: &Tensor,
    settings: &EvaluationConfig,
    physics: Option<PhysicsTargets<'_>>,
) -> Result<Rollout> {
    let (bptt, pred_length) = (model.config().bptt, model.config().pred_length);
    let codes = subsample(&codes.to_dtype(DType::U32)?, settings.data_increment)?;
    let uvw = match &physics {
        Some(targets) => Some(subsample(targets.uvw, settings.data_increment)?),
        None => None,
    };

    let (batch, steps) = (codes.dim(0)?, codes.dim(1)?);
    let window = bptt + pred_length;
    if steps < window {
        return Err(TurbcastError::data(format!(
            "sequence of {steps} steps is shorter than one window ({window})"
        )));
    }
    if let Some(uvw) = &uvw {
        if uvw.rank() != 6 || uvw.dim(0)? != batch || uvw.dim(1)? != steps {
            return Err(TurbcastError::shape_mismatch(
                format!("uvw [{batch}, {steps}, 3, G, G, G]"),
                format!("{:?}", uvw.dims()),
            ));
        }
    }

    // One [B, 1, d, h, w] slice per step, overwritten by predictions when cyclic
    let mut history: Vec<Tensor> = (0..steps)
        .map(|t| codes.narrow(1, t, 1))
        .collect::<candle_core::Result<_>>()?;

    let mut logger = MetricLogger::new();
    let mut predicted = Vec::new();
    let mut last_fields = None;
    let mut start = 0;
    while start + window <= steps {
        let code = if bptt == 0 {
            codes.narrow(1, start, 0)?
        } else {
            Tensor::cat(&history[start..start + bptt], 1)?
        };
        let input = ForecastInput {
            code,
            ncode: codes.narrow(1, start + bptt, pred_length)?,
        };
        let output = model.forward(&input, None, false)?;
        let mut evaluation = metrics::evaluate_codes(&input, &output)?;

        if let (Some(targets), Some(uvw)) = (&physics, &uvw) {
            let (_, _, d, h, w) = output.code.dims5()?;
            let flat = output.code.reshape((batch * pred_length, d, h, w))?;
            let decoded = targets.autoencoder.decode(&flat)?;
            let truth = uvw.narrow(1, start + bptt, pred_length)?;
            let truth = truth.reshape(decoded.dims())?.to_dtype(decoded.dtype())?;
            evaluation.extend(metrics::evaluate_fields(&decoded, &truth)?);
            last_fields = Some((truth, decoded));
        }
        logger.append(&evaluation, batch);

        if settings.cyclic_prediction {
            for p in 0..pred_length {
                history[start + bptt + p] = output.code.narrow(1, p, 1)?;
            }
        }
        predicted.push(output.code);
        start += pred_length;
    }

    tracing::info!(
        "Rollout over {} windows (cyclic={}): {}",
        predicted.len(),
        settings.cyclic_prediction,
        logger.summary()
    );
    Ok(Rollout {
        metrics: logger,
        predicted: Tensor::cat(&predicted, 1)?,
        last_fields,
    })
}

//! Training checkpoints.
//!
//! A checkpoint is a directory holding:
//! - `model.safetensors` - every model parameter
//! - `training_state.json` - epoch counter, learning rate, best loss, scheduler, history
//! - `config.yaml` - the configuration the run was started with
//!
//! The trainer rewrites `<output_dir>/checkpoint` after every epoch and
//! copies it to `<output_dir>/best` whenever the test loss improves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::TurbcastConfig;
use crate::error::{Result, TurbcastError};
use crate::model::ConvLstm;
use crate::scheduler::LRScheduler;

/// Parameter file inside a checkpoint directory.
pub const MODEL_FILE: &str = "model.safetensors";
/// Training state file inside a checkpoint directory.
pub const STATE_FILE: &str = "training_state.json";
/// Configuration file inside a checkpoint directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Latest checkpoint directory under `output_dir`.
pub fn latest_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("checkpoint")
}

/// Best checkpoint directory under `output_dir`.
pub fn best_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("best")
}

/// Metric means of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Learning rate used during the epoch.
    pub learning_rate: f64,
    /// Training metric means.
    pub train: BTreeMap<String, f64>,
    /// Test metric means.
    pub test: BTreeMap<String, f64>,
}

/// Everything besides parameters needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs.
    pub epoch: usize,
    /// Learning rate for the next epoch.
    pub learning_rate: f64,
    /// Lowest test loss seen so far.
    pub pivot: Option<f64>,
    /// Scheduler position.
    pub scheduler: LRScheduler,
    /// Per-epoch metric means.
    pub history: Vec<EpochRecord>,
}

impl TrainingState {
    /// State of a run that has not started.
    pub fn new(scheduler: LRScheduler) -> Self {
        Self {
            epoch: 0,
            learning_rate: scheduler.get_lr(),
            pivot: None,
            scheduler,
            history: Vec::new(),
        }
    }

    /// Record `test_loss`; true when it beats the previous best.
    pub fn improve_pivot(&mut self, test_loss: f64) -> bool {
        let improved = self.pivot.map_or(true, |pivot| test_loss < pivot);
        if improved {
            self.pivot = Some(test_loss);
        }
        improved
    }
}

/// Write a checkpoint into `dir`, creating it if needed.
///
/// # Errors
///
/// Returns an error if the directory or any checkpoint file cannot be written.
pub fn save(dir: &Path, model: &ConvLstm, state: &TrainingState, config: &TurbcastConfig) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    model.save(&dir.join(MODEL_FILE))?;

    let state_json = serde_json::to_string_pretty(state)
        .map_err(|e| TurbcastError::checkpoint(format!("Failed to serialize state: {e}")))?;
    std::fs::write(dir.join(STATE_FILE), state_json)?;
    config.to_file(dir.join(CONFIG_FILE))?;

    tracing::info!("Saved checkpoint to: {}", dir.display());
    Ok(())
}

/// Read the training state of a checkpoint.
///
/// # Errors
///
/// Returns [`TurbcastError::Checkpoint`] if the state file is missing or malformed.
pub fn load_state(dir: &Path) -> Result<TrainingState> {
    let path = dir.join(STATE_FILE);
    let json = std::fs::read_to_string(&path)
        .map_err(|e| TurbcastError::checkpoint(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&json)
        .map_err(|e| TurbcastError::checkpoint(format!("Failed to parse state: {e}")))
}

/// Read the configuration stored with a checkpoint.
///
/// # Errors
///
/// Returns an error if `config.yaml` is missing or not a valid configuration.
pub fn load_config(dir: &Path) -> Result<TurbcastConfig> {
    TurbcastConfig::from_file(dir.join(CONFIG_FILE))
}

/// Overwrite `model`'s parameters from a checkpoint and return its state.
///
/// # Errors
///
/// Returns [`TurbcastError::Checkpoint`] if the state or parameters cannot be
/// read, or do not fit `model`.
pub fn resume(dir: &Path, model: &mut ConvLstm) -> Result<TrainingState> {
    let state = load_state(dir)?;
    model.load_weights(&dir.join(MODEL_FILE))?;
    tracing::info!(
        "Loaded checkpoint from: {} (epoch={}, lr={:.3e})",
        dir.display(),
        state.epoch,
        state.learning_rate
    );
    Ok(state)
}

/// Copy every checkpoint file from `from` into `to`.
///
/// # Errors
///
/// Returns an error if a checkpoint file is missing or cannot be copied.
pub fn copy(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for name in [MODEL_FILE, STATE_FILE, CONFIG_FILE] {
        std::fs::copy(from.join(name), to.join(name))?;
    }
    tracing::info!("Copied checkpoint {} -> {}", from.display(), to.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerKind;
    use candle_core::Device;

    #[test]
    fn test_pivot_tracking() {
        let mut state = TrainingState::new(LRScheduler::new(SchedulerKind::Constant, 1e-3));
        assert!(state.improve_pivot(2.0));
        assert!(!state.improve_pivot(2.5));
        assert!(state.improve_pivot(1.5));
        assert_eq!(state.pivot, Some(1.5));
    }

    #[test]
    fn test_save_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let config = TurbcastConfig::test_preset();
        let model = ConvLstm::new(&config.model, &Device::Cpu).unwrap();

        let mut state = TrainingState::new(LRScheduler::new(SchedulerKind::Constant, 1e-3));
        state.epoch = 3;
        state.improve_pivot(0.75);
        save(dir.path(), &model, &state, &config).unwrap();

        let mut other = ConvLstm::new(&config.model, &Device::Cpu).unwrap();
        let restored = resume(dir.path(), &mut other).unwrap();
        assert_eq!(restored, state);
        assert_eq!(load_config(dir.path()).unwrap(), config);

        let best = dir.path().join("best");
        copy(dir.path(), &best).unwrap();
        assert!(best.join(MODEL_FILE).exists());
        assert_eq!(load_state(&best).unwrap().pivot, Some(0.75));
    }

    #[test]
    fn test_missing_state() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_state(dir.path()).unwrap_err();
        assert!(matches!(err, TurbcastError::Checkpoint(_)));
    }
}

//! Integration tests for training, checkpointing and rollout.

use candle_core::{Device, Tensor};
use turbcast_rs::checkpoint;
use turbcast_rs::metrics::LOSS;
use turbcast_rs::{rollout, ConvLstm, EvaluationConfig, ForecastInput, Trainer, TurbcastConfig};

fn config(dir: &std::path::Path) -> TurbcastConfig {
    let mut config = TurbcastConfig::test_preset();
    config.output_dir = dir.display().to_string();
    config
}

fn sequence(steps: usize) -> Tensor {
    let n = steps * 8;
    let values: Vec<u32> = (0..n as u32).map(|i| (i / 8 * 3 + i % 5) % 8).collect();
    Tensor::from_vec(values, (1, steps, 2, 2, 2), &Device::Cpu).unwrap()
}

fn codes(t: &Tensor) -> Vec<u32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

#[test]
fn test_loss_decreases_on_constant_target() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.training.epochs = 15;
    config.training.learning_rate = 1e-2;
    let constant = Tensor::full(3u32, (2, 7, 2, 2, 2), &Device::Cpu).unwrap();

    let mut trainer = Trainer::new(config, &Device::Cpu).unwrap();
    let state = trainer.fit(&constant, None).unwrap();

    let first = state.history.first().unwrap().train[LOSS];
    let last = state.history.last().unwrap().train[LOSS];
    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn test_best_checkpoint_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mut trainer = Trainer::new(config.clone(), &Device::Cpu).unwrap();
    trainer.fit(&sequence(9), Some(&sequence(5))).unwrap();

    let best = trainer.best_dir();
    let state = checkpoint::load_state(&best).unwrap();
    assert!(state.pivot.is_some());
    assert_eq!(checkpoint::load_config(&best).unwrap(), config);

    let mut latest = ConvLstm::load(
        &config.model,
        &trainer.checkpoint_dir().join(checkpoint::MODEL_FILE),
        &Device::Cpu,
    )
    .unwrap();
    let window = ForecastInput {
        code: sequence(5).narrow(1, 0, 2).unwrap(),
        ncode: sequence(5).narrow(1, 2, 1).unwrap(),
    };
    let a = latest.forward(&window, None, false).unwrap().score;
    let b = trainer.model_mut().forward(&window, None, false).unwrap().score;
    let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_cyclic_rollout_feeds_predictions_back() {
    let config = TurbcastConfig::test_preset();
    let mut model = ConvLstm::new(&config.model, &Device::Cpu).unwrap();
    let truth = sequence(5);

    let settings = EvaluationConfig {
        cyclic_prediction: true,
        data_increment: 1,
    };
    let result = rollout(&mut model, &truth, &settings, None).unwrap();
    assert_eq!(result.predicted.dims(), &[1, 3, 2, 2, 2]);

    // bptt 2, pred_length 1: the third window sees only predictions
    let p0 = result.predicted.narrow(1, 0, 1).unwrap();
    let p1 = result.predicted.narrow(1, 1, 1).unwrap();
    let window = ForecastInput {
        code: Tensor::cat(&[&p0, &p1], 1).unwrap(),
        ncode: truth.narrow(1, 4, 1).unwrap(),
    };
    let expected = model.forward(&window, None, false).unwrap().code;
    assert_eq!(codes(&result.predicted.narrow(1, 2, 1).unwrap()), codes(&expected));

    // Without feedback the same window sees the true history
    let open_loop = EvaluationConfig {
        cyclic_prediction: false,
        data_increment: 1,
    };
    let result = rollout(&mut model, &truth, &open_loop, None).unwrap();
    let window = ForecastInput {
        code: truth.narrow(1, 2, 2).unwrap(),
        ncode: truth.narrow(1, 4, 1).unwrap(),
    };
    let expected = model.forward(&window, None, false).unwrap().code;
    assert_eq!(codes(&result.predicted.narrow(1, 2, 1).unwrap()), codes(&expected));
}

#[test]
fn test_rollout_subsamples_time() {
    let config = TurbcastConfig::test_preset();
    let mut model = ConvLstm::new(&config.model, &Device::Cpu).unwrap();
    let settings = EvaluationConfig {
        cyclic_prediction: false,
        data_increment: 2,
    };
    // 9 steps -> 5 kept -> 3 windows
    let result = rollout(&mut model, &sequence(9), &settings, None).unwrap();
    assert_eq!(result.predicted.dim(1).unwrap(), 3);
}

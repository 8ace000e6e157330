//! Integration tests for the turbcast CLI.

use assert_cmd::Command;
use candle_core::{Device, Tensor};
use tempfile::TempDir;
use turbcast_rs::{data, TurbcastConfig};

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("turbcast").expect("Failed to find turbcast binary");
    cmd.args(args);
    cmd
}

#[test]
fn test_init_then_validate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    let path = path.to_str().unwrap();

    run_cli(&["init", path, "--preset", "test"]).assert().success();
    run_cli(&["validate", path]).assert().success();

    let config = TurbcastConfig::from_file(path).unwrap();
    assert_eq!(config, TurbcastConfig::test_preset());
}

#[test]
fn test_init_unknown_preset_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    run_cli(&["init", path.to_str().unwrap(), "--preset", "nope"])
        .assert()
        .failure();
}

#[test]
fn test_validate_rejects_unknown_activation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    let mut yaml = serde_yaml::to_string(&TurbcastConfig::test_preset()).unwrap();
    yaml = yaml.replace("activation: tanh", "activation: swish");
    std::fs::write(&path, yaml).unwrap();

    run_cli(&["validate", path.to_str().unwrap()]).assert().failure();
}

#[test]
fn test_train_writes_checkpoint() {
    let dir = TempDir::new().unwrap();
    let codes_path = dir.path().join("train.safetensors");
    let codes = Tensor::full(1u32, (1, 5, 2, 2, 2), &Device::Cpu).unwrap();
    data::save_codes(&codes, &codes_path).unwrap();

    let mut config = TurbcastConfig::test_preset();
    config.training.epochs = 1;
    config.data.train_codes = codes_path.display().to_string();
    config.output_dir = dir.path().join("out").display().to_string();
    let config_path = dir.path().join("config.yaml");
    config.to_file(&config_path).unwrap();

    run_cli(&["train", config_path.to_str().unwrap()]).assert().success();
    assert!(dir.path().join("out/checkpoint/model.safetensors").exists());
    assert!(dir.path().join("out/best/training_state.json").exists());
}

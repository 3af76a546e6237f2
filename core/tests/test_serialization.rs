//! JSON round-trips: configs, epoch reports, checkpoints and resume.

use mstcn_core::adam::{Adam, AdamConfig};
use mstcn_core::trainer::SplitStats;
use mstcn_core::{CheckpointStore, Device, EpochReport, ModelConfig, MultiStageModel, TrainConfig, Trainer};

#[test]
fn test_train_config_partial_json() {
    let cfg: TrainConfig = serde_json::from_str(r#"{"sample_rate": 2, "num_epochs": 5}"#).unwrap();
    assert_eq!(cfg.sample_rate, 2);
    assert_eq!(cfg.num_epochs, 5);
    assert_eq!(cfg.batch_size, TrainConfig::default().batch_size);
    assert_eq!(cfg.seed, 1_538_574_472);
    assert_eq!(cfg.device, Device::Cpu);
}

#[test]
fn test_unknown_device_in_json_is_rejected() {
    let res: Result<TrainConfig, _> = serde_json::from_str(r#"{"device": "cuda"}"#);
    assert!(res.is_err());
}

#[test]
fn test_model_config_round_trip() {
    let cfg = ModelConfig::mstcn(2048, 48);
    let json = serde_json::to_string(&cfg).unwrap();
    let back: ModelConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, cfg);
}

#[test]
fn test_epoch_report_json_fields() {
    let report = EpochReport {
        epoch: 3,
        train: SplitStats { loss: 1.25, accuracy: 0.5, valid_frames: 100 },
        test: SplitStats { loss: 2.0, accuracy: 0.25, valid_frames: 40 },
    };
    let value: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["epoch"], 3);
    assert_eq!(value["train"]["accuracy"], 0.5);
    assert_eq!(value["test"]["valid_frames"], 40);
}

#[test]
fn test_checkpoint_preserves_parameters_and_moments() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut model = MultiStageModel::init(&ModelConfig::test_config(), 11).unwrap();
    let mut opt = Adam::new(&model, AdamConfig::default());
    for _ in 0..3 {
        let grads = model.clone();
        opt.step(&mut model, &grads, 1e-2);
    }
    store.save(7, &model, &opt).unwrap();

    let resumed = Trainer::resume(&store, 7, 0).unwrap();
    assert_eq!(resumed.epoch(), 7);
    assert_eq!(resumed.model, model);
    assert_eq!(resumed.optimizer, opt);
    assert_eq!(resumed.optimizer.step_count(), 3);
}

#[test]
fn test_checkpoint_with_inconsistent_buffers_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut model = MultiStageModel::init(&ModelConfig::test_config(), 11).unwrap();
    let opt = Adam::new(&model, AdamConfig::default());
    // declared config no longer matches the stored buffers
    model.config.num_f_maps = 9;
    store.save(1, &model, &opt).unwrap();
    assert!(matches!(store.load_model(1).unwrap_err(), mstcn_core::SegError::Checkpoint { .. }));
}

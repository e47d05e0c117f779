mod common;

use std::sync::Arc;

use common::{clustered_features, flat_values, probe_config, NanLoss, EMBED_DIM};
use model::{BackboneHandle, Identity};
use tempfile::tempdir;
use training::{
    data::VAL_FILE, latest_checkpoint, logging::LOG_FILENAME, Dataset, DistributedContext, ProbeConfig, Trainer,
    TrainingError,
};

fn build_trainer(config: ProbeConfig) -> Result<Trainer, TrainingError> {
    let train: Arc<dyn Dataset> = Arc::new(clustered_features(64, 0));
    let val: Arc<dyn Dataset> = Arc::new(clustered_features(16, 2));
    Trainer::with_components(
        config,
        DistributedContext::standalone(),
        BackboneHandle::new(Identity::new(EMBED_DIM)),
        train,
        val,
    )
}

fn state_values(trainer: &Trainer) -> Vec<Vec<f32>> {
    let classifier = trainer.classifier();
    classifier
        .parameters()
        .into_iter()
        .chain(classifier.buffers())
        .map(|(_, var)| flat_values(var.as_tensor()))
        .collect()
}

#[test]
fn resume_continues_after_the_last_saved_epoch() {
    let tmp = tempdir().unwrap();
    let output_dir = tmp.path().join("run");
    let config = probe_config(tmp.path(), Some(&output_dir), "");

    let mut first = build_trainer(config.clone()).unwrap();
    first.run().unwrap();
    let saved_state = state_values(&first);
    let saved_optimizer = first.optimizer().state().unwrap();

    let latest = latest_checkpoint(&output_dir).unwrap().unwrap();
    assert_eq!(latest.manifest.epoch, 1);

    let mut resumed_config = config;
    resumed_config.scheduler.epochs = 3;
    resumed_config.runtime.resume = Some(output_dir.clone());
    let mut resumed = build_trainer(resumed_config).unwrap();

    assert_eq!(resumed.start_epoch(), 2);
    assert_eq!(Some(resumed.max_accuracy()), latest.manifest.best_acc1);
    assert_eq!(state_values(&resumed), saved_state);

    let restored_optimizer = resumed.optimizer().state().unwrap();
    assert_eq!(restored_optimizer.step, saved_optimizer.step);
    for (restored, saved) in restored_optimizer
        .parameters
        .iter()
        .zip(&saved_optimizer.parameters)
    {
        assert_eq!(restored.name, saved.name);
        for (key, values) in &saved.buffers {
            let restored_values = &restored.buffers[key];
            assert_eq!(restored_values.len(), values.len());
            for (a, b) in restored_values.iter().zip(values) {
                assert!((a - b).abs() < 1e-6, "{} differs: {} vs {}", key, a, b);
            }
        }
    }

    let summary = resumed.run().unwrap();
    assert_eq!(summary.epochs_run, 1);
    let log = std::fs::read_to_string(output_dir.join(LOG_FILENAME)).unwrap();
    assert_eq!(log.lines().count(), 3);
    assert_eq!(
        latest_checkpoint(&output_dir).unwrap().unwrap().manifest.epoch,
        2
    );
}

#[test]
fn eval_only_restores_weights_without_moving_the_epoch() {
    let tmp = tempdir().unwrap();
    let output_dir = tmp.path().join("run");
    let config = probe_config(tmp.path(), Some(&output_dir), "");
    let mut first = build_trainer(config.clone()).unwrap();
    first.run().unwrap();
    let saved_state = state_values(&first);

    let mut eval_config = config;
    eval_config.runtime.eval = true;
    eval_config.runtime.resume = Some(output_dir.join("checkpoint-0001"));
    let mut evaluator = build_trainer(eval_config).unwrap();

    assert_eq!(evaluator.start_epoch(), 0);
    assert_eq!(evaluator.optimizer().steps(), 0);
    assert_eq!(state_values(&evaluator), saved_state);

    let summary = evaluator.run().unwrap();
    assert_eq!(summary.epochs_run, 0);
    let test = summary.last_test.unwrap();
    assert!(test.contains_key("acc1") && test.contains_key("acc5"));
    assert_eq!(
        std::fs::read_to_string(output_dir.join(LOG_FILENAME))
            .unwrap()
            .lines()
            .count(),
        2
    );
}

#[test]
fn eval_only_run_needs_no_training_split() {
    let tmp = tempdir().unwrap();
    let output_dir = tmp.path().join("run");
    let config = probe_config(tmp.path(), Some(&output_dir), "");
    let mut first = build_trainer(config.clone()).unwrap();
    first.run().unwrap();
    let saved_state = state_values(&first);

    let data_dir = tmp.path().join("val-only");
    clustered_features(16, 2).save(data_dir.join(VAL_FILE)).unwrap();
    let mut eval_config = config.clone();
    eval_config.data.data_path = data_dir.clone();
    eval_config.runtime.eval = true;
    eval_config.runtime.resume = Some(output_dir.clone());

    let mut evaluator = Trainer::new(eval_config, DistributedContext::standalone()).unwrap();
    assert_eq!(evaluator.steps_per_epoch(), 0);
    assert_eq!(state_values(&evaluator), saved_state);
    let summary = evaluator.run().unwrap();
    assert_eq!(summary.epochs_run, 0);
    assert!(summary.last_test.unwrap().contains_key("acc1"));

    let mut train_config = config;
    train_config.data.data_path = data_dir;
    assert!(matches!(
        Trainer::new(train_config, DistributedContext::standalone()),
        Err(TrainingError::Initialization(_))
    ));
}

#[test]
fn eval_only_accepts_a_training_split_smaller_than_a_batch() {
    let tmp = tempdir().unwrap();
    let mut config = probe_config(tmp.path(), None, "");
    config.runtime.eval = true;
    let tiny: Arc<dyn Dataset> = Arc::new(clustered_features(3, 0));
    let val: Arc<dyn Dataset> = Arc::new(clustered_features(16, 2));

    let mut evaluator = Trainer::with_components(
        config.clone(),
        DistributedContext::standalone(),
        BackboneHandle::new(Identity::new(EMBED_DIM)),
        tiny.clone(),
        val.clone(),
    )
    .unwrap();
    assert!(evaluator.run().unwrap().last_test.is_some());

    config.runtime.eval = false;
    assert!(matches!(
        Trainer::with_components(
            config,
            DistributedContext::standalone(),
            BackboneHandle::new(Identity::new(EMBED_DIM)),
            tiny,
            val,
        ),
        Err(TrainingError::Initialization(_))
    ));
}

#[test]
fn non_finite_loss_stops_before_any_checkpoint() {
    let tmp = tempdir().unwrap();
    let output_dir = tmp.path().join("run");
    let config = probe_config(tmp.path(), Some(&output_dir), "");
    let mut trainer = build_trainer(config).unwrap().with_criterion(Box::new(NanLoss));

    match trainer.run() {
        Err(TrainingError::NonFiniteLoss { epoch, step, value }) => {
            assert_eq!((epoch, step), (0, 0));
            assert!(value.is_nan());
        }
        other => panic!("expected a non-finite loss error, got {:?}", other.map(|_| ())),
    }
    assert!(latest_checkpoint(&output_dir).unwrap().is_none());
    assert_eq!(trainer.optimizer().steps(), 0);
}

#[test]
fn missing_resume_target_fails_initialization() {
    let tmp = tempdir().unwrap();
    let mut config = probe_config(tmp.path(), None, "");
    config.runtime.resume = Some(tmp.path().join("nowhere"));

    assert!(matches!(build_trainer(config), Err(TrainingError::Checkpoint(_))));
}

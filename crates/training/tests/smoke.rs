mod common;

use std::fs;

use common::{clustered_features, probe_config, EMBED_DIM, NUM_CLASSES};
use tempfile::tempdir;
use training::{
    data::{TRAIN_FILE, VAL_FILE},
    latest_checkpoint,
    logging::LOG_FILENAME,
    DistributedContext, MemorySink, Trainer,
};

#[test]
fn single_process_run_learns_and_persists_every_epoch() {
    let tmp = tempdir().unwrap();
    let data_dir = tmp.path().join("features");
    let output_dir = tmp.path().join("run");
    clustered_features(64, 0)
        .save(data_dir.join(TRAIN_FILE))
        .unwrap();
    clustered_features(32, 5).save(data_dir.join(VAL_FILE)).unwrap();

    let mut config = probe_config(&data_dir, Some(&output_dir), "");
    config.scheduler.epochs = 4;
    config.data.num_workers = 2;

    let sink = MemorySink::new();
    let mut trainer = Trainer::new(config, DistributedContext::standalone())
        .unwrap()
        .with_scalar_sink(Box::new(sink.clone()));
    assert_eq!(trainer.steps_per_epoch(), 4);

    let summary = trainer.run().unwrap();

    assert_eq!(summary.epochs_run, 4);
    assert!(summary.max_accuracy >= 75.0, "{:?}", summary);
    assert_eq!(trainer.optimizer().steps(), 16);
    assert_eq!(trainer.start_epoch(), 4);

    let log = fs::read_to_string(output_dir.join(LOG_FILENAME)).unwrap();
    let records: Vec<serde_json::Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 4);
    for (epoch, record) in records.iter().enumerate() {
        assert_eq!(record["epoch"], epoch);
        assert_eq!(record["n_parameters"], EMBED_DIM * NUM_CLASSES + NUM_CLASSES);
        for key in ["train_loss", "train_lr", "test_loss", "test_acc1", "test_acc5"] {
            assert!(record[key].is_number(), "missing {} in {}", key, record);
        }
    }
    let first_loss = records[0]["test_loss"].as_f64().unwrap();
    let last_loss = records[3]["test_loss"].as_f64().unwrap();
    assert!(last_loss < first_loss, "{} !< {}", last_loss, first_loss);

    let latest = latest_checkpoint(&output_dir).unwrap().unwrap();
    assert_eq!(latest.manifest.epoch, 3);
    assert!(output_dir.join("checkpoint-0000").is_dir());

    let acc1 = sink.points_for("perf/test_acc1");
    assert_eq!(
        acc1.iter().map(|point| point.step).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    let losses = sink.points_for("loss");
    assert_eq!(losses.len(), 16);
    assert_eq!(losses[0].step, 0);
    assert_eq!(losses[5].step, 1250);
}

#[test]
fn lr_follows_warmup_then_cosine() {
    let tmp = tempdir().unwrap();
    let data_dir = tmp.path().join("features");
    clustered_features(64, 0)
        .save(data_dir.join(TRAIN_FILE))
        .unwrap();
    clustered_features(16, 1).save(data_dir.join(VAL_FILE)).unwrap();

    let mut config = probe_config(&data_dir, None, "");
    config.scheduler.epochs = 2;
    config.scheduler.warmup_epochs = 1.0;

    let sink = MemorySink::new();
    let mut trainer = Trainer::new(config, DistributedContext::standalone())
        .unwrap()
        .with_scalar_sink(Box::new(sink.clone()));
    trainer.run().unwrap();

    let lrs: Vec<f64> = sink
        .points_for("lr")
        .iter()
        .map(|point| point.value)
        .collect();
    assert_eq!(lrs.len(), 8);
    // warmup: 0, 0.025, 0.05, 0.075
    for (step, lr) in lrs.iter().take(4).enumerate() {
        assert!((lr - 0.1 * step as f64 / 4.0).abs() < 1e-9, "{:?}", lrs);
    }
    assert!((lrs[4] - 0.1).abs() < 1e-9);
    assert!(lrs.windows(2).skip(4).all(|pair| pair[1] < pair[0]));
}

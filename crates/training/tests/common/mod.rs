#![allow(dead_code)]

use std::{path::Path, sync::Arc};

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use training::{
    loss::{Criterion, CrossEntropyLoss, LossOutput},
    InMemoryDataset, ProbeConfig, TrainingError,
};

pub const EMBED_DIM: usize = 8;
pub const NUM_CLASSES: usize = 4;

/// Rows of class `i % classes` light up feature `class` with a small
/// deterministic jitter everywhere else.
pub fn clustered_features(rows: usize, salt: usize) -> InMemoryDataset {
    let mut inputs = Vec::with_capacity(rows * EMBED_DIM);
    let mut labels = Vec::with_capacity(rows);
    for row in 0..rows {
        let label = row % NUM_CLASSES;
        for dim in 0..EMBED_DIM {
            let jitter = ((row * 7 + dim * 13 + salt) % 11) as f32 / 50.0 - 0.1;
            let signal = if dim == label { 3.0 } else { 0.0 };
            inputs.push(signal + jitter);
        }
        labels.push(label as u32);
    }
    let inputs = Tensor::from_vec(inputs, (rows, EMBED_DIM), &Device::Cpu).unwrap();
    let labels = Tensor::from_vec(labels, rows, &Device::Cpu).unwrap();
    InMemoryDataset::new(inputs, labels).unwrap()
}

/// Small SGD run over identity features. `extra` lands in the `[runtime]`
/// table unless it opens a table of its own.
pub fn probe_config(data_path: &Path, output_dir: Option<&Path>, extra: &str) -> ProbeConfig {
    let output = output_dir
        .map(|dir| format!("output_dir = {:?}\n", dir.display().to_string()))
        .unwrap_or_default();
    let text = format!(
        r#"
[model]
embed_dim = {embed}
nb_classes = {classes}

[data]
data_path = {data:?}
batch_size = 16
num_workers = 0
pin_mem = false

[optimizer]
algorithm = "sgd"
lr = 0.1
momentum = 0.9

[scheduler]
epochs = 2
warmup_epochs = 0.0

[runtime]
seed = 7
print_freq = 1
{output}
{extra}
"#,
        embed = EMBED_DIM,
        classes = NUM_CLASSES,
        data = data_path.display().to_string(),
        output = output,
        extra = extra,
    );
    let config: ProbeConfig = toml::from_str(&text).unwrap();
    config.validate().unwrap();
    config
}

/// Cross entropy that records every micro-batch loss value it produces.
#[derive(Clone, Default)]
pub struct RecordingLoss {
    pub values: Arc<Mutex<Vec<f64>>>,
}

impl Criterion for RecordingLoss {
    fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let output = CrossEntropyLoss::new().compute(logits, targets)?;
        self.values.lock().push(output.value);
        Ok(output)
    }
}

/// Reports NaN for every batch.
pub struct NanLoss;

impl Criterion for NanLoss {
    fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let mut output = CrossEntropyLoss::new().compute(logits, targets)?;
        output.value = f64::NAN;
        Ok(output)
    }
}

pub fn flat_values(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

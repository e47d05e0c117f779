use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
};

use candle_core::{DType, Device, Tensor};

use crate::{config::ProbeConfig, distributed::DistributedContext, TrainingError};

pub mod sampler;

pub use sampler::{DistributedSampler, Sampler, SequentialSampler};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

pub const INPUTS_KEY: &str = "inputs";
pub const LABELS_KEY: &str = "labels";
pub const TRAIN_FILE: &str = "train.safetensors";
pub const VAL_FILE: &str = "val.safetensors";

/// One batch of backbone inputs and class targets, already on the loader device.
#[derive(Debug, Clone)]
pub struct DataBatch {
    pub inputs: Tensor,
    pub targets: Tensor,
    /// Dataset rows this batch was assembled from.
    pub indices: Vec<usize>,
    /// Position of the batch within the epoch.
    pub index: usize,
}

impl DataBatch {
    pub fn batch_size(&self) -> usize {
        self.indices.len()
    }
}

/// Random-access source of `(inputs, labels)` rows.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gathers the given rows into `(inputs, labels)` tensors on the CPU.
    fn gather(&self, indices: &[usize]) -> Result<(Tensor, Tensor)>;
}

/// Inputs and labels held in host memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    inputs: Tensor,
    labels: Tensor,
}

impl InMemoryDataset {
    /// `inputs` is `[n, ...]`, `labels` is `[n]` with integer class ids.
    pub fn new(inputs: Tensor, labels: Tensor) -> Result<Self> {
        let rows = inputs.dims().first().copied().ok_or_else(|| {
            TrainingError::initialization("dataset inputs must have a leading sample dimension")
        })?;
        if labels.dims() != [rows] {
            return Err(TrainingError::initialization(format!(
                "dataset labels must be shaped [{}], got {:?}",
                rows,
                labels.dims()
            )));
        }
        let labels = match labels.dtype() {
            DType::U32 => labels,
            DType::U8 | DType::I64 => labels.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::initialization(format!(
                    "dataset labels must be integers, got {:?}",
                    dtype
                )))
            }
        };
        Ok(Self {
            inputs: inputs.to_device(&Device::Cpu).map_err(to_runtime_error)?,
            labels: labels.to_device(&Device::Cpu).map_err(to_runtime_error)?,
        })
    }

    /// Reads the `inputs` and `labels` tensors of a safetensors file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors: HashMap<String, Tensor> =
            candle_core::safetensors::load(path, &Device::Cpu).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to read dataset {}: {}",
                    path.display(),
                    err
                ))
            })?;
        let mut take = |key: &str| {
            tensors.remove(key).ok_or_else(|| {
                TrainingError::initialization(format!(
                    "dataset {} has no '{}' tensor",
                    path.display(),
                    key
                ))
            })
        };
        let inputs = take(INPUTS_KEY)?;
        let labels = take(LABELS_KEY)?;
        Self::new(inputs, labels)
    }

    /// Writes both tensors to `path`, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tensors = HashMap::from([
            (INPUTS_KEY.to_string(), self.inputs.clone()),
            (LABELS_KEY.to_string(), self.labels.clone()),
        ]);
        candle_core::safetensors::save(&tensors, path).map_err(to_runtime_error)
    }

    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    fn gather(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        let len = Dataset::len(self);
        if let Some(&bad) = indices.iter().find(|&&index| index >= len) {
            return Err(TrainingError::runtime(format!(
                "sample index {} out of range for dataset of {}",
                bad, len
            )));
        }
        let ids: Vec<u32> = indices.iter().map(|&index| index as u32).collect();
        let ids = Tensor::from_vec(ids, indices.len(), &Device::Cpu).map_err(to_runtime_error)?;
        let inputs = self.inputs.index_select(&ids, 0).map_err(to_runtime_error)?;
        let labels = self.labels.index_select(&ids, 0).map_err(to_runtime_error)?;
        Ok((inputs, labels))
    }
}

/// Loads one split file, [`TRAIN_FILE`] or [`VAL_FILE`], from `data_path`.
pub fn load_split(data_path: &Path, file: &str) -> Result<InMemoryDataset> {
    InMemoryDataset::load(data_path.join(file))
}

/// Shuffled, rank-partitioned loader that drops the trailing partial batch.
pub fn train_loader(
    cfg: &ProbeConfig,
    dataset: Arc<dyn Dataset>,
    ctx: &DistributedContext,
) -> Result<DataLoader> {
    let sampler = DistributedSampler::new(
        dataset.len(),
        ctx.world_size(),
        ctx.rank(),
        true,
        cfg.runtime.seed,
    )?;
    Ok(DataLoader::new(dataset, Box::new(sampler), cfg.data.batch_size)?
        .with_drop_last(true)
        .with_num_workers(cfg.data.num_workers)
        .with_device(ctx.device().clone())
        .with_pin_memory(cfg.data.pin_mem))
}

/// Evaluation loader. With `dist_eval` every rank sees a padded shard,
/// otherwise every rank walks the full set in order.
pub fn eval_loader(
    cfg: &ProbeConfig,
    dataset: Arc<dyn Dataset>,
    ctx: &DistributedContext,
) -> Result<DataLoader> {
    let sampler: Box<dyn Sampler> = if cfg.data.dist_eval && ctx.is_distributed() {
        if dataset.len() % ctx.world_size() != 0 {
            log::warn!(
                "distributed evaluation with a dataset of {} not divisible by {} processes \
                 duplicates entries and slightly alters results",
                dataset.len(),
                ctx.world_size()
            );
        }
        Box::new(DistributedSampler::new(
            dataset.len(),
            ctx.world_size(),
            ctx.rank(),
            true,
            cfg.runtime.seed,
        )?)
    } else {
        Box::new(SequentialSampler::new(dataset.len()))
    };
    Ok(DataLoader::new(dataset, sampler, cfg.data.batch_size)?
        .with_num_workers(cfg.data.num_workers)
        .with_device(ctx.device().clone())
        .with_pin_memory(cfg.data.pin_mem))
}

/// Batches a sampler's indices over a dataset.
///
/// With `num_workers > 0` a background thread assembles up to `num_workers`
/// batches ahead through a bounded channel; otherwise batches are assembled
/// on the calling thread.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    sampler: Box<dyn Sampler>,
    batch_size: usize,
    drop_last: bool,
    num_workers: usize,
    pin_memory: bool,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        sampler: Box<dyn Sampler>,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "data loader batch_size must be greater than 0",
            ));
        }
        Ok(Self {
            dataset,
            sampler,
            batch_size,
            drop_last: false,
            num_workers: 0,
            pin_memory: false,
            device: Device::Cpu,
        })
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Host tensors are never page-locked; the flag is recorded and logged only.
    pub fn with_pin_memory(mut self, pin_memory: bool) -> Self {
        if pin_memory {
            log::debug!(
                "pin_mem is set but has no effect: batches are copied straight to {:?}",
                self.device
            );
        }
        self.pin_memory = pin_memory;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pin_memory(&self) -> bool {
        self.pin_memory
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// Samples this rank visits per epoch, before batching.
    pub fn num_samples(&self) -> usize {
        self.sampler.len()
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        let samples = self.sampler.len();
        if self.drop_last {
            samples / self.batch_size
        } else {
            samples.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Result<Batches> {
        let mut chunks: Vec<Vec<usize>> = self
            .sampler
            .indices()
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        if self.drop_last && chunks.last().is_some_and(|c| c.len() < self.batch_size) {
            chunks.pop();
        }
        let remaining = chunks.len();

        let source = if self.num_workers == 0 || remaining == 0 {
            BatchSource::Inline {
                dataset: Arc::clone(&self.dataset),
                chunks: chunks.into_iter(),
            }
        } else {
            let (sender, receiver) = mpsc::sync_channel(self.num_workers);
            let dataset = Arc::clone(&self.dataset);
            let worker = thread::Builder::new()
                .name("batch-prefetch".to_string())
                .spawn(move || {
                    for chunk in chunks {
                        let item = dataset
                            .gather(&chunk)
                            .map(|(inputs, labels)| (chunk, inputs, labels));
                        let failed = item.is_err();
                        if sender.send(item).is_err() || failed {
                            break;
                        }
                    }
                })?;
            BatchSource::Prefetch {
                receiver: Some(receiver),
                worker: Some(worker),
            }
        };

        Ok(Batches {
            device: self.device.clone(),
            remaining,
            next_index: 0,
            source,
        })
    }
}

type RawBatch = (Vec<usize>, Tensor, Tensor);

enum BatchSource {
    Inline {
        dataset: Arc<dyn Dataset>,
        chunks: std::vec::IntoIter<Vec<usize>>,
    },
    Prefetch {
        receiver: Option<Receiver<Result<RawBatch>>>,
        worker: Option<JoinHandle<()>>,
    },
}

/// One pass over a [`DataLoader`]. The first error ends the pass.
pub struct Batches {
    device: Device,
    remaining: usize,
    next_index: usize,
    source: BatchSource,
}

impl Batches {
    fn next_raw(&mut self) -> Option<Result<RawBatch>> {
        match &mut self.source {
            BatchSource::Inline { dataset, chunks } => {
                let chunk = chunks.next()?;
                Some(
                    dataset
                        .gather(&chunk)
                        .map(|(inputs, labels)| (chunk, inputs, labels)),
                )
            }
            BatchSource::Prefetch { receiver, .. } => {
                let receiver = receiver.as_ref()?;
                Some(receiver.recv().unwrap_or_else(|_| {
                    Err(TrainingError::runtime("data prefetch worker stopped early"))
                }))
            }
        }
    }
}

impl Iterator for Batches {
    type Item = Result<DataBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let raw = self.next_raw()?;
        let batch = raw.and_then(|(indices, inputs, labels)| {
            Ok(DataBatch {
                inputs: inputs.to_device(&self.device).map_err(to_runtime_error)?,
                targets: labels.to_device(&self.device).map_err(to_runtime_error)?,
                indices,
                index: self.next_index,
            })
        });
        if batch.is_err() {
            self.remaining = 0;
        } else {
            self.remaining -= 1;
            self.next_index += 1;
        }
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Batches {}

impl Drop for Batches {
    fn drop(&mut self) {
        if let BatchSource::Prefetch { receiver, worker } = &mut self.source {
            // disconnect first so a worker blocked on a full channel wakes up
            drop(receiver.take());
            if let Some(worker) = worker.take() {
                if worker.join().is_err() {
                    log::warn!("data prefetch worker panicked");
                }
            }
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(rows: usize) -> Arc<dyn Dataset> {
        let inputs: Vec<f32> = (0..rows * 2).map(|v| v as f32).collect();
        let labels: Vec<u32> = (0..rows as u32).map(|v| v % 3).collect();
        Arc::new(
            InMemoryDataset::new(
                Tensor::from_vec(inputs, (rows, 2), &Device::Cpu).unwrap(),
                Tensor::from_vec(labels, rows, &Device::Cpu).unwrap(),
            )
            .unwrap(),
        )
    }

    fn collect(loader: &DataLoader) -> Vec<DataBatch> {
        loader
            .iter()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn sequential_batches_keep_row_order() {
        let loader = DataLoader::new(dataset(5), Box::new(SequentialSampler::new(5)), 2).unwrap();
        assert_eq!(loader.len(), 3);

        let batches = collect(&loader);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].indices, vec![4]);
        assert_eq!(batches[2].index, 2);
        let first = batches[0].inputs.to_vec2::<f32>().unwrap();
        assert_eq!(first, vec![vec![0.0, 1.0], vec![2.0, 3.0]]);
        assert_eq!(batches[1].targets.to_vec1::<u32>().unwrap(), vec![2, 0]);
    }

    #[test]
    fn drop_last_skips_partial_batch() {
        let loader = DataLoader::new(dataset(5), Box::new(SequentialSampler::new(5)), 2)
            .unwrap()
            .with_drop_last(true);
        assert_eq!(loader.len(), 2);
        assert_eq!(loader.iter().unwrap().len(), 2);
        assert_eq!(collect(&loader).len(), 2);
    }

    #[test]
    fn prefetch_matches_inline_order() {
        let sampler = || Box::new(DistributedSampler::new(11, 1, 0, true, 3).unwrap());
        let inline = DataLoader::new(dataset(11), sampler(), 3).unwrap();
        let prefetched = DataLoader::new(dataset(11), sampler(), 3)
            .unwrap()
            .with_num_workers(2);

        let a: Vec<Vec<usize>> = collect(&inline).into_iter().map(|b| b.indices).collect();
        let b: Vec<Vec<usize>> = collect(&prefetched).into_iter().map(|b| b.indices).collect();

        assert_eq!(a, b);
    }

    #[test]
    fn pin_memory_leaves_batches_unchanged() {
        let plain = DataLoader::new(dataset(4), Box::new(SequentialSampler::new(4)), 2).unwrap();
        let pinned = DataLoader::new(dataset(4), Box::new(SequentialSampler::new(4)), 2)
            .unwrap()
            .with_pin_memory(true);
        assert!(pinned.pin_memory());

        for (a, b) in collect(&plain).into_iter().zip(collect(&pinned)) {
            assert_eq!(a.indices, b.indices);
            assert_eq!(
                a.inputs.to_vec2::<f32>().unwrap(),
                b.inputs.to_vec2::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn dropping_a_prefetching_pass_early_terminates_the_worker() {
        let loader = DataLoader::new(dataset(64), Box::new(SequentialSampler::new(64)), 1)
            .unwrap()
            .with_num_workers(1);
        let mut batches = loader.iter().unwrap();
        assert!(batches.next().is_some());
        drop(batches);
    }

    #[test]
    fn set_epoch_reshuffles_train_order() {
        let mut loader = DataLoader::new(
            dataset(32),
            Box::new(DistributedSampler::new(32, 1, 0, true, 0).unwrap()),
            32,
        )
        .unwrap();
        let first = collect(&loader).remove(0).indices;
        loader.set_epoch(1);
        let second = collect(&loader).remove(0).indices;
        assert_ne!(first, second);
    }

    #[test]
    fn safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TRAIN_FILE);
        let original = InMemoryDataset::new(
            Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu).unwrap(),
            Tensor::from_vec(vec![1i64, 0], 2, &Device::Cpu).unwrap(),
        )
        .unwrap();
        original.save(&path).unwrap();

        let loaded = InMemoryDataset::load(&path).unwrap();

        assert_eq!(Dataset::len(&loaded), 2);
        assert_eq!(loaded.labels().to_vec1::<u32>().unwrap(), vec![1, 0]);
    }

    #[test]
    fn rejects_mismatched_labels() {
        let inputs = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros(2, DType::U32, &Device::Cpu).unwrap();
        assert!(InMemoryDataset::new(inputs, labels).is_err());
    }
}

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use candle_core::{DType, Tensor, Var};
use model::{BackboneHandle, ClassifierConfig, FrozenProjection, Identity, LinearClassifier};

use crate::{
    checkpoint::{self, RestoreMode, SaveRequest},
    config::{BackboneConfig, ProbeConfig},
    data::{self, DataBatch, DataLoader, Dataset},
    distributed::DistributedContext,
    logging::{self, ScalarSink, TensorBoardWriter, LOG_FILENAME},
    loss::{accuracy, Criterion, CrossEntropyLoss},
    metrics::{format_duration, MeterFormat, MetricLogger, SmoothedValue},
    optimizer::{build_optimizer, GradientScaler, Optimizer},
    scheduler::{fractional_epoch, LRScheduler, WarmupCosine},
    step::{forward_loss, ScaledGradientStep, StepOutcome},
    TrainingError,
};

/// Meter name to global average.
pub type Stats = BTreeMap<String, f64>;

const TENSORBOARD_FLUSH_EVERY: usize = 64;
const EVAL_PRINT_FREQ: usize = 10;

/// Outcome of [`Trainer::run`].
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub max_accuracy: f64,
    pub last_train: Option<Stats>,
    pub last_test: Option<Stats>,
    pub elapsed: Duration,
}

/// Epoch orchestrator for linear probing: one instance per worker.
pub struct Trainer {
    config: ProbeConfig,
    ctx: DistributedContext,
    backbone: BackboneHandle,
    classifier: LinearClassifier,
    criterion: Box<dyn Criterion>,
    optimizer: Box<dyn Optimizer>,
    schedule: Box<dyn LRScheduler>,
    step: ScaledGradientStep,
    /// `None` for evaluation-only runs.
    train_loader: Option<DataLoader>,
    eval_loader: DataLoader,
    sink: Option<Box<dyn ScalarSink>>,
    /// Same on every rank: gates the per-step loss all-reduce.
    log_scalars: bool,
    start_epoch: usize,
    max_accuracy: f64,
    n_parameters: usize,
}

impl Trainer {
    /// Loads the splits from `data.data_path` and builds the configured backbone.
    /// Evaluation-only runs read the validation split alone.
    pub fn new(config: ProbeConfig, ctx: DistributedContext) -> Result<Self, TrainingError> {
        config.validate()?;
        let data_path = &config.data.data_path;
        let train: Option<Arc<dyn Dataset>> = if config.runtime.eval {
            None
        } else {
            let train: Arc<dyn Dataset> =
                Arc::new(data::load_split(data_path, data::TRAIN_FILE)?);
            Some(train)
        };
        let val = data::load_split(data_path, data::VAL_FILE)?;
        if ctx.is_main() {
            match train.as_ref() {
                Some(train) => println!(
                    "Dataset train: {} samples, val: {} samples ({})",
                    train.len(),
                    Dataset::len(&val),
                    data_path.display()
                ),
                None => println!(
                    "Dataset val: {} samples ({})",
                    Dataset::len(&val),
                    data_path.display()
                ),
            }
        }
        let backbone = build_backbone(&config, &ctx)?;
        Self::assemble(config, ctx, backbone, train, Arc::new(val))
    }

    /// Builds a trainer over caller-supplied datasets. `train` is ignored
    /// when `runtime.eval` is set.
    pub fn with_components(
        config: ProbeConfig,
        ctx: DistributedContext,
        backbone: BackboneHandle,
        train: Arc<dyn Dataset>,
        val: Arc<dyn Dataset>,
    ) -> Result<Self, TrainingError> {
        Self::assemble(config, ctx, backbone, Some(train), val)
    }

    fn assemble(
        config: ProbeConfig,
        ctx: DistributedContext,
        backbone: BackboneHandle,
        train: Option<Arc<dyn Dataset>>,
        val: Arc<dyn Dataset>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        if backbone.embed_dim() != config.model.embed_dim {
            return Err(TrainingError::initialization(format!(
                "backbone produces {} features but model.embed_dim is {}",
                backbone.embed_dim(),
                config.model.embed_dim
            )));
        }
        let main = ctx.is_main();
        let seed = config.runtime.seed + ctx.rank() as u64;
        if let Err(err) = ctx.device().set_seed(seed) {
            log::warn!("failed to seed device RNG: {}", err);
        }

        let train_loader = match train {
            Some(train) if !config.runtime.eval => {
                let loader = data::train_loader(&config, train, &ctx)?;
                if loader.is_empty() {
                    return Err(TrainingError::initialization(format!(
                        "training shard of {} samples is smaller than one batch of {}",
                        loader.num_samples(),
                        config.data.batch_size
                    )));
                }
                Some(loader)
            }
            Some(_) => None,
            None if config.runtime.eval => None,
            None => {
                return Err(TrainingError::initialization(
                    "a training split is required unless runtime.eval is set",
                ))
            }
        };
        let eval_loader = data::eval_loader(&config, val, &ctx)?;

        let classifier = LinearClassifier::new(
            ClassifierConfig::new(config.model.embed_dim, config.model.nb_classes)
                .with_seed(seed)
                .with_device(ctx.device().clone()),
        )
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let n_parameters = classifier.num_trainable_parameters();

        let world_size = ctx.world_size();
        let eff_batch_size = config.effective_batch_size(world_size);
        let lr = config.effective_lr(world_size);
        if main {
            println!("Model = {:?}", backbone);
            println!("number of params (M): {:.2}", n_parameters as f64 / 1.0e6);
            println!("base lr: {:.2e}", lr * 256.0 / eff_batch_size as f64);
            println!("actual lr: {:.2e}", lr);
            println!("accumulate grad iterations: {}", config.data.accum_iter);
            println!("effective batch size: {}", eff_batch_size);
        }

        let mut optimizer = build_optimizer(&config.optimizer, classifier.parameters(), lr)?;
        let mut scaler = GradientScaler::new(config.runtime.precision);
        if main {
            println!(
                "optimizer = {} (lr {:.2e}, weight_decay {})",
                optimizer.name(),
                lr,
                config.optimizer.weight_decay
            );
            println!("criterion = CrossEntropyLoss");
        }

        let mut start_epoch = config.runtime.start_epoch;
        let mut max_accuracy = 0.0;
        if let Some(resume) = config.runtime.resume.as_ref() {
            let mode = if config.runtime.eval {
                RestoreMode::EvalOnly
            } else {
                RestoreMode::TrainResume
            };
            let restored = checkpoint::load_checkpoint(
                resume,
                mode,
                &classifier,
                optimizer.as_mut(),
                &mut scaler,
            )?;
            if let Some(epoch) = restored.start_epoch {
                start_epoch = epoch;
                max_accuracy = restored.best_acc1.unwrap_or(0.0);
                if main {
                    println!("With optim & sched!");
                }
            }
        }

        // every rank continues from rank 0's classifier
        broadcast_vars(&ctx, &classifier.parameters())?;
        broadcast_vars(&ctx, &classifier.buffers())?;

        let parameters = classifier
            .parameters()
            .into_iter()
            .map(|(_, var)| var)
            .collect();
        let step = ScaledGradientStep::new(
            parameters,
            config.data.accum_iter,
            config.optimizer.max_norm,
            scaler,
        )?;
        let schedule: Box<dyn LRScheduler> =
            Box::new(WarmupCosine::from_config(&config, world_size)?);

        let log_scalars = config.runtime.log_dir.is_some() && !config.runtime.eval;
        let sink: Option<Box<dyn ScalarSink>> = match config.runtime.log_dir.as_ref() {
            Some(dir) if main && !config.runtime.eval => Some(Box::new(
                TensorBoardWriter::create(dir, TENSORBOARD_FLUSH_EVERY)?,
            )),
            _ => None,
        };

        Ok(Self {
            config,
            ctx,
            backbone,
            classifier,
            criterion: Box::new(CrossEntropyLoss::new()),
            optimizer,
            schedule,
            step,
            train_loader,
            eval_loader,
            sink,
            log_scalars,
            start_epoch,
            max_accuracy,
            n_parameters,
        })
    }

    /// Replaces the scalar destination. Only the main process writes to it,
    /// but every rank has to call this so the loss reductions line up.
    pub fn with_scalar_sink(mut self, sink: Box<dyn ScalarSink>) -> Self {
        self.sink = self.ctx.is_main().then_some(sink);
        self.log_scalars = true;
        self
    }

    pub fn with_criterion(mut self, criterion: Box<dyn Criterion>) -> Self {
        self.criterion = criterion;
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn context(&self) -> &DistributedContext {
        &self.ctx
    }

    pub fn classifier(&self) -> &LinearClassifier {
        &self.classifier
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn scaler(&self) -> &GradientScaler {
        self.step.scaler()
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn max_accuracy(&self) -> f64 {
        self.max_accuracy
    }

    /// Zero for evaluation-only runs.
    pub fn steps_per_epoch(&self) -> usize {
        self.train_loader.as_ref().map_or(0, DataLoader::len)
    }

    /// Trains from `start_epoch` to `scheduler.epochs`, or evaluates once when
    /// `runtime.eval` is set.
    pub fn run(&mut self) -> Result<TrainingSummary, TrainingError> {
        let start = Instant::now();
        if self.config.runtime.eval {
            let test = self.evaluate()?;
            self.report_accuracy(&test);
            return Ok(TrainingSummary {
                epochs_run: 0,
                max_accuracy: self.max_accuracy,
                last_train: None,
                last_test: Some(test),
                elapsed: start.elapsed(),
            });
        }

        let epochs = self.config.scheduler.epochs;
        if self.ctx.is_main() {
            println!("Start training for {} epochs", epochs);
        }
        let mut summary = TrainingSummary {
            epochs_run: 0,
            max_accuracy: self.max_accuracy,
            last_train: None,
            last_test: None,
            elapsed: Duration::ZERO,
        };
        for epoch in self.start_epoch..epochs {
            let train = self.train_one_epoch(epoch)?;
            self.save_checkpoint(epoch)?;

            let test = self.evaluate()?;
            self.report_accuracy(&test);
            let acc1 = test.get("acc1").copied().unwrap_or(0.0);
            self.max_accuracy = self.max_accuracy.max(acc1);
            if self.ctx.is_main() {
                println!("Max accuracy: {:.2}%", self.max_accuracy);
            }

            if let Some(sink) = self.sink.as_mut() {
                for key in ["acc1", "acc5", "loss"] {
                    if let Some(value) = test.get(key) {
                        sink.add_scalar(&format!("perf/test_{}", key), *value, epoch as u64)?;
                    }
                }
                sink.flush()?;
            }
            self.append_log(epoch, &train, &test)?;

            self.start_epoch = epoch + 1;
            summary.epochs_run += 1;
            summary.last_train = Some(train);
            summary.last_test = Some(test);
        }

        summary.max_accuracy = self.max_accuracy;
        summary.elapsed = start.elapsed();
        if self.ctx.is_main() {
            println!("Training time {}", format_duration(summary.elapsed));
        }
        Ok(summary)
    }

    /// One pass over this rank's training shard. Returns the synchronized
    /// global averages of every meter.
    pub fn train_one_epoch(&mut self, epoch: usize) -> Result<Stats, TrainingError> {
        let loader = self.train_loader.as_mut().ok_or_else(|| {
            TrainingError::runtime("evaluation-only trainer has no training split")
        })?;
        loader.set_epoch(epoch);
        let steps_per_epoch = loader.len();
        let batches = loader.iter()?;
        self.classifier.set_training(true);

        let mut metric_logger = MetricLogger::new("  ").with_printing(self.ctx.is_main());
        metric_logger.add_meter(
            "lr",
            SmoothedValue::new(1, MeterFormat::Latest { precision: 6 }),
        );
        let header = format!("Epoch: [{}]", epoch);
        let log_scalars = self.log_scalars;
        if let (Some(dir), true) = (self.config.runtime.log_dir.as_ref(), self.sink.is_some()) {
            println!("log_dir: {}", dir.display());
        }

        let mut current_lr = 0.0;
        metric_logger.log_every(
            batches,
            self.config.runtime.print_freq,
            &header,
            |logger, step_index, batch| {
                let batch = batch?;
                if self.step.is_window_start(step_index) {
                    let progress = fractional_epoch(epoch, step_index, steps_per_epoch);
                    current_lr = self.schedule.apply(self.optimizer.as_mut(), progress);
                }

                let outcome = self.train_micro_step(&batch, epoch, step_index)?;
                if let StepOutcome::Stepped {
                    loss, micro_steps, ..
                } = outcome
                {
                    logger.update_weighted("loss", loss, micro_steps as f64);
                    logger.update("lr", current_lr);

                    if log_scalars {
                        let loss_reduced = self.ctx.all_reduce_mean(loss)?;
                        let epoch_1000x =
                            (fractional_epoch(epoch, step_index, steps_per_epoch) * 1000.0) as u64;
                        if let Some(sink) = self.sink.as_mut() {
                            sink.add_scalar("loss", loss_reduced, epoch_1000x)?;
                            sink.add_scalar("lr", current_lr, epoch_1000x)?;
                        }
                    }
                }
                Ok(())
            },
        )?;
        if let Some(window) = self.step.discard() {
            metric_logger.update_weighted("loss", window.loss, window.micro_steps as f64);
        }

        metric_logger.synchronize_between_processes(&self.ctx)?;
        if self.ctx.is_main() {
            println!("Averaged stats: {}", metric_logger);
        }
        Ok(collect_stats(&metric_logger))
    }

    fn train_micro_step(
        &mut self,
        batch: &DataBatch,
        epoch: usize,
        step_index: usize,
    ) -> Result<StepOutcome, TrainingError> {
        let output = forward_loss(
            &self.backbone,
            &self.classifier,
            self.criterion.as_ref(),
            batch,
        )?;
        self.step.micro_step(
            &output,
            epoch,
            step_index,
            self.optimizer.as_mut(),
            &self.ctx,
        )
    }

    /// Evaluates the classifier on the validation split with running
    /// batch-norm statistics taken from rank 0.
    pub fn evaluate(&mut self) -> Result<Stats, TrainingError> {
        broadcast_vars(&self.ctx, &self.classifier.buffers())?;
        let was_training = self.classifier.is_training();
        self.classifier.set_training(false);
        let result = self.evaluate_inner();
        self.classifier.set_training(was_training);
        result
    }

    fn evaluate_inner(&mut self) -> Result<Stats, TrainingError> {
        let criterion = CrossEntropyLoss::new();
        let mut metric_logger = MetricLogger::new("  ").with_printing(self.ctx.is_main());
        let batches = self.eval_loader.iter()?;
        metric_logger.log_every(batches, EVAL_PRINT_FREQ, "Test:", |logger, _, batch| {
            let batch = batch?;
            let features = self.backbone.embed(&batch.inputs).map_err(to_runtime_error)?;
            let logits = self
                .classifier
                .forward(&features)
                .map_err(to_runtime_error)?
                .detach();
            let output = criterion.compute(&logits, &batch.targets)?;
            let topk = accuracy(&logits, &batch.targets, &[1, 5])?;

            let batch_size = batch.batch_size() as f64;
            logger.update("loss", output.value);
            logger.update_weighted("acc1", topk[0], batch_size);
            logger.update_weighted("acc5", topk[1], batch_size);
            Ok(())
        })?;

        metric_logger.synchronize_between_processes(&self.ctx)?;
        let stats = collect_stats(&metric_logger);
        if self.ctx.is_main() {
            println!(
                "* Acc@1 {:.3} Acc@5 {:.3} loss {:.3}",
                stats.get("acc1").copied().unwrap_or(0.0),
                stats.get("acc5").copied().unwrap_or(0.0),
                stats.get("loss").copied().unwrap_or(0.0)
            );
        }
        Ok(stats)
    }

    fn report_accuracy(&self, test: &Stats) {
        if self.ctx.is_main() {
            println!(
                "Accuracy of the network on the {} test images: {:.1}%",
                self.eval_loader.dataset_len(),
                test.get("acc1").copied().unwrap_or(0.0)
            );
        }
    }

    fn save_checkpoint(&self, epoch: usize) -> Result<Option<PathBuf>, TrainingError> {
        let Some(output_dir) = self.config.runtime.output_dir.as_ref() else {
            return Ok(None);
        };
        let descriptor = checkpoint::save_on_main(
            &self.ctx,
            SaveRequest {
                output_dir,
                epoch,
                config: &self.config,
                classifier: &self.classifier,
                optimizer: self.optimizer.as_ref(),
                scaler: self.step.scaler(),
                best_acc1: Some(self.max_accuracy),
            },
        )?;
        Ok(descriptor.map(|d| d.directory))
    }

    fn append_log(&self, epoch: usize, train: &Stats, test: &Stats) -> Result<(), TrainingError> {
        let Some(output_dir) = self.config.runtime.output_dir.as_ref() else {
            return Ok(());
        };
        if !self.ctx.is_main() {
            return Ok(());
        }
        let mut record = serde_json::Map::new();
        for (key, value) in train {
            record.insert(format!("train_{}", key), serde_json::json!(value));
        }
        for (key, value) in test {
            record.insert(format!("test_{}", key), serde_json::json!(value));
        }
        record.insert("epoch".into(), serde_json::json!(epoch));
        record.insert("n_parameters".into(), serde_json::json!(self.n_parameters));
        logging::append_json_line(
            &output_dir.join(LOG_FILENAME),
            &serde_json::Value::Object(record),
        )
    }
}

/// Builds the configured frozen backbone on the worker's device.
pub fn build_backbone(
    config: &ProbeConfig,
    ctx: &DistributedContext,
) -> Result<BackboneHandle, TrainingError> {
    let handle = match config.model.backbone {
        BackboneConfig::Identity => BackboneHandle::new(Identity::new(config.model.embed_dim)),
        BackboneConfig::FrozenProjection { input_dim, seed } => BackboneHandle::new(
            FrozenProjection::new(input_dim, config.model.embed_dim, seed, ctx.device())
                .map_err(|err| TrainingError::initialization(err.to_string()))?,
        ),
    };
    Ok(handle.with_compute_dtype(config.runtime.precision.dtype()))
}

/// Overwrites every variable with rank 0's values using a single collective.
fn broadcast_vars(ctx: &DistributedContext, vars: &[(String, Var)]) -> Result<(), TrainingError> {
    if !ctx.is_distributed() || vars.is_empty() {
        return Ok(());
    }
    let mut flat = Vec::new();
    for (_, var) in vars {
        let values = var
            .as_tensor()
            .to_dtype(DType::F64)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f64>())
            .map_err(to_runtime_error)?;
        flat.extend(values);
    }
    ctx.broadcast_from_main(&mut flat)?;

    let mut offset = 0;
    for (_, var) in vars {
        let tensor = var.as_tensor();
        let numel = tensor.elem_count();
        let values = flat[offset..offset + numel].to_vec();
        offset += numel;
        let replacement = Tensor::from_vec(values, tensor.dims(), tensor.device())
            .and_then(|t| t.to_dtype(tensor.dtype()))
            .map_err(to_runtime_error)?;
        var.set(&replacement).map_err(to_runtime_error)?;
    }
    Ok(())
}

fn collect_stats(logger: &MetricLogger) -> Stats {
    logger
        .meters()
        .map(|(name, meter)| (name.to_string(), meter.global_avg()))
        .collect()
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

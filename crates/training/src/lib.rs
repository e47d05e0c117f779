pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod step;
pub mod trainer;

pub use checkpoint::{latest_checkpoint, load_checkpoint, CheckpointManifest, RestoreMode};
pub use config::{ConfigOverride, Precision, ProbeConfig, TrainingError};
pub use data::{DataBatch, DataLoader, Dataset, DistributedSampler, InMemoryDataset};
pub use distributed::{Collective, DistributedContext, LocalGroup, TcpGroup};
pub use logging::{MemorySink, ScalarSink, TensorBoardWriter};
pub use loss::{accuracy, Criterion, CrossEntropyLoss, LossOutput};
pub use metrics::{MetricLogger, SmoothedValue};
pub use optimizer::{GradientScaler, Optimizer, OptimizerState};
pub use scheduler::{compute_lr, LRScheduler, WarmupCosine};
pub use step::{ScaledGradientStep, StepOutcome};
pub use trainer::{Trainer, TrainingSummary};

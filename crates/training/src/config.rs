use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Full run configuration for linear-probe training.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default)]
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl ProbeConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: ProbeConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.embed_dim == 0 {
            errors.push("model.embed_dim must be greater than 0".to_string());
        }
        if self.model.nb_classes == 0 {
            errors.push("model.nb_classes must be greater than 0".to_string());
        }
        if let BackboneConfig::FrozenProjection { input_dim, .. } = self.model.backbone {
            if input_dim == 0 {
                errors.push("model.backbone.input_dim must be greater than 0".to_string());
            }
        }

        if self.data.data_path.as_os_str().is_empty() {
            errors.push("data.data_path must not be empty".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.accum_iter == 0 {
            errors.push("data.accum_iter must be greater than 0".to_string());
        }

        if let Some(lr) = self.optimizer.lr {
            if !(lr > 0.0) {
                errors.push("optimizer.lr must be greater than 0".to_string());
            }
        }
        if !(self.optimizer.blr > 0.0) {
            errors.push("optimizer.blr must be greater than 0".to_string());
        }
        if self.optimizer.min_lr < 0.0 {
            errors.push("optimizer.min_lr must be >= 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }
        if self.optimizer.trust_coefficient <= 0.0 {
            errors.push("optimizer.trust_coefficient must be greater than 0".to_string());
        }
        if let Some(max_norm) = self.optimizer.max_norm {
            if !(max_norm > 0.0) {
                errors.push("optimizer.max_norm must be greater than 0".to_string());
            }
        }

        if self.scheduler.epochs == 0 {
            errors.push("scheduler.epochs must be greater than 0".to_string());
        }
        if !(self.scheduler.warmup_epochs >= 0.0) {
            errors.push("scheduler.warmup_epochs must be >= 0".to_string());
        }

        if self.runtime.print_freq == 0 {
            errors.push("runtime.print_freq must be greater than 0".to_string());
        }
        if let Err(err) = parse_device_spec(&self.runtime.device) {
            errors.push(err);
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.data_path, base);
        for path in [
            self.runtime.output_dir.as_mut(),
            self.runtime.log_dir.as_mut(),
            self.runtime.resume.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }

    /// Absolute learning rate, scaled by the global effective batch when only
    /// `blr` is configured.
    pub fn effective_lr(&self, world_size: usize) -> f64 {
        match self.optimizer.lr {
            Some(lr) => lr,
            None => self.optimizer.blr * self.effective_batch_size(world_size) as f64 / 256.0,
        }
    }

    pub fn effective_batch_size(&self, world_size: usize) -> usize {
        self.data.batch_size * self.data.accum_iter * world_size.max(1)
    }

    /// Resolves `runtime.device`; CUDA ordinals default to the local rank.
    pub fn resolve_device(&self, local_rank: usize) -> Result<Device, TrainingError> {
        let spec = parse_device_spec(&self.runtime.device).map_err(TrainingError::Config)?;
        let device = match spec {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal.unwrap_or(local_rank)),
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal.unwrap_or(0)),
        };
        device.map_err(|err| {
            TrainingError::initialization(format!(
                "failed to open device '{}': {}",
                self.runtime.device, err
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default = "default_nb_classes")]
    pub nb_classes: usize,
    #[serde(default)]
    pub backbone: BackboneConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embed_dim: default_embed_dim(),
            nb_classes: default_nb_classes(),
            backbone: BackboneConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackboneConfig {
    /// Dataset inputs already are backbone features.
    Identity,
    FrozenProjection {
        input_dim: usize,
        #[serde(default)]
        seed: u64,
    },
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self::Identity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub data_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_accum_iter")]
    pub accum_iter: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_true")]
    pub pin_mem: bool,
    #[serde(default)]
    pub dist_eval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    /// Absolute learning rate; takes precedence over `blr`.
    #[serde(default)]
    pub lr: Option<f64>,
    #[serde(default = "default_blr")]
    pub blr: f64,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_trust_coefficient")]
    pub trust_coefficient: f64,
    #[serde(default)]
    pub max_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            lr: None,
            blr: default_blr(),
            min_lr: 0.0,
            weight_decay: 0.0,
            momentum: default_momentum(),
            trust_coefficient: default_trust_coefficient(),
            max_norm: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Lars,
    Sgd,
}

impl Default for OptimizerType {
    fn default() -> Self {
        Self::Lars
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            warmup_epochs: default_warmup_epochs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub resume: Option<PathBuf>,
    #[serde(default)]
    pub start_epoch: usize,
    #[serde(default)]
    pub eval: bool,
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            device: default_device(),
            precision: Precision::default(),
            output_dir: None,
            log_dir: None,
            resume: None,
            start_epoch: 0,
            eval: false,
            print_freq: default_print_freq(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Fp32
    }
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceSpec {
    Cpu,
    Cuda(Option<usize>),
    Metal(Option<usize>),
}

fn parse_device_spec(value: &str) -> Result<DeviceSpec, String> {
    let lower = value.trim().to_ascii_lowercase();
    let (kind, ordinal) = match lower.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal
                .parse::<usize>()
                .map_err(|_| format!("runtime.device has an invalid ordinal: '{}'", value))?;
            (kind.to_string(), Some(ordinal))
        }
        None => (lower.clone(), None),
    };
    match (kind.as_str(), ordinal) {
        ("cpu", None) => Ok(DeviceSpec::Cpu),
        ("cuda", ordinal) => Ok(DeviceSpec::Cuda(ordinal)),
        ("metal", ordinal) => Ok(DeviceSpec::Metal(ordinal)),
        _ => Err(format!("unsupported runtime.device '{}'", value)),
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_embed_dim() -> usize {
    1024
}

fn default_nb_classes() -> usize {
    1000
}

fn default_batch_size() -> usize {
    512
}

fn default_accum_iter() -> usize {
    1
}

fn default_num_workers() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_blr() -> f64 {
    0.1
}

fn default_momentum() -> f64 {
    0.9
}

fn default_trust_coefficient() -> f64 {
    0.001
}

fn default_epochs() -> usize {
    90
}

fn default_warmup_epochs() -> f64 {
    10.0
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_print_freq() -> usize {
    20
}

/// One `--override section.key=value` assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: Vec<String>,
    pub value: serde_json::Value,
}

impl FromStr for ConfigOverride {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s.split_once('=').ok_or_else(|| {
            TrainingError::ConfigFormat(format!("override '{}' must be in the form key=value", s))
        })?;
        let path: Vec<String> = path.trim().split('.').map(str::to_string).collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return Err(TrainingError::ConfigFormat(format!(
                "override key '{}' has an empty segment",
                s
            )));
        }
        Ok(Self {
            path,
            value: parse_override_value(value),
        })
    }
}

impl ProbeConfig {
    /// Applies dotted overrides on top of the loaded file and re-validates.
    /// Unknown keys are rejected; relative paths resolve against the working
    /// directory.
    pub fn with_overrides(self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        let cwd = std::env::current_dir()?;
        self.with_overrides_in(overrides, &cwd)
    }

    fn with_overrides_in(
        self,
        overrides: &[ConfigOverride],
        base: &Path,
    ) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut tree = serde_json::to_value(self)?;
        for item in overrides {
            set_at_path(&mut tree, &item.path, item.value.clone())?;
        }
        let mut config: ProbeConfig = serde_json::from_value(tree)?;
        for item in overrides {
            match item.path.join(".").as_str() {
                "data.data_path" => absolutize_in_place(&mut config.data.data_path, base),
                "runtime.output_dir" => {
                    if let Some(path) = config.runtime.output_dir.as_mut() {
                        absolutize_in_place(path, base);
                    }
                }
                "runtime.log_dir" => {
                    if let Some(path) = config.runtime.log_dir.as_mut() {
                        absolutize_in_place(path, base);
                    }
                }
                "runtime.resume" => {
                    if let Some(path) = config.runtime.resume.as_mut() {
                        absolutize_in_place(path, base);
                    }
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_override_value(raw: &str) -> serde_json::Value {
    use serde_json::Value;

    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::from(int_val);
    }
    if let Some(number) = trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
    {
        return Value::Number(number);
    }
    Value::String(trimmed.to_string())
}

fn set_at_path(
    target: &mut serde_json::Value,
    path: &[String],
    new_value: serde_json::Value,
) -> Result<(), TrainingError> {
    let mut current = target;
    for (depth, segment) in path.iter().enumerate() {
        if current.is_null() {
            *current = serde_json::Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(TrainingError::ConfigFormat(format!(
                "override '{}' descends into a non-table value",
                path[..depth].join(".")
            )));
        };
        current = map
            .entry(segment.clone())
            .or_insert(serde_json::Value::Null);
    }
    *current = new_value;
    Ok(())
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    /// Malformed distributed environment.
    Config(String),
    Initialization(String),
    Runtime(String),
    Checkpoint(String),
    Collective(String),
    NonFiniteLoss {
        value: f64,
        epoch: usize,
        step: usize,
    },
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Config(msg) => {
                write!(f, "invalid distributed environment: {}", msg)
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "runtime error: {}", msg),
            TrainingError::Checkpoint(msg) => write!(f, "checkpoint error: {}", msg),
            TrainingError::Collective(msg) => write!(f, "collective operation failed: {}", msg),
            TrainingError::NonFiniteLoss { value, epoch, step } => write!(
                f,
                "loss is {} at epoch {} step {}, stopping training",
                value, epoch, step
            ),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

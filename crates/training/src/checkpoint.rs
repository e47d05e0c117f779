use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use model::LinearClassifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    distributed::DistributedContext,
    optimizer::{GradientScaler, GradientScalerState, Optimizer, OptimizerState},
    ProbeConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const STAGING_MARKER: &str = ".tmp-";
const DISPLACED_MARKER: &str = ".old-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    /// Last completed epoch.
    pub epoch: usize,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub config: serde_json::Value,
    pub model: FileRecord,
    #[serde(default)]
    pub optimizer: Option<FileRecord>,
    #[serde(default)]
    pub scaler: Option<FileRecord>,
    #[serde(default)]
    pub best_acc1: Option<f64>,
}

pub struct SaveRequest<'a> {
    pub output_dir: &'a Path,
    pub epoch: usize,
    pub config: &'a ProbeConfig,
    pub classifier: &'a LinearClassifier,
    pub optimizer: &'a dyn Optimizer,
    pub scaler: &'a GradientScaler,
    pub best_acc1: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// What a restore touches besides the classifier tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Restore optimizer and scaler state and continue after the saved epoch.
    TrainResume,
    /// Restore the classifier only.
    EvalOnly,
}

#[derive(Debug, Clone)]
pub struct Restored {
    pub directory: PathBuf,
    pub epoch: usize,
    /// `epoch + 1` for [`RestoreMode::TrainResume`], `None` otherwise.
    pub start_epoch: Option<usize>,
    pub best_acc1: Option<f64>,
}

pub fn checkpoint_dir_name(epoch: usize) -> String {
    format!("{}{:04}", CHECKPOINT_PREFIX, epoch)
}

/// Saves on the main process; other ranks return `Ok(None)` without touching disk.
pub fn save_on_main(
    ctx: &DistributedContext,
    request: SaveRequest<'_>,
) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    if !ctx.is_main() {
        return Ok(None);
    }
    save_checkpoint(request).map(Some)
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.output_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create output directory {}: {err}",
            request.output_dir.display()
        ))
    })?;

    sweep_stale_staging(request.output_dir)?;

    let dir_name = checkpoint_dir_name(request.epoch);
    let final_dir = request.output_dir.join(&dir_name);
    let staging_dir = request
        .output_dir
        .join(format!(".{}{}{}", dir_name, STAGING_MARKER, std::process::id()));
    fs::create_dir(&staging_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create staging directory {}: {err}",
            staging_dir.display()
        ))
    })?;

    let manifest = match write_contents(&request, &staging_dir) {
        Ok(manifest) => manifest,
        Err(err) => {
            let _ = fs::remove_dir_all(&staging_dir);
            return Err(err);
        }
    };

    // the previous copy stays complete on disk until the new one is in place
    let displaced = if final_dir.exists() {
        let aside = request
            .output_dir
            .join(format!(".{}{}{}", dir_name, DISPLACED_MARKER, std::process::id()));
        fs::rename(&final_dir, &aside).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to move {} aside: {err}",
                final_dir.display()
            ))
        })?;
        Some(aside)
    } else {
        None
    };
    if let Err(err) = fs::rename(&staging_dir, &final_dir) {
        if let Some(aside) = &displaced {
            let _ = fs::rename(aside, &final_dir);
        }
        return Err(TrainingError::checkpoint(format!(
            "failed to move checkpoint into {}: {err}",
            final_dir.display()
        )));
    }
    if let Some(aside) = displaced {
        remove_dir(&aside)?;
    }
    log::info!("saved checkpoint {}", final_dir.display());

    Ok(CheckpointDescriptor {
        directory: final_dir,
        manifest,
    })
}

fn write_contents(
    request: &SaveRequest<'_>,
    dir: &Path,
) -> Result<CheckpointManifest, TrainingError> {
    let model_path = dir.join(MODEL_FILENAME);
    save_classifier(request.classifier, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_path = dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let scaler_record = match request.scaler.state() {
        Some(state) => {
            let scaler_path = dir.join(SCALER_FILENAME);
            write_json(&scaler_path, &state)?;
            Some(file_record(&scaler_path)?)
        }
        None => None,
    };

    let (config, config_sha256) = snapshot_config(request.config)?;
    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        epoch: request.epoch,
        created_unix_timestamp: unix_timestamp(),
        config_sha256,
        config,
        model: model_record,
        optimizer: Some(optimizer_record),
        scaler: scaler_record,
        best_acc1: request.best_acc1,
    };
    // written last: a directory with a manifest is complete
    write_json(&dir.join(MANIFEST_FILENAME), &manifest)?;
    Ok(manifest)
}

/// Highest-epoch checkpoint under `output_dir` that has a manifest.
pub fn latest_checkpoint(output_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let mut candidates = checkpoint_directories(output_dir)?;
    candidates.sort_by_key(|(epoch, _)| *epoch);
    let Some((_, directory)) = candidates.pop() else {
        return Ok(None);
    };
    let manifest = load_manifest(&directory)?;
    Ok(Some(CheckpointDescriptor {
        directory,
        manifest,
    }))
}

/// Accepts a checkpoint directory or an output directory holding checkpoints.
pub fn resolve_checkpoint(path: &Path) -> Result<PathBuf, TrainingError> {
    if path.join(MANIFEST_FILENAME).is_file() {
        return Ok(path.to_path_buf());
    }
    match latest_checkpoint(path)? {
        Some(descriptor) => Ok(descriptor.directory),
        None => Err(TrainingError::checkpoint(format!(
            "no checkpoint found at {}",
            path.display()
        ))),
    }
}

pub fn load_checkpoint(
    path: &Path,
    mode: RestoreMode,
    classifier: &LinearClassifier,
    optimizer: &mut dyn Optimizer,
    scaler: &mut GradientScaler,
) -> Result<Restored, TrainingError> {
    let directory = resolve_checkpoint(path)?;
    let manifest = load_manifest(&directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;
    apply_classifier_weights(classifier, &model_path)?;

    let start_epoch = match mode {
        RestoreMode::EvalOnly => None,
        RestoreMode::TrainResume => {
            let optimizer_state: Option<OptimizerState> =
                read_optional(&directory, manifest.optimizer.as_ref(), "optimizer")?;
            match optimizer_state {
                Some(state) => optimizer.load_state(state)?,
                None => log::warn!("checkpoint has no optimizer state, starting fresh"),
            }
            let scaler_state: Option<GradientScalerState> =
                read_optional(&directory, manifest.scaler.as_ref(), "scaler")?;
            match scaler_state {
                Some(state) => scaler.load_state(state)?,
                None if scaler.is_enabled() => {
                    log::warn!("checkpoint has no loss-scale state, using the initial scale")
                }
                None => {}
            }
            Some(manifest.epoch + 1)
        }
    };

    println!("Resume checkpoint {}", directory.display());
    Ok(Restored {
        directory,
        epoch: manifest.epoch,
        start_epoch,
        best_acc1: manifest.best_acc1,
    })
}

fn read_optional<T: for<'de> Deserialize<'de>>(
    directory: &Path,
    record: Option<&FileRecord>,
    what: &str,
) -> Result<Option<T>, TrainingError> {
    let Some(record) = record else {
        return Ok(None);
    };
    let path = directory.join(&record.filename);
    if !path.is_file() {
        log::warn!("{} state listed but missing at {}", what, path.display());
        return Ok(None);
    }
    validate_file(&path, &record.sha256)?;
    read_json(&path).map(Some)
}

pub fn apply_classifier_weights(
    classifier: &LinearClassifier,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let tensors: HashMap<String, _> =
        load_safetensors(weights_path, classifier.device()).map_err(candle_to_checkpoint_error)?;
    classifier
        .load_state_tensors(&tensors)
        .map_err(candle_to_checkpoint_error)
}

fn save_classifier(classifier: &LinearClassifier, path: &Path) -> Result<(), TrainingError> {
    let tensors = classifier.state_tensors();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize classifier weights to {}: {err}",
            path.display()
        ))
    })
}

/// JSON snapshot of the run configuration and its sha256 fingerprint.
pub fn snapshot_config(
    config: &ProbeConfig,
) -> Result<(serde_json::Value, String), TrainingError> {
    let value = serde_json::to_value(config)
        .map_err(|err| TrainingError::checkpoint(format!("failed to snapshot config: {err}")))?;
    let bytes = serde_json::to_vec(&value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to hash config: {err}")))?;
    Ok((value, hex_encode(Sha256::digest(bytes))))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

/// Removes staging and displaced directories left behind by interrupted saves.
fn sweep_stale_staging(output_dir: &Path) -> Result<(), TrainingError> {
    let entries = fs::read_dir(output_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read checkpoint directory {}: {err}",
            output_dir.display()
        ))
    })?;
    for entry in entries {
        let entry = entry
            .map_err(|err| TrainingError::checkpoint(format!("failed to read entry: {err}")))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let leftover = name.starts_with(&format!(".{}", CHECKPOINT_PREFIX))
            && (name.contains(STAGING_MARKER) || name.contains(DISPLACED_MARKER));
        if leftover && entry.path().is_dir() {
            log::warn!("removing stale checkpoint staging directory {}", name);
            remove_dir(&entry.path())?;
        }
    }
    Ok(())
}

fn checkpoint_directories(base: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    let entries = fs::read_dir(base).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })?;
    for entry in entries {
        let entry = entry
            .map_err(|err| TrainingError::checkpoint(format!("failed to read entry: {err}")))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(epoch) = name
            .to_str()
            .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|digits| digits.parse::<usize>().ok())
        else {
            continue;
        };
        if path.join(MANIFEST_FILENAME).is_file() {
            dirs.push((epoch, path));
        }
    }
    Ok(dirs)
}

pub fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 16];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let mut data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    data.push(b'\n');
    file.write_all(&data)
        .and_then(|_| file.sync_all())
        .map_err(|err| {
            TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
        })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn remove_dir(path: &Path) -> Result<(), TrainingError> {
    fs::remove_dir_all(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to remove {}: {err}", path.display()))
    })
}

fn candle_to_checkpoint_error(err: candle_core::Error) -> TrainingError {
    TrainingError::checkpoint(err.to_string())
}

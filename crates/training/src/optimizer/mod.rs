use std::collections::{BTreeMap, HashMap};

pub mod lars;
pub mod scaler;
pub mod sgd;

pub use lars::{Lars, LarsConfig};
pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};
pub use sgd::{Sgd, SgdConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

/// A set of parameters sharing hyper-parameters. The schedule writes `lr`;
/// `lr_scale` lets a group follow the schedule at a fixed ratio.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<(String, Var)>,
    pub lr: f64,
    pub lr_scale: f64,
    pub weight_decay: f64,
}

impl ParamGroup {
    pub fn new(
        name: impl Into<String>,
        params: Vec<(String, Var)>,
        lr: f64,
        weight_decay: f64,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            lr,
            lr_scale: 1.0,
            weight_decay,
        }
    }
}

pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Applies one update from already averaged and unscaled gradients.
    /// Parameters without a gradient are left untouched.
    fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError>;

    /// Number of updates applied so far.
    fn steps(&self) -> usize;

    fn state(&self) -> Result<OptimizerState, TrainingError>;

    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError>;

    /// Every parameter across groups, in group order.
    fn parameters(&self) -> Vec<(String, Var)> {
        self.param_groups()
            .iter()
            .flat_map(|group| group.params.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerState {
    pub algorithm: String,
    pub step: usize,
    pub groups: Vec<GroupState>,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupState {
    pub name: String,
    pub lr: f64,
    pub lr_scale: f64,
    pub weight_decay: f64,
}

/// Per-parameter buffers (momentum, moments) flattened in row-major order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub buffers: BTreeMap<String, Vec<f32>>,
}

/// Builds the configured optimizer over a single parameter group.
pub fn build_optimizer(
    cfg: &config::OptimizerConfig,
    params: Vec<(String, Var)>,
    lr: f64,
) -> Result<Box<dyn Optimizer>, TrainingError> {
    if params.is_empty() {
        return Err(TrainingError::initialization(
            "optimizer requires at least one parameter",
        ));
    }
    for (name, var) in &params {
        if !var.as_tensor().dtype().is_float() {
            return Err(TrainingError::initialization(format!(
                "optimizer received non-floating parameter '{}'",
                name
            )));
        }
    }
    let group = ParamGroup::new("head", params, lr, cfg.weight_decay);
    let optimizer: Box<dyn Optimizer> = match cfg.algorithm {
        config::OptimizerType::Lars => Box::new(Lars::new(
            vec![group],
            LarsConfig {
                momentum: cfg.momentum,
                trust_coefficient: cfg.trust_coefficient,
            },
        )?),
        config::OptimizerType::Sgd => Box::new(Sgd::new(
            vec![group],
            SgdConfig {
                momentum: cfg.momentum,
            },
        )?),
    };
    Ok(optimizer)
}

/// Zero-initialized buffers shaped like each parameter, one vector per group.
pub(crate) fn zeros_like_groups(groups: &[ParamGroup]) -> Result<Vec<Vec<Tensor>>, TrainingError> {
    groups
        .iter()
        .map(|group| {
            group
                .params
                .iter()
                .map(|(_, var)| {
                    let tensor = var.as_tensor();
                    Tensor::zeros(tensor.dims(), DType::F32, tensor.device())
                        .map_err(to_runtime_error)
                })
                .collect()
        })
        .collect()
}

pub(crate) fn group_states(groups: &[ParamGroup]) -> Vec<GroupState> {
    groups
        .iter()
        .map(|group| GroupState {
            name: group.name.clone(),
            lr: group.lr,
            lr_scale: group.lr_scale,
            weight_decay: group.weight_decay,
        })
        .collect()
}

/// Serializes named buffers for every parameter.
pub(crate) fn collect_parameter_states(
    groups: &[ParamGroup],
    buffers: &[(&str, &Vec<Vec<Tensor>>)],
) -> Result<Vec<ParameterState>, TrainingError> {
    let mut states = Vec::new();
    for (group_index, group) in groups.iter().enumerate() {
        for (param_index, (name, var)) in group.params.iter().enumerate() {
            let shape = var.as_tensor().dims().to_vec();
            let expected = shape.iter().product();
            let mut entries = BTreeMap::new();
            for (key, tensors) in buffers {
                let tensor = &tensors[group_index][param_index];
                entries.insert(key.to_string(), flatten_to_vec(tensor, expected)?);
            }
            states.push(ParameterState {
                name: name.clone(),
                shape,
                buffers: entries,
            });
        }
    }
    Ok(states)
}

/// Validates `state` against the live groups and returns the restored
/// buffers in the same layout as [`zeros_like_groups`], keyed by buffer name.
pub(crate) fn restore_parameter_states(
    algorithm: &str,
    groups: &mut [ParamGroup],
    state: OptimizerState,
    keys: &[&str],
) -> Result<HashMap<String, Vec<Vec<Tensor>>>, TrainingError> {
    if state.algorithm != algorithm {
        return Err(TrainingError::checkpoint(format!(
            "optimizer state was saved by '{}' but the run uses '{}'",
            state.algorithm, algorithm
        )));
    }
    if state.groups.len() != groups.len() {
        return Err(TrainingError::checkpoint(format!(
            "optimizer state has {} parameter groups, expected {}",
            state.groups.len(),
            groups.len()
        )));
    }
    let mut by_name: HashMap<_, _> = state
        .parameters
        .into_iter()
        .map(|param| (param.name.clone(), param))
        .collect();

    let mut restored: HashMap<String, Vec<Vec<Tensor>>> = keys
        .iter()
        .map(|key| (key.to_string(), Vec::with_capacity(groups.len())))
        .collect();

    for group in groups.iter() {
        let mut per_key: HashMap<&str, Vec<Tensor>> =
            keys.iter().map(|key| (*key, Vec::new())).collect();
        for (name, var) in &group.params {
            let mut saved = by_name.remove(name).ok_or_else(|| {
                TrainingError::checkpoint(format!("optimizer state missing parameter '{}'", name))
            })?;
            let tensor = var.as_tensor();
            if tensor.dims() != saved.shape.as_slice() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state shape mismatch for '{}'",
                    name
                )));
            }
            let expected: usize = saved.shape.iter().product();
            for key in keys {
                let values = saved.buffers.remove(*key).ok_or_else(|| {
                    TrainingError::checkpoint(format!(
                        "optimizer state for '{}' lacks buffer '{}'",
                        name, key
                    ))
                })?;
                if values.len() != expected {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer buffer '{}' for '{}' has {} values, expected {}",
                        key,
                        name,
                        values.len(),
                        expected
                    )));
                }
                let buffer = Tensor::from_vec(values, expected, tensor.device())
                    .and_then(|t| t.reshape(tensor.dims()))
                    .map_err(to_runtime_error)?;
                if let Some(list) = per_key.get_mut(key) {
                    list.push(buffer);
                }
            }
        }
        for (key, list) in per_key {
            if let Some(slots) = restored.get_mut(key) {
                slots.push(list);
            }
        }
    }

    if !by_name.is_empty() {
        return Err(TrainingError::checkpoint(
            "optimizer state has extra parameters not present in the model",
        ));
    }

    for (group, saved) in groups.iter_mut().zip(&state.groups) {
        group.lr = saved.lr;
        group.lr_scale = saved.lr_scale;
        group.weight_decay = saved.weight_decay;
    }

    Ok(restored)
}

pub(crate) fn gradient_for(grads: &GradStore, var: &Var) -> Result<Option<Tensor>, TrainingError> {
    match grads.get(var.as_tensor()) {
        Some(grad) => Ok(Some(grad.to_dtype(DType::F32).map_err(to_runtime_error)?)),
        None => Ok(None),
    }
}

pub(crate) fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .to_dtype(DType::F64)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f64>()
        .map_err(to_runtime_error)?;
    Ok(squared.sqrt())
}

pub(crate) fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use test_support::*;

    #[test]
    fn builds_each_algorithm() {
        for algorithm in [config::OptimizerType::Lars, config::OptimizerType::Sgd] {
            let cfg = OptimizerConfig {
                algorithm,
                ..OptimizerConfig::default()
            };
            let params = vec![("w".to_string(), var(&[1.0, 2.0], &[1, 2]))];
            let optimizer = build_optimizer(&cfg, params, 0.5).unwrap();
            assert_eq!(optimizer.param_groups().len(), 1);
            assert_eq!(optimizer.param_groups()[0].lr, 0.5);
            assert_eq!(optimizer.parameters().len(), 1);
        }
    }

    #[test]
    fn rejects_empty_parameter_list() {
        assert!(build_optimizer(&OptimizerConfig::default(), Vec::new(), 0.1).is_err());
    }

    #[test]
    fn state_from_other_algorithm_is_rejected() {
        let params = vec![("w".to_string(), var(&[1.0], &[1]))];
        let sgd = build_optimizer(
            &OptimizerConfig {
                algorithm: config::OptimizerType::Sgd,
                ..OptimizerConfig::default()
            },
            params.clone(),
            0.1,
        )
        .unwrap();
        let mut lars = build_optimizer(&OptimizerConfig::default(), params, 0.1).unwrap();
        assert!(lars.load_state(sgd.state().unwrap()).is_err());
    }
}

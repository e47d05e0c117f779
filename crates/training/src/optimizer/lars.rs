//! Layer-wise adaptive rate scaling on top of momentum SGD.
//!
//! Parameters with more than one dimension receive weight decay and have
//! their update rescaled by the trust ratio
//! `trust_coefficient * ||p|| / ||g + wd * p||`. Vectors (biases, norms) take
//! a plain momentum step.

use candle_core::{backprop::GradStore, Tensor};

use super::{
    collect_parameter_states, gradient_for, group_states, restore_parameter_states,
    tensor_l2_norm, to_runtime_error, zeros_like_groups, Optimizer, OptimizerState, ParamGroup,
};
use crate::TrainingError;

const MOMENTUM_BUFFER: &str = "mu";

#[derive(Debug, Clone, Copy)]
pub struct LarsConfig {
    pub momentum: f64,
    pub trust_coefficient: f64,
}

impl Default for LarsConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            trust_coefficient: 0.001,
        }
    }
}

pub struct Lars {
    groups: Vec<ParamGroup>,
    config: LarsConfig,
    momentum: Vec<Vec<Tensor>>,
    step: usize,
}

impl Lars {
    pub fn new(groups: Vec<ParamGroup>, config: LarsConfig) -> Result<Self, TrainingError> {
        let momentum = zeros_like_groups(&groups)?;
        Ok(Self {
            groups,
            config,
            momentum,
            step: 0,
        })
    }

    fn trust_ratio(&self, param: &Tensor, update: &Tensor) -> Result<f64, TrainingError> {
        let param_norm = tensor_l2_norm(param)?;
        let update_norm = tensor_l2_norm(update)?;
        if param_norm > 0.0 && update_norm > 0.0 {
            Ok(self.config.trust_coefficient * param_norm / update_norm)
        } else {
            Ok(1.0)
        }
    }
}

impl Optimizer for Lars {
    fn name(&self) -> &'static str {
        "lars"
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        for (group_index, group) in self.groups.iter().enumerate() {
            for (param_index, (_, var)) in group.params.iter().enumerate() {
                let Some(grad) = gradient_for(grads, var)? else {
                    continue;
                };
                let dtype = var.as_tensor().dtype();
                let param = var
                    .as_tensor()
                    .to_dtype(candle_core::DType::F32)
                    .map_err(to_runtime_error)?;

                let mut update = grad;
                if param.rank() > 1 {
                    if group.weight_decay != 0.0 {
                        update = (update + param.affine(group.weight_decay, 0.0))
                            .map_err(to_runtime_error)?;
                    }
                    let q = self.trust_ratio(&param, &update)?;
                    update = update.affine(q, 0.0).map_err(to_runtime_error)?;
                }

                let mu = (self.momentum[group_index][param_index]
                    .affine(self.config.momentum, 0.0)
                    .map_err(to_runtime_error)?
                    + update)
                    .map_err(to_runtime_error)?;
                let next = (param - mu.affine(group.lr, 0.0).map_err(to_runtime_error)?)
                    .map_err(to_runtime_error)?;
                var.set(&next.to_dtype(dtype).map_err(to_runtime_error)?)
                    .map_err(to_runtime_error)?;
                self.momentum[group_index][param_index] = mu;
            }
        }
        self.step += 1;
        Ok(())
    }

    fn steps(&self) -> usize {
        self.step
    }

    fn state(&self) -> Result<OptimizerState, TrainingError> {
        Ok(OptimizerState {
            algorithm: self.name().to_string(),
            step: self.step,
            groups: group_states(&self.groups),
            parameters: collect_parameter_states(
                &self.groups,
                &[(MOMENTUM_BUFFER, &self.momentum)],
            )?,
        })
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let step = state.step;
        let mut restored =
            restore_parameter_states(self.name(), &mut self.groups, state, &[MOMENTUM_BUFFER])?;
        if let Some(momentum) = restored.remove(MOMENTUM_BUFFER) {
            self.momentum = momentum;
        }
        self.step = step;
        Ok(())
    }
}

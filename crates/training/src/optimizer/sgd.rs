use candle_core::{backprop::GradStore, DType, Tensor};

use super::{
    collect_parameter_states, gradient_for, group_states, restore_parameter_states,
    to_runtime_error, zeros_like_groups, Optimizer, OptimizerState, ParamGroup,
};
use crate::TrainingError;

const MOMENTUM_BUFFER: &str = "momentum_buffer";

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub momentum: f64,
}

/// Momentum SGD with coupled weight decay.
pub struct Sgd {
    groups: Vec<ParamGroup>,
    config: SgdConfig,
    momentum: Vec<Vec<Tensor>>,
    step: usize,
}

impl Sgd {
    pub fn new(groups: Vec<ParamGroup>, config: SgdConfig) -> Result<Self, TrainingError> {
        let momentum = zeros_like_groups(&groups)?;
        Ok(Self {
            groups,
            config,
            momentum,
            step: 0,
        })
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
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
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?;
                let grad = if group.weight_decay != 0.0 {
                    grad.add(&param.affine(group.weight_decay, 0.0).map_err(to_runtime_error)?)
                        .map_err(to_runtime_error)?
                } else {
                    grad
                };
                let direction = if self.config.momentum != 0.0 {
                    let buffer = self.momentum[group_index][param_index]
                        .affine(self.config.momentum, 0.0)
                        .and_then(|buf| buf.add(&grad))
                        .map_err(to_runtime_error)?;
                    self.momentum[group_index][param_index] = buffer.clone();
                    buffer
                } else {
                    grad
                };
                let next = param
                    .sub(&direction.affine(group.lr, 0.0).map_err(to_runtime_error)?)
                    .and_then(|t| t.to_dtype(dtype))
                    .map_err(to_runtime_error)?;
                var.set(&next).map_err(to_runtime_error)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::test_support::*;

    #[test]
    fn plain_step_without_momentum() {
        let weight = var(&[2.0, -4.0], &[2]);
        let group = ParamGroup::new("head", vec![("w".into(), weight.clone())], 0.25, 0.0);
        let mut sgd = Sgd::new(vec![group], SgdConfig { momentum: 0.0 }).unwrap();

        sgd.step(&quadratic_grads(&[&weight], 1.0)).unwrap();

        assert_eq!(values(&weight), vec![1.5, -3.0]);
        assert_eq!(sgd.steps(), 1);
    }

    #[test]
    fn weight_decay_is_added_to_gradient() {
        let weight = var(&[1.0, 1.0], &[1, 2]);
        let group = ParamGroup::new("head", vec![("w".into(), weight.clone())], 0.5, 1.0);
        let mut sgd = Sgd::new(vec![group], SgdConfig { momentum: 0.9 }).unwrap();

        // grad = p + wd * p = 2p -> p - 0.5 * 2p = 0
        sgd.step(&quadratic_grads(&[&weight], 1.0)).unwrap();

        assert_eq!(values(&weight), vec![0.0, 0.0]);
    }
}

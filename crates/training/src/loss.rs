use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Loss over `(batch, classes)` logits and `(batch,)` class indices.
pub trait Criterion: Send + Sync {
    fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError>;
}

/// Mean negative log-likelihood of the target class.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }
}

impl Criterion for CrossEntropyLoss {
    fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects [batch, classes] logits, got {:?}",
                logits.dims()
            ))
        })?;
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy received an empty batch or zero classes",
            ));
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "targets must be shaped [{}], got {:?}",
                batch,
                targets.dims()
            )));
        }

        let targets = to_class_indices(targets, logits)?;
        let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
        let loss = log_probs
            .gather(&targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .and_then(|nll| nll.neg())
            .and_then(|nll| nll.mean_all())
            .map_err(to_runtime_error)?;
        let value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;

        Ok(LossOutput {
            loss,
            value,
            batch_size: batch,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar loss attached to the autograd graph.
    pub loss: Tensor,
    pub value: f64,
    pub batch_size: usize,
}

/// Top-k accuracy, in percent, for each requested `k`.
pub fn accuracy(
    logits: &Tensor,
    targets: &Tensor,
    topk: &[usize],
) -> Result<Vec<f64>, TrainingError> {
    let rows = logits
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(to_runtime_error)?;
    let labels = to_class_indices(targets, logits)?
        .to_vec1::<u32>()
        .map_err(to_runtime_error)?;
    if rows.len() != labels.len() {
        return Err(TrainingError::runtime(format!(
            "accuracy received {} rows but {} labels",
            rows.len(),
            labels.len()
        )));
    }
    if rows.is_empty() {
        return Ok(vec![0.0; topk.len()]);
    }

    // rank = number of classes scoring strictly higher than the target
    let ranks: Vec<usize> = rows
        .iter()
        .zip(&labels)
        .map(|(row, &label)| {
            let target = row[label as usize];
            row.iter().filter(|&&score| score > target).count()
        })
        .collect();

    Ok(topk
        .iter()
        .map(|&k| {
            let correct = ranks.iter().filter(|&&rank| rank < k).count();
            correct as f64 * 100.0 / ranks.len() as f64
        })
        .collect())
}

fn to_class_indices(targets: &Tensor, logits: &Tensor) -> Result<Tensor, TrainingError> {
    let targets = targets.to_device(logits.device()).map_err(to_runtime_error)?;
    let targets = match targets.dtype() {
        DType::U32 => targets,
        DType::I64 | DType::U8 => targets.to_dtype(DType::U32).map_err(to_runtime_error)?,
        dtype => {
            return Err(TrainingError::runtime(format!(
                "unsupported target dtype {:?} for classification",
                dtype
            )))
        }
    };
    let classes = logits.dim(D::Minus1).map_err(to_runtime_error)?;
    let max = targets
        .max(0)
        .and_then(|m| m.to_vec0::<u32>())
        .map_err(to_runtime_error)?;
    if max as usize >= classes {
        return Err(TrainingError::runtime(format!(
            "target class {} out of range for {} classes",
            max, classes
        )));
    }
    Ok(targets)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits() -> Tensor {
        Tensor::from_slice(
            &[
                2.0f32, 1.0, 0.0, -1.0, //
                0.0, 0.0, 3.0, 1.0, //
                0.5, 0.4, 0.3, 0.2,
            ],
            (3, 4),
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn uniform_logits_give_log_classes() {
        let logits = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::from_slice(&[1u32, 4], 2, &Device::Cpu).unwrap();

        let output = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();

        assert!((output.value - 5f64.ln()).abs() < 1e-6);
        assert_eq!(output.batch_size, 2);
    }

    #[test]
    fn loss_is_differentiable() {
        let logits = candle_core::Var::from_tensor(&logits()).unwrap();
        let targets = Tensor::from_slice(&[0i64, 2, 3], 3, &Device::Cpu).unwrap();

        let output = CrossEntropyLoss::new()
            .compute(logits.as_tensor(), &targets)
            .unwrap();
        let grads = output.loss.backward().unwrap();

        let grad = grads.get(logits.as_tensor()).unwrap();
        // softmax - one_hot sums to zero per row
        let row_sums = grad.sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert!(row_sums.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn top_k_accuracy_in_percent() {
        let targets = Tensor::from_slice(&[0u32, 3, 3], 3, &Device::Cpu).unwrap();

        let acc = accuracy(&logits(), &targets, &[1, 2, 5]).unwrap();

        // row 0 rank 0, row 1 rank 1, row 2 rank 3
        assert!((acc[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!((acc[1] - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(acc[2], 100.0);
    }

    #[test]
    fn rejects_out_of_range_targets() {
        let targets = Tensor::from_slice(&[0u32, 1, 4], 3, &Device::Cpu).unwrap();
        assert!(CrossEntropyLoss::new().compute(&logits(), &targets).is_err());
    }
}

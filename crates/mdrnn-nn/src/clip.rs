// Gradient clipping
//
// Long MDLSTM recurrences can produce exploding gradients early in training.
// clip_grad_norm rescales all parameter gradients together so their global
// L2 norm is at most max_norm:
//
//   total = sqrt(Σ_p ‖g_p‖²)
//   g_p  ← g_p · max_norm / total      if total > max_norm

use mdrnn_core::backend::Backend;
use mdrnn_core::backprop::GradStore;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::tensor::Tensor;

/// Norm threshold that works well for MDLSTM training from scratch.
pub const DEFAULT_MAX_GRAD_NORM: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipOutcome {
    /// Global norm before clipping.
    pub total_norm: f64,
    pub clipped: bool,
}

/// Global L2 norm of the gradients of `params`. Parameters without a
/// gradient contribute nothing.
pub fn grad_norm<B: Backend>(grads: &GradStore<B>, params: &[Tensor<B>]) -> Result<f64> {
    let mut sum_sq = 0.0;
    for p in params {
        if let Some(g) = grads.get(p) {
            sum_sq += g.to_f64_vec()?.iter().map(|v| v * v).sum::<f64>();
        }
    }
    Ok(sum_sq.sqrt())
}

/// Return a copy of `grads` with the gradients of `params` rescaled so their
/// global norm is at most `max_norm`. Gradients of other tensors are kept
/// as they are.
pub fn clip_grad_norm<B: Backend>(
    grads: &GradStore<B>,
    params: &[Tensor<B>],
    max_norm: f64,
) -> Result<(GradStore<B>, ClipOutcome)> {
    if max_norm.is_nan() || max_norm <= 0.0 {
        return Err(Error::msg(format!(
            "clip_grad_norm: max_norm must be positive, got {max_norm}"
        )));
    }
    let total_norm = grad_norm(grads, params)?;
    let mut out = grads.clone();
    let clipped = total_norm > max_norm;
    if clipped {
        log::warn!(
            "gradient norm {:.4} exceeds {:.4}, rescaling",
            total_norm,
            max_norm
        );
        let scale = max_norm / total_norm;
        for p in params {
            if let Some(g) = grads.get(p) {
                out.insert(p, g.affine(scale, 0.0)?);
            }
        }
    }
    Ok((
        out,
        ClipOutcome {
            total_norm,
            clipped,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdrnn_core::DType;
    use mdrnn_cpu::{CpuDevice, CpuTensor};

    #[test]
    fn test_no_clip_below_threshold() -> Result<()> {
        let w = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64, &CpuDevice)?
            .set_variable();
        let grads = w.sum_all()?.backward()?;
        let (clipped, outcome) = clip_grad_norm(&grads, &[w.clone()], DEFAULT_MAX_GRAD_NORM)?;
        assert!(!outcome.clipped);
        assert!((outcome.total_norm - 3.0f64.sqrt()).abs() < 1e-10);
        assert_eq!(clipped.get(&w).unwrap().to_f64_vec()?, vec![1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_clips_across_parameters() -> Result<()> {
        let w1 = CpuTensor::from_f64_slice(&[3.0], 1, DType::F64, &CpuDevice)?.set_variable();
        let w2 = CpuTensor::from_f64_slice(&[4.0], 1, DType::F64, &CpuDevice)?.set_variable();
        // grads [6], [8], global norm 10
        let loss = w1.square()?.add(&w2.square()?)?.sum_all()?;
        let grads = loss.backward()?;
        let params = vec![w1.clone(), w2.clone()];
        let (clipped, outcome) = clip_grad_norm(&grads, &params, 2.0)?;
        assert!(outcome.clipped);
        assert!((outcome.total_norm - 10.0).abs() < 1e-10);
        assert!((clipped.get(&w1).unwrap().to_scalar_f64()? - 1.2).abs() < 1e-10);
        assert!((clipped.get(&w2).unwrap().to_scalar_f64()? - 1.6).abs() < 1e-10);
        assert!((grad_norm(&clipped, &params)? - 2.0).abs() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_rejects_non_positive_threshold() -> Result<()> {
        let w = CpuTensor::ones(2, DType::F64, &CpuDevice)?.set_variable();
        let grads = w.sum_all()?.backward()?;
        assert!(clip_grad_norm(&grads, &[w], 0.0).is_err());
        Ok(())
    }
}

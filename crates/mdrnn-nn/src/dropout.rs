// Dropout — random zeroing during training
//
// In training mode each element is zeroed with probability p and the
// survivors are scaled by 1/(1-p). In eval mode the layer is the identity.
//
// The flag is an AtomicBool rather than a Cell so the layer can sit inside
// parameter bundles shared across the rayon direction fork-join.

use std::sync::atomic::{AtomicBool, Ordering};

use mdrnn_core::backend::Backend;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::tensor::Tensor;

use crate::module::Module;

#[derive(Debug)]
pub struct Dropout {
    p: f64,
    training: AtomicBool,
}

impl Dropout {
    /// `p` must lie in [0, 1).
    pub fn new(p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::msg(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
        Ok(Dropout {
            p,
            training: AtomicBool::new(true),
        })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    pub fn forward_t<B: Backend>(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        if !self.is_training() || self.p == 0.0 {
            return Ok(x.clone());
        }
        let scale = 1.0 / (1.0 - self.p);
        let draws = Tensor::<B>::rand(x.shape(), x.dtype(), x.device())?;
        let threshold = Tensor::<B>::full_like(&draws, self.p)?;
        let keep = draws.ge(&threshold)?;
        Tensor::where_cond(&keep, &x.affine(scale, 0.0)?, &Tensor::zeros_like(x)?)
    }
}

impl<B: Backend> Module<B> for Dropout {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.forward_t(x)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }

    fn set_training(&self, training: bool) {
        Dropout::set_training(self, training);
    }

    fn is_training(&self) -> bool {
        Dropout::is_training(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdrnn_core::DType;
    use mdrnn_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn test_eval_is_identity() -> Result<()> {
        let d = Dropout::new(0.5)?;
        d.set_training(false);
        let x = Tensor::<CpuBackend>::ones((4, 4), DType::F32, &CpuDevice)?;
        assert_eq!(d.forward_t(&x)?.to_f64_vec()?, x.to_f64_vec()?);
        Ok(())
    }

    #[test]
    fn test_training_zeroes_or_scales() -> Result<()> {
        let d = Dropout::new(0.2)?;
        let x = Tensor::<CpuBackend>::ones(1000, DType::F64, &CpuDevice)?;
        let y = d.forward_t(&x)?.to_f64_vec()?;
        assert!(y.iter().all(|&v| v == 0.0 || (v - 1.25).abs() < 1e-12));
        assert!(y.iter().any(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn test_invalid_probability() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
    }
}

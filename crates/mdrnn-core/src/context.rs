use crate::backend::{Backend, BackendDevice};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Where and in which precision a model computes.
///
/// Layers take one of these at construction and create every parameter and
/// every state tensor through it, so nothing downstream has to ask a tensor
/// which device it lives on.
pub struct ExecutionContext<B: Backend> {
    device: B::Device,
    dtype: DType,
}

impl<B: Backend> Clone for ExecutionContext<B> {
    fn clone(&self) -> Self {
        ExecutionContext {
            device: self.device.clone(),
            dtype: self.dtype,
        }
    }
}

impl<B: Backend> std::fmt::Debug for ExecutionContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecutionContext(device={}, dtype={})",
            self.device.name(),
            self.dtype
        )
    }
}

impl<B: Backend> ExecutionContext<B> {
    /// Only floating point dtypes can hold parameters.
    pub fn new(device: B::Device, dtype: DType) -> Result<Self> {
        if !dtype.is_float() {
            return Err(Error::msg(format!(
                "execution context needs a float dtype, got {}",
                dtype
            )));
        }
        Ok(ExecutionContext { device, dtype })
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn zeros(&self, shape: impl Into<crate::Shape>) -> Result<Tensor<B>> {
        Tensor::zeros(shape, self.dtype, &self.device)
    }

    pub fn full(&self, shape: impl Into<crate::Shape>, val: f64) -> Result<Tensor<B>> {
        Tensor::full(shape, val, self.dtype, &self.device)
    }

    pub fn rand(&self, shape: impl Into<crate::Shape>) -> Result<Tensor<B>> {
        Tensor::rand(shape, self.dtype, &self.device)
    }

    pub fn from_f64_slice(
        &self,
        data: &[f64],
        shape: impl Into<crate::Shape>,
    ) -> Result<Tensor<B>> {
        Tensor::from_f64_slice(data, shape, self.dtype, &self.device)
    }

    /// Reject a tensor that was created under a different dtype.
    pub fn check(&self, t: &Tensor<B>) -> Result<()> {
        if t.dtype() != self.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: t.dtype(),
            });
        }
        Ok(())
    }
}

// Linear — fully-connected layer, y = x @ Wᵀ + b
//
//   weight: [out_features, in_features]
//   bias:   [1, out_features], broadcast over the batch
//
// The MDLSTM classifier head is one of these, fed the flattened
// concatenation of every scan direction's activations.

use mdrnn_core::backend::Backend;
use mdrnn_core::context::ExecutionContext;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::shape::Shape;
use mdrnn_core::tensor::Tensor;

use crate::init;
use crate::module::Module;

/// A fully-connected layer.
///
/// ```ignore
/// let head = Linear::new(1024, 10, true, &ctx)?;
/// let scores = head.forward(&features)?; // [batch, 10]
/// ```
pub struct Linear<B: Backend> {
    weight: Tensor<B>,
    bias: Option<Tensor<B>>,
    in_features: usize,
    out_features: usize,
}

impl<B: Backend> Linear<B> {
    /// Kaiming-uniform weights, bias drawn from the same range.
    pub fn new(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        ctx: &ExecutionContext<B>,
    ) -> Result<Self> {
        let weight = init::kaiming_uniform(ctx, (out_features, in_features))?;
        let bias = if use_bias {
            let k = (1.0 / in_features.max(1) as f64).sqrt();
            Some(init::uniform(ctx, (1, out_features), -k, k)?)
        } else {
            None
        };
        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Wrap existing tensors (weight `[out, in]`, bias `[1, out]`).
    pub fn from_tensors(weight: Tensor<B>, bias: Option<Tensor<B>>) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: dims.len(),
            });
        }
        let (out_features, in_features) = (dims[0], dims[1]);
        if let Some(b) = &bias {
            let expected = Shape::from((1, out_features));
            if b.shape() != &expected {
                return Err(Error::ShapeMismatch {
                    expected,
                    got: b.shape().clone(),
                });
            }
        }
        Ok(Linear {
            weight: weight.set_variable(),
            bias: bias.map(|b| b.set_variable()),
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }
}

impl<B: Backend> Module<B> for Linear<B> {
    /// `[batch, in_features]` → `[batch, out_features]`
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let features = x.dims().last().copied().unwrap_or(0);
        if features != self.in_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((x.dims().first().copied().unwrap_or(1), self.in_features)),
                got: x.shape().clone(),
            });
        }
        let output = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => output.add(bias),
            None => Ok(output),
        }
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.iter().cloned());
        params
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = vec![("weight".to_string(), self.weight.clone())];
        if let Some(b) = &self.bias {
            named.push(("bias".to_string(), b.clone()));
        }
        named
    }
}

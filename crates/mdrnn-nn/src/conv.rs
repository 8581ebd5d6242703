// Conv2d — learnable 2-D convolution
//
//   weight: [C_out, C_in, kH, kW]
//   bias:   [C_out]                 (optional)
//
//   H_out = (H + 2 * pH - kH) / sH + 1
//
// Inside the MDLSTM the layer is used in three shapes:
//   1×1 over the skewed input map          (input responses, with bias)
//   2×1 with one row of top padding        (state column plus its shifted copy)
//   1×1 over a state column                (memory peepholes)
//
// A state column is `[N, C, H]`; `forward_column` lifts it to
// `[N, C, H, 1]`, convolves, and drops the trailing rows the padding added.

use mdrnn_core::backend::Backend;
use mdrnn_core::context::ExecutionContext;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::shape::Shape;
use mdrnn_core::tensor::Tensor;

use crate::init;
use crate::module::Module;

/// 2-D convolution over `[N, C_in, H, W]`.
pub struct Conv2d<B: Backend> {
    weight: Tensor<B>,
    bias: Option<Tensor<B>>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

impl<B: Backend> Conv2d<B> {
    /// Kaiming-uniform weights; bias in the same range.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        padding: [usize; 2],
        use_bias: bool,
        ctx: &ExecutionContext<B>,
    ) -> Result<Self> {
        let [kh, kw] = kernel_size;
        let weight = init::kaiming_uniform(ctx, (out_channels, in_channels, kh, kw))?;
        let bias = if use_bias {
            let k = (1.0 / (in_channels * kh * kw).max(1) as f64).sqrt();
            Some(init::uniform(ctx, out_channels, -k, k)?)
        } else {
            None
        };
        Ok(Conv2d {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel_size,
            stride: [1, 1],
            padding,
        })
    }

    /// Wrap existing tensors, checking the weight against `expected_kernel`
    /// (`[C_out, C_in, kH, kW]`). `name` is reported in the error.
    pub fn from_tensors(
        name: &str,
        weight: Tensor<B>,
        bias: Option<Tensor<B>>,
        expected_kernel: impl Into<Shape>,
        padding: [usize; 2],
    ) -> Result<Self> {
        let expected = expected_kernel.into();
        if weight.shape() != &expected {
            return Err(Error::KernelShapeMismatch {
                name: format!("{name}.weight"),
                expected,
                got: weight.shape().clone(),
            });
        }
        let (out_channels, in_channels, kh, kw) = weight.shape().dims4()?;
        if let Some(b) = &bias {
            if b.dims() != [out_channels] {
                return Err(Error::KernelShapeMismatch {
                    name: format!("{name}.bias"),
                    expected: Shape::from(out_channels),
                    got: b.shape().clone(),
                });
            }
        }
        Ok(Conv2d {
            weight: weight.set_variable(),
            bias: bias.map(|b| b.set_variable()),
            in_channels,
            out_channels,
            kernel_size: [kh, kw],
            stride: [1, 1],
            padding,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        self.kernel_size
    }

    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }

    /// Overwrite every bias entry with `value`.
    pub fn fill_bias(&self, value: f64) -> Result<()> {
        match &self.bias {
            Some(b) => b.update_data_inplace(&vec![value; b.elem_count()]),
            None => Err(Error::msg("fill_bias: convolution has no bias")),
        }
    }

    /// Convolve a state column `[N, C_in, H]` → `[N, C_out, H]`.
    ///
    /// Rows the padding added below the column are dropped, so a 2×1
    /// kernel with padding `[1, 0]` yields `W₀ · x[r - 1] + W₁ · x[r]`.
    pub fn forward_column(&self, column: &Tensor<B>) -> Result<Tensor<B>> {
        let (_, _, height) = column.shape().dims3()?;
        let out = self.forward(&column.unsqueeze(3)?)?;
        out.narrow(2, 0, height)?.squeeze(3)
    }
}

impl<B: Backend> Module<B> for Conv2d<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.conv2d(&self.weight, self.bias.as_ref(), self.stride, self.padding)
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

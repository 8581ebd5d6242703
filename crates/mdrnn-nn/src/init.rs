// Parameter initialization
//
//   uniform(shape, low, high)        U(low, high)
//   kaiming_uniform(shape)           U(-k, k), k = sqrt(1 / fan_in)
//
// Both return graph leaves with `set_variable()` already applied.

use mdrnn_core::backend::Backend;
use mdrnn_core::context::ExecutionContext;
use mdrnn_core::error::Result;
use mdrnn_core::shape::Shape;
use mdrnn_core::tensor::Tensor;

/// fan_in of a weight shape: dims[1] times the receptive field for
/// convolution kernels `[C_out, C_in, kH, kW]`, dims[1] for matrices.
pub fn fan_in(shape: &Shape) -> usize {
    let dims = shape.dims();
    match dims.len() {
        0 => 1,
        1 => dims[0],
        _ => dims[1] * dims[2..].iter().product::<usize>(),
    }
}

/// U(low, high).
pub fn uniform<B: Backend>(
    ctx: &ExecutionContext<B>,
    shape: impl Into<Shape>,
    low: f64,
    high: f64,
) -> Result<Tensor<B>> {
    Ok(ctx
        .rand(shape)?
        .affine(high - low, low)?
        .detach()
        .set_variable())
}

/// U(-k, k) with k = sqrt(1 / fan_in).
pub fn kaiming_uniform<B: Backend>(
    ctx: &ExecutionContext<B>,
    shape: impl Into<Shape>,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let k = (1.0 / fan_in(&shape).max(1) as f64).sqrt();
    uniform(ctx, shape, -k, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_in_of_kernels() {
        assert_eq!(fan_in(&Shape::from((8, 3, 2, 1))), 6);
        assert_eq!(fan_in(&Shape::from((10, 64))), 64);
        assert_eq!(fan_in(&Shape::from(5)), 5);
    }
}

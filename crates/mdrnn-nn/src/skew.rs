// Image skewing
//
// The MDLSTM cell at (r, c) depends on (r - 1, c) and (r, c - 1). Shifting
// row r right by r places every anti-diagonal of the image in one column of
// the skewed map, so a left-to-right sweep over skewed columns respects both
// dependencies and processes a whole diagonal per step:
//
//   a b c          a b c . .
//   d e f    →     . d e f .        width W + H - 1
//   g h i          . . g h i
//
// Both directions are built from narrow, pad and cat, so gradients flow
// through them.

use mdrnn_core::backend::Backend;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::shape::Shape;
use mdrnn_core::tensor::Tensor;
use mdrnn_core::SizeTwoDimensional;

/// `[N, C, H, W]` → `[N, C, H, W + H - 1]`, row `r` shifted right by `r`
/// with zeros elsewhere.
pub fn skew<B: Backend>(x: &Tensor<B>) -> Result<Tensor<B>> {
    let (_, _, height, _) = x.shape().dims4()?;
    let rows = (0..height)
        .map(|r| x.narrow(2, r, 1)?.pad(&[[r, height - 1 - r]], 0.0))
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&rows, 2)
}

/// Reassemble `[N, C, H, W]` from the per-skewed-column activations.
///
/// `columns` holds `W + H - 1` tensors shaped `[N, C, H]`, in sweep order.
/// Row `r` of the result is read from skewed columns `r .. r + W`.
pub fn unskew<B: Backend>(columns: &[Tensor<B>], height: usize, width: usize) -> Result<Tensor<B>> {
    let size = SizeTwoDimensional::new(height, width)?;
    let first = columns
        .first()
        .ok_or_else(|| Error::msg("unskew: no columns"))?;
    let (n, c, h) = first.shape().dims3()?;
    if columns.len() != size.skewed_width() || h != height {
        return Err(Error::ShapeMismatch {
            expected: Shape::from((n, c, height, size.skewed_width())),
            got: Shape::from((n, c, h, columns.len())),
        });
    }
    let skewed = Tensor::stack(columns, 3)?;
    unskew_rows(&skewed, size)
}

/// Inverse of [`skew`] on a whole skewed map `[N, C, H, W + H - 1]`.
pub fn unskew_map<B: Backend>(skewed: &Tensor<B>, height: usize, width: usize) -> Result<Tensor<B>> {
    let size = SizeTwoDimensional::new(height, width)?;
    let (n, c, h, s) = skewed.shape().dims4()?;
    if h != height || s != size.skewed_width() {
        return Err(Error::ShapeMismatch {
            expected: Shape::from((n, c, height, size.skewed_width())),
            got: skewed.shape().clone(),
        });
    }
    unskew_rows(skewed, size)
}

fn unskew_rows<B: Backend>(skewed: &Tensor<B>, size: SizeTwoDimensional) -> Result<Tensor<B>> {
    let rows = (0..size.height())
        .map(|r| skewed.narrow(2, r, 1)?.narrow(3, r, size.width()))
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&rows, 2)
}

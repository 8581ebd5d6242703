use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — how a logical shape maps onto flat storage
//
// shape + strides + offset. Narrowing moves the offset, transposing and
// permuting reorder strides, broadcasting sets strides to zero. None of them
// copy data; the backend walks the layout with `StridedIter` when it needs
// the elements in logical order.
//
// The skew/unskew and chunk/dechunk transforms are built almost entirely out
// of narrowed views, so most tensors a backend sees are non-contiguous.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Offset into the storage buffer where this tensor's data starts.
    offset: usize,
}

impl Layout {
    /// Row-major layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major with no gaps and no offset.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Swap two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// Reorder dimensions: output dim `i` is input dim `order[i]`.
    pub fn permute(&self, order: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if order.len() != rank {
            return Err(Error::msg(format!(
                "permute: expected {} dimensions, got {}",
                rank,
                order.len()
            )));
        }
        let mut seen = vec![false; rank];
        for &d in order {
            if d >= rank {
                return Err(Error::DimOutOfRange { dim: d, rank });
            }
            if seen[d] {
                return Err(Error::msg(format!("permute: duplicate dimension {}", d)));
            }
            seen[d] = true;
        }
        let dims = self.dims();
        let new_dims: Vec<usize> = order.iter().map(|&d| dims[d]).collect();
        let new_strides: Vec<usize> = order.iter().map(|&d| self.strides[d]).collect();
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// Slice `len` entries starting at `start` along `dim`.
    ///
    /// [4, 6] narrow(dim=1, start=2, len=3) → [4, 3], offset += 2 * stride[1]
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.shape.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        new_dims[dim] = len;
        let new_offset = self.offset + start * self.strides[dim];
        Ok(Layout::new(
            Shape::new(new_dims),
            self.strides.clone(),
            new_offset,
        ))
    }

    /// View this layout as the (larger) broadcast shape `target`.
    ///
    /// Size-1 dimensions and missing leading dimensions get stride 0.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        let src = self.dims();
        let dst = target.dims();
        if src.len() > dst.len() {
            return Err(Error::msg(format!(
                "cannot broadcast {} to {}",
                self.shape, target
            )));
        }
        let lead = dst.len() - src.len();
        let mut strides = vec![0usize; dst.len()];
        for (i, (&s, &stride)) in src.iter().zip(self.strides.iter()).enumerate() {
            let t = dst[lead + i];
            if s == t {
                strides[lead + i] = stride;
            } else if s != 1 {
                return Err(Error::msg(format!(
                    "cannot broadcast {} to {}",
                    self.shape, target
                )));
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// flat = offset + Σ index[i] * stride[i]
    pub fn flat_index(&self, index: &[usize]) -> usize {
        self.offset
            + index
                .iter()
                .zip(self.strides.iter())
                .map(|(&i, &s)| i * s)
                .sum::<usize>()
    }

    /// Storage indices of every element, in logical (row-major) order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    /// Storage index of `current`, kept incrementally.
    position: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            position: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    /// Advance the multi-dimensional index by one, rightmost dimension first.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.position += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.position -= self.current[i] * self.strides[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.position)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_indices() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_indices() {
        // [[0, 1, 2], [3, 4, 5]] read column-major
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let transposed = layout.transpose(0, 1).unwrap();
        assert_eq!(transposed.dims(), &[3, 2]);
        assert!(!transposed.is_contiguous());
        let indices: Vec<usize> = transposed.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_narrowed_block_indices() {
        // top-right 2x2 block of a 4x6 map
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let block = layout.narrow(0, 0, 2).unwrap().narrow(1, 4, 2).unwrap();
        assert_eq!(block.offset(), 4);
        let indices: Vec<usize> = block.strided_indices().collect();
        assert_eq!(indices, vec![4, 5, 10, 11]);
    }

    #[test]
    fn test_narrow_out_of_bounds() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        assert!(matches!(
            layout.narrow(1, 5, 3),
            Err(Error::NarrowOutOfBounds { dim: 1, .. })
        ));
    }

    #[test]
    fn test_permute_nchw_to_nhwc() {
        let layout = Layout::contiguous(Shape::from((1, 2, 2, 3)));
        let p = layout.permute(&[0, 2, 3, 1]).unwrap();
        assert_eq!(p.dims(), &[1, 2, 3, 2]);
        assert_eq!(p.strides(), &[12, 3, 1, 6]);
        assert!(layout.permute(&[0, 0, 1, 2]).is_err());
    }

    #[test]
    fn test_broadcast_row_vector() {
        let layout = Layout::contiguous(Shape::from((1, 3)));
        let b = layout.broadcast_as(&Shape::from((2, 3))).unwrap();
        let indices: Vec<usize> = b.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);
        assert!(layout.broadcast_as(&Shape::from((2, 4))).is_err());
    }

    #[test]
    fn test_flat_index() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        assert_eq!(layout.flat_index(&[1, 2, 3]), 23);
        assert_eq!(layout.flat_index(&[0, 0, 0]), 0);
    }
}

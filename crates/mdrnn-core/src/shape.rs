use std::fmt;

use crate::error::{Error, Result};

// Shape — size of each tensor dimension
//
// Feature maps in this workspace are almost always rank 4,
// [batch, channels, height, width]; state columns are rank 3,
// [batch, hidden, height]. The `dims3` / `dims4` helpers unpack those with a
// rank check so layer code can destructure shapes without indexing.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Row-major strides for this shape: [2, 3, 4] → [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Unpack a rank-3 shape.
    pub fn dims3(&self) -> Result<(usize, usize, usize)> {
        match self.0.as_slice() {
            &[a, b, c] => Ok((a, b, c)),
            _ => Err(Error::RankMismatch {
                expected: 3,
                got: self.rank(),
            }),
        }
    }

    /// Unpack a rank-4 shape.
    pub fn dims4(&self) -> Result<(usize, usize, usize, usize)> {
        match self.0.as_slice() {
            &[a, b, c, d] => Ok((a, b, c, d)),
            _ => Err(Error::RankMismatch {
                expected: 4,
                got: self.rank(),
            }),
        }
    }

    // Broadcasting

    /// NumPy-style broadcast of two shapes, aligned from the right.
    ///
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [3] and [4]          → error
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(Error::msg(format!(
                    "shapes {} and {} are not broadcast-compatible (dim {} from right: {} vs {})",
                    lhs, rhs, i, ld, rd
                )));
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Strides that let this shape be read as `target`: broadcast dimensions
    /// (size 1 here, or missing on the left) get stride 0.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let self_dims = self.dims();
        let target_dims = target.dims();
        let self_strides = self.stride_contiguous();

        let mut result = vec![0usize; target_dims.len()];
        let offset = target_dims.len() - self_dims.len();

        for i in 0..self_dims.len() {
            if self_dims[i] == target_dims[i + offset] {
                result[i + offset] = self_strides[i];
            }
        }
        result
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<(usize, usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3, d4): (usize, usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3, d4])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

use std::fmt;

use crate::error::{Error, Result};

/// An immutable (height, width) pair with both sides positive.
///
/// Used for image sizes, block sizes and the per-example entries of the
/// list chunking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeTwoDimensional {
    height: usize,
    width: usize,
}

impl SizeTwoDimensional {
    /// Fails with [`Error::InvalidSize`] when either side is zero.
    pub fn new(height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::InvalidSize { height, width });
        }
        Ok(SizeTwoDimensional { height, width })
    }

    /// The spatial size of a rank-3 `[C, H, W]` or rank-4 `[N, C, H, W]`
    /// dims slice.
    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        match dims {
            &[_, h, w] | &[_, _, h, w] => Self::new(h, w),
            _ => Err(Error::msg(format!(
                "expected a [C, H, W] or [N, C, H, W] shape, got rank {}",
                dims.len()
            ))),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn area(&self) -> usize {
        self.height * self.width
    }

    /// Width of the skewed map: every row shifted right by its row index.
    pub fn skewed_width(&self) -> usize {
        self.width + self.height - 1
    }
}

impl fmt::Display for SizeTwoDimensional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

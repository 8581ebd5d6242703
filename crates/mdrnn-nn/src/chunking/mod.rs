// Tensor chunking — feature maps to batches of blocks and back
//
// A block-wise layer runs on fixed-size tiles of its input. Chunking cuts a
// map into `block_size` tiles, stacks them along the leading axis so the
// layer sees one big batch, and dechunking stitches the layer's output back
// together. Both directions are narrow + cat only: dechunking never writes
// into a preallocated buffer, so the gradient of every output element reaches
// the block it came from.
//
// Two flavours:
//   TensorChunking      uniform [N, C, H, W] input, block-major layout
//   TensorListChunking  a list of [C, H, W] maps of different sizes,
//                       example-major layout (see `list`)

mod list;

pub use list::{ExampleBlocks, TensorListChunking};

use mdrnn_core::backend::Backend;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::shape::Shape;
use mdrnn_core::tensor::Tensor;
use mdrnn_core::SizeTwoDimensional;

/// How many blocks fit along each axis; errors when a side does not divide.
pub(crate) fn block_grid(
    original: SizeTwoDimensional,
    block: SizeTwoDimensional,
) -> Result<(usize, usize)> {
    if original.height() % block.height() != 0 {
        return Err(Error::BlockSizeMismatch {
            axis: "height",
            original: original.height(),
            block: block.height(),
        });
    }
    if original.width() % block.width() != 0 {
        return Err(Error::BlockSizeMismatch {
            axis: "width",
            original: original.width(),
            block: block.width(),
        });
    }
    Ok((
        original.height() / block.height(),
        original.width() / block.width(),
    ))
}

/// Append the blocks of `x` (`[.., C, H, W]`) to `out`, row by row.
pub(crate) fn split_blocks<B: Backend>(
    x: &Tensor<B>,
    block: SizeTwoDimensional,
    out: &mut Vec<Tensor<B>>,
) -> Result<()> {
    for row in x.split(block.height(), 2)? {
        out.extend(row.split(block.width(), 3)?);
    }
    Ok(())
}

/// Stitch `blocks_per_column × blocks_per_row` blocks (`[.., C, bh, bw]`,
/// fetched in row-major block order) into one map.
pub(crate) fn assemble_blocks<B, F>(
    blocks_per_column: usize,
    blocks_per_row: usize,
    block: F,
) -> Result<Tensor<B>>
where
    B: Backend,
    F: Fn(usize) -> Result<Tensor<B>>,
{
    let rows = (0..blocks_per_column)
        .map(|r| {
            let row = (0..blocks_per_row)
                .map(|c| block(r * blocks_per_row + c))
                .collect::<Result<Vec<_>>>()?;
            Tensor::cat(&row, 3)
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&rows, 2)
}

/// Block chunking for a uniform batch `[N, C, H, W]`.
///
/// The chunked tensor is block-major: slice `block_index * N + example`
/// holds block `block_index` (row-major over the block grid) of `example`.
///
/// ```ignore
/// let chunking = TensorChunking::new(SizeTwoDimensional::new(4, 6)?, SizeTwoDimensional::new(2, 2)?)?;
/// let blocks = chunking.chunk(&x)?;            // [6 * N, C, 2, 2]
/// let back = chunking.dechunk(&blocks)?;       // [N, C, 4, 6]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorChunking {
    original_size: SizeTwoDimensional,
    block_size: SizeTwoDimensional,
    blocks_per_column: usize,
    blocks_per_row: usize,
}

impl TensorChunking {
    /// Fails with [`Error::BlockSizeMismatch`] unless the block divides the
    /// original size exactly on both axes.
    pub fn new(original_size: SizeTwoDimensional, block_size: SizeTwoDimensional) -> Result<Self> {
        let (blocks_per_column, blocks_per_row) = block_grid(original_size, block_size)?;
        log::debug!(
            "tensor chunking {} into {} blocks of {}",
            original_size,
            blocks_per_column * blocks_per_row,
            block_size
        );
        Ok(TensorChunking {
            original_size,
            block_size,
            blocks_per_column,
            blocks_per_row,
        })
    }

    pub fn original_size(&self) -> SizeTwoDimensional {
        self.original_size
    }

    pub fn block_size(&self) -> SizeTwoDimensional {
        self.block_size
    }

    pub fn blocks_per_column(&self) -> usize {
        self.blocks_per_column
    }

    pub fn blocks_per_row(&self) -> usize {
        self.blocks_per_row
    }

    pub fn blocks_per_example(&self) -> usize {
        self.blocks_per_column * self.blocks_per_row
    }

    /// `[N, C, H, W]` → `[blocks_per_example * N, C, bh, bw]`.
    pub fn chunk<B: Backend>(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (n, c, h, w) = x.shape().dims4()?;
        if (h, w) != (self.original_size.height(), self.original_size.width()) {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((
                    n,
                    c,
                    self.original_size.height(),
                    self.original_size.width(),
                )),
                got: x.shape().clone(),
            });
        }
        let mut blocks = Vec::with_capacity(self.blocks_per_example());
        split_blocks(x, self.block_size, &mut blocks)?;
        Tensor::cat(&blocks, 0)
    }

    /// `[blocks_per_example * N, C', bh, bw]` → `[N, C', H, W]`.
    ///
    /// Only the block spatial size is fixed; the channel count may differ
    /// from what was chunked.
    pub fn dechunk<B: Backend>(&self, blocks: &Tensor<B>) -> Result<Tensor<B>> {
        let (total, c, bh, bw) = blocks.shape().dims4()?;
        if (bh, bw) != (self.block_size.height(), self.block_size.width()) {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((total, c, self.block_size.height(), self.block_size.width())),
                got: blocks.shape().clone(),
            });
        }
        let per_example = self.blocks_per_example();
        if total == 0 || total % per_example != 0 {
            return Err(Error::BlockCountMismatch {
                got: total,
                blocks_per_example: per_example,
            });
        }
        let n = total / per_example;
        let grouped = blocks.reshape((per_example, n, c, bh, bw))?;
        assemble_blocks(self.blocks_per_column, self.blocks_per_row, |i| {
            grouped.narrow(0, i, 1)?.squeeze(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdrnn_core::DType;
    use mdrnn_cpu::{CpuDevice, CpuTensor};

    fn size(h: usize, w: usize) -> SizeTwoDimensional {
        SizeTwoDimensional::new(h, w).unwrap()
    }

    fn counting(n: usize, c: usize, h: usize, w: usize) -> Result<CpuTensor> {
        let data: Vec<f64> = (1..=n * c * h * w).map(|v| v as f64).collect();
        CpuTensor::from_f64_slice(&data, (n, c, h, w), DType::F32, &CpuDevice)
    }

    #[test]
    fn test_block_major_layout() -> Result<()> {
        // two 1x2x4 examples, 1x2 blocks
        let x = counting(2, 1, 2, 4)?;
        let chunking = TensorChunking::new(size(2, 4), size(1, 2))?;
        let blocks = chunking.chunk(&x)?;
        assert_eq!(blocks.dims(), &[8, 1, 1, 2]);
        // slice block_index * N + example
        assert_eq!(blocks.narrow(0, 0, 1)?.to_f64_vec()?, vec![1.0, 2.0]);
        assert_eq!(blocks.narrow(0, 1, 1)?.to_f64_vec()?, vec![9.0, 10.0]);
        assert_eq!(blocks.narrow(0, 2, 1)?.to_f64_vec()?, vec![3.0, 4.0]);
        assert_eq!(blocks.narrow(0, 7, 1)?.to_f64_vec()?, vec![15.0, 16.0]);
        Ok(())
    }

    #[test]
    fn test_block_size_must_divide() {
        let err = TensorChunking::new(size(5, 5), size(2, 2)).unwrap_err();
        assert!(matches!(
            err,
            Error::BlockSizeMismatch {
                axis: "height",
                original: 5,
                block: 2
            }
        ));
        assert!(matches!(
            TensorChunking::new(size(4, 5), size(2, 2)),
            Err(Error::BlockSizeMismatch { axis: "width", .. })
        ));
    }

    #[test]
    fn test_dechunk_rejects_partial_batches() -> Result<()> {
        let chunking = TensorChunking::new(size(4, 4), size(2, 2))?;
        let blocks = CpuTensor::zeros((6, 1, 2, 2), DType::F32, &CpuDevice)?;
        assert!(matches!(
            chunking.dechunk(&blocks),
            Err(Error::BlockCountMismatch {
                got: 6,
                blocks_per_example: 4
            })
        ));
        let wrong_block = CpuTensor::zeros((4, 1, 2, 1), DType::F32, &CpuDevice)?;
        assert!(matches!(
            chunking.dechunk(&wrong_block),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_dechunk_with_changed_channels() -> Result<()> {
        let chunking = TensorChunking::new(size(2, 4), size(2, 2))?;
        // 2 blocks for one example, 3 channels each
        let blocks = counting(2, 3, 2, 2)?;
        let map = chunking.dechunk(&blocks)?;
        assert_eq!(map.dims(), &[1, 3, 2, 4]);
        // channel 0: block 0 channel 0 | block 1 channel 0
        assert_eq!(
            map.narrow(1, 0, 1)?.to_f64_vec()?,
            vec![1.0, 2.0, 13.0, 14.0, 3.0, 4.0, 15.0, 16.0]
        );
        Ok(())
    }
}

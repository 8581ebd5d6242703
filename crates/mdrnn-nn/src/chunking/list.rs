// TensorListChunking — block chunking for examples of different sizes
//
// Each example is a [C, H, W] map with its own H and W; all share the block
// size. The chunked tensor is example-major: the blocks of example 0 (row
// by row), then those of example 1, and so on. A table built once at
// construction records where each example's blocks start.
//
//   example   size   grid   blocks   offset
//   0         4x6    2x3    6        0
//   1         2x4    1x2    2        6

use mdrnn_core::backend::Backend;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::shape::Shape;
use mdrnn_core::tensor::Tensor;
use mdrnn_core::SizeTwoDimensional;

use super::{assemble_blocks, block_grid, split_blocks};

/// One row of the reconstruction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExampleBlocks {
    pub size: SizeTwoDimensional,
    pub blocks_per_column: usize,
    pub blocks_per_row: usize,
    pub block_count: usize,
    /// Index of the example's first block in the chunked tensor.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorListChunking {
    block_size: SizeTwoDimensional,
    table: Vec<ExampleBlocks>,
    total_blocks: usize,
}

impl TensorListChunking {
    /// Build the table for examples of the given spatial sizes.
    pub fn new(sizes: &[SizeTwoDimensional], block_size: SizeTwoDimensional) -> Result<Self> {
        let mut table = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for &size in sizes {
            let (blocks_per_column, blocks_per_row) = block_grid(size, block_size)?;
            let block_count = blocks_per_column * blocks_per_row;
            table.push(ExampleBlocks {
                size,
                blocks_per_column,
                blocks_per_row,
                block_count,
                offset,
            });
            offset += block_count;
        }
        log::debug!(
            "list chunking {} examples into {} blocks of {}",
            sizes.len(),
            offset,
            block_size
        );
        Ok(TensorListChunking {
            block_size,
            table,
            total_blocks: offset,
        })
    }

    /// Build the table from the `[C, H, W]` examples themselves.
    pub fn from_tensors<B: Backend>(
        examples: &[Tensor<B>],
        block_size: SizeTwoDimensional,
    ) -> Result<Self> {
        let sizes = examples
            .iter()
            .map(|t| {
                let (_, h, w) = t.shape().dims3()?;
                SizeTwoDimensional::new(h, w)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(&sizes, block_size)
    }

    pub fn block_size(&self) -> SizeTwoDimensional {
        self.block_size
    }

    pub fn table(&self) -> &[ExampleBlocks] {
        &self.table
    }

    pub fn num_examples(&self) -> usize {
        self.table.len()
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// `[C, H_i, W_i]` per example → `[total_blocks, C, bh, bw]`.
    pub fn chunk<B: Backend>(&self, examples: &[Tensor<B>]) -> Result<Tensor<B>> {
        if examples.len() != self.table.len() {
            return Err(Error::ExampleCountMismatch {
                expected: self.table.len(),
                got: examples.len(),
            });
        }
        let mut blocks = Vec::with_capacity(self.total_blocks);
        for (example, entry) in examples.iter().zip(&self.table) {
            let (c, h, w) = example.shape().dims3()?;
            if (h, w) != (entry.size.height(), entry.size.width()) {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from((c, entry.size.height(), entry.size.width())),
                    got: example.shape().clone(),
                });
            }
            split_blocks(&example.unsqueeze(0)?, self.block_size, &mut blocks)?;
        }
        Tensor::cat(&blocks, 0)
    }

    /// Inverse of [`chunk`](Self::chunk); the channel count may differ.
    pub fn dechunk<B: Backend>(&self, blocks: &Tensor<B>) -> Result<Vec<Tensor<B>>> {
        self.dechunk_with_block_size(blocks, self.block_size)
    }

    /// Reassemble blocks whose spatial size is `block_size` rather than the
    /// size they were chunked with, e.g. after a strided convolution that
    /// shrank every block. Example `i` comes back as
    /// `[C', blocks_per_column * bh, blocks_per_row * bw]`.
    pub fn dechunk_with_block_size<B: Backend>(
        &self,
        blocks: &Tensor<B>,
        block_size: SizeTwoDimensional,
    ) -> Result<Vec<Tensor<B>>> {
        let (_, c, _, _) = blocks.shape().dims4()?;
        let expected = Shape::from((self.total_blocks, c, block_size.height(), block_size.width()));
        if blocks.shape() != &expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: blocks.shape().clone(),
            });
        }
        self.table
            .iter()
            .map(|entry| {
                let own = blocks.narrow(0, entry.offset, entry.block_count)?;
                assemble_blocks(entry.blocks_per_column, entry.blocks_per_row, |i| {
                    own.narrow(0, i, 1)
                })?
                .squeeze(0)
            })
            .collect()
    }
}

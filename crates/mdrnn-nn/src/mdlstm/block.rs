// BlockMdlstm — MDLSTM run independently on fixed-size blocks
//
// The input map is cut into blocks, every block of every example goes
// through the directions as one batch, the direction outputs are summed and
// the blocks are stitched back into a [N, hidden, H, W] map. Recurrence
// never crosses a block border, which keeps the sweep short (bw + bh - 1
// columns) on large maps.
//
// forward_list does the same for a list of [C, H_i, W_i] examples of
// different sizes.

use std::sync::atomic::{AtomicBool, Ordering};

use mdrnn_core::backend::Backend;
use mdrnn_core::context::ExecutionContext;
use mdrnn_core::error::Result;
use mdrnn_core::tensor::Tensor;
use mdrnn_core::SizeTwoDimensional;

use super::composer::{DirectionSet, MdlstmConfig};
use crate::chunking::{TensorChunking, TensorListChunking};
use crate::module::{prefixed, Module};
use crate::tensor_utils::{sum_list_of_tensors, sum_tensor_lists_elementwise};

pub struct BlockMdlstm<B: Backend> {
    chunking: TensorChunking,
    directions: DirectionSet<B>,
    training: AtomicBool,
}

impl<B: Backend> BlockMdlstm<B> {
    /// `config.input_size` is the full map size and must be tiled exactly by
    /// `block_size`. The classifier fields of `config` are not used.
    pub fn new(
        config: &MdlstmConfig,
        block_size: SizeTwoDimensional,
        ctx: &ExecutionContext<B>,
    ) -> Result<Self> {
        let chunking = TensorChunking::new(config.input_size, block_size)?;
        let directions = DirectionSet::new(config, ctx)?;
        Ok(BlockMdlstm {
            chunking,
            directions,
            training: AtomicBool::new(true),
        })
    }

    pub fn chunking(&self) -> &TensorChunking {
        &self.chunking
    }

    pub fn direction_set(&self) -> &DirectionSet<B> {
        &self.directions
    }

    /// Run every block through all directions and sum the outputs,
    /// `[blocks, C, bh, bw]` → `[blocks, hidden, bh, bw]`.
    fn run_blocks(&self, blocks: &Tensor<B>) -> Result<Tensor<B>> {
        sum_list_of_tensors(&self.directions.forward_directions(blocks)?)
    }

    /// `[C, H_i, W_i]` examples → `[hidden, H_i, W_i]` each. Every size must
    /// be a multiple of the block size.
    pub fn forward_list(&self, examples: &[Tensor<B>]) -> Result<Vec<Tensor<B>>> {
        let chunking = TensorListChunking::from_tensors(examples, self.chunking.block_size())?;
        let blocks = chunking.chunk(examples)?;
        let per_direction = self
            .directions
            .forward_directions(&blocks)?
            .iter()
            .map(|out| chunking.dechunk(out))
            .collect::<Result<Vec<_>>>()?;
        sum_tensor_lists_elementwise(&per_direction)
    }
}

impl<B: Backend> Module<B> for BlockMdlstm<B> {
    /// `[N, C, H, W]` → `[N, hidden, H, W]`.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let blocks = self.chunking.chunk(x)?;
        let out = self.run_blocks(&blocks)?;
        self.chunking.dechunk(&out)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.directions.parameters()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        prefixed("mdlstm", self.directions.named_parameters())
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
        self.directions.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }
}

//! # mdrnn-nn
//!
//! Multi-dimensional LSTM layers for 2-D inputs, and the pieces they are
//! built from:
//!
//! 1. **Module trait** — every layer implements `forward()` and lists its
//!    parameters
//! 2. **Linear / Conv2d / Dropout** — the building-block layers
//! 3. **skew / unskew** — turn the 2-D recurrence into a sweep over columns
//! 4. **TensorChunking / TensorListChunking** — cut maps into blocks that
//!    batch together, and stitch them back
//! 5. **MdlstmParameters / MdlstmEngine** — gate kernels and recurrence of
//!    one scan direction
//! 6. **MultiDimensionalLstm / BlockMdlstm** — four-direction classifier and
//!    block-wise layer
//! 7. **clip_grad_norm** — global gradient-norm clipping
//!
//! Modules are generic over `Backend`, so the same layer runs on whichever
//! backend its `ExecutionContext` names.

pub mod chunking;
pub mod clip;
pub mod conv;
pub mod dropout;
pub mod init;
pub mod linear;
pub mod mdlstm;
pub mod module;
pub mod skew;
pub mod tensor_utils;

pub use chunking::{ExampleBlocks, TensorChunking, TensorListChunking};
pub use clip::{clip_grad_norm, grad_norm, ClipOutcome, DEFAULT_MAX_GRAD_NORM};
pub use conv::Conv2d;
pub use dropout::Dropout;
pub use linear::Linear;
pub use mdlstm::{
    BlockMdlstm, DirectionMode, DirectionSet, MdlstmConfig, MdlstmEngine, MdlstmParameters,
    MultiDimensionalLstm, OutputGating, Parallelism, ScanDirection,
};
pub use module::Module;
pub use skew::{skew, unskew, unskew_map};
pub use tensor_utils::{
    count_non_zeros, count_zeros, sum_list_of_tensors, sum_tensor_lists_elementwise,
    tensor_lists_equal, tensors_equal,
};

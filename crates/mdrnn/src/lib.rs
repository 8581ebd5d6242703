//! # mdrnn
//!
//! Multi-dimensional recurrent networks for 2-D data.
//!
//! This is the facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```ignore
//! use mdrnn::prelude::*;
//!
//! let ctx = ExecutionContext::<CpuBackend>::new(CpuDevice, DType::F32)?;
//! let config = MdlstmConfig::new(1, 8, SizeTwoDimensional::new(28, 28)?);
//! let model = MultiDimensionalLstm::new(config, &ctx)?;
//! let scores = model.forward(&images)?; // [batch, 10]
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `mdrnn-core` | Tensor, Shape, DType, Layout, Backend trait, autograd, SizeTwoDimensional |
//! | `mdrnn-cpu` | CPU backend with rayon-parallel kernels |
//! | `mdrnn-nn` | Skewing, chunking, MDLSTM layers, Linear, Conv2d, Dropout, clipping |

/// Re-export core types.
pub use mdrnn_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp},
    op::{Op, TensorId},
    DType, Error, ExecutionContext, GradStore, Layout, Result, Shape, SizeTwoDimensional, Tensor,
    WithDType,
};

/// Re-export CPU backend.
pub use mdrnn_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export layers, chunking and the MDLSTM.
pub mod nn {
    pub use mdrnn_nn::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::nn::{
        clip_grad_norm, grad_norm, skew, unskew, unskew_map, BlockMdlstm, ClipOutcome, Conv2d,
        DirectionMode, Dropout, Linear, MdlstmConfig, MdlstmEngine, MdlstmParameters, Module,
        MultiDimensionalLstm, OutputGating, Parallelism, ScanDirection, TensorChunking,
        TensorListChunking,
    };
    pub use crate::{
        CpuBackend, CpuDevice, CpuTensor, DType, ExecutionContext, GradStore, Result, Shape,
        SizeTwoDimensional, Tensor,
    };
}

//! # mdrnn-core
//!
//! Tensor primitives, backend traits and reverse-mode autograd for the
//! multi-dimensional recurrent layers in `mdrnn-nn`.
//!
//! - [`Tensor`]: n-dimensional array that records the ops producing it
//! - [`Shape`] / [`Layout`]: dims, strides and offsets of strided views
//! - [`DType`]: element types (F32, F64, U8, I64)
//! - [`Backend`]: the seam between graph bookkeeping and arithmetic
//! - [`GradStore`]: what `backward()` returns
//! - [`SizeTwoDimensional`]: validated (height, width) pairs
//! - [`ExecutionContext`]: the device and dtype a model computes in

pub mod backend;
pub mod backprop;
pub mod context;
mod conv;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod op;
pub mod shape;
pub mod size;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage};
pub use backprop::GradStore;
pub use context::ExecutionContext;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use op::{Op, TensorId};
pub use shape::Shape;
pub use size::SizeTwoDimensional;
pub use tensor::Tensor;

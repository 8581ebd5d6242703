// Op — autograd graph node
//
// Every tensor produced by a differentiable operation records the op and
// holds its input tensors (Arc handles, cheap to clone). The graph therefore
// keeps exactly the tensors backward needs alive and nothing else. It is a
// DAG, so dropping the loss drops the whole graph.
//
// One MDLSTM forward pass over a W-column image records on the order of a few
// hundred nodes per skewed column: slices of the precomputed input responses,
// the state-mixing convolutions, the gate nonlinearities and the memory
// update. backward() walks them in reverse topological order.

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Next id from a global atomic counter.
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Records the operation that produced a tensor, with its inputs.
#[derive(Clone)]
pub enum Op<B: Backend> {
    /// Leaf: input data or trainable parameter.
    None,

    Binary {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
        op: BinaryOp,
    },

    Unary {
        input: Tensor<B>,
        op: UnaryOp,
    },

    /// `dims` empty means a full reduction to a scalar.
    Reduce {
        input: Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    Matmul {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
    },

    /// Same elements in the same order, different shape
    /// (reshape, squeeze, unsqueeze).
    Reshape {
        input: Tensor<B>,
        src_shape: Shape,
    },

    Transpose {
        input: Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    /// Output dim `i` is input dim `order[i]`.
    Permute {
        input: Tensor<B>,
        order: Vec<usize>,
    },

    Narrow {
        input: Tensor<B>,
        dim: usize,
        start: usize,
        len: usize,
    },

    /// result = input * mul + add
    Affine {
        input: Tensor<B>,
        mul: f64,
        add: f64,
    },

    Contiguous {
        input: Tensor<B>,
    },

    /// input: [N, C_in, H, W], weight: [C_out, C_in, kH, kW], bias: [C_out]
    Conv2d {
        input: Tensor<B>,
        weight: Tensor<B>,
        bias: Option<Tensor<B>>,
        stride: [usize; 2],
        padding: [usize; 2],
    },

    /// `sizes` holds each input's extent along `dim`, so backward can narrow
    /// the gradient back into per-input pieces.
    Cat {
        inputs: Vec<Tensor<B>>,
        dim: usize,
        sizes: Vec<usize>,
    },

    /// The mask is not differentiated.
    WhereCond {
        mask: Tensor<B>,
        on_true: Tensor<B>,
        on_false: Tensor<B>,
    },

    /// `padding[d] = [before, after]` for every dimension.
    Pad {
        input: Tensor<B>,
        padding: Vec<[usize; 2]>,
    },

    IndexSelect {
        input: Tensor<B>,
        indices: Tensor<B>,
        dim: usize,
    },

    ToDtype {
        input: Tensor<B>,
        src_dtype: DType,
    },
}

impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({:?}, {:?}, {:?})", op, lhs.id(), rhs.id())
            }
            Op::Unary { input, op } => write!(f, "Unary({:?}, {:?})", op, input.id()),
            Op::Reduce {
                input, op, dims, ..
            } => write!(f, "Reduce({:?}, dims={:?}, {:?})", op, dims, input.id()),
            Op::Matmul { lhs, rhs } => write!(f, "Matmul({:?}, {:?})", lhs.id(), rhs.id()),
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape(from {}, {:?})", src_shape, input.id())
            }
            Op::Transpose { input, dim0, dim1 } => {
                write!(f, "Transpose({}, {}, {:?})", dim0, dim1, input.id())
            }
            Op::Permute { input, order } => write!(f, "Permute({:?}, {:?})", order, input.id()),
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => write!(
                f,
                "Narrow(dim={}, {}..{}, {:?})",
                dim,
                start,
                start + len,
                input.id()
            ),
            Op::Affine { input, mul, add } => {
                write!(f, "Affine(*{} +{}, {:?})", mul, add, input.id())
            }
            Op::Contiguous { input } => write!(f, "Contiguous({:?})", input.id()),
            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
            } => write!(
                f,
                "Conv2d(in={:?}, w={:?}, bias={}, s={:?}, p={:?})",
                input.id(),
                weight.id(),
                bias.is_some(),
                stride,
                padding
            ),
            Op::Cat { inputs, dim, .. } => {
                let ids: Vec<_> = inputs.iter().map(|t| t.id()).collect();
                write!(f, "Cat(dim={}, {:?})", dim, ids)
            }
            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => write!(
                f,
                "WhereCond(mask={:?}, {:?}, {:?})",
                mask.id(),
                on_true.id(),
                on_false.id()
            ),
            Op::Pad { input, padding } => write!(f, "Pad({:?}, {:?})", padding, input.id()),
            Op::IndexSelect {
                input,
                indices,
                dim,
            } => write!(
                f,
                "IndexSelect(dim={}, {:?}, idx={:?})",
                dim,
                input.id(),
                indices.id()
            ),
            Op::ToDtype { input, src_dtype } => {
                write!(f, "ToDtype(from={}, {:?})", src_dtype, input.id())
            }
        }
    }
}

impl<B: Backend> Op<B> {
    /// The tensors this op read. Used by the topological sort in backward().
    pub fn inputs(&self) -> Vec<&Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Permute { input, .. }
            | Op::Narrow { input, .. }
            | Op::Affine { input, .. }
            | Op::Contiguous { input }
            | Op::Pad { input, .. }
            | Op::ToDtype { input, .. } => vec![input],
            Op::Conv2d {
                input,
                weight,
                bias,
                ..
            } => {
                let mut v = vec![input, weight];
                v.extend(bias.iter());
                v
            }
            Op::Cat { inputs, .. } => inputs.iter().collect(),
            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => vec![mask, on_true, on_false],
            Op::IndexSelect { input, indices, .. } => vec![input, indices],
        }
    }

    /// Short name of the op, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "leaf",
            Op::Binary { .. } => "binary",
            Op::Unary { .. } => "unary",
            Op::Reduce { .. } => "reduce",
            Op::Matmul { .. } => "matmul",
            Op::Reshape { .. } => "reshape",
            Op::Transpose { .. } => "transpose",
            Op::Permute { .. } => "permute",
            Op::Narrow { .. } => "narrow",
            Op::Affine { .. } => "affine",
            Op::Contiguous { .. } => "contiguous",
            Op::Conv2d { .. } => "conv2d",
            Op::Cat { .. } => "cat",
            Op::WhereCond { .. } => "where_cond",
            Op::Pad { .. } => "pad",
            Op::IndexSelect { .. } => "index_select",
            Op::ToDtype { .. } => "to_dtype",
        }
    }
}

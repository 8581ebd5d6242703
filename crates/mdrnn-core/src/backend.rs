use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — the compute device abstraction
//
// Every tensor operation in mdrnn-core validates shapes, records the autograd
// op, and then hands (storage, layout) pairs to a Backend for the arithmetic.
// A backend never sees autograd and never mutates its inputs: every method
// returns fresh storage.
//
// Tensor<B: Backend> is generic over the backend, so the MDLSTM layers in
// mdrnn-nn are written once and run on whichever backend the caller's
// ExecutionContext names.

/// Identifies a compute device.
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device (e.g., "cpu").
    fn name(&self) -> String;
}

/// A storage buffer that holds tensor data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Operation enums. They parameterize the backend kernels and are recorded in
// the autograd graph so backward knows which derivative to apply.

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Sqrt,
    Square,
    Relu,
    Sigmoid,
    Tanh,
}

/// Reduction operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// Comparison operations (produce U8 tensors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
}

/// The main Backend trait. Implementing it for a struct makes that struct a
/// complete compute backend.
///
/// All operations take storage + layout and return new storage.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    //  Creation

    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Normal values (mean 0, std 1).
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    //  Element-wise

    /// result[i] = op(lhs[i], rhs[i]), broadcasting both sides to `out_shape`.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
        out_shape: &Shape,
    ) -> Result<Self::Storage>;

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// result = input * mul + add.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    /// Element-wise comparison with broadcasting, returns U8 storage (0 or 1).
    fn cmp_op(
        op: CmpOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
        out_shape: &Shape,
    ) -> Result<Self::Storage>;

    /// result[i] = if mask[i] != 0 { on_true[i] } else { on_false[i] }.
    /// All three layouts have the same shape.
    fn where_cond(
        mask: &Self::Storage,
        mask_layout: &Layout,
        on_true: &Self::Storage,
        on_true_layout: &Layout,
        on_false: &Self::Storage,
        on_false_layout: &Layout,
    ) -> Result<Self::Storage>;

    //  Reductions

    /// Reduce along `dims`; an empty slice reduces everything to one element.
    /// The result is laid out as the input shape with the reduced dims
    /// removed (the caller re-inserts size-1 dims for keep_dim).
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
    ) -> Result<Self::Storage>;

    //  Linear algebra

    /// C = A @ B over the last two dims. Leading (batch) dims must match.
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    //  Data movement

    /// Contiguous copy following the given layout.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy the elements to the host as f64, in logical order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    /// Select entries along `dim` using a 1-D integer index storage.
    fn index_select(
        input: &Self::Storage,
        input_layout: &Layout,
        indices: &Self::Storage,
        indices_layout: &Layout,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Concatenate along `dim` into one contiguous storage.
    /// `out_shape` is the pre-validated output shape.
    fn cat(
        inputs: &[(&Self::Storage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Cast storage to a different dtype.
    ///
    /// The default goes through the host; backends may override it.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout)?;
        Self::from_f64_slice(&data, dtype, device)
    }
}

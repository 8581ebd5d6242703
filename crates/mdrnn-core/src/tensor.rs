use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::backend::{Backend, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use crate::conv::{gemm, ConvGeometry};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor — n-dimensional array with reverse-mode autograd
//
// A Tensor<B> is a cheap handle (Arc) to:
//   - storage on B's device, shared between views behind Arc<RwLock<..>>
//   - a Layout (shape + strides + offset) saying how to read that storage
//   - the Op that produced it, holding its inputs, for backward()
//
// Views (narrow, transpose, permute, unsqueeze) share storage and only swap
// the layout. Everything else allocates fresh storage; no operation writes
// into a tensor another tensor can see, except `update_data_inplace`, which
// exists for optimizers stepping parameters between forward passes.

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    /// How this tensor was computed; `Op::None` for leaves.
    op: Op<B>,
    /// Trainable parameter flag. Gradients are computed for every tensor in
    /// the graph, this only marks which ones an optimizer should step.
    is_variable: bool,
}

/// An n-dimensional array of numbers on a specific backend.
///
/// # Example
/// ```ignore
/// use mdrnn_core::{DType, Tensor};
/// use mdrnn_cpu::{CpuBackend, CpuDevice};
///
/// let a = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &CpuDevice)?;
/// let b = Tensor::<CpuBackend>::ones((2, 2), DType::F32, &CpuDevice)?;
/// let c = a.add(&b)?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// Fresh tensor computed on this tensor's device and dtype.
    fn derived(&self, storage: B::Storage, shape: Shape, op: Op<B>) -> Self {
        Self::from_storage(
            storage,
            Layout::contiguous(shape),
            self.inner.dtype,
            self.inner.device.clone(),
            op,
        )
    }

    /// View sharing this tensor's storage under a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    /// Same id, storage and graph position, different variable flag.
    fn with_variable_flag(&self, is_variable: bool) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable,
            }),
        }
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// Shortcut for `shape().dims()`.
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    /// Read access to the underlying storage (shared with any views).
    pub fn storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // In-place mutation

    /// Overwrite this tensor's elements.
    ///
    /// Every handle sharing the storage (clones held by a module, for
    /// instance) sees the new values. Element count must match; the shape is
    /// unchanged.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected,
                got: new_data.len(),
            });
        }
        if !self.is_contiguous() {
            return Err(Error::msg("update_data_inplace: tensor is a strided view"));
        }
        let new_storage = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        let mut guard = self
            .inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))?;
        *guard = new_storage;
        Ok(())
    }

    // Creation

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Create a tensor from row-major f64 values, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Normal values, mean 0 and std 1.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape(), other.dtype(), other.device())
    }

    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape(), other.dtype(), other.device())
    }

    pub fn full_like(other: &Self, val: f64) -> Result<Self> {
        Self::full(other.shape(), val, other.dtype(), other.device())
    }

    /// Mark this tensor as a trainable parameter.
    pub fn set_variable(self) -> Self {
        self.with_variable_flag(true)
    }

    /// Same data, fresh id, cut from the graph.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }

    // Views (no data copy)

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Transpose of a matrix.
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Reorder dimensions: `permute(&[0, 2, 3, 1])` turns NCHW into NHWC.
    pub fn permute(&self, order: &[usize]) -> Result<Self> {
        let new_layout = self.inner.layout.permute(order)?;
        let op = Op::Permute {
            input: self.clone(),
            order: order.to_vec(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Slice `len` entries starting at `start` along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let new_layout = self.inner.layout.narrow(dim, start, len)?;
        let op = Op::Narrow {
            input: self.clone(),
            dim,
            start,
            len,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Reinterpret the elements (in row-major order) under a new shape.
    /// Non-contiguous tensors are copied first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ReshapeElementMismatch {
                src: current_count,
                dst: new_count,
                dst_shape: new_shape,
            });
        }
        let tensor = self.contiguous()?;
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape: tensor.shape().clone(),
        };
        Ok(tensor.view_with_layout(Layout::contiguous(new_shape), op))
    }

    /// Copy into row-major storage, unless already contiguous.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let new_storage = B::to_contiguous(&*self.storage()?, &self.inner.layout)?;
        Ok(self.derived(
            new_storage,
            self.shape().clone(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    /// Insert a size-1 dimension at `dim`: unsqueeze(0) on [3, 4] → [1, 3, 4].
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim,
                rank: rank + 1,
            });
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        // never stepped along, any value works
        let stride_val = if dim < rank { new_strides[dim] } else { 1 };
        new_dims.insert(dim, 1);
        new_strides.insert(dim, stride_val);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Remove the size-1 dimension `dim`.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        if self.dims()[dim] != 1 {
            return Err(Error::msg(format!(
                "squeeze: dimension {} has size {}, expected 1",
                dim,
                self.dims()[dim]
            )));
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        new_dims.remove(dim);
        new_strides.remove(dim);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Collapse dims `start_dim..=end_dim` into one.
    pub fn flatten(&self, start_dim: usize, end_dim: usize) -> Result<Self> {
        let rank = self.rank();
        if start_dim >= rank || end_dim >= rank || start_dim > end_dim {
            return Err(Error::msg(format!(
                "flatten: invalid range [{}, {}] for rank {}",
                start_dim, end_dim, rank
            )));
        }
        let dims = self.dims();
        let mut new_dims: Vec<usize> = dims[..start_dim].to_vec();
        new_dims.push(dims[start_dim..=end_dim].iter().product());
        new_dims.extend_from_slice(&dims[end_dim + 1..]);
        self.reshape(new_dims)
    }

    // Arithmetic (broadcasting)

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let result = B::binary_op(
            op,
            &*self.storage()?,
            &self.inner.layout,
            &*rhs.storage()?,
            &rhs.inner.layout,
            &out_shape,
        )?;
        let result_op = Op::Binary {
            lhs: self.clone(),
            rhs: rhs.clone(),
            op,
        };
        Ok(self.derived(result, out_shape, result_op))
    }

    // Comparisons (U8 results, not differentiable)

    pub fn gt(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Gt)
    }

    pub fn ge(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Ge)
    }

    pub fn lt(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Lt)
    }

    fn cmp_op(&self, rhs: &Self, op: CmpOp) -> Result<Self> {
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let result = B::cmp_op(
            op,
            &*self.storage()?,
            &self.inner.layout,
            &*rhs.storage()?,
            &rhs.inner.layout,
            &out_shape,
        )?;
        Ok(Self::from_storage(
            result,
            Layout::contiguous(out_shape),
            DType::U8,
            self.inner.device.clone(),
            Op::None,
        ))
    }

    // Unary

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Abs)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    /// 1 / (1 + e^(-x))
    pub fn sigmoid(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Tanh)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let result = B::unary_op(op, &*self.storage()?, &self.inner.layout)?;
        let result_op = Op::Unary {
            input: self.clone(),
            op,
        };
        Ok(self.derived(result, self.shape().clone(), result_op))
    }

    /// result[i] = self[i] * mul + add
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let result = B::affine(&*self.storage()?, &self.inner.layout, mul, add)?;
        let result_op = Op::Affine {
            input: self.clone(),
            mul,
            add,
        };
        Ok(self.derived(result, self.shape().clone(), result_op))
    }

    /// `result[i] = if mask[i] != 0 { on_true[i] } else { on_false[i] }`.
    ///
    /// All three tensors must have the same shape.
    pub fn where_cond(mask: &Self, on_true: &Self, on_false: &Self) -> Result<Self> {
        for t in [mask, on_false] {
            if t.shape() != on_true.shape() {
                return Err(Error::ShapeMismatch {
                    expected: on_true.shape().clone(),
                    got: t.shape().clone(),
                });
            }
        }
        if on_true.dtype() != on_false.dtype() {
            return Err(Error::DTypeMismatch {
                expected: on_true.dtype(),
                got: on_false.dtype(),
            });
        }
        let result = B::where_cond(
            &*mask.storage()?,
            &mask.inner.layout,
            &*on_true.storage()?,
            &on_true.inner.layout,
            &*on_false.storage()?,
            &on_false.inner.layout,
        )?;
        let result_op = Op::WhereCond {
            mask: mask.clone(),
            on_true: on_true.clone(),
            on_false: on_false.clone(),
        };
        Ok(on_true.derived(result, on_true.shape().clone(), result_op))
    }

    /// Pad the trailing dimensions with the constant `value`.
    ///
    /// `padding` holds `[before, after]` pairs for the last `padding.len()`
    /// dimensions: on a `[N, C, H]` column, `pad(&[[1, 0]], 0.0)` adds one
    /// zero row on top.
    pub fn pad(&self, padding: &[[usize; 2]], value: f64) -> Result<Self> {
        let rank = self.rank();
        if padding.len() > rank {
            return Err(Error::msg(format!(
                "pad: {} padding pairs but tensor rank is {}",
                padding.len(),
                rank
            )));
        }
        let mut full_pad = vec![[0usize; 2]; rank];
        full_pad[rank - padding.len()..].copy_from_slice(padding);
        if full_pad.iter().all(|&[b, a]| b == 0 && a == 0) {
            return Ok(self.clone());
        }

        // Built from a detached copy so only the Pad node lands in the graph.
        let mut current = self.detach();
        for (d, &[before, after]) in full_pad.iter().enumerate().rev() {
            if before == 0 && after == 0 {
                continue;
            }
            let mut parts = Vec::with_capacity(3);
            let mut side_dims = current.dims().to_vec();
            if before > 0 {
                side_dims[d] = before;
                parts.push(Self::full(
                    side_dims.clone(),
                    value,
                    self.dtype(),
                    self.device(),
                )?);
            }
            parts.push(current);
            if after > 0 {
                side_dims[d] = after;
                parts.push(Self::full(side_dims, value, self.dtype(), self.device())?);
            }
            current = Self::cat(&parts, d)?;
        }

        let storage = current.storage()?.clone();
        let op = Op::Pad {
            input: self.clone(),
            padding: full_pad,
        };
        Ok(self.derived(storage, current.shape().clone(), op))
    }

    // Reductions

    /// Sum of every element, as a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        let result = B::reduce_op(op, &*self.storage()?, &self.inner.layout, dims)?;

        let result_shape = if dims.is_empty() {
            Shape::from(())
        } else {
            let kept = self.dims().iter().enumerate().filter_map(|(i, &d)| {
                if !dims.contains(&i) {
                    Some(d)
                } else if keep_dim {
                    Some(1)
                } else {
                    None
                }
            });
            Shape::new(kept.collect())
        };

        let result_op = Op::Reduce {
            input: self.clone(),
            op,
            dims: dims.to_vec(),
            keep_dim,
        };
        Ok(self.derived(result, result_shape, result_op))
    }

    // Joining and splitting

    /// Concatenate along `dim`. All other dims must agree.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = match tensors {
            [] => return Err(Error::msg("cat: empty tensor list")),
            [only] => return Ok(only.clone()),
            [first, ..] => first,
        };
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }

        for t in &tensors[1..] {
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            let compatible = t.rank() == rank
                && (0..rank).all(|d| d == dim || t.dims()[d] == first.dims()[d]);
            if !compatible {
                let mut expected = first.dims().to_vec();
                if t.rank() == rank {
                    expected[dim] = t.dims()[dim];
                }
                return Err(Error::ShapeMismatch {
                    expected: Shape::new(expected),
                    got: t.shape().clone(),
                });
            }
        }

        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[dim]).collect();
        let mut out_dims = first.dims().to_vec();
        out_dims[dim] = sizes.iter().sum();
        let out_shape = Shape::new(out_dims);

        let guards = tensors
            .iter()
            .map(|t| t.storage())
            .collect::<Result<Vec<_>>>()?;
        let pairs: Vec<(&B::Storage, &Layout)> = guards
            .iter()
            .zip(tensors)
            .map(|(g, t)| (&**g, &t.inner.layout))
            .collect();
        let storage = B::cat(&pairs, &out_shape, dim)?;

        let op = Op::Cat {
            inputs: tensors.to_vec(),
            dim,
            sizes,
        };
        Ok(first.derived(storage, out_shape, op))
    }

    /// Join equal-shaped tensors along a new dimension `dim`.
    pub fn stack(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("stack: empty tensor list"))?;
        for t in &tensors[1..] {
            if t.shape() != first.shape() {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().clone(),
                    got: t.shape().clone(),
                });
            }
        }
        let unsqueezed = tensors
            .iter()
            .map(|t| t.unsqueeze(dim))
            .collect::<Result<Vec<_>>>()?;
        Self::cat(&unsqueezed, dim)
    }

    /// Views of `split_size` entries along `dim`; the last may be shorter.
    pub fn split(&self, split_size: usize, dim: usize) -> Result<Vec<Self>> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        if split_size == 0 {
            return Err(Error::msg("split: split_size must be > 0"));
        }
        let dim_size = self.dims()[dim];
        (0..dim_size)
            .step_by(split_size)
            .map(|start| self.narrow(dim, start, split_size.min(dim_size - start)))
            .collect()
    }

    /// `n` roughly equal views along `dim`.
    pub fn chunk(&self, n: usize, dim: usize) -> Result<Vec<Self>> {
        if n == 0 {
            return Err(Error::msg("chunk: n must be > 0"));
        }
        let dim_size = self.shape().dim(dim)?;
        self.split(dim_size.div_ceil(n).max(1), dim)
    }

    /// Select entries along `dim` with a 1-D integer index tensor.
    pub fn index_select(&self, dim: usize, indices: &Self) -> Result<Self> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        if indices.rank() != 1 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: indices.rank(),
            });
        }
        let storage = B::index_select(
            &*self.storage()?,
            &self.inner.layout,
            &*indices.storage()?,
            &indices.inner.layout,
            dim,
        )?;
        let mut out_dims = self.dims().to_vec();
        out_dims[dim] = indices.elem_count();
        let op = Op::IndexSelect {
            input: self.clone(),
            indices: indices.clone(),
            dim,
        };
        Ok(self.derived(storage, Shape::new(out_dims), op))
    }

    /// Reverse the order of entries along `dim`.
    pub fn flip(&self, dim: usize) -> Result<Self> {
        let n = self.shape().dim(dim)?;
        let reversed: Vec<f64> = (0..n).rev().map(|i| i as f64).collect();
        let indices = Self::from_f64_slice(&reversed, n, DType::I64, self.device())?;
        self.index_select(dim, &indices)
    }

    // Linear algebra

    /// Matrix product over the last two dims.
    ///
    /// - [m, k] @ [k, n] → [m, n]
    /// - [b, m, k] @ [b, k, n] → [b, m, n]
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        if self.rank() < 2 || self.rank() != rhs.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank().max(2),
                got: rhs.rank(),
            });
        }
        let rank = self.rank();
        let (lhs_dims, rhs_dims) = (self.dims(), rhs.dims());
        let (m, k1) = (lhs_dims[rank - 2], lhs_dims[rank - 1]);
        let (k2, n) = (rhs_dims[rank - 2], rhs_dims[rank - 1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        if lhs_dims[..rank - 2] != rhs_dims[..rank - 2] {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: rhs.shape().clone(),
            });
        }

        let result = B::matmul(
            &*self.storage()?,
            &self.inner.layout,
            &*rhs.storage()?,
            &rhs.inner.layout,
        )?;
        let mut result_dims = lhs_dims[..rank - 2].to_vec();
        result_dims.extend_from_slice(&[m, n]);
        let op = Op::Matmul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        Ok(self.derived(result, Shape::new(result_dims), op))
    }

    /// 2-D convolution.
    ///
    /// - `self`:   `[N, C_in, H, W]`
    /// - `weight`: `[C_out, C_in, kH, kW]`
    /// - `bias`:   optional `[C_out]`
    ///
    /// Output is `[N, C_out, H_out, W_out]` with
    /// `H_out = (H + 2*pH - kH) / sH + 1`.
    pub fn conv2d(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        let (n, c_in, h, w) = self.shape().dims4()?;
        let (c_out, wc_in, kh, kw) = weight.shape().dims4()?;
        if c_in != wc_in {
            return Err(Error::ChannelMismatch {
                expected: wc_in,
                got: c_in,
            });
        }
        if let Some(b) = bias {
            if b.dims() != [c_out] {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(c_out),
                    got: b.shape().clone(),
                });
            }
        }
        let geom = ConvGeometry::new((c_in, h, w), (kh, kw), stride, padding)
            .ok_or_else(|| Error::msg("conv2d: kernel larger than padded input"))?;

        let input_data = self.to_f64_vec()?;
        let weight_data = weight.to_f64_vec()?;
        let bias_data = bias.map(|b| b.to_f64_vec()).transpose()?;

        let (rows, cols) = (geom.col_rows(), geom.col_cols());
        let sample = geom.sample_size();
        let mut output = vec![0.0f64; n * c_out * cols];
        let mut columns = vec![0.0f64; rows * cols];

        for (ni, out) in output.chunks_mut(c_out * cols).enumerate() {
            geom.im2col(&input_data[ni * sample..(ni + 1) * sample], &mut columns);
            gemm(&weight_data, &columns, out, c_out, cols, rows);
            if let Some(bd) = &bias_data {
                for (row, &b) in out.chunks_mut(cols).zip(bd) {
                    row.iter_mut().for_each(|v| *v += b);
                }
            }
        }

        let storage = B::from_f64_slice(&output, self.dtype(), self.device())?;
        let op = Op::Conv2d {
            input: self.clone(),
            weight: weight.clone(),
            bias: bias.cloned(),
            stride,
            padding,
        };
        Ok(self.derived(
            storage,
            Shape::new(vec![n, c_out, geom.h_out, geom.w_out]),
            op,
        ))
    }

    // Data extraction

    /// All elements in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        B::to_f64_vec(&*self.storage()?, &self.inner.layout)
    }

    /// The value of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    /// Cast to another dtype. Gradients are cast back in backward().
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let storage = B::cast(&*self.storage()?, &self.inner.layout, dtype, self.device())?;
        let op = Op::ToDtype {
            input: self.clone(),
            src_dtype: self.dtype(),
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            dtype,
            self.device().clone(),
            op,
        ))
    }

    // Autograd

    /// Reverse-mode gradients of this scalar with respect to every tensor in
    /// its graph.
    ///
    /// ```ignore
    /// let a = Tensor::from_f64_slice(&[2.0], 1, DType::F64, &dev)?.set_variable();
    /// let b = Tensor::from_f64_slice(&[3.0], 1, DType::F64, &dev)?.set_variable();
    /// let grads = a.mul(&b)?.sum_all()?.backward()?;
    /// // grad_a = 3.0, grad_b = 2.0
    /// ```
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }
}

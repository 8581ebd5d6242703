//! # mdrnn-cpu
//!
//! Host backend for mdrnn. Storage is a plain `Vec<T>` per dtype; kernels in
//! [`ops`] read through layouts, so strided views never need an eager copy.
//!
//! ```ignore
//! use mdrnn_cpu::{CpuDevice, CpuTensor};
//! use mdrnn_core::DType;
//!
//! let x = CpuTensor::zeros((2, 3, 4, 6), DType::F32, &CpuDevice)?;
//! ```

mod ops;

use std::fmt;

use rand::Rng;
use rand_distr::StandardNormal;

use mdrnn_core::backend::{
    Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp,
};
use mdrnn_core::dtype::DType;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::layout::Layout;
use mdrnn_core::shape::Shape;
use mdrnn_core::{Tensor, WithDType};

/// The host. There is only one, so the device carries no state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Host memory, one variant per supported dtype.
#[derive(Clone, PartialEq)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    I64(Vec<i64>),
}

impl fmt::Debug for CpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuStorage::{}(len={})", self.dtype(), self.len())
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

/// Apply a generic kernel to whichever variant `$storage` holds and wrap the
/// result in the same variant.
macro_rules! map_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            CpuStorage::F32($v) => CpuStorage::F32($body),
            CpuStorage::F64($v) => CpuStorage::F64($body),
            CpuStorage::U8($v) => CpuStorage::U8($body),
            CpuStorage::I64($v) => CpuStorage::I64($body),
        }
    };
}

/// Same as `map_storage!` for two operands that must share a dtype.
macro_rules! zip_storage {
    ($lhs:expr, $rhs:expr, ($a:ident, $b:ident) => $body:expr) => {
        match ($lhs, $rhs) {
            (CpuStorage::F32($a), CpuStorage::F32($b)) => CpuStorage::F32($body),
            (CpuStorage::F64($a), CpuStorage::F64($b)) => CpuStorage::F64($body),
            (CpuStorage::U8($a), CpuStorage::U8($b)) => CpuStorage::U8($body),
            (CpuStorage::I64($a), CpuStorage::I64($b)) => CpuStorage::I64($body),
            (l, r) => {
                return Err(Error::DTypeMismatch {
                    expected: l.dtype(),
                    got: r.dtype(),
                })
            }
        }
    };
}

impl CpuStorage {
    fn from_fn(dtype: DType, n: usize, mut f: impl FnMut() -> f64) -> Self {
        fn build<T: WithDType>(n: usize, f: &mut impl FnMut() -> f64) -> Vec<T> {
            (0..n).map(|_| T::from_f64(f())).collect()
        }
        match dtype {
            DType::F32 => CpuStorage::F32(build(n, &mut f)),
            DType::F64 => CpuStorage::F64(build(n, &mut f)),
            DType::U8 => CpuStorage::U8(build(n, &mut f)),
            DType::I64 => CpuStorage::I64(build(n, &mut f)),
        }
    }

    fn to_f64_vec(&self, layout: &Layout) -> Vec<f64> {
        fn convert<T: WithDType>(data: &[T], layout: &Layout) -> Vec<f64> {
            ops::gather(data, layout)
                .into_iter()
                .map(WithDType::to_f64)
                .collect()
        }
        match self {
            CpuStorage::F32(v) => convert(v, layout),
            CpuStorage::F64(v) => convert(v, layout),
            CpuStorage::U8(v) => convert(v, layout),
            CpuStorage::I64(v) => convert(v, layout),
        }
    }

    /// Borrow the elements as f32, if that is the dtype.
    pub fn as_f32_slice(&self) -> Result<&[f32]> {
        match self {
            CpuStorage::F32(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    /// Borrow the elements as f64, if that is the dtype.
    pub fn as_f64_slice(&self) -> Result<&[f64]> {
        match self {
            CpuStorage::F64(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F64,
                got: other.dtype(),
            }),
        }
    }
}

/// The host backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// A tensor living in host memory.
pub type CpuTensor = Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_fn(dtype, shape.elem_count(), || 0.0))
    }

    fn ones(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_fn(dtype, shape.elem_count(), || 1.0))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_fn(dtype, shape.elem_count(), || val))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut values = data.iter().copied();
        Ok(CpuStorage::from_fn(dtype, data.len(), || {
            values.next().unwrap_or_default()
        }))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        match dtype {
            DType::F32 => Ok(CpuStorage::F32((0..n).map(|_| rng.gen::<f32>()).collect())),
            DType::F64 => Ok(CpuStorage::F64((0..n).map(|_| rng.gen::<f64>()).collect())),
            _ => Err(Error::msg(format!(
                "rand_uniform not supported for {:?}",
                dtype
            ))),
        }
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        match dtype {
            DType::F32 => Ok(CpuStorage::F32(
                (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect(),
            )),
            DType::F64 => Ok(CpuStorage::F64(
                (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect(),
            )),
            _ => Err(Error::msg(format!(
                "rand_normal not supported for {:?}",
                dtype
            ))),
        }
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
        out_shape: &Shape,
    ) -> Result<CpuStorage> {
        Ok(zip_storage!(lhs, rhs, (a, b) => {
            ops::binary(op, a, lhs_layout, b, rhs_layout, out_shape)?
        }))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(map_storage!(input, v => ops::unary(op, v, layout)))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        Ok(map_storage!(input, v => ops::affine(v, layout, mul, add)))
    }

    fn cmp_op(
        op: CmpOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
        out_shape: &Shape,
    ) -> Result<CpuStorage> {
        let out = match (lhs, rhs) {
            (CpuStorage::F32(a), CpuStorage::F32(b)) => {
                ops::compare(op, a, lhs_layout, b, rhs_layout, out_shape)?
            }
            (CpuStorage::F64(a), CpuStorage::F64(b)) => {
                ops::compare(op, a, lhs_layout, b, rhs_layout, out_shape)?
            }
            (CpuStorage::U8(a), CpuStorage::U8(b)) => {
                ops::compare(op, a, lhs_layout, b, rhs_layout, out_shape)?
            }
            (CpuStorage::I64(a), CpuStorage::I64(b)) => {
                ops::compare(op, a, lhs_layout, b, rhs_layout, out_shape)?
            }
            (l, r) => {
                return Err(Error::DTypeMismatch {
                    expected: l.dtype(),
                    got: r.dtype(),
                })
            }
        };
        Ok(CpuStorage::U8(out))
    }

    fn where_cond(
        mask: &CpuStorage,
        mask_layout: &Layout,
        on_true: &CpuStorage,
        on_true_layout: &Layout,
        on_false: &CpuStorage,
        on_false_layout: &Layout,
    ) -> Result<CpuStorage> {
        let mask = mask.to_f64_vec(mask_layout);
        Ok(zip_storage!(on_true, on_false, (t, f) => {
            ops::select(&mask, t, on_true_layout, f, on_false_layout)
        }))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
    ) -> Result<CpuStorage> {
        Ok(map_storage!(input, v => ops::reduce(op, v, layout, dims)))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        Ok(zip_storage!(lhs, rhs, (a, b) => {
            ops::matmul(a, lhs_layout, b, rhs_layout)?
        }))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(map_storage!(input, v => ops::gather(v, layout)))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(input.to_f64_vec(layout))
    }

    fn index_select(
        input: &CpuStorage,
        input_layout: &Layout,
        indices: &CpuStorage,
        indices_layout: &Layout,
        dim: usize,
    ) -> Result<CpuStorage> {
        let indices = indices.to_f64_vec(indices_layout);
        Ok(map_storage!(input, v => {
            ops::index_select(v, input_layout, &indices, dim)?
        }))
    }

    fn cat(inputs: &[(&CpuStorage, &Layout)], out_shape: &Shape, dim: usize) -> Result<CpuStorage> {
        macro_rules! cat_as {
            ($variant:ident) => {{
                let parts = inputs
                    .iter()
                    .map(|(s, l)| match s {
                        CpuStorage::$variant(v) => Ok((v.as_slice(), *l)),
                        other => Err(Error::DTypeMismatch {
                            expected: DType::$variant,
                            got: other.dtype(),
                        }),
                    })
                    .collect::<Result<Vec<_>>>()?;
                CpuStorage::$variant(ops::cat(&parts, out_shape, dim))
            }};
        }
        let first = inputs
            .first()
            .ok_or_else(|| Error::msg("cat: empty input list"))?;
        Ok(match first.0.dtype() {
            DType::F32 => cat_as!(F32),
            DType::F64 => cat_as!(F64),
            DType::U8 => cat_as!(U8),
            DType::I64 => cat_as!(I64),
        })
    }
}

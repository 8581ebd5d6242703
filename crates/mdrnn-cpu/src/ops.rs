// Host kernels, generic over the element type
//
// Every kernel first reads its inputs in logical order through the layout
// (`gather`), so strided views from narrow/transpose/broadcast need no
// special cases. Arithmetic runs in f64 and rounds back to T once per
// element. Large element-wise maps fan out over rayon.

use rayon::prelude::*;

use mdrnn_core::backend::{BinaryOp, CmpOp, ReduceOp, UnaryOp};
use mdrnn_core::error::{Error, Result};
use mdrnn_core::layout::Layout;
use mdrnn_core::shape::Shape;
use mdrnn_core::WithDType;

/// Element count above which element-wise maps run on the rayon pool.
pub(crate) const PARALLEL_THRESHOLD: usize = 1 << 14;

/// Elements of `data` in the logical order of `layout`.
pub(crate) fn gather<T: WithDType>(data: &[T], layout: &Layout) -> Vec<T> {
    if layout.is_contiguous() {
        return data[..layout.elem_count()].to_vec();
    }
    layout.strided_indices().map(|i| data[i]).collect()
}

fn map_f64<T, F>(src: &[T], f: F) -> Vec<T>
where
    T: WithDType,
    F: Fn(f64) -> f64 + Sync + Send,
{
    if src.len() >= PARALLEL_THRESHOLD {
        src.par_iter().map(|&v| T::from_f64(f(v.to_f64()))).collect()
    } else {
        src.iter().map(|&v| T::from_f64(f(v.to_f64()))).collect()
    }
}

fn zip_f64<T, U, F>(lhs: &[T], rhs: &[T], f: F) -> Vec<U>
where
    T: WithDType,
    U: WithDType,
    F: Fn(f64, f64) -> f64 + Sync + Send,
{
    if lhs.len() >= PARALLEL_THRESHOLD {
        lhs.par_iter()
            .zip(rhs.par_iter())
            .map(|(&a, &b)| U::from_f64(f(a.to_f64(), b.to_f64())))
            .collect()
    } else {
        lhs.iter()
            .zip(rhs)
            .map(|(&a, &b)| U::from_f64(f(a.to_f64(), b.to_f64())))
            .collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub(crate) fn unary<T: WithDType>(op: UnaryOp, data: &[T], layout: &Layout) -> Vec<T> {
    let src = gather(data, layout);
    match op {
        UnaryOp::Neg => map_f64(&src, |x| -x),
        UnaryOp::Abs => map_f64(&src, f64::abs),
        UnaryOp::Exp => map_f64(&src, f64::exp),
        UnaryOp::Sqrt => map_f64(&src, f64::sqrt),
        UnaryOp::Square => map_f64(&src, |x| x * x),
        UnaryOp::Relu => map_f64(&src, |x| x.max(0.0)),
        UnaryOp::Sigmoid => map_f64(&src, sigmoid),
        UnaryOp::Tanh => map_f64(&src, f64::tanh),
    }
}

pub(crate) fn affine<T: WithDType>(data: &[T], layout: &Layout, mul: f64, add: f64) -> Vec<T> {
    map_f64(&gather(data, layout), |x| x * mul + add)
}

pub(crate) fn binary<T: WithDType>(
    op: BinaryOp,
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
    out_shape: &Shape,
) -> Result<Vec<T>> {
    let l = gather(lhs, &lhs_layout.broadcast_as(out_shape)?);
    let r = gather(rhs, &rhs_layout.broadcast_as(out_shape)?);
    Ok(match op {
        BinaryOp::Add => zip_f64(&l, &r, |a, b| a + b),
        BinaryOp::Sub => zip_f64(&l, &r, |a, b| a - b),
        BinaryOp::Mul => zip_f64(&l, &r, |a, b| a * b),
        BinaryOp::Div => zip_f64(&l, &r, |a, b| a / b),
    })
}

pub(crate) fn compare<T: WithDType>(
    op: CmpOp,
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
    out_shape: &Shape,
) -> Result<Vec<u8>> {
    let l = gather(lhs, &lhs_layout.broadcast_as(out_shape)?);
    let r = gather(rhs, &rhs_layout.broadcast_as(out_shape)?);
    let test: fn(f64, f64) -> bool = match op {
        CmpOp::Gt => |a, b| a > b,
        CmpOp::Ge => |a, b| a >= b,
        CmpOp::Lt => |a, b| a < b,
    };
    Ok(zip_f64(&l, &r, move |a, b| if test(a, b) { 1.0 } else { 0.0 }))
}

pub(crate) fn select<T: WithDType>(
    mask: &[f64],
    on_true: &[T],
    on_true_layout: &Layout,
    on_false: &[T],
    on_false_layout: &Layout,
) -> Vec<T> {
    let t = gather(on_true, on_true_layout);
    let f = gather(on_false, on_false_layout);
    mask.iter()
        .zip(t.into_iter().zip(f))
        .map(|(&m, (a, b))| if m != 0.0 { a } else { b })
        .collect()
}

/// Sum or mean over `dims` (everything when empty), reduced dims dropped.
pub(crate) fn reduce<T: WithDType>(
    op: ReduceOp,
    data: &[T],
    layout: &Layout,
    dims: &[usize],
) -> Vec<T> {
    let in_dims = layout.dims();
    let reduced = |d: usize| dims.is_empty() || dims.contains(&d);

    // Output position of each input element: reduced dims get stride 0.
    let mut out_strides = vec![0usize; in_dims.len()];
    let mut acc_stride = 1usize;
    for d in (0..in_dims.len()).rev() {
        if !reduced(d) {
            out_strides[d] = acc_stride;
            acc_stride *= in_dims[d];
        }
    }
    let out_len = acc_stride;
    let count = (layout.elem_count() / out_len.max(1)).max(1);

    let src = gather(data, layout);
    let target = Layout::new(layout.shape().clone(), out_strides, 0);
    let mut acc = vec![0.0f64; out_len];
    for (pos, v) in target.strided_indices().zip(&src) {
        acc[pos] += WithDType::to_f64(*v);
    }
    let scale = match op {
        ReduceOp::Sum => 1.0,
        ReduceOp::Mean => 1.0 / count as f64,
    };
    acc.into_iter().map(|v| T::from_f64(v * scale)).collect()
}

/// Batched `[.., m, k] @ [.., k, n]`.
pub(crate) fn matmul<T: WithDType>(
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
) -> Result<Vec<T>> {
    let ld = lhs_layout.dims();
    let rd = rhs_layout.dims();
    let rank = ld.len();
    if rank < 2 || rd.len() != rank {
        return Err(Error::RankMismatch {
            expected: rank.max(2),
            got: rd.len(),
        });
    }
    let (m, k) = (ld[rank - 2], ld[rank - 1]);
    let n = rd[rank - 1];
    if rd[rank - 2] != k {
        return Err(Error::MatmulShapeMismatch {
            m,
            k1: k,
            k2: rd[rank - 2],
            n,
        });
    }

    let a: Vec<f64> = gather(lhs, lhs_layout).iter().map(|&v| WithDType::to_f64(v)).collect();
    let b: Vec<f64> = gather(rhs, rhs_layout).iter().map(|&v| WithDType::to_f64(v)).collect();
    let batch: usize = ld[..rank - 2].iter().product();
    if m * n == 0 {
        return Ok(Vec::new());
    }
    let mut out = vec![0.0f64; batch * m * n];

    let kernel = |(bi, c): (usize, &mut [f64])| {
        let a = &a[bi * m * k..(bi + 1) * m * k];
        let b = &b[bi * k * n..(bi + 1) * k * n];
        for i in 0..m {
            for p in 0..k {
                let av = a[i * k + p];
                for (cv, &bv) in c[i * n..(i + 1) * n].iter_mut().zip(&b[p * n..(p + 1) * n]) {
                    *cv += av * bv;
                }
            }
        }
    };
    if out.len() * k >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(m * n).enumerate().for_each(kernel);
    } else {
        out.chunks_mut(m * n).enumerate().for_each(kernel);
    }
    Ok(out.into_iter().map(T::from_f64).collect())
}

pub(crate) fn index_select<T: WithDType>(
    data: &[T],
    layout: &Layout,
    indices: &[f64],
    dim: usize,
) -> Result<Vec<T>> {
    let dims = layout.dims();
    let src_len = dims[dim];
    let outer: usize = dims[..dim].iter().product();
    let inner: usize = dims[dim + 1..].iter().product();
    let src = gather(data, layout);

    let mut out = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &idx in indices {
            let i = idx as usize;
            if idx < 0.0 || i >= src_len {
                return Err(Error::msg(format!(
                    "index_select: index {} out of range for dimension of size {}",
                    idx, src_len
                )));
            }
            let start = (o * src_len + i) * inner;
            out.extend_from_slice(&src[start..start + inner]);
        }
    }
    Ok(out)
}

pub(crate) fn cat<T: WithDType>(
    inputs: &[(&[T], &Layout)],
    out_shape: &Shape,
    dim: usize,
) -> Vec<T> {
    let out_dims = out_shape.dims();
    let outer: usize = out_dims[..dim].iter().product();
    let inner: usize = out_dims[dim + 1..].iter().product();
    let parts: Vec<(Vec<T>, usize)> = inputs
        .iter()
        .map(|(data, layout)| (gather(data, layout), layout.dims()[dim] * inner))
        .collect();

    let mut out = Vec::with_capacity(out_shape.elem_count());
    for o in 0..outer {
        for (part, row) in &parts {
            out.extend_from_slice(&part[o * row..(o + 1) * row]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_middle_dim() {
        // [2, 3, 2] summed over dim 1
        let data: Vec<f64> = (0..12).map(|v| v as f64).collect();
        let layout = Layout::contiguous(Shape::from((2, 3, 2)));
        let out = reduce(ReduceOp::Sum, &data, &layout, &[1]);
        assert_eq!(out, vec![6.0, 9.0, 24.0, 27.0]);
        let mean = reduce(ReduceOp::Mean, &data, &layout, &[]);
        assert_eq!(mean, vec![5.5]);
    }

    #[test]
    fn test_reduce_and_matmul_on_f32_and_i64() -> Result<()> {
        let data: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert_eq!(reduce(ReduceOp::Sum, &data, &layout, &[0]), vec![3.0f32, 5.0, 7.0]);

        let ints: Vec<i64> = vec![1, 2, 3, 4];
        let square = Layout::contiguous(Shape::from((2, 2)));
        assert_eq!(reduce(ReduceOp::Mean, &ints, &square, &[]), vec![2i64]);
        assert_eq!(matmul(&ints, &square, &ints, &square)?, vec![7i64, 10, 15, 22]);

        let lhs = [1.0f32, 2.0, 3.0, 4.0];
        let rhs = [5.0f32, 6.0, 7.0, 8.0];
        assert_eq!(matmul(&lhs, &square, &rhs, &square)?, vec![19.0f32, 22.0, 43.0, 50.0]);
        Ok(())
    }

    #[test]
    fn test_cat_rows_of_blocks() {
        // two [2, 1] columns side by side
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        let la = Layout::contiguous(Shape::from((2, 1)));
        let lb = la.clone();
        let out = cat(&[(&a[..], &la), (&b[..], &lb)], &Shape::from((2, 2)), 1);
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_sigmoid_is_stable() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(-800.0) >= 0.0);
        assert!((sigmoid(800.0) - 1.0).abs() < 1e-12);
    }
}

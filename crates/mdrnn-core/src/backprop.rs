// Backpropagation — reverse-mode automatic differentiation
//
// backward() sorts the graph below a scalar root so that every tensor comes
// after its inputs, seeds grad(root) = 1 and walks the order in reverse,
// applying one chain-rule step per Op and summing contributions when a tensor
// feeds several ops.
//
// Gradient rules:
//
//   Add / Sub:    grad_a += g,      grad_b += ±g        (summed over broadcast dims)
//   Mul:          grad_a += g * b,  grad_b += g * a
//   Div:          grad_a += g / b,  grad_b += -g * a / b²
//   Sigmoid:      grad_x += g * s * (1 - s)
//   Tanh:         grad_x += g * (1 - t²)
//   Sum / Mean:   grad_x += broadcast(g) (scaled by 1/n for Mean)
//   Matmul:       grad_A += g @ Bᵀ,  grad_B += Aᵀ @ g
//   Narrow:       grad_x += zero-pad(g) back to the input extent
//   Pad:          grad_x += narrow(g) to the unpadded region
//   Cat:          grad_i += narrow(g) to input i's slice
//   Conv2d:       weight via im2col, input via col2im, bias via sums
//
// The MDLSTM recurrence produces long chains (one link per skewed column), so
// the topological sort is iterative.

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::conv::{gemm_a_bt, gemm_at_b, ConvGeometry};
use crate::error::{Error, Result};
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Gradients of one backward pass, keyed by tensor id.
///
/// Every tensor in the graph gets an entry, inputs included, so a caller can
/// ask for the gradient of a plain data tensor as well as a parameter.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Gradient of `tensor`, if any flowed to it.
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    pub fn get_by_id(&self, id: &TensorId) -> Option<&Tensor<B>> {
        self.grads.get(id)
    }

    /// Replace the gradient stored for `tensor` (used by gradient clipping).
    pub fn insert(&mut self, tensor: &Tensor<B>, grad: Tensor<B>) {
        self.grads.insert(tensor.id(), grad);
    }

    /// Add `grad` to whatever is already stored for `id`.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        let summed = match self.grads.get(&id) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.grads.insert(id, summed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

/// Tensors reachable from `root`, every one after all of its inputs.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    let mut visited: HashSet<TensorId> = HashSet::new();
    let mut order = Vec::new();
    // (tensor, inputs already pushed)
    let mut stack: Vec<(Tensor<B>, bool)> = vec![(root.clone(), false)];

    while let Some((t, expanded)) = stack.pop() {
        if expanded {
            order.push(t);
            continue;
        }
        if !visited.insert(t.id()) {
            continue;
        }
        let inputs: Vec<Tensor<B>> = t.op().inputs().into_iter().cloned().collect();
        stack.push((t, true));
        for input in inputs.into_iter().rev() {
            if !visited.contains(&input.id()) {
                stack.push((input, false));
            }
        }
    }
    order
}

/// Gradients of the scalar `root` with respect to every tensor below it.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(Error::NotAScalar {
            shape: root.shape().clone(),
        });
    }

    let topo = build_topo(root);
    log::trace!("backward: {} nodes", topo.len());

    let mut grads = GradStore::new();
    grads.grads.insert(root.id(), Tensor::ones_like(root)?);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_by_id(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => grads.accumulate(input.id(), grad_output)?,

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?
            }

            Op::Unary { input, op } => compute_unary_grad(*op, &grad_output, input, &mut grads)?,

            Op::Reduce {
                input, op, dims, ..
            } => compute_reduce_grad(*op, &grad_output, input, dims, &mut grads)?,

            Op::Matmul { lhs, rhs } => {
                let rank = lhs.rank();
                let grad_lhs = grad_output.matmul(&rhs.transpose(rank - 2, rank - 1)?)?;
                let grad_rhs = lhs.transpose(rank - 2, rank - 1)?.matmul(&grad_output)?;
                grads.accumulate(lhs.id(), grad_lhs)?;
                grads.accumulate(rhs.id(), grad_rhs)?;
            }

            Op::Reshape { input, src_shape } => {
                grads.accumulate(input.id(), grad_output.reshape(src_shape)?)?
            }

            Op::Transpose { input, dim0, dim1 } => {
                grads.accumulate(input.id(), grad_output.transpose(*dim0, *dim1)?)?
            }

            Op::Permute { input, order } => {
                let mut inverse = vec![0usize; order.len()];
                for (i, &d) in order.iter().enumerate() {
                    inverse[d] = i;
                }
                grads.accumulate(input.id(), grad_output.permute(&inverse)?)?
            }

            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => {
                let mut padding = vec![[0usize; 2]; input.rank()];
                padding[*dim] = [*start, input.dims()[*dim] - start - len];
                grads.accumulate(input.id(), grad_output.pad(&padding, 0.0)?)?
            }

            Op::Pad { input, padding } => {
                let mut grad = grad_output.clone();
                for (d, &[before, _]) in padding.iter().enumerate() {
                    grad = grad.narrow(d, before, input.dims()[d])?;
                }
                grads.accumulate(input.id(), grad)?
            }

            Op::Affine { input, mul, .. } => {
                grads.accumulate(input.id(), grad_output.affine(*mul, 0.0)?)?
            }

            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
            } => compute_conv2d_grad(
                &grad_output,
                input,
                weight,
                bias.as_ref(),
                *stride,
                *padding,
                &mut grads,
            )?,

            Op::Cat { inputs, dim, sizes } => {
                let mut offset = 0usize;
                for (inp, &size) in inputs.iter().zip(sizes) {
                    grads.accumulate(inp.id(), grad_output.narrow(*dim, offset, size)?)?;
                    offset += size;
                }
            }

            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => {
                let zeros = Tensor::zeros_like(&grad_output)?;
                let grad_true = Tensor::where_cond(mask, &grad_output, &zeros)?;
                let grad_false = Tensor::where_cond(mask, &zeros, &grad_output)?;
                grads.accumulate(on_true.id(), grad_true)?;
                grads.accumulate(on_false.id(), grad_false)?;
            }

            Op::IndexSelect {
                input,
                indices,
                dim,
            } => compute_index_select_grad(&grad_output, input, indices, *dim, &mut grads)?,

            Op::ToDtype { input, src_dtype } => {
                grads.accumulate(input.id(), grad_output.to_dtype(*src_dtype)?)?
            }
        }
    }

    Ok(grads)
}

fn compute_binary_grad<B: Backend>(
    op: BinaryOp,
    grad_output: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let (raw_lhs, raw_rhs) = match op {
        BinaryOp::Add => (grad_output.clone(), grad_output.clone()),
        BinaryOp::Sub => (grad_output.clone(), grad_output.neg()?),
        BinaryOp::Mul => (grad_output.mul(rhs)?, grad_output.mul(lhs)?),
        BinaryOp::Div => {
            let b_sq = rhs.square()?;
            (
                grad_output.div(rhs)?,
                grad_output.neg()?.mul(lhs)?.div(&b_sq)?,
            )
        }
    };
    grads.accumulate(lhs.id(), reduce_broadcast_grad(&raw_lhs, lhs.shape())?)?;
    grads.accumulate(rhs.id(), reduce_broadcast_grad(&raw_rhs, rhs.shape())?)?;
    Ok(())
}

/// Sum `grad` over the dimensions broadcasting added to reach `target`.
///
/// A `[1, 4]` operand broadcast to `[3, 4]` gets its gradient summed over
/// dim 0; a `[4]` operand additionally loses the leading dim.
fn reduce_broadcast_grad<B: Backend>(grad: &Tensor<B>, target: &Shape) -> Result<Tensor<B>> {
    let grad_dims = grad.dims();
    let target_dims = target.dims();
    if grad_dims == target_dims {
        return Ok(grad.clone());
    }

    let lead = grad_dims.len() - target_dims.len();
    let mut result = grad.clone();
    for d in (0..grad_dims.len()).rev() {
        let target_size = if d < lead { 1 } else { target_dims[d - lead] };
        if target_size == 1 && grad_dims[d] != 1 {
            result = result.sum(d, true)?;
        }
    }
    result.reshape(target)
}

fn compute_unary_grad<B: Backend>(
    op: UnaryOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let grad_input = match op {
        UnaryOp::Neg => grad_output.neg()?,

        // sign(x), zero at zero
        UnaryOp::Abs => {
            let zeros = Tensor::zeros_like(input)?;
            let positive = input.gt(&zeros)?.to_dtype(input.dtype())?;
            let negative = input.lt(&zeros)?.to_dtype(input.dtype())?;
            grad_output.mul(&positive.sub(&negative)?)?
        }

        UnaryOp::Exp => grad_output.mul(&input.exp()?)?,

        // 1 / (2 * sqrt(x))
        UnaryOp::Sqrt => grad_output.div(&input.sqrt()?.affine(2.0, 0.0)?)?,

        UnaryOp::Square => grad_output.mul(&input.affine(2.0, 0.0)?)?,

        UnaryOp::Relu => {
            let mask = input.gt(&Tensor::zeros_like(input)?)?;
            Tensor::where_cond(&mask, grad_output, &Tensor::zeros_like(grad_output)?)?
        }

        UnaryOp::Sigmoid => {
            let s = input.sigmoid()?;
            grad_output.mul(&s.mul(&s.affine(-1.0, 1.0)?)?)?
        }

        UnaryOp::Tanh => {
            let t = input.tanh()?;
            grad_output.mul(&t.square()?.affine(-1.0, 1.0)?)?
        }
    };
    grads.accumulate(input.id(), grad_input)
}

fn compute_reduce_grad<B: Backend>(
    op: ReduceOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    grads: &mut GradStore<B>,
) -> Result<()> {
    // reduced dims become 1 so the gradient broadcasts back over them
    let kept: Vec<usize> = input
        .dims()
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if dims.is_empty() || dims.contains(&i) {
                1
            } else {
                d
            }
        })
        .collect();
    let reduced_count = input.elem_count() / kept.iter().product::<usize>().max(1);

    let grad = grad_output.reshape(kept)?;
    let grad = match op {
        ReduceOp::Sum => grad,
        ReduceOp::Mean => grad.affine(1.0 / reduced_count.max(1) as f64, 0.0)?,
    };
    let expanded = Tensor::zeros_like(input)?.add(&grad)?;
    grads.accumulate(input.id(), expanded)
}

/// grad_weight[co] = Σ_n grad_out[n, co] × columns(input[n])ᵀ
/// grad_input[n]   = col2im(weightᵀ × grad_out[n])
/// grad_bias[co]   = Σ_{n, oh, ow} grad_out[n, co, oh, ow]
fn compute_conv2d_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    weight: &Tensor<B>,
    bias: Option<&Tensor<B>>,
    stride: [usize; 2],
    padding: [usize; 2],
    grads: &mut GradStore<B>,
) -> Result<()> {
    let (n_batch, c_in, h, w) = input.shape().dims4()?;
    let (c_out, _, kh, kw) = weight.shape().dims4()?;
    let geom = ConvGeometry::new((c_in, h, w), (kh, kw), stride, padding)
        .ok_or_else(|| Error::msg("conv2d backward: kernel larger than padded input"))?;

    let input_data = input.to_f64_vec()?;
    let weight_data = weight.to_f64_vec()?;
    let grad_out_data = grad_output.to_f64_vec()?;

    let (rows, cols) = (geom.col_rows(), geom.col_cols());
    let sample = geom.sample_size();
    let out_sample = c_out * cols;

    let mut grad_w = vec![0.0f64; c_out * rows];
    let mut grad_in = vec![0.0f64; n_batch * sample];
    let mut columns = vec![0.0f64; rows * cols];

    for ni in 0..n_batch {
        let go = &grad_out_data[ni * out_sample..(ni + 1) * out_sample];

        geom.im2col(&input_data[ni * sample..(ni + 1) * sample], &mut columns);
        gemm_a_bt(go, &columns, &mut grad_w, c_out, rows, cols);

        columns.iter_mut().for_each(|v| *v = 0.0);
        gemm_at_b(&weight_data, go, &mut columns, rows, cols, c_out);
        geom.col2im(&columns, &mut grad_in[ni * sample..(ni + 1) * sample]);
    }

    let grad_weight = Tensor::from_f64_slice(
        &grad_w,
        weight.shape(),
        weight.dtype(),
        weight.device(),
    )?;
    grads.accumulate(weight.id(), grad_weight)?;

    let grad_input =
        Tensor::from_f64_slice(&grad_in, input.shape(), input.dtype(), input.device())?;
    grads.accumulate(input.id(), grad_input)?;

    if let Some(b) = bias {
        let mut grad_b = vec![0.0f64; c_out];
        for sample_grad in grad_out_data.chunks(out_sample) {
            for (acc, channel) in grad_b.iter_mut().zip(sample_grad.chunks(cols)) {
                *acc += channel.iter().sum::<f64>();
            }
        }
        let grad_bias = Tensor::from_f64_slice(&grad_b, b.shape(), b.dtype(), b.device())?;
        grads.accumulate(b.id(), grad_bias)?;
    }
    Ok(())
}

/// Scatter-add the gradient back to the selected positions.
fn compute_index_select_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    indices: &Tensor<B>,
    dim: usize,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let in_dims = input.dims();
    let outer: usize = in_dims[..dim].iter().product();
    let inner: usize = in_dims[dim + 1..].iter().product();
    let src_len = in_dims[dim];
    let idx = indices.to_f64_vec()?;
    let go = grad_output.to_f64_vec()?;

    let mut grad_in = vec![0.0f64; input.elem_count()];
    for o in 0..outer {
        for (j, &src) in idx.iter().enumerate() {
            let src = src as usize;
            let from = (o * idx.len() + j) * inner;
            let to = (o * src_len + src) * inner;
            for k in 0..inner {
                grad_in[to + k] += go[from + k];
            }
        }
    }
    let grad = Tensor::from_f64_slice(&grad_in, input.shape(), input.dtype(), input.device())?;
    grads.accumulate(input.id(), grad)
}

// Tensor utilities — comparisons, counts and list sums
//
// Small helpers used by the block layer (summing per-direction outputs) and
// by tests checking reconstruction and sparsity.

use mdrnn_core::backend::Backend;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::tensor::Tensor;

/// Exact equality: same shape and every element equal.
pub fn tensors_equal<B: Backend>(a: &Tensor<B>, b: &Tensor<B>) -> Result<bool> {
    if a.shape() != b.shape() {
        return Ok(false);
    }
    Ok(a.to_f64_vec()? == b.to_f64_vec()?)
}

/// Pairwise [`tensors_equal`] over two lists of the same length.
pub fn tensor_lists_equal<B: Backend>(a: &[Tensor<B>], b: &[Tensor<B>]) -> Result<bool> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        if !tensors_equal(x, y)? {
            log::debug!("tensor lists differ at index {i}: {} vs {}", x.shape(), y.shape());
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn count_zeros<B: Backend>(t: &Tensor<B>) -> Result<usize> {
    Ok(t.to_f64_vec()?.iter().filter(|&&v| v == 0.0).count())
}

pub fn count_non_zeros<B: Backend>(t: &Tensor<B>) -> Result<usize> {
    Ok(t.elem_count() - count_zeros(t)?)
}

/// Sum of a non-empty list of same-shape tensors, recorded in the graph.
pub fn sum_list_of_tensors<B: Backend>(tensors: &[Tensor<B>]) -> Result<Tensor<B>> {
    let (first, rest) = tensors
        .split_first()
        .ok_or_else(|| Error::msg("sum_list_of_tensors: empty list"))?;
    rest.iter().try_fold(first.clone(), |acc, t| acc.add(t))
}

/// Element-wise sum of equally long tensor lists: entry `i` of the result
/// is the sum of entry `i` of every list.
pub fn sum_tensor_lists_elementwise<B: Backend>(lists: &[Vec<Tensor<B>>]) -> Result<Vec<Tensor<B>>> {
    let first = lists
        .first()
        .ok_or_else(|| Error::msg("sum_tensor_lists_elementwise: no lists"))?;
    if let Some(bad) = lists.iter().find(|l| l.len() != first.len()) {
        return Err(Error::msg(format!(
            "sum_tensor_lists_elementwise: list lengths differ ({} vs {})",
            first.len(),
            bad.len()
        )));
    }
    (0..first.len())
        .map(|i| {
            let column: Vec<Tensor<B>> = lists.iter().map(|l| l[i].clone()).collect();
            sum_list_of_tensors(&column)
        })
        .collect()
}

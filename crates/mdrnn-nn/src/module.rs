// Module trait — the interface every layer implements
//
// forward() maps one input tensor to one output tensor; parameters() lists
// the trainable tensors so an external optimizer can step them. Layers are
// generic over B: Backend, so the same MDLSTM definition runs on whichever
// backend its ExecutionContext names.

use mdrnn_core::backend::Backend;
use mdrnn_core::error::Result;
use mdrnn_core::tensor::Tensor;

/// A layer with trainable parameters and a train/eval switch.
///
/// # Example
/// ```ignore
/// struct Head<B: Backend> {
///     linear: Linear<B>,
/// }
///
/// impl<B: Backend> Module<B> for Head<B> {
///     fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
///         self.linear.forward(x)?.relu()
///     }
///     fn parameters(&self) -> Vec<Tensor<B>> {
///         self.linear.parameters()
///     }
/// }
/// ```
pub trait Module<B: Backend> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// All trainable tensors, in a stable order.
    fn parameters(&self) -> Vec<Tensor<B>>;

    /// Switch between training and evaluation behaviour.
    ///
    /// Takes `&self`: modules with mode-dependent behaviour (dropout) keep
    /// the flag behind an atomic. Default is a no-op.
    fn set_training(&self, _training: bool) {}

    fn is_training(&self) -> bool {
        true
    }

    fn train(&self) {
        self.set_training(true);
    }

    fn eval(&self) {
        self.set_training(false);
    }

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Parameters with dotted names, e.g. `directions.0.input_gate_input.weight`.
    ///
    /// Leaf layers name their own tensors (`weight`, `bias`); composite
    /// layers prefix their children's names. The default falls back to
    /// positional names.
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("param_{i}"), p))
            .collect()
    }
}

/// Prefix every name in `named` with `prefix.`.
pub(crate) fn prefixed<B: Backend>(
    prefix: &str,
    named: Vec<(String, Tensor<B>)>,
) -> Vec<(String, Tensor<B>)> {
    named
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t))
        .collect()
}

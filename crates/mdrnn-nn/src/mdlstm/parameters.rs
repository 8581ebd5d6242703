// MdlstmParameters — the gate kernels of one scan direction
//
// Five gates read the skewed input through 1×1 convolutions with bias:
//
//   input, input_gate, forget_gate_one, forget_gate_two, output_gate
//
// Each gate also sees the previous hidden column through a 2×1 kernel over
// the column and its one-row-shifted copy (`*_hidden`). Peephole kernels
// read the memory column:
//
//   input_gate_memory        2×1   m and shift(m)
//   forget_gate_one_memory   1×1   m
//   forget_gate_two_memory   1×1   shift(m)
//   output_gate_memory       1×1   the new memory column, optionally dropped out
//
// KERNEL SHAPES (hidden = H, input channels = C):
//   *_input:   weight [H, C, 1, 1], bias [H]
//   *_hidden:  weight [H, H, 2, 1]
//   memory:    weight [H, H, 2, 1] or [H, H, 1, 1]
//
// Every shape is checked when the bundle is built, so the recurrence never
// meets a mismatched kernel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use mdrnn_core::backend::Backend;
use mdrnn_core::context::ExecutionContext;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::shape::Shape;
use mdrnn_core::tensor::Tensor;

use crate::conv::Conv2d;
use crate::dropout::Dropout;
use crate::module::{prefixed, Module};

/// Default dropout probability on the output-gate peephole.
pub const DEFAULT_DROPOUT_P: f64 = 0.2;

/// Initial value of both forget-gate input biases.
pub const FORGET_GATE_BIAS: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
enum KernelKind {
    /// 1×1 over the skewed input, with bias.
    Input,
    /// 2×1 over a state column and its shifted copy.
    Pair,
    /// 1×1 over a state column.
    Point,
}

impl KernelKind {
    fn shape(self, input_channels: usize, hidden: usize) -> Shape {
        match self {
            KernelKind::Input => Shape::from((hidden, input_channels, 1, 1)),
            KernelKind::Pair => Shape::from((hidden, hidden, 2, 1)),
            KernelKind::Point => Shape::from((hidden, hidden, 1, 1)),
        }
    }

    fn padding(self) -> [usize; 2] {
        match self {
            KernelKind::Pair => [1, 0],
            KernelKind::Input | KernelKind::Point => [0, 0],
        }
    }

    fn has_bias(self) -> bool {
        matches!(self, KernelKind::Input)
    }
}

/// Kernel roles in registration order.
const ROLES: [(&str, KernelKind); 14] = [
    ("input_input", KernelKind::Input),
    ("input_gate_input", KernelKind::Input),
    ("forget_gate_one_input", KernelKind::Input),
    ("forget_gate_two_input", KernelKind::Input),
    ("output_gate_input", KernelKind::Input),
    ("input_hidden", KernelKind::Pair),
    ("input_gate_hidden", KernelKind::Pair),
    ("forget_gate_one_hidden", KernelKind::Pair),
    ("forget_gate_two_hidden", KernelKind::Pair),
    ("output_gate_hidden", KernelKind::Pair),
    ("input_gate_memory", KernelKind::Pair),
    ("forget_gate_one_memory", KernelKind::Point),
    ("forget_gate_two_memory", KernelKind::Point),
    ("output_gate_memory", KernelKind::Point),
];

/// Raw input responses of the five gates over a whole skewed map, each
/// `[N, hidden, H, W + H - 1]`.
pub struct GateResponses<B: Backend> {
    pub input: Tensor<B>,
    pub input_gate: Tensor<B>,
    pub forget_gate_one: Tensor<B>,
    pub forget_gate_two: Tensor<B>,
    pub output_gate: Tensor<B>,
}

impl<B: Backend> GateResponses<B> {
    /// Skewed column `c` of every response, each `[N, hidden, H]`.
    pub fn column(&self, c: usize) -> Result<GateResponses<B>> {
        let take = |t: &Tensor<B>| t.narrow(3, c, 1)?.squeeze(3);
        Ok(GateResponses {
            input: take(&self.input)?,
            input_gate: take(&self.input_gate)?,
            forget_gate_one: take(&self.forget_gate_one)?,
            forget_gate_two: take(&self.forget_gate_two)?,
            output_gate: take(&self.output_gate)?,
        })
    }
}

/// Gate kernels for one scan direction.
pub struct MdlstmParameters<B: Backend> {
    input_channels: usize,
    hidden_size: usize,

    pub(crate) input_input: Conv2d<B>,
    pub(crate) input_gate_input: Conv2d<B>,
    pub(crate) forget_gate_one_input: Conv2d<B>,
    pub(crate) forget_gate_two_input: Conv2d<B>,
    pub(crate) output_gate_input: Conv2d<B>,

    pub(crate) input_hidden: Conv2d<B>,
    pub(crate) input_gate_hidden: Conv2d<B>,
    pub(crate) forget_gate_one_hidden: Conv2d<B>,
    pub(crate) forget_gate_two_hidden: Conv2d<B>,
    pub(crate) output_gate_hidden: Conv2d<B>,

    pub(crate) input_gate_memory: Conv2d<B>,
    pub(crate) forget_gate_one_memory: Conv2d<B>,
    pub(crate) forget_gate_two_memory: Conv2d<B>,
    pub(crate) output_gate_memory: Conv2d<B>,

    dropout: Option<Dropout>,
    training: AtomicBool,
    ctx: ExecutionContext<B>,
}

impl<B: Backend> MdlstmParameters<B> {
    /// Fresh kernels with both forget-gate biases set to 1.
    ///
    /// With `use_dropout`, the output-gate peephole contribution is dropped
    /// out with probability `dropout_p` while training.
    pub fn new(
        input_channels: usize,
        hidden_size: usize,
        use_dropout: bool,
        dropout_p: f64,
        ctx: &ExecutionContext<B>,
    ) -> Result<Self> {
        if input_channels == 0 || hidden_size == 0 {
            return Err(Error::msg(format!(
                "mdlstm parameters need positive sizes, got {input_channels} input channels and hidden size {hidden_size}"
            )));
        }
        let convs = ROLES
            .iter()
            .map(|&(_, kind)| {
                let shape = kind.shape(input_channels, hidden_size);
                let (out_c, in_c, kh, kw) = shape.dims4()?;
                Conv2d::new(in_c, out_c, [kh, kw], kind.padding(), kind.has_bias(), ctx)
            })
            .collect::<Result<Vec<_>>>()?;
        let params = Self::assemble(input_channels, hidden_size, convs, use_dropout, dropout_p, ctx)?;
        params.set_forget_gate_biases(FORGET_GATE_BIAS)?;
        log::debug!(
            "mdlstm parameters: {} input channels, hidden {}, dropout {}, {} scalars",
            input_channels,
            hidden_size,
            use_dropout,
            params.num_parameters()
        );
        Ok(params)
    }

    /// Build from tensors keyed by the names [`named_parameters`] reports
    /// (`input_input.weight`, `forget_gate_two_memory.weight`, ...).
    ///
    /// Every kernel shape is validated; a wrong one fails with
    /// [`Error::KernelShapeMismatch`] naming the kernel. Every tensor must
    /// also carry the dtype of `ctx`.
    ///
    /// [`named_parameters`]: Module::named_parameters
    pub fn from_named_tensors(
        input_channels: usize,
        hidden_size: usize,
        tensors: &HashMap<String, Tensor<B>>,
        use_dropout: bool,
        dropout_p: f64,
        ctx: &ExecutionContext<B>,
    ) -> Result<Self> {
        let fetch = |key: String| {
            let t = tensors
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::msg(format!("missing mdlstm tensor `{key}`")))?;
            ctx.check(&t)?;
            Ok::<_, Error>(t)
        };
        let convs = ROLES
            .iter()
            .map(|&(role, kind)| {
                let weight = fetch(format!("{role}.weight"))?;
                let bias = if kind.has_bias() {
                    Some(fetch(format!("{role}.bias"))?)
                } else {
                    None
                };
                Conv2d::from_tensors(
                    role,
                    weight,
                    bias,
                    kind.shape(input_channels, hidden_size),
                    kind.padding(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(input_channels, hidden_size, convs, use_dropout, dropout_p, ctx)
    }

    fn assemble(
        input_channels: usize,
        hidden_size: usize,
        convs: Vec<Conv2d<B>>,
        use_dropout: bool,
        dropout_p: f64,
        ctx: &ExecutionContext<B>,
    ) -> Result<Self> {
        let dropout = if use_dropout {
            Some(Dropout::new(dropout_p)?)
        } else {
            None
        };
        let mut it = convs.into_iter();
        let mut next = || {
            it.next()
                .ok_or_else(|| Error::msg("mdlstm parameters: kernel list too short"))
        };
        Ok(MdlstmParameters {
            input_channels,
            hidden_size,
            input_input: next()?,
            input_gate_input: next()?,
            forget_gate_one_input: next()?,
            forget_gate_two_input: next()?,
            output_gate_input: next()?,
            input_hidden: next()?,
            input_gate_hidden: next()?,
            forget_gate_one_hidden: next()?,
            forget_gate_two_hidden: next()?,
            output_gate_hidden: next()?,
            input_gate_memory: next()?,
            forget_gate_one_memory: next()?,
            forget_gate_two_memory: next()?,
            output_gate_memory: next()?,
            dropout,
            training: AtomicBool::new(true),
            ctx: ctx.clone(),
        })
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn uses_dropout(&self) -> bool {
        self.dropout.is_some()
    }

    /// The context the kernels were created under; state columns of the
    /// recurrence are allocated through it.
    pub fn context(&self) -> &ExecutionContext<B> {
        &self.ctx
    }

    /// Overwrite both forget-gate input biases with `value`.
    pub fn set_forget_gate_biases(&self, value: f64) -> Result<()> {
        self.forget_gate_one_input.fill_bias(value)?;
        self.forget_gate_two_input.fill_bias(value)
    }

    /// The five 1×1 input convolutions over the skewed map.
    pub fn input_responses(&self, skewed: &Tensor<B>) -> Result<GateResponses<B>> {
        Ok(GateResponses {
            input: self.input_input.forward(skewed)?,
            input_gate: self.input_gate_input.forward(skewed)?,
            forget_gate_one: self.forget_gate_one_input.forward(skewed)?,
            forget_gate_two: self.forget_gate_two_input.forward(skewed)?,
            output_gate: self.output_gate_input.forward(skewed)?,
        })
    }

    /// Output-gate peephole on the new memory column, dropped out when
    /// enabled and training.
    pub(crate) fn output_gate_memory_contribution(&self, memory: &Tensor<B>) -> Result<Tensor<B>> {
        let contribution = self.output_gate_memory.forward_column(memory)?;
        match &self.dropout {
            Some(d) => d.forward_t(&contribution),
            None => Ok(contribution),
        }
    }

    fn convs(&self) -> [&Conv2d<B>; 14] {
        [
            &self.input_input,
            &self.input_gate_input,
            &self.forget_gate_one_input,
            &self.forget_gate_two_input,
            &self.output_gate_input,
            &self.input_hidden,
            &self.input_gate_hidden,
            &self.forget_gate_one_hidden,
            &self.forget_gate_two_hidden,
            &self.output_gate_hidden,
            &self.input_gate_memory,
            &self.forget_gate_one_memory,
            &self.forget_gate_two_memory,
            &self.output_gate_memory,
        ]
    }
}

impl<B: Backend> Module<B> for MdlstmParameters<B> {
    /// Runs the recurrence for a single direction with the default output
    /// mode; see [`MdlstmEngine`](super::MdlstmEngine) for the options.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        super::MdlstmEngine::default().run_direction(self, x)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.convs()
            .iter()
            .flat_map(|conv| conv.parameters())
            .collect()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.convs()
            .iter()
            .zip(ROLES.iter())
            .flat_map(|(conv, (role, _))| prefixed(role, conv.named_parameters()))
            .collect()
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
        if let Some(d) = &self.dropout {
            d.set_training(training);
        }
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdrnn_core::DType;
    use mdrnn_cpu::{CpuBackend, CpuDevice};

    fn ctx() -> ExecutionContext<CpuBackend> {
        ExecutionContext::new(CpuDevice, DType::F64).unwrap()
    }

    #[test]
    fn test_forget_biases_start_at_one() -> Result<()> {
        let p = MdlstmParameters::new(3, 4, false, DEFAULT_DROPOUT_P, &ctx())?;
        for conv in [&p.forget_gate_one_input, &p.forget_gate_two_input] {
            let bias = conv.bias().unwrap().to_f64_vec()?;
            assert_eq!(bias, vec![1.0; 4]);
        }
        assert!(p.input_gate_input.bias().unwrap().to_f64_vec()?.iter().all(|v| v.abs() < 1.0));
        Ok(())
    }

    #[test]
    fn test_kernel_shapes_and_count() -> Result<()> {
        let p = MdlstmParameters::new(3, 4, false, DEFAULT_DROPOUT_P, &ctx())?;
        assert_eq!(p.input_input.weight().dims(), &[4, 3, 1, 1]);
        assert_eq!(p.input_gate_memory.weight().dims(), &[4, 4, 2, 1]);
        assert_eq!(p.forget_gate_two_memory.weight().dims(), &[4, 4, 1, 1]);
        // 5 input convs with bias, 6 pair kernels, 3 point kernels
        let expected = 5 * (4 * 3 + 4) + 6 * (4 * 4 * 2) + 3 * (4 * 4);
        assert_eq!(p.num_parameters(), expected);
        assert_eq!(p.parameters().len(), 19);
        Ok(())
    }

    #[test]
    fn test_named_tensors_round_trip() -> Result<()> {
        let p = MdlstmParameters::new(2, 3, false, DEFAULT_DROPOUT_P, &ctx())?;
        let named: HashMap<String, _> = p.named_parameters().into_iter().collect();
        assert!(named.contains_key("forget_gate_one_input.bias"));
        assert!(named.contains_key("output_gate_memory.weight"));
        let q = MdlstmParameters::from_named_tensors(2, 3, &named, false, DEFAULT_DROPOUT_P, &ctx())?;
        assert_eq!(
            q.input_hidden.weight().to_f64_vec()?,
            p.input_hidden.weight().to_f64_vec()?
        );
        Ok(())
    }

    #[test]
    fn test_wrong_kernel_shape_rejected() -> Result<()> {
        let p = MdlstmParameters::new(2, 3, false, DEFAULT_DROPOUT_P, &ctx())?;
        let mut named: HashMap<String, _> = p.named_parameters().into_iter().collect();
        named.insert(
            "forget_gate_two_memory.weight".to_string(),
            Tensor::zeros((3, 3, 2, 1), DType::F64, &CpuDevice)?,
        );
        let err = MdlstmParameters::from_named_tensors(2, 3, &named, false, DEFAULT_DROPOUT_P, &ctx())
            .err()
            .unwrap();
        match err {
            Error::KernelShapeMismatch { name, .. } => {
                assert_eq!(name, "forget_gate_two_memory.weight")
            }
            other => panic!("unexpected error {other}"),
        }
        Ok(())
    }

    #[test]
    fn test_named_tensors_must_match_context_dtype() -> Result<()> {
        let p = MdlstmParameters::new(2, 3, false, DEFAULT_DROPOUT_P, &ctx())?;
        let named: HashMap<String, _> = p.named_parameters().into_iter().collect();
        let f32_ctx = ExecutionContext::<CpuBackend>::new(CpuDevice, DType::F32)?;
        assert!(matches!(
            MdlstmParameters::from_named_tensors(2, 3, &named, false, DEFAULT_DROPOUT_P, &f32_ctx),
            Err(Error::DTypeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_set_training_reaches_dropout() -> Result<()> {
        let p = MdlstmParameters::new(1, 2, true, DEFAULT_DROPOUT_P, &ctx())?;
        assert!(p.uses_dropout());
        p.set_training(false);
        assert!(!p.is_training());
        assert!(!p.dropout.as_ref().unwrap().is_training());
        Ok(())
    }
}

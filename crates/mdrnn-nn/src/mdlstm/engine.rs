// MDLSTM recurrence over skewed columns
//
// For one scan direction and an input [N, C, H, W]:
//
//   1. skew the input to [N, C, H, S], S = W + H - 1
//   2. compute the five gate input responses over the whole skewed map
//   3. sweep the S columns left to right with state columns h, m (zeros at
//      the start), each [N, hidden, H]:
//
//        a   = tanh(in[c]  + U_a  * h)
//        i   = σ(ig[c]  + U_i  * h + P_i  * m)
//        f1  = σ(f1[c]  + U_f1 * h + P_f1 * m)
//        f2  = σ(f2[c]  + U_f2 * h + P_f2 * shift(m))
//        m'  = a ⊙ i + f1 ⊙ m + f2 ⊙ shift(m)
//        o   = σ(og[c]  + U_o  * h + P_o  * m')
//        h'  = tanh(m')            (OutputGating::Default)
//            = o ⊙ tanh(m')        (OutputGating::Gated)
//
//      where `U * h` is a 2×1 kernel over (shift(h), h) and shift moves a
//      column one row down with a zero row on top.
//   4. unskew the emitted columns back to [N, hidden, H, W]
//
// Cell (r, c) of the image lands in skewed column r + c, so at column s the
// unshifted state holds the left neighbour and the shifted state the one
// above.

use mdrnn_core::backend::Backend;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::tensor::Tensor;

use super::parameters::{GateResponses, MdlstmParameters};
use crate::skew::{skew, unskew};

/// What a cell emits as its hidden state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputGating {
    /// `tanh(m')`. The output gate is still computed every step but does
    /// not feed the emitted value.
    #[default]
    Default,
    /// `o ⊙ tanh(m')`.
    Gated,
}

/// One column of a state, moved one row down; row 0 becomes zero.
fn shift<B: Backend>(column: &Tensor<B>) -> Result<Tensor<B>> {
    let (_, _, height) = column.shape().dims3()?;
    column.pad(&[[1, 0]], 0.0)?.narrow(2, 0, height)
}

/// Runs the recurrence of one direction with a given parameter bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MdlstmEngine {
    output_gating: OutputGating,
}

impl MdlstmEngine {
    pub fn new(output_gating: OutputGating) -> Self {
        MdlstmEngine { output_gating }
    }

    pub fn output_gating(&self) -> OutputGating {
        self.output_gating
    }

    /// `[N, C, H, W]` → `[N, hidden, H, W]`.
    pub fn run_direction<B: Backend>(
        &self,
        params: &MdlstmParameters<B>,
        x: &Tensor<B>,
    ) -> Result<Tensor<B>> {
        let (_, _, height, width) = x.shape().dims4()?;
        let columns = self.run_columns(params, x)?;
        unskew(&columns, height, width)
    }

    /// The emitted activation of every skewed column, in sweep order, each
    /// `[N, hidden, H]`.
    pub fn run_columns<B: Backend>(
        &self,
        params: &MdlstmParameters<B>,
        x: &Tensor<B>,
    ) -> Result<Vec<Tensor<B>>> {
        let ctx = params.context();
        ctx.check(x)?;
        let (n, channels, height, width) = x.shape().dims4()?;
        if channels != params.input_channels() {
            return Err(Error::ChannelMismatch {
                expected: params.input_channels(),
                got: channels,
            });
        }
        let skewed = skew(x)?;
        let skewed_width = skewed.dims()[3];
        log::trace!(
            "mdlstm sweep over {}x{} image, batch {}, {} skewed columns",
            height,
            width,
            n,
            skewed_width
        );

        let responses = params.input_responses(&skewed)?;
        let zeros = ctx.zeros((n, params.hidden_size(), height))?;
        let mut hidden = zeros.clone();
        let mut memory = zeros;
        let mut emitted = Vec::with_capacity(skewed_width);
        for c in 0..skewed_width {
            let (h_next, m_next) = self.step(params, &responses.column(c)?, &hidden, &memory)?;
            emitted.push(h_next.clone());
            hidden = h_next;
            memory = m_next;
        }
        log::trace!("mdlstm sweep done, {} columns emitted", emitted.len());
        Ok(emitted)
    }

    /// One column transition; returns `(h', m')`.
    fn step<B: Backend>(
        &self,
        params: &MdlstmParameters<B>,
        inputs: &GateResponses<B>,
        hidden: &Tensor<B>,
        memory: &Tensor<B>,
    ) -> Result<(Tensor<B>, Tensor<B>)> {
        let shifted_memory = shift(memory)?;

        let activation = inputs
            .input
            .add(&params.input_hidden.forward_column(hidden)?)?
            .tanh()?;
        let input_gate = inputs
            .input_gate
            .add(&params.input_gate_hidden.forward_column(hidden)?)?
            .add(&params.input_gate_memory.forward_column(memory)?)?
            .sigmoid()?;
        let forget_gate_one = inputs
            .forget_gate_one
            .add(&params.forget_gate_one_hidden.forward_column(hidden)?)?
            .add(&params.forget_gate_one_memory.forward_column(memory)?)?
            .sigmoid()?;
        let forget_gate_two = inputs
            .forget_gate_two
            .add(&params.forget_gate_two_hidden.forward_column(hidden)?)?
            .add(&params.forget_gate_two_memory.forward_column(&shifted_memory)?)?
            .sigmoid()?;

        let new_memory = activation
            .mul(&input_gate)?
            .add(&forget_gate_one.mul(memory)?)?
            .add(&forget_gate_two.mul(&shifted_memory)?)?;

        let output_gate = inputs
            .output_gate
            .add(&params.output_gate_hidden.forward_column(hidden)?)?
            .add(&params.output_gate_memory_contribution(&new_memory)?)?
            .sigmoid()?;

        let squashed = new_memory.tanh()?;
        let new_hidden = match self.output_gating {
            OutputGating::Default => squashed,
            OutputGating::Gated => output_gate.mul(&squashed)?,
        };
        Ok((new_hidden, new_memory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdrnn_core::context::ExecutionContext;
    use mdrnn_core::DType;
    use mdrnn_cpu::{CpuBackend, CpuDevice, CpuTensor};

    use crate::mdlstm::parameters::DEFAULT_DROPOUT_P;

    fn ctx() -> ExecutionContext<CpuBackend> {
        ExecutionContext::new(CpuDevice, DType::F64).unwrap()
    }

    #[test]
    fn test_shift_moves_rows_down() -> Result<()> {
        let col = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0], (1, 1, 3), DType::F64, &CpuDevice)?;
        assert_eq!(shift(&col)?.to_f64_vec()?, vec![0.0, 1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_output_shape_and_range() -> Result<()> {
        let params = MdlstmParameters::new(2, 3, false, DEFAULT_DROPOUT_P, &ctx())?;
        let x = CpuTensor::randn((2, 2, 4, 5), DType::F64, &CpuDevice)?;
        let engine = MdlstmEngine::default();
        let columns = engine.run_columns(&params, &x)?;
        assert_eq!(columns.len(), 8);
        assert_eq!(columns[0].dims(), &[2, 3, 4]);
        let y = engine.run_direction(&params, &x)?;
        assert_eq!(y.dims(), &[2, 3, 4, 5]);
        assert!(y.to_f64_vec()?.iter().all(|v| v.abs() < 1.0));
        Ok(())
    }

    #[test]
    fn test_channel_mismatch() -> Result<()> {
        let params = MdlstmParameters::new(2, 3, false, DEFAULT_DROPOUT_P, &ctx())?;
        let x = CpuTensor::zeros((1, 3, 2, 2), DType::F64, &CpuDevice)?;
        assert!(matches!(
            MdlstmEngine::default().run_direction(&params, &x),
            Err(Error::ChannelMismatch {
                expected: 2,
                got: 3
            })
        ));
        Ok(())
    }

    #[test]
    fn test_input_checked_against_context() -> Result<()> {
        let params = MdlstmParameters::new(1, 2, false, DEFAULT_DROPOUT_P, &ctx())?;
        let x = CpuTensor::zeros((1, 1, 2, 2), DType::F32, &CpuDevice)?;
        assert!(matches!(
            MdlstmEngine::default().run_columns(&params, &x),
            Err(Error::DTypeMismatch {
                expected: DType::F64,
                got: DType::F32
            })
        ));
        Ok(())
    }

    #[test]
    fn test_states_follow_context_dtype() -> Result<()> {
        let f32_ctx = ExecutionContext::<CpuBackend>::new(CpuDevice, DType::F32)?;
        let params = MdlstmParameters::new(1, 2, false, DEFAULT_DROPOUT_P, &f32_ctx)?;
        assert_eq!(params.context().dtype(), DType::F32);
        let x = CpuTensor::randn((2, 1, 3, 2), DType::F32, &CpuDevice)?;
        let columns = MdlstmEngine::default().run_columns(&params, &x)?;
        assert!(columns.iter().all(|c| c.dtype() == DType::F32));
        Ok(())
    }

    #[test]
    fn test_cells_only_see_top_left_context() -> Result<()> {
        // Changing pixel (1, 1) must leave every cell above or left of it
        // untouched: (0, *) and (*, 0).
        let params = MdlstmParameters::new(1, 2, false, DEFAULT_DROPOUT_P, &ctx())?;
        let engine = MdlstmEngine::default();
        let base = vec![0.5; 9];
        let mut bumped = base.clone();
        bumped[4] = -3.0;
        let a = CpuTensor::from_f64_slice(&base, (1, 1, 3, 3), DType::F64, &CpuDevice)?;
        let b = CpuTensor::from_f64_slice(&bumped, (1, 1, 3, 3), DType::F64, &CpuDevice)?;
        let ya = engine.run_direction(&params, &a)?.to_f64_vec()?;
        let yb = engine.run_direction(&params, &b)?.to_f64_vec()?;
        for channel in 0..2 {
            for (r, c) in [(0, 0), (0, 1), (0, 2), (1, 0), (2, 0)] {
                let i = channel * 9 + r * 3 + c;
                assert_eq!(ya[i], yb[i], "cell ({r}, {c}) changed");
            }
            let i = channel * 9 + 2 * 3 + 2;
            assert_ne!(ya[i], yb[i]);
        }
        Ok(())
    }

    #[test]
    fn test_gated_output_differs() -> Result<()> {
        let params = MdlstmParameters::new(1, 2, false, DEFAULT_DROPOUT_P, &ctx())?;
        let x = CpuTensor::randn((1, 1, 3, 3), DType::F64, &CpuDevice)?;
        let plain = MdlstmEngine::new(OutputGating::Default).run_direction(&params, &x)?;
        let gated = MdlstmEngine::new(OutputGating::Gated).run_direction(&params, &x)?;
        let (p, g) = (plain.to_f64_vec()?, gated.to_f64_vec()?);
        assert_ne!(p, g);
        // top-left cell has no recurrent input, so only the gate differs
        assert!(g[0].abs() <= p[0].abs());
        assert!(g.iter().all(|v| v.abs() < 1.0));
        Ok(())
    }
}

// Numerical gradient checks
//
// Every backward rule the MDLSTM relies on is compared against central
// differences of a scalar loss, first op by op and then end to end through
// the classifier and the block layer.

use mdrnn::prelude::*;

const EPS: f64 = 1e-5;
const TOL: f64 = 1e-6;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn size(h: usize, w: usize) -> SizeTwoDimensional {
    SizeTwoDimensional::new(h, w).unwrap()
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!((g - e).abs() < tol, "index {i}: got {g} expected {e}");
    }
}

fn tensor(data: &[f64], dims: &[usize]) -> mdrnn::Result<CpuTensor> {
    CpuTensor::from_f64_slice(data, dims.to_vec(), DType::F64, &CpuDevice)
}

fn random(dims: &[usize]) -> mdrnn::Result<Vec<f64>> {
    CpuTensor::randn(dims.to_vec(), DType::F64, &CpuDevice)?.to_f64_vec()
}

/// A loss that weights every output element differently, so a gradient
/// routed to the wrong position shows up.
fn weighted_loss(y: &CpuTensor) -> mdrnn::Result<CpuTensor> {
    let weights: Vec<f64> = (0..y.elem_count())
        .map(|i| (i as f64 * 0.37).sin() + 0.5)
        .collect();
    let weights = tensor(&weights, y.dims())?;
    y.tanh()?.mul(&weights)?.sum_all()
}

/// Compare the gradient of `weighted_loss(f(x))` with respect to `x` against
/// central differences.
fn check_gradient<F>(data: &[f64], dims: &[usize], f: F) -> mdrnn::Result<()>
where
    F: Fn(&CpuTensor) -> mdrnn::Result<CpuTensor>,
{
    let x = tensor(data, dims)?.set_variable();
    let grads = weighted_loss(&f(&x)?)?.backward()?;
    let analytic = grads.get(&x).expect("no gradient for input").to_f64_vec()?;

    let loss_at = |values: &[f64]| -> mdrnn::Result<f64> {
        weighted_loss(&f(&tensor(values, dims)?)?)?.to_scalar_f64()
    };
    let mut numerical = Vec::with_capacity(data.len());
    for i in 0..data.len() {
        let mut plus = data.to_vec();
        plus[i] += EPS;
        let mut minus = data.to_vec();
        minus[i] -= EPS;
        numerical.push((loss_at(&plus)? - loss_at(&minus)?) / (2.0 * EPS));
    }
    assert_vec_approx(&analytic, &numerical, TOL);
    Ok(())
}

/// Same check for every parameter of a module, perturbed in place.
fn check_parameter_gradients<M>(model: &M, x: &CpuTensor) -> mdrnn::Result<()>
where
    M: Module<CpuBackend>,
{
    let grads = weighted_loss(&model.forward(x)?)?.backward()?;
    for (name, param) in model.named_parameters() {
        let analytic = grads
            .get(&param)
            .unwrap_or_else(|| panic!("no gradient for {name}"))
            .to_f64_vec()?;
        let base = param.to_f64_vec()?;
        let mut numerical = Vec::with_capacity(base.len());
        for i in 0..base.len() {
            let mut plus = base.clone();
            plus[i] += EPS;
            param.update_data_inplace(&plus)?;
            let loss_plus = weighted_loss(&model.forward(x)?)?.to_scalar_f64()?;
            let mut minus = base.clone();
            minus[i] -= EPS;
            param.update_data_inplace(&minus)?;
            let loss_minus = weighted_loss(&model.forward(x)?)?.to_scalar_f64()?;
            numerical.push((loss_plus - loss_minus) / (2.0 * EPS));
        }
        param.update_data_inplace(&base)?;
        for (i, (a, n)) in analytic.iter().zip(&numerical).enumerate() {
            assert!((a - n).abs() < TOL, "{name}[{i}]: analytic {a} numerical {n}");
        }
    }
    Ok(())
}

// Single ops

#[test]
fn test_pad_numerical_grad() -> mdrnn::Result<()> {
    let dims = [2, 3, 2];
    check_gradient(&random(&dims)?, &dims, |x| x.pad(&[[1, 2]], 0.0))
}

#[test]
fn test_shift_numerical_grad() -> mdrnn::Result<()> {
    // pad one row on top, keep the original height
    let dims = [2, 3, 4];
    check_gradient(&random(&dims)?, &dims, |x| {
        x.pad(&[[1, 0]], 0.0)?.narrow(2, 0, 4)
    })
}

#[test]
fn test_flip_numerical_grad() -> mdrnn::Result<()> {
    let dims = [2, 3, 4];
    check_gradient(&random(&dims)?, &dims, |x| x.flip(1))?;
    check_gradient(&random(&dims)?, &dims, |x| x.flip(2)?.flip(1))
}

#[test]
fn test_cat_narrow_numerical_grad() -> mdrnn::Result<()> {
    let dims = [2, 3, 4];
    check_gradient(&random(&dims)?, &dims, |x| {
        let parts = [x.narrow(1, 1, 2)?, x.clone(), x.narrow(1, 0, 1)?];
        Tensor::cat(&parts, 1)?.narrow(2, 1, 3)
    })
}

#[test]
fn test_permute_numerical_grad() -> mdrnn::Result<()> {
    let dims = [2, 3, 4];
    check_gradient(&random(&dims)?, &dims, |x| {
        x.permute(&[2, 0, 1])?.mul(&x.permute(&[2, 0, 1])?.sigmoid()?)
    })
}

#[test]
fn test_conv2d_vertical_pair_numerical_grad() -> mdrnn::Result<()> {
    // 2x1 kernel with one row of padding on each side, as the hidden kernels
    let x_dims = [2, 2, 3, 2];
    let w_dims = [3, 2, 2, 1];
    let b_dims = [3];
    let (x_data, w_data, b_data) = (random(&x_dims)?, random(&w_dims)?, random(&b_dims)?);
    let x = tensor(&x_data, &x_dims)?;
    let w = tensor(&w_data, &w_dims)?;
    let b = tensor(&b_data, &b_dims)?;

    check_gradient(&x_data, &x_dims, |x| x.conv2d(&w, Some(&b), [1, 1], [1, 0]))?;
    check_gradient(&w_data, &w_dims, |w| x.conv2d(w, Some(&b), [1, 1], [1, 0]))?;
    check_gradient(&b_data, &b_dims, |b| x.conv2d(&w, Some(b), [1, 1], [1, 0]))
}

#[test]
fn test_skew_unskew_numerical_grad() -> mdrnn::Result<()> {
    let dims = [1, 2, 3, 4];
    check_gradient(&random(&dims)?, &dims, |x| {
        unskew_map(&skew(x)?.square()?, 3, 4)
    })
}

// End to end

fn gated_config(h: usize, w: usize) -> MdlstmConfig {
    let mut config = MdlstmConfig::new(1, 2, size(h, w));
    config.output_gating = OutputGating::Gated;
    config.num_classes = 3;
    config
}

fn ctx() -> ExecutionContext<CpuBackend> {
    ExecutionContext::new(CpuDevice, DType::F64).unwrap()
}

#[test]
fn test_mdlstm_input_numerical_grad() -> mdrnn::Result<()> {
    init_logging();
    let model = MultiDimensionalLstm::new(gated_config(3, 3), &ctx())?;
    let dims = [2, 1, 3, 3];
    check_gradient(&random(&dims)?, &dims, |x| model.forward(x))
}

#[test]
fn test_mdlstm_parameter_numerical_grad() -> mdrnn::Result<()> {
    init_logging();
    let model = MultiDimensionalLstm::new(gated_config(3, 3), &ctx())?;
    let x = CpuTensor::randn((1, 1, 3, 3), DType::F64, &CpuDevice)?;
    check_parameter_gradients(&model, &x)
}

#[test]
fn test_block_mdlstm_input_numerical_grad() -> mdrnn::Result<()> {
    let config = gated_config(4, 4);
    let layer = BlockMdlstm::new(&config, size(2, 2), &ctx())?;
    let dims = [1, 1, 4, 4];
    check_gradient(&random(&dims)?, &dims, |x| layer.forward(x))
}

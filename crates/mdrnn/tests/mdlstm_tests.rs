// Integration tests for the MDLSTM layers
//
// Forward shapes, determinism, train/eval switching, gradient flow into
// every direction's kernels and gradient clipping, on the CPU backend.

use mdrnn::nn::{count_zeros, DEFAULT_MAX_GRAD_NORM};
use mdrnn::prelude::*;
use mdrnn::Error;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ctx() -> ExecutionContext<CpuBackend> {
    ExecutionContext::new(CpuDevice, DType::F64).unwrap()
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

#[test]
fn test_classifier_forward_shape() -> mdrnn::Result<()> {
    init_logging();
    let config = MdlstmConfig::new(1, 4, size(6, 5));
    let model = MultiDimensionalLstm::new(config, &ctx())?;
    let x = CpuTensor::randn((3, 1, 6, 5), DType::F64, &CpuDevice)?;
    assert_eq!(model.forward(&x)?.dims(), &[3, 10]);
    Ok(())
}

#[test]
fn test_single_direction_head_width() -> mdrnn::Result<()> {
    let mut config = MdlstmConfig::new(2, 3, size(4, 4));
    config.directions = DirectionMode::Single;
    config.num_classes = 5;
    let model = MultiDimensionalLstm::new(config, &ctx())?;
    assert_eq!(model.head().in_features(), 4 * 4 * 3);
    let x = CpuTensor::randn((1, 2, 4, 4), DType::F64, &CpuDevice)?;
    assert_eq!(model.forward(&x)?.dims(), &[1, 5]);
    Ok(())
}

#[test]
fn test_forward_is_deterministic() -> mdrnn::Result<()> {
    let config = MdlstmConfig::new(1, 3, size(4, 4));
    let model = MultiDimensionalLstm::new(config, &ctx())?;
    let x = CpuTensor::randn((2, 1, 4, 4), DType::F64, &CpuDevice)?;
    let first = model.forward(&x)?.to_f64_vec()?;
    let second = model.forward(&x)?.to_f64_vec()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_dropout_only_while_training() -> mdrnn::Result<()> {
    let mut config = MdlstmConfig::new(1, 4, size(5, 5));
    config.use_dropout = true;
    config.output_gating = OutputGating::Gated;
    let model = MultiDimensionalLstm::new(config, &ctx())?;
    let x = CpuTensor::randn((2, 1, 5, 5), DType::F64, &CpuDevice)?;

    model.set_training(false);
    assert!(!model.is_training());
    assert!(model
        .direction_set()
        .bundles()
        .iter()
        .all(|b| !b.is_training()));
    let a = model.forward(&x)?.to_f64_vec()?;
    let b = model.forward(&x)?.to_f64_vec()?;
    assert_eq!(a, b);

    model.set_training(true);
    let mut differs = false;
    for _ in 0..5 {
        if model.forward(&x)?.to_f64_vec()? != a {
            differs = true;
            break;
        }
    }
    assert!(differs, "dropout never changed the gated output");
    Ok(())
}

#[test]
fn test_gradients_reach_every_direction() -> mdrnn::Result<()> {
    init_logging();
    let config = MdlstmConfig::new(1, 2, size(3, 3));
    let model = MultiDimensionalLstm::new(config, &ctx())?;
    let x = CpuTensor::randn((2, 1, 3, 3), DType::F64, &CpuDevice)?;
    let loss = model.forward(&x)?.square()?.mean_all()?;
    let grads = loss.backward()?;
    for (name, param) in model.named_parameters() {
        let g = grads.get(&param);
        // the output gate does not feed the emitted value by default
        if name.contains("output_gate") {
            continue;
        }
        let g = g.unwrap_or_else(|| panic!("no gradient for {name}"));
        assert_eq!(g.dims(), param.dims(), "{name}");
        assert!(
            count_zeros(g)? < g.elem_count(),
            "gradient of {name} is all zeros"
        );
    }
    Ok(())
}

#[test]
fn test_gated_output_trains_output_gate() -> mdrnn::Result<()> {
    let mut config = MdlstmConfig::new(1, 2, size(3, 3));
    config.directions = DirectionMode::Single;
    config.output_gating = OutputGating::Gated;
    let model = MultiDimensionalLstm::new(config, &ctx())?;
    let x = CpuTensor::randn((1, 1, 3, 3), DType::F64, &CpuDevice)?;
    let grads = model.forward(&x)?.sum_all()?.backward()?;
    let named = model.named_parameters();
    let (_, w) = named
        .iter()
        .find(|(n, _)| n == "directions.0.output_gate_input.weight")
        .unwrap();
    assert!(count_zeros(grads.get(w).unwrap())? < w.elem_count());
    Ok(())
}

#[test]
fn test_rayon_directions_match_sequential() -> mdrnn::Result<()> {
    let mut config = MdlstmConfig::new(1, 2, size(4, 3));
    config.parallelism = Parallelism::Rayon;
    let model = MultiDimensionalLstm::new(config, &ctx())?;
    let x = CpuTensor::randn((2, 1, 4, 3), DType::F64, &CpuDevice)?;
    let parallel = model.forward_directions(&x)?;
    let engine = model.direction_set().engine();
    for ((direction, bundle), got) in ScanDirection::ALL
        .iter()
        .zip(model.direction_set().bundles())
        .zip(&parallel)
    {
        let flipped = direction.apply(&x)?;
        let expected = direction.apply(&engine.run_direction(bundle, &flipped)?)?;
        assert_eq!(got.to_f64_vec()?, expected.to_f64_vec()?);
    }
    Ok(())
}

#[test]
fn test_block_mdlstm_round_trip_gradients() -> mdrnn::Result<()> {
    init_logging();
    let config = MdlstmConfig::new(2, 3, size(4, 6));
    let layer = BlockMdlstm::new(&config, size(2, 3), &ctx())?;
    let x = CpuTensor::randn((2, 2, 4, 6), DType::F64, &CpuDevice)?.set_variable();
    let y = layer.forward(&x)?;
    assert_eq!(y.dims(), &[2, 3, 4, 6]);
    let grads = y.sum_all()?.backward()?;
    let gx = grads.get(&x).unwrap();
    assert_eq!(gx.dims(), x.dims());
    assert!(count_zeros(gx)? < gx.elem_count());
    Ok(())
}

#[test]
fn test_block_size_must_tile_input() {
    let config = MdlstmConfig::new(1, 2, size(5, 5));
    assert!(matches!(
        BlockMdlstm::new(&config, size(2, 2), &ctx()),
        Err(Error::BlockSizeMismatch { .. })
    ));
}

#[test]
fn test_clip_after_backward() -> mdrnn::Result<()> {
    let config = MdlstmConfig::new(1, 2, size(3, 3));
    let model = MultiDimensionalLstm::new(config, &ctx())?;
    let x = CpuTensor::randn((1, 1, 3, 3), DType::F64, &CpuDevice)?;
    // scale the loss so the norm is far above the threshold
    let loss = model.forward(&x)?.sum_all()?.affine(1e4, 0.0)?;
    let grads = loss.backward()?;
    let params = model.parameters();
    let (clipped, outcome) = clip_grad_norm(&grads, &params, DEFAULT_MAX_GRAD_NORM)?;
    assert!(outcome.clipped);
    let after = grad_norm(&clipped, &params)?;
    assert_vec_approx(&[after], &[DEFAULT_MAX_GRAD_NORM], 1e-6);
    Ok(())
}

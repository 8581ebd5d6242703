// Integration tests for skewing and tensor chunking
//
// Round trips, block layouts and gradient flow through chunk → dechunk,
// on the CPU backend.

use mdrnn::nn::{count_non_zeros, tensor_lists_equal, tensors_equal};
use mdrnn::prelude::*;
use mdrnn::Error;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn size(h: usize, w: usize) -> SizeTwoDimensional {
    SizeTwoDimensional::new(h, w).unwrap()
}

fn counting(dims: (usize, usize, usize, usize)) -> mdrnn::Result<CpuTensor> {
    let (n, c, h, w) = dims;
    let data: Vec<f64> = (1..=n * c * h * w).map(|v| v as f64).collect();
    CpuTensor::from_f64_slice(&data, dims, DType::F32, &CpuDevice)
}

// Uniform chunking

#[test]
fn test_round_trip_1_to_96() -> mdrnn::Result<()> {
    init_logging();
    let x = counting((2, 2, 4, 6))?;
    let chunking = TensorChunking::new(size(4, 6), size(2, 2))?;
    let blocks = chunking.chunk(&x)?;
    assert_eq!(blocks.dims(), &[12, 2, 2, 2]);
    // first block of example 0, channel 0: rows 0..2, cols 0..2
    assert_eq!(
        blocks.narrow(0, 0, 1)?.narrow(1, 0, 1)?.to_f64_vec()?,
        vec![1.0, 2.0, 7.0, 8.0]
    );
    let back = chunking.dechunk(&blocks)?;
    assert!(tensors_equal(&back, &x)?);
    Ok(())
}

#[test]
fn test_round_trip_1_to_24_per_channel() -> mdrnn::Result<()> {
    // every channel of every example holds the 4x6 map 1..24
    let map: Vec<f64> = (1..=24).map(|v| v as f64).collect();
    let data: Vec<f64> = map.iter().copied().cycle().take(4 * 24).collect();
    let x = CpuTensor::from_f64_slice(&data, (2, 2, 4, 6), DType::F32, &CpuDevice)?;
    let chunking = TensorChunking::new(size(4, 6), size(2, 2))?;
    let blocks = chunking.chunk(&x)?;
    assert_eq!(blocks.dims(), &[12, 2, 2, 2]);
    // block (0, 1) of example 1, channel 1: rows 0..2, cols 2..4
    assert_eq!(
        blocks.narrow(0, 3, 1)?.narrow(1, 1, 1)?.to_f64_vec()?,
        vec![3.0, 4.0, 9.0, 10.0]
    );
    let back = chunking.dechunk(&blocks)?;
    assert_eq!(back.dims(), &[2, 2, 4, 6]);
    assert!(tensors_equal(&back, &x)?);
    Ok(())
}

#[test]
fn test_round_trip_block_sizes() -> mdrnn::Result<()> {
    init_logging();
    let x = counting((2, 2, 4, 6))?;
    for (bh, bw) in [(1, 1), (2, 2), (4, 2), (2, 3), (4, 6)] {
        let chunking = TensorChunking::new(size(4, 6), size(bh, bw))?;
        let blocks = chunking.chunk(&x)?;
        assert_eq!(blocks.dims()[0], (4 / bh) * (6 / bw) * 2);
        let back = chunking.dechunk(&blocks)?;
        assert!(tensors_equal(&back, &x)?, "block {bh}x{bw} did not round trip");
    }
    Ok(())
}

#[test]
fn test_block_equal_to_map_is_one_block_per_example() -> mdrnn::Result<()> {
    let x = counting((3, 1, 4, 6))?;
    let chunking = TensorChunking::new(size(4, 6), size(4, 6))?;
    assert_eq!(chunking.blocks_per_example(), 1);
    let blocks = chunking.chunk(&x)?;
    assert!(tensors_equal(&blocks, &x)?);
    Ok(())
}

#[test]
fn test_five_by_five_with_two_by_two_blocks_fails() {
    assert!(matches!(
        TensorChunking::new(size(5, 5), size(2, 2)),
        Err(Error::BlockSizeMismatch { .. })
    ));
}

#[test]
fn test_gradient_reaches_every_input_element() -> mdrnn::Result<()> {
    init_logging();
    let x = counting((2, 2, 4, 6))?.set_variable();
    let chunking = TensorChunking::new(size(4, 6), size(2, 2))?;
    let back = chunking.dechunk(&chunking.chunk(&x)?)?;
    // weight by position so a misrouted gradient would show
    let weights = counting((2, 2, 4, 6))?;
    let grads = back.mul(&weights)?.sum_all()?.backward()?;
    let gx = grads.get(&x).unwrap();
    assert_eq!(count_non_zeros(gx)?, x.elem_count());
    assert_eq!(gx.to_f64_vec()?, weights.to_f64_vec()?);
    Ok(())
}

#[test]
fn test_dechunk_after_channel_change() -> mdrnn::Result<()> {
    let x = counting((2, 3, 4, 4))?;
    let chunking = TensorChunking::new(size(4, 4), size(2, 2))?;
    let blocks = chunking.chunk(&x)?;
    // keep two of three channels, as a layer with fewer outputs would
    let reduced = blocks.narrow(1, 0, 2)?;
    let back = chunking.dechunk(&reduced)?;
    assert!(tensors_equal(&back, &x.narrow(1, 0, 2)?)?);
    Ok(())
}

// List chunking

#[test]
fn test_list_round_trip() -> mdrnn::Result<()> {
    init_logging();
    let examples = vec![
        counting((1, 2, 4, 6))?.squeeze(0)?,
        counting((1, 2, 2, 4))?.squeeze(0)?,
        counting((1, 2, 6, 2))?.squeeze(0)?,
    ];
    for block in [size(1, 1), size(2, 2)] {
        let chunking = TensorListChunking::from_tensors(&examples, block)?;
        let blocks = chunking.chunk(&examples)?;
        assert_eq!(blocks.dims()[0], chunking.total_blocks());
        let back = chunking.dechunk(&blocks)?;
        assert!(tensor_lists_equal(&back, &examples)?);
    }
    Ok(())
}

#[test]
fn test_list_gradient_flow() -> mdrnn::Result<()> {
    let a = counting((1, 1, 2, 4))?.squeeze(0)?.set_variable();
    let b = counting((1, 1, 4, 2))?.squeeze(0)?.set_variable();
    let examples = vec![a.clone(), b.clone()];
    let chunking = TensorListChunking::from_tensors(&examples, size(2, 2))?;
    let back = chunking.dechunk(&chunking.chunk(&examples)?)?;
    let loss = back[0].sum_all()?.add(&back[1].square()?.sum_all()?)?;
    let grads = loss.backward()?;
    assert_eq!(grads.get(&a).unwrap().to_f64_vec()?, vec![1.0; 8]);
    let expected_b: Vec<f64> = (1..=8).map(|v| 2.0 * v as f64).collect();
    assert_eq!(grads.get(&b).unwrap().to_f64_vec()?, expected_b);
    Ok(())
}

// Skewing

#[test]
fn test_skew_shapes_and_round_trip() -> mdrnn::Result<()> {
    for (h, w) in [(1, 5), (3, 3), (4, 6), (6, 2)] {
        let x = counting((2, 2, h, w))?;
        let skewed = skew(&x)?;
        assert_eq!(skewed.dims(), &[2, 2, h, w + h - 1]);
        assert!(tensors_equal(&unskew_map(&skewed, h, w)?, &x)?);
    }
    Ok(())
}

#[test]
fn test_skew_gradient_is_identity() -> mdrnn::Result<()> {
    let x = counting((1, 1, 3, 4))?.set_variable();
    let loss = unskew_map(&skew(&x)?, 3, 4)?.sum_all()?;
    let grads = loss.backward()?;
    assert_eq!(grads.get(&x).unwrap().to_f64_vec()?, vec![1.0; 12]);
    Ok(())
}

// Property tests: chunking and skewing are lossless for any divisible size

use mdrnn::nn::{tensor_lists_equal, tensors_equal};
use mdrnn::prelude::{
    skew, unskew_map, CpuDevice, CpuTensor, DType, SizeTwoDimensional, TensorChunking,
    TensorListChunking,
};
use proptest::prelude::*;

fn counting(dims: &[usize]) -> CpuTensor {
    let n: usize = dims.iter().product();
    let data: Vec<f64> = (0..n).map(|v| v as f64).collect();
    CpuTensor::from_f64_slice(&data, dims.to_vec(), DType::F64, &CpuDevice).unwrap()
}

fn size(h: usize, w: usize) -> SizeTwoDimensional {
    SizeTwoDimensional::new(h, w).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_uniform_chunk_round_trip(
        n in 1usize..3,
        c in 1usize..3,
        bh in 1usize..4,
        bw in 1usize..4,
        rows in 1usize..4,
        cols in 1usize..4,
    ) {
        let (h, w) = (bh * rows, bw * cols);
        let x = counting(&[n, c, h, w]);
        let chunking = TensorChunking::new(size(h, w), size(bh, bw)).unwrap();
        let blocks = chunking.chunk(&x).unwrap();
        prop_assert_eq!(blocks.dims(), &[rows * cols * n, c, bh, bw]);
        let back = chunking.dechunk(&blocks).unwrap();
        prop_assert!(tensors_equal(&back, &x).unwrap());
    }

    #[test]
    fn prop_list_chunk_round_trip(
        grids in proptest::collection::vec((1usize..4, 1usize..4), 1..4),
        bh in 1usize..3,
        bw in 1usize..3,
    ) {
        let examples: Vec<CpuTensor> = grids
            .iter()
            .map(|&(r, c)| counting(&[2, r * bh, c * bw]))
            .collect();
        let chunking = TensorListChunking::from_tensors(&examples, size(bh, bw)).unwrap();
        let expected_blocks: usize = grids.iter().map(|&(r, c)| r * c).sum();
        prop_assert_eq!(chunking.total_blocks(), expected_blocks);
        let back = chunking.dechunk(&chunking.chunk(&examples).unwrap()).unwrap();
        prop_assert!(tensor_lists_equal(&back, &examples).unwrap());
    }

    #[test]
    fn prop_skew_round_trip(h in 1usize..6, w in 1usize..6) {
        let x = counting(&[1, 2, h, w]);
        let skewed = skew(&x).unwrap();
        prop_assert_eq!(skewed.dims(), &[1, 2, h, w + h - 1]);
        prop_assert!(tensors_equal(&unskew_map(&skewed, h, w).unwrap(), &x).unwrap());
    }
}

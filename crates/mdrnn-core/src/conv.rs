// im2col / col2im convolution kernels on host f64 buffers
//
// A convolution over one sample becomes a single GEMM:
//
//   columns = im2col(input)      [C_in * kH * kW, H_out * W_out]
//   output  = weight × columns   [C_out, H_out * W_out]
//
// and the input gradient is the transpose product scattered back with
// col2im. The MDLSTM uses two kernel shapes: 1×1 over the whole skewed map
// (input responses) and 2×1 over a state column (unshifted plus shifted
// neighbour), both with stride 1.

/// Everything needed to map between an input sample and its column matrix.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConvGeometry {
    pub c_in: usize,
    pub h: usize,
    pub w: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub h_out: usize,
    pub w_out: usize,
}

impl ConvGeometry {
    /// `None` when the kernel does not fit the padded input.
    pub fn new(
        input: (usize, usize, usize),
        kernel: (usize, usize),
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Option<Self> {
        let (c_in, h, w) = input;
        let (kh, kw) = kernel;
        let [sh, sw] = stride;
        let [ph, pw] = padding;
        if sh == 0 || sw == 0 || h + 2 * ph < kh || w + 2 * pw < kw {
            return None;
        }
        Some(ConvGeometry {
            c_in,
            h,
            w,
            kh,
            kw,
            stride,
            padding,
            h_out: (h + 2 * ph - kh) / sh + 1,
            w_out: (w + 2 * pw - kw) / sw + 1,
        })
    }

    pub fn col_rows(&self) -> usize {
        self.c_in * self.kh * self.kw
    }

    pub fn col_cols(&self) -> usize {
        self.h_out * self.w_out
    }

    pub fn sample_size(&self) -> usize {
        self.c_in * self.h * self.w
    }

    /// Input position read by kernel tap (ki, kj) at output (oh, ow), if it
    /// falls inside the unpadded input.
    #[inline]
    fn source(&self, oh: usize, ow: usize, ki: usize, kj: usize) -> Option<(usize, usize)> {
        let ih = (oh * self.stride[0] + ki).checked_sub(self.padding[0])?;
        let iw = (ow * self.stride[1] + kj).checked_sub(self.padding[1])?;
        (ih < self.h && iw < self.w).then_some((ih, iw))
    }

    /// Unroll one `[C_in, H, W]` sample into `columns`.
    pub fn im2col(&self, input: &[f64], columns: &mut [f64]) {
        let cols = self.col_cols();
        for ci in 0..self.c_in {
            for ki in 0..self.kh {
                for kj in 0..self.kw {
                    let row = ((ci * self.kh + ki) * self.kw + kj) * cols;
                    for oh in 0..self.h_out {
                        for ow in 0..self.w_out {
                            columns[row + oh * self.w_out + ow] = match self.source(oh, ow, ki, kj)
                            {
                                Some((ih, iw)) => input[(ci * self.h + ih) * self.w + iw],
                                None => 0.0,
                            };
                        }
                    }
                }
            }
        }
    }

    /// Scatter-add `columns` back into one `[C_in, H, W]` sample.
    pub fn col2im(&self, columns: &[f64], output: &mut [f64]) {
        let cols = self.col_cols();
        for ci in 0..self.c_in {
            for ki in 0..self.kh {
                for kj in 0..self.kw {
                    let row = ((ci * self.kh + ki) * self.kw + kj) * cols;
                    for oh in 0..self.h_out {
                        for ow in 0..self.w_out {
                            if let Some((ih, iw)) = self.source(oh, ow, ki, kj) {
                                output[(ci * self.h + ih) * self.w + iw] +=
                                    columns[row + oh * self.w_out + ow];
                            }
                        }
                    }
                }
            }
        }
    }
}

/// C += A × B with A: [m, k], B: [k, n], all row-major.
pub(crate) fn gemm(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        for p in 0..k {
            let a_val = a[i * k + p];
            if a_val == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            for (c_val, &b_val) in c[i * n..(i + 1) * n].iter_mut().zip(b_row) {
                *c_val += a_val * b_val;
            }
        }
    }
}

/// C += Aᵀ × B with A: [k, m], B: [k, n].
pub(crate) fn gemm_at_b(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for p in 0..k {
        let b_row = &b[p * n..(p + 1) * n];
        for i in 0..m {
            let a_val = a[p * m + i];
            for (c_val, &b_val) in c[i * n..(i + 1) * n].iter_mut().zip(b_row) {
                *c_val += a_val * b_val;
            }
        }
    }
}

/// C += A × Bᵀ with A: [m, k], B: [n, k].
pub(crate) fn gemm_a_bt(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let b_row = &b[j * k..(j + 1) * k];
            c[i * n + j] += a_row.iter().zip(b_row).map(|(x, y)| x * y).sum::<f64>();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertical_pair_geometry() {
        // a 2x1 kernel over a height-3 column, padded by one row on each side
        let g = ConvGeometry::new((1, 3, 1), (2, 1), [1, 1], [1, 0]).unwrap();
        assert_eq!((g.h_out, g.w_out), (4, 1));
        let mut columns = vec![0.0; g.col_rows() * g.col_cols()];
        g.im2col(&[1.0, 2.0, 3.0], &mut columns);
        // tap 0 sees the row above, tap 1 the row itself
        assert_eq!(columns, vec![0.0, 1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_col2im_accumulates_overlaps() {
        let g = ConvGeometry::new((1, 3, 1), (2, 1), [1, 1], [1, 0]).unwrap();
        let columns = vec![1.0; g.col_rows() * g.col_cols()];
        let mut out = vec![0.0; g.sample_size()];
        g.col2im(&columns, &mut out);
        assert_eq!(out, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_kernel_larger_than_input() {
        assert!(ConvGeometry::new((1, 2, 2), (3, 3), [1, 1], [0, 0]).is_none());
    }

    #[test]
    fn test_gemm_variants_agree() {
        // A = [[1, 2], [3, 4]], B = [[5, 6], [7, 8]]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [0.0; 4];
        gemm(&a, &b, &mut c, 2, 2, 2);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);

        let at = [1.0, 3.0, 2.0, 4.0];
        let mut c2 = [0.0; 4];
        gemm_at_b(&at, &b, &mut c2, 2, 2, 2);
        assert_eq!(c2, c);

        let bt = [5.0, 7.0, 6.0, 8.0];
        let mut c3 = [0.0; 4];
        gemm_a_bt(&a, &bt, &mut c3, 2, 2, 2);
        assert_eq!(c3, c);
    }
}

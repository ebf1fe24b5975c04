//! Shared reference implementations and data helpers for integration tests.

#![allow(dead_code)]

use tenjit::einsum::{ContractionConfig, DimType, LoopDim, PrimType};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic values in `[-5, 5)` from a 64-bit LCG.
pub struct TestData {
    state: u64,
}

impl TestData {
    pub fn new(seed: u64) -> Self {
        Self { state: seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407) }
    }

    pub fn next_f32(&mut self) -> f32 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let unit = (self.state >> 40) as f32 / (1u64 << 24) as f32;
        10.0 * unit - 5.0
    }

    pub fn vec(&mut self, len: usize) -> Vec<f32> {
        (0..len).map(|_| self.next_f32()).collect()
    }
}

/// `C += sum_b A_b * B_b` with column-major operands and element strides.
#[allow(clippy::too_many_arguments)]
pub fn reference_brgemm(
    m: usize,
    n: usize,
    k: usize,
    batch: usize,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    (lda, ldb, ldc, stride_a, stride_b): (usize, usize, usize, usize, usize),
) {
    for br in 0..batch {
        for col in 0..n {
            for row in 0..m {
                let mut acc = 0.0f32;
                for kk in 0..k {
                    acc += a[br * stride_a + kk * lda + row] * b[br * stride_b + col * ldb + kk];
                }
                c[col * ldc + row] += acc;
            }
        }
    }
}

/// Visit every index tuple of `dims`, passing the three operand offsets.
fn for_each_offset(dims: &[LoopDim], mut visit: impl FnMut(&[usize], [usize; 3])) {
    let mut index = vec![0usize; dims.len()];
    let total: usize = dims.iter().map(|d| d.size).product();
    for _ in 0..total {
        let mut offsets = [0usize; 3];
        for (d, &i) in dims.iter().zip(&index) {
            offsets[0] += i * d.stride_in0;
            offsets[1] += i * d.stride_in1;
            offsets[2] += i * d.stride_out;
        }
        visit(&index, offsets);
        for pos in (0..dims.len()).rev() {
            index[pos] += 1;
            if index[pos] < dims[pos].size {
                break;
            }
            index[pos] = 0;
        }
    }
}

/// Scalar evaluation of a contraction, touch kernels included.
pub fn reference_contraction(config: &ContractionConfig, in0: &[f32], in1: &[f32], out: &mut [f32]) {
    let dims = &config.dims;
    match config.main {
        PrimType::Gemm | PrimType::Brgemm => {
            let is_first_k = |index: &[usize]| {
                dims.iter().zip(index).all(|(d, &i)| d.dim_type != DimType::K || i == 0)
            };
            if config.first_touch == PrimType::Zero {
                for_each_offset(dims, |index, [_, _, o]| {
                    if is_first_k(index) {
                        out[o] = 0.0;
                    }
                });
            }
            for_each_offset(dims, |_, [i0, i1, o]| out[o] += in0[i0] * in1[i1]);
            if config.last_touch == PrimType::Relu {
                for_each_offset(dims, |index, [_, _, o]| {
                    if is_first_k(index) {
                        out[o] = out[o].max(0.0);
                    }
                });
            }
        }
        PrimType::Zero => for_each_offset(dims, |_, [_, _, o]| out[o] = 0.0),
        PrimType::Copy | PrimType::Transpose => for_each_offset(dims, |_, [i0, _, o]| out[o] = in0[i0]),
        PrimType::Relu => for_each_offset(dims, |_, [i0, _, o]| out[o] = in0[i0].max(0.0)),
        PrimType::None => {}
    }
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let scale = e.abs().max(1.0);
        assert!((a - e).abs() <= tol * scale, "element {i}: got {a}, expected {e}");
    }
}

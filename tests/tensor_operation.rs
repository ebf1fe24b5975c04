//! End-to-end tests of tensor contractions: setup validation, loop normalization,
//! the loop walker, and (on aarch64) sequential and parallel execution checked
//! against a scalar reference.

mod common;

use tenjit::einsum::{
    ContractionConfig, DType, DimType, DimType::*, ExecType, ExecType::*, KernelInvocation, LeadingDims, LoopDim,
    OptimizeOptions, PrimIds, PrimType, TensorOperation,
};
use tenjit::JitError;

/// `C[m, n] = sum_k A[m, k] * B[k, n]`, 128 x 96 x 80, column-major, loops in an
/// arbitrary order and none marked primitive.
fn unnormalized_gemm() -> ContractionConfig {
    ContractionConfig::new(
        PrimType::Gemm,
        vec![
            LoopDim::new(N, Seq, 96, [0, 80, 128]),
            LoopDim::new(K, Seq, 80, [128, 1, 0]),
            LoopDim::new(M, Seq, 128, [1, 0, 1]),
        ],
    )
}

/// Blocked batch-reduce contraction: outer M and N blocks, an 8-way reduction over
/// 32 x 32 x 32 blocks.
fn blocked_brgemm(first_exec: ExecType) -> ContractionConfig {
    ContractionConfig::new(
        PrimType::Brgemm,
        vec![
            LoopDim::new(M, first_exec, 4, [8192, 0, 4096]),
            LoopDim::new(N, Seq, 4, [0, 8192, 1024]),
            LoopDim::new(K, Prim, 8, [1024, 1024, 0]),
            LoopDim::new(M, Prim, 32, [1, 0, 1]),
            LoopDim::new(N, Prim, 32, [0, 32, 32]),
            LoopDim::new(K, Prim, 32, [32, 1, 0]),
        ],
    )
}

fn expect_bad(result: Result<impl std::fmt::Debug, JitError>) {
    match result {
        Err(JitError::BadParameter { .. }) => {}
        other => panic!("expected BadParameter, got {other:?}"),
    }
}

#[test]
fn test_optimize_then_setup() {
    common::init_logging();

    let mut config = unnormalized_gemm();
    expect_bad(TensorOperation::setup(config.clone()));

    config.optimize(OptimizeOptions::default()).unwrap();
    let kinds: Vec<(DimType, ExecType, usize)> =
        config.dims.iter().map(|d| (d.dim_type, d.exec_type, d.size)).collect();
    assert_eq!(kinds, vec![(M, Seq, 2), (K, Seq, 2), (M, Prim, 64), (N, Prim, 96), (K, Prim, 40)]);

    let op = TensorOperation::setup(config).unwrap();
    assert_eq!(op.prim_ids(), PrimIds { m: 2, n: 3, k: Some(4), batch: None });
    assert_eq!(op.leading_dims(), LeadingDims { lda: 128, ldb: 80, ldc: 128, ..Default::default() });

    let compiled = op.compile().unwrap();
    assert_eq!(compiled.operand_extents(), [128 * 80, 80 * 96, 128 * 96]);
    assert_eq!(compiled.kernels().len(), 1);
}

#[test]
fn test_optimize_keeps_canonical_loops() {
    let config = ContractionConfig::new(
        PrimType::Gemm,
        vec![
            LoopDim::new(M, Prim, 16, [1, 0, 1]),
            LoopDim::new(N, Prim, 4, [0, 8, 16]),
            LoopDim::new(K, Prim, 8, [16, 1, 0]),
        ],
    );
    let mut op = TensorOperation::setup(config.clone()).unwrap();
    op.optimize(OptimizeOptions { parallel: true }).unwrap();
    assert_eq!(op.config().dims, config.dims);

    let mut transpose = TensorOperation::setup(ContractionConfig::new(
        PrimType::Transpose,
        vec![LoopDim::new(M, Prim, 4, [1, 0, 6]), LoopDim::new(N, Prim, 6, [4, 0, 1])],
    ))
    .unwrap();
    let before = transpose.config().dims.clone();
    transpose.optimize(OptimizeOptions::default()).unwrap();
    assert_eq!(transpose.config().dims, before);
    assert_eq!(transpose.leading_dims(), LeadingDims { lda: 4, ldc: 6, ..Default::default() });
}

#[test]
fn test_walker_narrows_touch_flags() {
    let mut config = unnormalized_gemm().with_first_touch(PrimType::Zero).with_last_touch(PrimType::Relu);
    config.optimize(OptimizeOptions { parallel: true }).unwrap();
    assert_eq!(config.dims[0].exec_type, Shared);
    assert_eq!(config.dims[0].dim_type, M);

    let compiled = TensorOperation::setup(config).unwrap().compile().unwrap();
    assert_eq!(compiled.kernels().len(), 3);
    assert_eq!(compiled.stats().kernels_generated, 3);

    let mut seen = Vec::new();
    compiled.walk(|inv| seen.push(inv));
    let expected = [(0, 0, true, false), (5120, 0, false, true), (64, 64, true, false), (5184, 64, false, true)];
    assert_eq!(seen.len(), expected.len());
    for (inv, &(in0, out, first, last)) in seen.iter().zip(&expected) {
        assert_eq!((inv.in0, inv.out, inv.first, inv.last), (in0, out, first, last), "{inv:?}");
    }
}

#[test]
fn test_walker_visits_every_block_once() {
    let compiled = TensorOperation::setup(blocked_brgemm(Seq)).unwrap().compile().unwrap();
    let mut outs: Vec<usize> = Vec::new();
    compiled.walk(|inv: KernelInvocation| {
        assert!(inv.first && inv.last);
        outs.push(inv.out);
    });
    outs.sort_unstable();
    let mut expected: Vec<usize> = (0..4).flat_map(|m| (0..4).map(move |n| m * 4096 + n * 1024)).collect();
    expected.sort_unstable();
    assert_eq!(outs, expected);
}

/// `C[m1, m0, n1, n0] = sum_{k1, k0} A[m1, k1, k0, m0] * B[n1, k1, n0, k0]`: 32 x 32 blocks
/// over a 32 x 32 x 8 block grid, the outer K loop reducing around a GEMM main kernel.
fn blocked_gemm() -> TensorOperation {
    TensorOperation::setup_from_arrays(
        DType::F32,
        PrimType::None,
        PrimType::Gemm,
        PrimType::None,
        &[M, N, K, M, N, K],
        &[Seq, Seq, Seq, Prim, Prim, Prim],
        &[32, 32, 8, 32, 32, 32],
        &[8192, 0, 1024, 1, 0, 32],
        &[0, 8192, 1024, 0, 32, 1],
        &[32768, 1024, 0, 1, 32, 0],
    )
    .unwrap()
}

#[test]
fn test_blocked_gemm_walk_matches_loop_nest() {
    let op = blocked_gemm();
    assert_eq!(op.prim_ids(), PrimIds { m: 3, n: 4, k: Some(5), batch: None });
    assert_eq!(op.leading_dims(), LeadingDims { lda: 32, ldb: 32, ldc: 32, ..Default::default() });

    let compiled = op.compile().unwrap();
    assert_eq!(compiled.operand_extents(), [32 * 32 * 8 * 32, 32 * 32 * 8 * 32, 1024 * 1024]);

    let mut seen = Vec::new();
    compiled.walk(|inv| seen.push(inv));
    let mut expected = Vec::with_capacity(8192);
    for m in 0..32 {
        for n in 0..32 {
            for k in 0..8 {
                expected.push(KernelInvocation {
                    in0: m * 8192 + k * 1024,
                    in1: n * 8192 + k * 1024,
                    out: m * 32768 + n * 1024,
                    first: k == 0,
                    last: k == 7,
                });
            }
        }
    }
    assert_eq!(seen.len(), 8192);
    assert_eq!(seen, expected);
}

#[test]
fn test_parallel_walk_covers_sequential_walk() {
    // A is 24 x 16 (lda 24), B is 16 x 8 (ldb 16), C is 24 x 8 (ldc 24).
    let config = ContractionConfig::new(
        PrimType::Gemm,
        vec![
            LoopDim::new(M, Shared, 3, [8, 0, 8]),
            LoopDim::new(N, Shared, 2, [0, 64, 96]),
            LoopDim::new(K, Seq, 2, [192, 8, 0]),
            LoopDim::new(M, Prim, 8, [1, 0, 1]),
            LoopDim::new(N, Prim, 4, [0, 16, 24]),
            LoopDim::new(K, Prim, 8, [24, 1, 0]),
        ],
    )
    .with_first_touch(PrimType::Zero);
    let compiled = TensorOperation::setup(config).unwrap().compile().unwrap();

    let key = |inv: &KernelInvocation| (inv.in0, inv.in1, inv.out, inv.first, inv.last);
    let mut sequential = Vec::new();
    compiled.walk(|inv| sequential.push(key(&inv)));
    let parallel = std::sync::Mutex::new(Vec::new());
    compiled.walk_parallel(|inv| parallel.lock().unwrap().push(key(&inv)));
    let mut parallel = parallel.into_inner().unwrap();

    assert_eq!(sequential.len(), 12);
    sequential.sort_unstable();
    parallel.sort_unstable();
    assert_eq!(parallel, sequential);
    assert_eq!(parallel.iter().filter(|t| t.3).count(), 6);
    assert_eq!(parallel.iter().filter(|t| t.4).count(), 6);
}

#[test]
fn test_setup_rejections() {
    let types = [M, N, K];
    let execs = [Prim, Prim, Prim];
    let gemm = |sizes: &[i64], in0: &[i64], in1: &[i64], out: &[i64]| {
        TensorOperation::setup_from_arrays(
            DType::F32,
            PrimType::None,
            PrimType::Gemm,
            PrimType::None,
            &types,
            &execs,
            sizes,
            in0,
            in1,
            out,
        )
    };
    assert!(gemm(&[16, 4, 8], &[1, 0, 16], &[0, 8, 1], &[1, 16, 0]).is_ok());
    // Length mismatch, negative stride, non-unit M stride, K loop writing the output.
    expect_bad(gemm(&[16, 4], &[1, 0, 16], &[0, 8, 1], &[1, 16, 0]));
    expect_bad(gemm(&[16, 4, 8], &[1, 0, -16], &[0, 8, 1], &[1, 16, 0]));
    expect_bad(gemm(&[16, 4, 8], &[2, 0, 32], &[0, 8, 1], &[1, 16, 0]));
    expect_bad(gemm(&[16, 4, 8], &[1, 0, 16], &[0, 8, 1], &[1, 16, 4]));
    expect_bad(gemm(&[16, 0, 8], &[1, 0, 16], &[0, 8, 1], &[1, 16, 0]));

    let base = blocked_brgemm(Seq);

    let mut shared_k = base.clone();
    shared_k.dims.insert(0, LoopDim::new(K, Shared, 2, [32768, 32768, 0]));
    expect_bad(TensorOperation::setup(shared_k));

    let mut late_shared = base.clone();
    late_shared.dims[1].exec_type = Shared;
    expect_bad(TensorOperation::setup(late_shared));

    let mut gap = base.clone();
    gap.dims.swap(1, 2);
    expect_bad(TensorOperation::setup(gap));

    let gemm_with_batch = ContractionConfig { main: PrimType::Gemm, ..base.clone() };
    expect_bad(TensorOperation::setup(gemm_with_batch));

    let wide = ContractionConfig { dtype: DType::F64, ..base.clone() };
    expect_bad(TensorOperation::setup(wide));

    let no_main = ContractionConfig { main: PrimType::None, ..base.clone() };
    expect_bad(TensorOperation::setup(no_main));

    let gemm_touch = base.clone().with_last_touch(PrimType::Gemm);
    expect_bad(TensorOperation::setup(gemm_touch));

    let relu_with_touch = ContractionConfig::new(
        PrimType::Relu,
        vec![LoopDim::new(M, Prim, 8, [1, 0, 1]), LoopDim::new(N, Prim, 8, [8, 0, 8])],
    )
    .with_first_touch(PrimType::Zero);
    expect_bad(TensorOperation::setup(relu_with_touch));
}

#[test]
fn test_parallel_rejects_overlapping_output() {
    let config = ContractionConfig::new(
        PrimType::Gemm,
        vec![
            LoopDim::new(M, Shared, 2, [64, 0, 16]),
            LoopDim::new(M, Prim, 32, [1, 0, 1]),
            LoopDim::new(N, Prim, 4, [0, 8, 128]),
            LoopDim::new(K, Prim, 8, [128, 1, 0]),
        ],
    );
    let compiled = TensorOperation::setup(config).unwrap().compile().unwrap();
    let [e0, e1, e2] = compiled.operand_extents();
    let (a, b, mut c) = (vec![0.0; e0], vec![0.0; e1], vec![0.0; e2]);
    expect_bad(compiled.execute_parallel(&a, &b, &mut c));
}

#[test]
fn test_execute_checks_operand_sizes() {
    let compiled = TensorOperation::setup(blocked_brgemm(Shared)).unwrap().compile().unwrap();
    let [e0, e1, e2] = compiled.operand_extents();
    assert_eq!([e0, e1, e2], [32768, 32768, 16384]);
    let (a, b) = (vec![0.0; e0], vec![0.0; e1]);
    let mut short = vec![0.0; e2 - 1];
    expect_bad(compiled.execute(&a, &b, &mut short));
    expect_bad(compiled.execute_parallel(&a, &b[1..], &mut vec![0.0; e2]));
}

#[cfg(not(target_arch = "aarch64"))]
#[test]
fn test_execute_reports_foreign_host() {
    let compiled = TensorOperation::setup(blocked_brgemm(Shared)).unwrap().compile().unwrap();
    let [e0, e1, e2] = compiled.operand_extents();
    let (a, b, mut c) = (vec![1.0; e0], vec![1.0; e1], vec![1.0; e2]);
    let err = compiled.execute(&a, &b, &mut c).unwrap_err();
    assert!(matches!(err, JitError::UnsupportedHost { .. }));
    assert!(c.iter().all(|&v| v == 1.0));
}

#[cfg(target_arch = "aarch64")]
mod execution {
    use super::common::{assert_close, reference_contraction, TestData};
    use super::*;
    use tenjit::einsum::MainKernel;
    use tenjit::generator::GemmStrides;

    fn run_against_reference(config: ContractionConfig, seed: u64) {
        let reference_config = config.clone();
        let compiled = TensorOperation::setup(config).unwrap().compile().unwrap();
        let [e0, e1, e2] = compiled.operand_extents();
        let mut data = TestData::new(seed);
        let (a, b, c0) = (data.vec(e0), data.vec(e1), data.vec(e2));

        let mut expected = c0.clone();
        reference_contraction(&reference_config, &a, &b, &mut expected);

        let mut sequential = c0.clone();
        compiled.execute(&a, &b, &mut sequential).unwrap();
        assert_close(&sequential, &expected, 1e-4);

        let mut parallel = c0.clone();
        compiled.execute_parallel(&a, &b, &mut parallel).unwrap();
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_blocked_brgemm() {
        super::common::init_logging();
        run_against_reference(blocked_brgemm(Seq), 1);
        run_against_reference(blocked_brgemm(Shared), 2);
    }

    #[test]
    fn test_blocked_gemm_matches_loop_nest() {
        let config = blocked_gemm().config().clone();
        run_against_reference(config, 8);
    }

    #[test]
    fn test_primitive_only_execute_matches_kernel() {
        // A is 20 x 9 (lda 24), B is 9 x 12 (ldb 40), C is 20 x 12 (ldc 24).
        let config = ContractionConfig::new(
            PrimType::Gemm,
            vec![
                LoopDim::new(M, Prim, 20, [1, 0, 1]),
                LoopDim::new(N, Prim, 12, [0, 40, 24]),
                LoopDim::new(K, Prim, 9, [24, 1, 0]),
            ],
        );
        let compiled = TensorOperation::setup(config).unwrap().compile().unwrap();
        let ld = compiled.leading_dims();
        assert_eq!(ld, LeadingDims { lda: 24, ldb: 40, ldc: 24, ..Default::default() });
        let MainKernel::Gemm(kernel) = compiled.main_kernel() else {
            panic!("expected a GEMM main kernel");
        };

        let [e0, e1, e2] = compiled.operand_extents();
        let mut data = TestData::new(9);
        let (a, b, c0) = (data.vec(e0), data.vec(e1), data.vec(e2));
        let mut via_executor = c0.clone();
        compiled.execute(&a, &b, &mut via_executor).unwrap();

        let strides = GemmStrides { lda: ld.lda, ldb: ld.ldb, ldc: ld.ldc, batch_stride_a: 0, batch_stride_b: 0 };
        let mut direct = c0;
        kernel.run(&a, &b, &mut direct, strides).unwrap();
        assert_eq!(via_executor, direct);
    }

    #[test]
    fn test_touches_around_sequential_reduction() {
        let mut config = blocked_brgemm(Shared).with_first_touch(PrimType::Zero).with_last_touch(PrimType::Relu);
        // Turn the batch-reduce loop into a sequential reduction around a plain GEMM.
        config.main = PrimType::Gemm;
        config.dims[2].exec_type = Seq;
        run_against_reference(config, 3);
    }

    #[test]
    fn test_normalized_gemm_matches_original_loops() {
        let original = unnormalized_gemm().with_first_touch(PrimType::Zero);
        let mut config = original.clone();
        config.optimize(OptimizeOptions { parallel: true }).unwrap();
        let compiled = TensorOperation::setup(config).unwrap().compile().unwrap();

        let mut data = TestData::new(4);
        let (a, b) = (data.vec(128 * 80), data.vec(80 * 96));
        let mut expected = data.vec(128 * 96);
        let mut actual = expected.clone();
        reference_contraction(&original, &a, &b, &mut expected);
        compiled.execute_parallel(&a, &b, &mut actual).unwrap();
        assert_close(&actual, &expected, 1e-4);
    }

    #[test]
    fn test_batched_transpose() {
        let config = ContractionConfig::new(
            PrimType::Transpose,
            vec![
                LoopDim::new(C, Shared, 3, [192, 0, 320]),
                LoopDim::new(M, Prim, 16, [1, 0, 20]),
                LoopDim::new(N, Prim, 12, [16, 0, 1]),
            ],
        );
        run_against_reference(config, 5);
    }

    #[test]
    fn test_unary_mains() {
        let relu = ContractionConfig::new(
            PrimType::Relu,
            vec![
                LoopDim::new(N, Shared, 3, [40, 0, 36]),
                LoopDim::new(M, Prim, 17, [1, 0, 1]),
                LoopDim::new(N, Prim, 2, [20, 0, 18]),
            ],
        );
        run_against_reference(relu, 6);

        let copy = ContractionConfig::new(
            PrimType::Copy,
            vec![LoopDim::new(M, Prim, 9, [1, 0, 1]), LoopDim::new(N, Prim, 7, [11, 0, 9])],
        );
        run_against_reference(copy, 7);

        let zero = ContractionConfig::new(
            PrimType::Zero,
            vec![LoopDim::new(M, Prim, 17, [0, 0, 1]), LoopDim::new(N, Prim, 5, [0, 0, 18])],
        );
        let compiled = TensorOperation::setup(zero).unwrap().compile().unwrap();
        assert_eq!(compiled.operand_extents(), [0, 0, 4 * 18 + 17]);
        let mut out = vec![3.0f32; 4 * 18 + 17];
        compiled.execute(&[], &[], &mut out).unwrap();
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, if i % 18 < 17 { 0.0 } else { 3.0 });
        }
    }
}

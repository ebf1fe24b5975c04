// This module implements the batch-reduce GEMM microkernel generator. A generated kernel computes
// C += sum_b A_b * B_b for column-major single precision matrices, with A_b = A + b * stride_a
// and B_b = B + b * stride_b, all strides given in elements. Emission follows a fixed shape: a
// prologue saving d8..d15, staging that copies the argument pointers into working registers and
// converts the strides to bytes, then four size-specialized blocks for {full M tiles, M
// remainder} x {full N blocks, N remainder}. Each block nests counted loops N -> M -> batch -> K
// around the microkernel body, which loads one A column into vector registers, one B scalar per
// output column, and issues one fused multiply-add by element per A register into accumulators
// that stay resident for the whole reduction. Pointer bookkeeping between iterations is done
// with plain register arithmetic; branch targets are resolved by the label assembler.

//! Batch-reduce GEMM kernel generator.

use crate::aarch64::encoder as enc;
use crate::aarch64::{FpSize, Gpr, IndexMode, Shift, VReg, VecArrangement};
use crate::core::{AssembledCode, CodeAssembler, ExecutableBuffer, GenerationStats, JitError, JitResult};

use super::columns::{load_column, store_column};
use super::tiling::{choose_gemm_tile, GemmTiling, TileShape};
use super::{ensure_native_host, span_elements, stride_arg, DType, GeneratedKernel, MAX_LOOP_TRIPS};

/// Calling convention of generated GEMM/BRGEMM kernels:
/// `(a, b, c, lda, ldb, ldc, batch_stride_a, batch_stride_b)`, strides in elements.
pub type GemmFn = unsafe extern "C" fn(*const f32, *const f32, *mut f32, i64, i64, i64, i64, i64);

/// Register plan of the generated kernel.
mod plan {
    use crate::aarch64::Gpr;

    // Argument registers. x0/x1 become the running A/B pointers after staging.
    pub const ARG_A: Gpr = Gpr::x(0);
    pub const ARG_B: Gpr = Gpr::x(1);
    pub const ARG_C: Gpr = Gpr::x(2);
    pub const LDA: Gpr = Gpr::x(3);
    pub const LDB: Gpr = Gpr::x(4);
    pub const LDC: Gpr = Gpr::x(5);
    pub const BATCH_A: Gpr = Gpr::x(6);
    pub const BATCH_B: Gpr = Gpr::x(7);

    pub const RUN_A: Gpr = ARG_A;
    pub const RUN_B: Gpr = ARG_B;

    pub const TILE_A: Gpr = Gpr::x(8);
    pub const BLOCK_B: Gpr = Gpr::x(9);
    pub const TILE_C: Gpr = Gpr::x(10);

    pub const N_COUNT: Gpr = Gpr::x(11);
    pub const M_COUNT: Gpr = Gpr::x(12);
    pub const BATCH_COUNT: Gpr = Gpr::x(13);
    pub const K_COUNT: Gpr = Gpr::x(14);

    pub const WALK: Gpr = Gpr::x(15);
    pub const LANE: Gpr = Gpr::x(16);
    pub const SCRATCH: Gpr = Gpr::x(17);
}

use plan::*;

const ELEM_BYTES: i64 = 4;

/// Problem shape of a GEMM/BRGEMM kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrgemmShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// Number of (A, B) pairs reduced into C; 1 for a plain GEMM.
    pub batch: usize,
    pub trans_a: bool,
    pub trans_b: bool,
    pub trans_c: bool,
    pub dtype: DType,
}

impl BrgemmShape {
    /// Plain single precision GEMM.
    pub const fn gemm(m: usize, n: usize, k: usize) -> Self {
        Self::brgemm(m, n, k, 1)
    }

    /// Single precision batch-reduce GEMM.
    pub const fn brgemm(m: usize, n: usize, k: usize, batch: usize) -> Self {
        Self { m, n, k, batch, trans_a: false, trans_b: false, trans_c: false, dtype: DType::F32 }
    }

    fn validate(&self) -> JitResult<()> {
        if self.trans_a || self.trans_b || self.trans_c {
            return Err(JitError::bad_parameter("transposed GEMM operands are not supported"));
        }
        if self.dtype != DType::F32 {
            return Err(JitError::bad_parameter(format!("GEMM dtype {:?} is not supported", self.dtype)));
        }
        for (name, value) in [("m", self.m), ("n", self.n), ("k", self.k), ("batch", self.batch)] {
            if value == 0 || value > MAX_LOOP_TRIPS {
                return Err(JitError::bad_parameter(format!("GEMM size {name} = {value} is out of range")));
            }
        }
        Ok(())
    }
}

/// Runtime strides of a GEMM call, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmStrides {
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub batch_stride_a: usize,
    pub batch_stride_b: usize,
}

impl GemmStrides {
    /// Densely packed operands: A is `m x k` per batch, B is `k x n` per batch.
    pub const fn packed(shape: &BrgemmShape) -> Self {
        Self {
            lda: shape.m,
            ldb: shape.k,
            ldc: shape.m,
            batch_stride_a: shape.m * shape.k,
            batch_stride_b: shape.k * shape.n,
        }
    }
}

/// A generated GEMM/BRGEMM kernel.
pub struct GemmKernel {
    shape: BrgemmShape,
    tiling: GemmTiling,
    code: ExecutableBuffer,
    entry: GemmFn,
}

impl std::fmt::Debug for GemmKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GemmKernel")
            .field("shape", &self.shape)
            .field("tiling", &self.tiling)
            .field("code", &self.code)
            .finish()
    }
}

impl GemmKernel {
    pub fn shape(&self) -> &BrgemmShape {
        &self.shape
    }

    pub fn tiling(&self) -> &GemmTiling {
        &self.tiling
    }

    /// Raw entry point.
    pub fn entry(&self) -> GemmFn {
        self.entry
    }

    /// Invoke the kernel on raw pointers.
    ///
    /// # Safety
    /// Must run on an aarch64 host. Every element addressed through the pointers and
    /// strides for the kernel's shape must be valid: A for reads, B for reads, C for
    /// reads and writes, and C must not overlap A or B.
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub unsafe fn call(
        &self,
        a: *const f32,
        b: *const f32,
        c: *mut f32,
        lda: i64,
        ldb: i64,
        ldc: i64,
        batch_stride_a: i64,
        batch_stride_b: i64,
    ) {
        (self.entry)(a, b, c, lda, ldb, ldc, batch_stride_a, batch_stride_b)
    }

    /// Run the kernel on slices after checking that every addressed element is in bounds.
    pub fn run(&self, a: &[f32], b: &[f32], c: &mut [f32], strides: GemmStrides) -> JitResult<()> {
        let s = &self.shape;
        if strides.lda < s.m || strides.ldb < s.k || strides.ldc < s.m {
            return Err(JitError::bad_parameter(format!(
                "leading dimensions {strides:?} too small for {}x{}x{}",
                s.m, s.n, s.k
            )));
        }
        let need_a = span_elements(s.m, &[(s.k, strides.lda), (s.batch, strides.batch_stride_a)]);
        let need_b = span_elements(s.k, &[(s.n, strides.ldb), (s.batch, strides.batch_stride_b)]);
        let need_c = span_elements(s.m, &[(s.n, strides.ldc)]);
        for (name, need, have) in [("A", need_a, a.len()), ("B", need_b, b.len()), ("C", need_c, c.len())] {
            match need {
                Some(need) if need <= have => {}
                _ => {
                    return Err(JitError::bad_parameter(format!(
                        "operand {name} holds {have} elements, kernel addresses {need:?}"
                    )))
                }
            }
        }
        ensure_native_host()?;

        let lda = stride_arg("lda", strides.lda)?;
        let ldb = stride_arg("ldb", strides.ldb)?;
        let ldc = stride_arg("ldc", strides.ldc)?;
        let sa = stride_arg("batch_stride_a", strides.batch_stride_a)?;
        let sb = stride_arg("batch_stride_b", strides.batch_stride_b)?;
        // SAFETY: extents checked above, the host is aarch64, and `c` is a unique borrow.
        unsafe { self.call(a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), lda, ldb, ldc, sa, sb) };
        Ok(())
    }
}

impl GeneratedKernel for GemmKernel {
    fn family(&self) -> &'static str {
        if self.shape.batch > 1 {
            "brgemm"
        } else {
            "gemm"
        }
    }

    fn buffer(&self) -> &ExecutableBuffer {
        &self.code
    }

    fn symbol_name(&self) -> String {
        let s = &self.shape;
        format!("{}_{}x{}x{}_br{}", self.family(), s.m, s.n, s.k, s.batch)
    }
}

/// Generator of GEMM/BRGEMM kernels.
#[derive(Debug, Default)]
pub struct BrgemmGenerator {
    stats: GenerationStats,
}

impl BrgemmGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics over every kernel generated so far.
    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    /// Emit and finalize a kernel for `shape`.
    ///
    /// Rejects transposition flags, dtypes other than `F32`, and empty or oversized
    /// extents with [`JitError::BadParameter`] before anything is emitted.
    pub fn generate(&mut self, shape: &BrgemmShape) -> JitResult<GemmKernel> {
        shape.validate()?;
        let tiling = choose_gemm_tile(shape.m, shape.n);

        let mut asm = CodeAssembler::new();
        emit_kernel(&mut asm, shape, &tiling);
        let AssembledCode { mut buffer, labels, fixups } = asm.finish()?;
        buffer.finalize()?;
        let code = AssembledCode { buffer, labels, fixups };

        let family = if shape.batch > 1 { "brgemm" } else { "gemm" };
        self.stats.record(family, &code);
        log::debug!(
            "generated {family} {}x{}x{} batch {}: {} words, {} fixups",
            shape.m,
            shape.n,
            shape.k,
            shape.batch,
            code.buffer.len_words(),
            code.fixups
        );

        // SAFETY: GemmFn matches the calling convention emitted above.
        let entry = unsafe { code.buffer.as_callable::<GemmFn>() }
            .ok_or_else(|| JitError::AllocationFailure { reason: "kernel code was not mapped".to_string() })?;
        Ok(GemmKernel { shape: *shape, tiling, code: code.buffer, entry })
    }
}

fn emit_kernel(asm: &mut CodeAssembler, shape: &BrgemmShape, tiling: &GemmTiling) {
    asm.save_callee_saved_vregs();

    // Staging: working copies of the operand pointers, byte strides.
    asm.emit(enc::mov(TILE_A, ARG_A));
    asm.emit(enc::mov(BLOCK_B, ARG_B));
    asm.emit(enc::mov(TILE_C, ARG_C));
    for reg in [LDA, LDB, LDC, BATCH_A, BATCH_B] {
        asm.emit(enc::lsl_imm(reg, reg, 2));
    }
    if shape.batch > 1 {
        // After a K loop the running pointers sit k columns (A) or k rows (B) past the
        // batch start; fold that rewind into the batch strides once.
        asm.mov_imm(SCRATCH, shape.k as u64);
        asm.emit(enc::mul(LANE, SCRATCH, LDA));
        asm.emit(enc::sub_reg(BATCH_A, BATCH_A, LANE, Shift::Lsl, 0));
        asm.emit(enc::sub_reg(BATCH_B, BATCH_B, SCRATCH, Shift::Lsl, 2));
    }

    let n_blocks = [
        (tiling.big.n, tiling.full_n_blocks(shape.n)),
        (tiling.small.n, usize::from(tiling.small.n > 0)),
    ];
    for (tile_n, blocks) in n_blocks {
        if tile_n == 0 || blocks == 0 {
            continue;
        }
        log::trace!("gemm block: {blocks} x N tile {tile_n}");
        asm.counted_loop(N_COUNT, blocks as u64, |asm| {
            emit_column_block(asm, shape, tiling, tile_n);
        });
    }

    asm.restore_callee_saved_vregs_and_ret();
}

/// All M tiles of one block of `tile_n` output columns, then the move to the next block.
fn emit_column_block(asm: &mut CodeAssembler, shape: &BrgemmShape, tiling: &GemmTiling, tile_n: usize) {
    let full = TileShape::new(tiling.big.m, tile_n);
    // A lone tile leaves TILE_A and TILE_C where they are; so does the remainder tile.
    let looped = if tiling.m_remainder == 0 && tiling.full_m_tiles == 1 { 0 } else { tiling.full_m_tiles };
    asm.counted_loop(M_COUNT, looped as u64, |asm| {
        emit_tile(asm, shape, full, true);
    });
    if tiling.m_remainder > 0 {
        emit_tile(asm, shape, TileShape::new(tiling.m_remainder, tile_n), false);
    } else if looped == 0 {
        emit_tile(asm, shape, full, false);
    }

    let rows_bytes = (looped * tiling.big.m) as i64 * ELEM_BYTES;
    asm.add_const(TILE_A, TILE_A, -rows_bytes, SCRATCH);
    asm.add_const(TILE_C, TILE_C, -rows_bytes, SCRATCH);
    asm.add_scaled(TILE_C, TILE_C, tile_n as u64, LDC, SCRATCH);
    asm.add_scaled(BLOCK_B, BLOCK_B, tile_n as u64, LDB, SCRATCH);
}

/// Register layout of one output tile.
#[derive(Clone, Copy)]
struct TileRegs {
    tile: TileShape,
    col_regs: usize,
}

impl TileRegs {
    fn new(tile: TileShape) -> Self {
        Self { tile, col_regs: tile.regs_per_column() }
    }

    /// First accumulator register of output column `j`.
    fn acc(self, j: usize) -> VReg {
        VReg::new((j * self.col_regs) as u8)
    }

    /// First register of the staged A column.
    fn a(self) -> VReg {
        VReg::new((self.tile.n * self.col_regs) as u8)
    }

    /// Register receiving the B scalar.
    fn b(self) -> VReg {
        VReg::new((self.tile.n * self.col_regs + self.col_regs) as u8)
    }
}

/// One `tile.m x tile.n` output tile: load C, reduce over batch and K, store C. With
/// `advance`, TILE_A and TILE_C then move down to the next tile.
fn emit_tile(asm: &mut CodeAssembler, shape: &BrgemmShape, tile: TileShape, advance: bool) {
    let regs = TileRegs::new(tile);
    log::trace!("gemm tile {}x{} at word {}", tile.m, tile.n, asm.position());

    transfer_c_tile(asm, regs, true);

    asm.emit(enc::mov(RUN_A, TILE_A));
    asm.emit(enc::mov(RUN_B, BLOCK_B));
    if shape.batch > 1 {
        asm.counted_loop(BATCH_COUNT, shape.batch as u64, |asm| {
            emit_k_loop(asm, shape.k, regs);
            asm.emit(enc::add_reg(RUN_A, RUN_A, BATCH_A, Shift::Lsl, 0));
            asm.emit(enc::add_reg(RUN_B, RUN_B, BATCH_B, Shift::Lsl, 0));
        });
    } else {
        emit_k_loop(asm, shape.k, regs);
    }

    transfer_c_tile(asm, regs, false);

    if advance {
        let tile_bytes = tile.m as i64 * ELEM_BYTES;
        asm.add_const(TILE_A, TILE_A, tile_bytes, SCRATCH);
        asm.add_const(TILE_C, TILE_C, tile_bytes, SCRATCH);
    }
}

fn transfer_c_tile(asm: &mut CodeAssembler, regs: TileRegs, load: bool) {
    asm.emit(enc::mov(WALK, TILE_C));
    for j in 0..regs.tile.n {
        if load {
            load_column(asm, regs.acc(j), regs.tile.m, WALK, LANE);
        } else {
            store_column(asm, regs.acc(j), regs.tile.m, WALK, LANE);
        }
        if j + 1 < regs.tile.n {
            asm.emit(enc::add_reg(WALK, WALK, LDC, Shift::Lsl, 0));
        }
    }
}

fn emit_k_loop(asm: &mut CodeAssembler, k: usize, regs: TileRegs) {
    asm.counted_loop(K_COUNT, k as u64, |asm| {
        load_column(asm, regs.a(), regs.tile.m, RUN_A, LANE);
        for j in 0..regs.tile.n {
            let column: Gpr = match j {
                0 => RUN_B,
                1 => {
                    asm.emit(enc::add_reg(WALK, RUN_B, LDB, Shift::Lsl, 0));
                    WALK
                }
                _ => {
                    asm.emit(enc::add_reg(WALK, WALK, LDB, Shift::Lsl, 0));
                    WALK
                }
            };
            asm.emit(enc::ldr_fp(FpSize::S, regs.b(), column, 0, IndexMode::Offset));
            for r in 0..regs.col_regs {
                asm.emit(enc::fmla_elem(
                    VecArrangement::S4,
                    regs.acc(j).offset(r as u8),
                    regs.a().offset(r as u8),
                    regs.b(),
                    0,
                ));
            }
        }
        asm.emit(enc::add_reg(RUN_A, RUN_A, LDA, Shift::Lsl, 0));
        asm.emit(enc::add_imm(RUN_B, RUN_B, ELEM_BYTES as u32, false));
    });
}

// This module implements the generator for elementwise kernels B := op(A) over an M x N
// column-major grid, with op one of zero, identity, relu and transpose. Zero, identity and relu
// are tiled: the grid is partitioned by the tiling advisor, and every non-empty area gets a
// doubly nested counted loop (N outer, M inner) that loads a register tile from A (skipped for
// zero), applies the operation (an immediate zero, a vector maximum against a zero register, or
// nothing), stores it to B and advances both pointers by the tile height; after each inner pass
// the pointers move back by the area height and forward by one tile width of columns.
// Transpose is a plain scalar fallback that walks A column by column and scatters each element
// to its transposed slot in B. Every call owns a fresh buffer, so generators share no state.

//! Zero/identity/relu/transpose kernel generator.

use crate::aarch64::encoder as enc;
use crate::aarch64::{Gpr, IndexMode, Shift, VReg, VecArrangement};
use crate::core::{AssembledCode, CodeAssembler, ExecutableBuffer, GenerationStats, JitError, JitResult};

use super::columns::{load_column, store_column};
use super::tiling::{choose_elementwise_tile, ElementwiseTiling, TileShape, TiledArea};
use super::{ensure_native_host, span_elements, stride_arg, DType, GeneratedKernel, MAX_LOOP_TRIPS};

/// Calling convention of generated unary kernels: `(a, b, ld_a, ld_b)`, leading
/// dimensions in elements.
pub type UnaryFn = unsafe extern "C" fn(*const f32, *mut f32, i64, i64);

mod plan {
    use crate::aarch64::{Gpr, VReg};

    pub const ARG_A: Gpr = Gpr::x(0);
    pub const ARG_B: Gpr = Gpr::x(1);
    pub const LD_A: Gpr = Gpr::x(2);
    pub const LD_B: Gpr = Gpr::x(3);

    pub const AREA_A: Gpr = Gpr::x(8);
    pub const AREA_B: Gpr = Gpr::x(9);
    pub const N_COUNT: Gpr = Gpr::x(11);
    pub const M_COUNT: Gpr = Gpr::x(12);
    pub const WALK: Gpr = Gpr::x(15);
    pub const LANE: Gpr = Gpr::x(16);
    pub const SCRATCH: Gpr = Gpr::x(17);

    /// Scalar carried through the transpose.
    pub const ELEM: Gpr = Gpr::w(16);

    /// Zero operand of relu.
    pub const ZERO: VReg = VReg::new(31);
}

use plan::*;

const ELEM_BYTES: i64 = 4;

/// Elementwise operation of a unary kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Zero,
    Identity,
    Relu,
    Transpose,
}

impl UnaryOp {
    pub const fn name(self) -> &'static str {
        match self {
            UnaryOp::Zero => "zero",
            UnaryOp::Identity => "identity",
            UnaryOp::Relu => "relu",
            UnaryOp::Transpose => "transpose",
        }
    }

    /// Whether the kernel dereferences its input pointer.
    pub const fn reads_input(self) -> bool {
        !matches!(self, UnaryOp::Zero)
    }
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for UnaryOp {
    type Err = JitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zero" => Ok(UnaryOp::Zero),
            "identity" | "copy" => Ok(UnaryOp::Identity),
            "relu" => Ok(UnaryOp::Relu),
            "transpose" => Ok(UnaryOp::Transpose),
            other => Err(JitError::bad_parameter(format!("unknown unary operation {other:?}"))),
        }
    }
}

/// A generated unary kernel over an `m x n` input.
pub struct UnaryKernel {
    op: UnaryOp,
    m: usize,
    n: usize,
    code: ExecutableBuffer,
    entry: UnaryFn,
}

impl std::fmt::Debug for UnaryKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryKernel")
            .field("op", &self.op)
            .field("m", &self.m)
            .field("n", &self.n)
            .field("code", &self.code)
            .finish()
    }
}

impl UnaryKernel {
    pub fn op(&self) -> UnaryOp {
        self.op
    }

    /// Rows and columns of the input.
    pub fn shape(&self) -> (usize, usize) {
        (self.m, self.n)
    }

    pub fn entry(&self) -> UnaryFn {
        self.entry
    }

    /// Invoke the kernel on raw pointers.
    ///
    /// # Safety
    /// Must run on an aarch64 host. `b` must be valid for writes of the `m x n` output
    /// (`n x m` for transpose) with leading dimension `ld_b`; unless the op is
    /// [`UnaryOp::Zero`], `a` must be valid for reads of `m x n` elements with leading
    /// dimension `ld_a`. For transpose `a` and `b` must not overlap; the other ops
    /// tolerate `a == b` with equal leading dimensions.
    #[inline]
    pub unsafe fn call(&self, a: *const f32, b: *mut f32, ld_a: i64, ld_b: i64) {
        (self.entry)(a, b, ld_a, ld_b)
    }

    /// Run the kernel on slices after checking every addressed element is in bounds.
    /// `a` may be `None` only for [`UnaryOp::Zero`].
    pub fn run(&self, a: Option<&[f32]>, b: &mut [f32], ld_a: usize, ld_b: usize) -> JitResult<()> {
        let (out_rows, out_cols) = if self.op == UnaryOp::Transpose { (self.n, self.m) } else { (self.m, self.n) };
        if ld_b < out_rows {
            return Err(JitError::bad_parameter(format!("ld_b = {ld_b} is smaller than {out_rows} output rows")));
        }
        let need_b = span_elements(out_rows, &[(out_cols, ld_b)]);
        if need_b.map_or(true, |need| need > b.len()) {
            return Err(JitError::bad_parameter(format!(
                "output holds {} elements, kernel writes {need_b:?}",
                b.len()
            )));
        }

        let a_ptr = match a {
            Some(a) => {
                if ld_a < self.m {
                    return Err(JitError::bad_parameter(format!("ld_a = {ld_a} is smaller than {} rows", self.m)));
                }
                let need_a = span_elements(self.m, &[(self.n, ld_a)]);
                if need_a.map_or(true, |need| need > a.len()) {
                    return Err(JitError::bad_parameter(format!(
                        "input holds {} elements, kernel reads {need_a:?}",
                        a.len()
                    )));
                }
                a.as_ptr()
            }
            None if !self.op.reads_input() => std::ptr::null(),
            None => return Err(JitError::bad_parameter(format!("{} kernel needs an input", self.op))),
        };
        ensure_native_host()?;

        let ld_a = stride_arg("ld_a", ld_a)?;
        let ld_b = stride_arg("ld_b", ld_b)?;
        // SAFETY: extents checked above, the host is aarch64, and `b` is a unique borrow.
        unsafe { self.call(a_ptr, b.as_mut_ptr(), ld_a, ld_b) };
        Ok(())
    }
}

impl GeneratedKernel for UnaryKernel {
    fn family(&self) -> &'static str {
        self.op.name()
    }

    fn buffer(&self) -> &ExecutableBuffer {
        &self.code
    }

    fn symbol_name(&self) -> String {
        format!("{}_{}x{}", self.op.name(), self.m, self.n)
    }
}

/// Generator of unary kernels.
#[derive(Debug, Default)]
pub struct UnaryGenerator {
    stats: GenerationStats,
}

impl UnaryGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    /// Emit and finalize a kernel computing `B := op(A)` for an `m x n` input.
    pub fn generate(&mut self, m: usize, n: usize, dtype: DType, op: UnaryOp) -> JitResult<UnaryKernel> {
        if dtype != DType::F32 {
            return Err(JitError::bad_parameter(format!("unary dtype {dtype:?} is not supported")));
        }
        if m == 0 || n == 0 || m > MAX_LOOP_TRIPS || n > MAX_LOOP_TRIPS {
            return Err(JitError::bad_parameter(format!("unary size {m}x{n} is out of range")));
        }

        let mut asm = CodeAssembler::new();
        match op {
            UnaryOp::Transpose => emit_transpose(&mut asm, m, n),
            _ => emit_elementwise(&mut asm, &choose_elementwise_tile(m, n), op),
        }
        let AssembledCode { mut buffer, labels, fixups } = asm.finish()?;
        buffer.finalize()?;
        let code = AssembledCode { buffer, labels, fixups };
        self.stats.record(op.name(), &code);
        log::debug!("generated {op} {m}x{n}: {} words", code.buffer.len_words());

        // SAFETY: UnaryFn matches the calling convention emitted above.
        let entry = unsafe { code.buffer.as_callable::<UnaryFn>() }
            .ok_or_else(|| JitError::AllocationFailure { reason: "kernel code was not mapped".to_string() })?;
        Ok(UnaryKernel { op, m, n, code: code.buffer, entry })
    }
}

fn emit_elementwise(asm: &mut CodeAssembler, tiling: &ElementwiseTiling, op: UnaryOp) {
    asm.save_callee_saved_vregs();
    asm.emit(enc::lsl_imm(LD_A, LD_A, 2));
    asm.emit(enc::lsl_imm(LD_B, LD_B, 2));

    match op {
        UnaryOp::Relu => asm.emit(enc::movi_zero(VecArrangement::S4, ZERO)),
        UnaryOp::Zero => {
            // The stored registers never change, clear them once.
            let regs = tiling.areas().iter().filter_map(|a| a.tile).map(TileShape::vector_regs).max().unwrap_or(0);
            for r in 0..regs {
                asm.emit(enc::movi_zero(VecArrangement::S4, VReg::new(r as u8)));
            }
        }
        _ => {}
    }

    for area in tiling.areas() {
        if let Some(tile) = area.tile {
            emit_area(asm, &area, tile, op);
        }
    }

    asm.restore_callee_saved_vregs_and_ret();
}

/// `dst = base + row * 4 + col * ld`.
fn area_base(asm: &mut CodeAssembler, dst: Gpr, base: Gpr, area: &TiledArea, ld: Gpr) {
    asm.add_scaled(dst, base, area.col as u64, ld, SCRATCH);
    asm.add_const(dst, dst, area.row as i64 * ELEM_BYTES, SCRATCH);
}

fn emit_area(asm: &mut CodeAssembler, area: &TiledArea, tile: TileShape, op: UnaryOp) {
    let reads = op.reads_input();
    let col_regs = tile.regs_per_column();
    let column = |j: usize| VReg::new((j * col_regs) as u8);
    log::trace!("unary area {area:?} with tile {}x{}", tile.m, tile.n);

    if reads {
        area_base(asm, AREA_A, ARG_A, area, LD_A);
    }
    area_base(asm, AREA_B, ARG_B, area, LD_B);

    let m_tiles = area.rows / tile.m;
    // With a single M tile the row pointers never move down the column block.
    let walks_rows = m_tiles > 1;
    let tile_bytes = tile.m as i64 * ELEM_BYTES;
    let area_bytes = if walks_rows { area.rows as i64 * ELEM_BYTES } else { 0 };
    asm.counted_loop(N_COUNT, (area.cols / tile.n) as u64, |asm| {
        asm.counted_loop(M_COUNT, m_tiles as u64, |asm| {
            if reads {
                asm.emit(enc::mov(WALK, AREA_A));
                for j in 0..tile.n {
                    load_column(asm, column(j), tile.m, WALK, LANE);
                    if j + 1 < tile.n {
                        asm.emit(enc::add_reg(WALK, WALK, LD_A, Shift::Lsl, 0));
                    }
                }
            }
            if op == UnaryOp::Relu {
                for r in 0..tile.vector_regs() {
                    let reg = VReg::new(r as u8);
                    asm.emit(enc::fmax_vec(VecArrangement::S4, reg, reg, ZERO));
                }
            }
            asm.emit(enc::mov(WALK, AREA_B));
            for j in 0..tile.n {
                store_column(asm, column(j), tile.m, WALK, LANE);
                if j + 1 < tile.n {
                    asm.emit(enc::add_reg(WALK, WALK, LD_B, Shift::Lsl, 0));
                }
            }
            if walks_rows {
                if reads {
                    asm.add_const(AREA_A, AREA_A, tile_bytes, SCRATCH);
                }
                asm.add_const(AREA_B, AREA_B, tile_bytes, SCRATCH);
            }
        });
        if reads {
            asm.add_const(AREA_A, AREA_A, -area_bytes, SCRATCH);
            asm.add_scaled(AREA_A, AREA_A, tile.n as u64, LD_A, SCRATCH);
        }
        asm.add_const(AREA_B, AREA_B, -area_bytes, SCRATCH);
        asm.add_scaled(AREA_B, AREA_B, tile.n as u64, LD_B, SCRATCH);
    });
}

/// Scalar transpose: `B[j + i * ld_b] = A[i + j * ld_a]`.
fn emit_transpose(asm: &mut CodeAssembler, m: usize, n: usize) {
    asm.emit(enc::lsl_imm(LD_A, LD_A, 2));
    asm.emit(enc::lsl_imm(LD_B, LD_B, 2));
    asm.emit(enc::mov(AREA_A, ARG_A));
    asm.emit(enc::mov(AREA_B, ARG_B));

    let column_bytes = m as i64 * ELEM_BYTES;
    asm.counted_loop(N_COUNT, n as u64, |asm| {
        asm.emit(enc::mov(WALK, AREA_B));
        asm.counted_loop(M_COUNT, m as u64, |asm| {
            asm.emit(enc::ldr_gp(ELEM, AREA_A, ELEM_BYTES as i32, IndexMode::PostIndex));
            asm.emit(enc::str_gp(ELEM, WALK, 0, IndexMode::Offset));
            asm.emit(enc::add_reg(WALK, WALK, LD_B, Shift::Lsl, 0));
        });
        asm.add_const(AREA_A, AREA_A, -column_bytes, SCRATCH);
        asm.emit(enc::add_reg(AREA_A, AREA_A, LD_A, Shift::Lsl, 0));
        asm.emit(enc::add_imm(AREA_B, AREA_B, ELEM_BYTES as u32, false));
    });
    asm.emit(enc::ret());
}

//! Column loads and stores shared by the kernel generators.
//!
//! A column of `rows` single precision values occupies `⌈rows/4⌉` registers: one `q`
//! register per group of four rows, then a `d`, `s`, or `d` plus one lane for the
//! remainder. Partial registers are zero filled above the loaded lanes.

use crate::aarch64::encoder as enc;
use crate::aarch64::{FpSize, Gpr, IndexMode, VReg, XZR};
use crate::core::CodeAssembler;

use super::tiling::VECTOR_LANES;

const LANE_BYTES: i64 = 4;
const QREG_BYTES: i64 = 16;

fn transfer_column(asm: &mut CodeAssembler, load: bool, first: VReg, rows: usize, base: Gpr, lane_addr: Gpr) {
    let groups = rows / VECTOR_LANES;
    let access = |size, reg, offset| {
        if load {
            enc::ldr_fp(size, reg, base, offset, IndexMode::Offset)
        } else {
            enc::str_fp(size, reg, base, offset, IndexMode::Offset)
        }
    };

    for g in 0..groups {
        asm.emit(access(FpSize::Q, first.offset(g as u8), (g as i64 * QREG_BYTES) as i32));
    }

    let tail = first.offset(groups as u8);
    let offset = groups as i64 * QREG_BYTES;
    match rows % VECTOR_LANES {
        0 => {}
        1 => asm.emit(access(FpSize::S, tail, offset as i32)),
        2 => asm.emit(access(FpSize::D, tail, offset as i32)),
        _ => {
            asm.emit(access(FpSize::D, tail, offset as i32));
            asm.add_const(lane_addr, base, offset + 2 * LANE_BYTES, XZR);
            asm.emit(if load {
                enc::ld1_lane_s(tail, 2, lane_addr, false)
            } else {
                enc::st1_lane_s(tail, 2, lane_addr, false)
            });
        }
    }
}

/// Load `rows` floats at `[base]` into registers from `first` on. `lane_addr` is
/// clobbered when `rows % 4 == 3`.
pub(crate) fn load_column(asm: &mut CodeAssembler, first: VReg, rows: usize, base: Gpr, lane_addr: Gpr) {
    transfer_column(asm, true, first, rows, base, lane_addr);
}

/// Store `rows` floats from registers `first..` to `[base]`. `lane_addr` is clobbered
/// when `rows % 4 == 3`.
pub(crate) fn store_column(asm: &mut CodeAssembler, first: VReg, rows: usize, base: Gpr, lane_addr: Gpr) {
    transfer_column(asm, false, first, rows, base, lane_addr);
}

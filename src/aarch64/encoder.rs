// This module implements the AArch64 instruction encoder used by both kernel generators. Every
// instruction form is a pure const function that ORs a fixed opcode constant with operand
// fields. Field placement is centralized in the Field helper: each operand is masked to its
// field width and shifted to its bit offset, so out-of-range immediates are silently truncated
// and callers are expected to pre-validate. Register operands come from the typed register
// module (width class carried by Gpr, SIMD registers as VReg), and addressing variants are
// small enumerants (IndexMode, Shift). The encodings are checked word for word against
// an independent assembler in the conformance tests.

//! AArch64 instruction encoder.
//!
//! Only the subset of the A64 instruction set needed by the generated kernels is
//! covered: integer moves and arithmetic for address bookkeeping, branches, general
//! purpose and SIMD loads/stores, and the single precision vector arithmetic used by
//! the microkernels.

use super::registers::{FpSize, Gpr, VReg, VecArrangement};

/// A bit field inside an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub lsb: u32,
    pub width: u32,
}

impl Field {
    pub const fn new(lsb: u32, width: u32) -> Self {
        Self { lsb, width }
    }

    pub const fn mask(self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// Mask `value` to the field width and move it into position.
    pub const fn place(self, value: u32) -> u32 {
        (value & self.mask()) << self.lsb
    }

    /// Read the field back out of an encoded word.
    pub const fn extract(self, word: u32) -> u32 {
        (word >> self.lsb) & self.mask()
    }

    /// Read the field as a two's complement value.
    pub const fn extract_signed(self, word: u32) -> i32 {
        let raw = self.extract(word);
        let shift = 32 - self.width;
        ((raw << shift) as i32) >> shift
    }
}

pub mod fields {
    use super::Field;

    pub const RD: Field = Field::new(0, 5);
    pub const RT: Field = Field::new(0, 5);
    pub const RN: Field = Field::new(5, 5);
    pub const RT2: Field = Field::new(10, 5);
    pub const RA: Field = Field::new(10, 5);
    pub const RM: Field = Field::new(16, 5);
    pub const SF: Field = Field::new(31, 1);
    pub const Q: Field = Field::new(30, 1);
    pub const SZ: Field = Field::new(22, 1);
    pub const SHIFT: Field = Field::new(22, 2);
    pub const SH: Field = Field::new(22, 1);
    pub const N: Field = Field::new(22, 1);
    pub const IMM6: Field = Field::new(10, 6);
    pub const IMMR: Field = Field::new(16, 6);
    pub const IMMS: Field = Field::new(10, 6);
    pub const IMM7: Field = Field::new(15, 7);
    pub const IMM9: Field = Field::new(12, 9);
    pub const IMM12: Field = Field::new(10, 12);
    pub const IMM16: Field = Field::new(5, 16);
    pub const HW: Field = Field::new(21, 2);
    pub const IMM19: Field = Field::new(5, 19);
    pub const IMM26: Field = Field::new(0, 26);
    pub const LOAD: Field = Field::new(22, 1);
    pub const PAIR_MODE: Field = Field::new(23, 2);
    pub const SINGLE_MODE: Field = Field::new(10, 2);
    pub const LANE_S: Field = Field::new(12, 1);
    pub const ELEM_L: Field = Field::new(21, 1);
    pub const ELEM_H: Field = Field::new(11, 1);
    pub const POST: Field = Field::new(23, 1);
}

use fields::*;

/// Addressing mode of loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// `[xn, #imm]`, base unchanged.
    Offset,
    /// `[xn, #imm]!`, base updated before the access.
    PreIndex,
    /// `[xn], #imm`, base updated after the access.
    PostIndex,
}

impl IndexMode {
    const fn pair_bits(self) -> u32 {
        match self {
            IndexMode::PostIndex => 0b01,
            IndexMode::Offset => 0b10,
            IndexMode::PreIndex => 0b11,
        }
    }

    const fn single_bits(self) -> u32 {
        match self {
            IndexMode::PostIndex => 0b01,
            IndexMode::Offset => 0b00,
            IndexMode::PreIndex => 0b11,
        }
    }
}

/// Shift applied to the second register of arithmetic instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Lsl = 0,
    Lsr = 1,
    Asr = 2,
}

// ---------------------------------------------------------------------------
// Integer data processing
// ---------------------------------------------------------------------------

/// `mov rd, rm` (alias of `orr rd, zr, rm`).
pub const fn mov(rd: Gpr, rm: Gpr) -> u32 {
    0x2A00_03E0 | SF.place(rd.sf()) | RM.place(rm.id()) | RD.place(rd.id())
}

/// `movz rd, #imm16, lsl #(16 * hw)`.
pub const fn movz(rd: Gpr, imm16: u32, hw: u32) -> u32 {
    0x5280_0000 | SF.place(rd.sf()) | HW.place(hw) | IMM16.place(imm16) | RD.place(rd.id())
}

/// `movk rd, #imm16, lsl #(16 * hw)`.
pub const fn movk(rd: Gpr, imm16: u32, hw: u32) -> u32 {
    0x7280_0000 | SF.place(rd.sf()) | HW.place(hw) | IMM16.place(imm16) | RD.place(rd.id())
}

/// `add rd, rn, #imm12 {, lsl #12}`.
pub const fn add_imm(rd: Gpr, rn: Gpr, imm12: u32, lsl12: bool) -> u32 {
    0x1100_0000
        | SF.place(rd.sf())
        | SH.place(lsl12 as u32)
        | IMM12.place(imm12)
        | RN.place(rn.id())
        | RD.place(rd.id())
}

/// `sub rd, rn, #imm12 {, lsl #12}`.
pub const fn sub_imm(rd: Gpr, rn: Gpr, imm12: u32, lsl12: bool) -> u32 {
    0x5100_0000
        | SF.place(rd.sf())
        | SH.place(lsl12 as u32)
        | IMM12.place(imm12)
        | RN.place(rn.id())
        | RD.place(rd.id())
}

/// `add rd, rn, rm {, shift #amount}`.
pub const fn add_reg(rd: Gpr, rn: Gpr, rm: Gpr, shift: Shift, amount: u32) -> u32 {
    0x0B00_0000
        | SF.place(rd.sf())
        | SHIFT.place(shift as u32)
        | RM.place(rm.id())
        | IMM6.place(amount)
        | RN.place(rn.id())
        | RD.place(rd.id())
}

/// `sub rd, rn, rm {, shift #amount}`.
pub const fn sub_reg(rd: Gpr, rn: Gpr, rm: Gpr, shift: Shift, amount: u32) -> u32 {
    0x4B00_0000
        | SF.place(rd.sf())
        | SHIFT.place(shift as u32)
        | RM.place(rm.id())
        | IMM6.place(amount)
        | RN.place(rn.id())
        | RD.place(rd.id())
}

/// `ubfm rd, rn, #immr, #imms`.
const fn ubfm(rd: Gpr, rn: Gpr, immr: u32, imms: u32) -> u32 {
    0x5300_0000
        | SF.place(rd.sf())
        | N.place(rd.sf())
        | IMMR.place(immr)
        | IMMS.place(imms)
        | RN.place(rn.id())
        | RD.place(rd.id())
}

/// `lsl rd, rn, #shift`.
pub const fn lsl_imm(rd: Gpr, rn: Gpr, shift: u32) -> u32 {
    let bits = rd.bits();
    let shift = shift % bits;
    ubfm(rd, rn, (bits - shift) % bits, bits - 1 - shift)
}

/// `lsr rd, rn, #shift`.
pub const fn lsr_imm(rd: Gpr, rn: Gpr, shift: u32) -> u32 {
    ubfm(rd, rn, shift, rd.bits() - 1)
}

/// `madd rd, rn, rm, ra` (rd = ra + rn * rm).
pub const fn madd(rd: Gpr, rn: Gpr, rm: Gpr, ra: Gpr) -> u32 {
    0x1B00_0000
        | SF.place(rd.sf())
        | RM.place(rm.id())
        | RA.place(ra.id())
        | RN.place(rn.id())
        | RD.place(rd.id())
}

/// `mul rd, rn, rm`.
pub const fn mul(rd: Gpr, rn: Gpr, rm: Gpr) -> u32 {
    madd(rd, rn, rm, Gpr::x(31))
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

/// `cbz rt, #(4 * imm19)`.
pub const fn cbz(rt: Gpr, imm19: i32) -> u32 {
    0x3400_0000 | SF.place(rt.sf()) | IMM19.place(imm19 as u32) | RT.place(rt.id())
}

/// `cbnz rt, #(4 * imm19)`.
pub const fn cbnz(rt: Gpr, imm19: i32) -> u32 {
    0x3500_0000 | SF.place(rt.sf()) | IMM19.place(imm19 as u32) | RT.place(rt.id())
}

/// `b #(4 * imm26)`.
pub const fn b(imm26: i32) -> u32 {
    0x1400_0000 | IMM26.place(imm26 as u32)
}

/// `ret` (through x30).
pub const fn ret() -> u32 {
    0xD65F_03C0
}

pub const fn nop() -> u32 {
    0xD503_201F
}

// ---------------------------------------------------------------------------
// General purpose loads and stores
// ---------------------------------------------------------------------------

/// Single register load/store. `offset` is in bytes: scaled by the access size for
/// [`IndexMode::Offset`], unscaled 9-bit otherwise.
const fn ldst_gpr(load: bool, rt: Gpr, rn: Gpr, offset: i32, mode: IndexMode) -> u32 {
    let size = 2 | rt.sf();
    let base = (size << 30) | 0x3800_0000 | LOAD.place(load as u32);
    let addressing = match mode {
        IndexMode::Offset => 0x0100_0000 | IMM12.place((offset >> (size as i32)) as u32),
        _ => SINGLE_MODE.place(mode.single_bits()) | IMM9.place(offset as u32),
    };
    base | addressing | RN.place(rn.id()) | RT.place(rt.id())
}

pub const fn ldr_gp(rt: Gpr, rn: Gpr, offset: i32, mode: IndexMode) -> u32 {
    ldst_gpr(true, rt, rn, offset, mode)
}

pub const fn str_gp(rt: Gpr, rn: Gpr, offset: i32, mode: IndexMode) -> u32 {
    ldst_gpr(false, rt, rn, offset, mode)
}

// ---------------------------------------------------------------------------
// SIMD loads and stores
// ---------------------------------------------------------------------------

const fn fp_size_bits(size: FpSize) -> (u32, u32, u32) {
    // (size field, opc bit 23, log2 of access bytes)
    match size {
        FpSize::S => (0b10, 0, 2),
        FpSize::D => (0b11, 0, 3),
        FpSize::Q => (0b00, 1, 4),
    }
}

const fn ldst_fp(load: bool, size: FpSize, rt: VReg, rn: Gpr, offset: i32, mode: IndexMode) -> u32 {
    let (size_bits, opc_hi, scale) = fp_size_bits(size);
    let base = (size_bits << 30) | 0x3C00_0000 | (opc_hi << 23) | LOAD.place(load as u32);
    let addressing = match mode {
        IndexMode::Offset => 0x0100_0000 | IMM12.place((offset >> (scale as i32)) as u32),
        _ => SINGLE_MODE.place(mode.single_bits()) | IMM9.place(offset as u32),
    };
    base | addressing | RN.place(rn.id()) | RT.place(rt.id())
}

/// `ldr {s,d,q}t, [rn, #offset]`; `offset` in bytes.
pub const fn ldr_fp(size: FpSize, rt: VReg, rn: Gpr, offset: i32, mode: IndexMode) -> u32 {
    ldst_fp(true, size, rt, rn, offset, mode)
}

/// `str {s,d,q}t, [rn, #offset]`; `offset` in bytes.
pub const fn str_fp(size: FpSize, rt: VReg, rn: Gpr, offset: i32, mode: IndexMode) -> u32 {
    ldst_fp(false, size, rt, rn, offset, mode)
}

const fn ldst_pair_fp(
    load: bool,
    size: FpSize,
    rt: VReg,
    rt2: VReg,
    rn: Gpr,
    offset: i32,
    mode: IndexMode,
) -> u32 {
    let (opc, scale) = match size {
        FpSize::S => (0u32, 2),
        FpSize::D => (1, 3),
        FpSize::Q => (2, 4),
    };
    0x2C00_0000
        | (opc << 30)
        | PAIR_MODE.place(mode.pair_bits())
        | LOAD.place(load as u32)
        | IMM7.place((offset >> scale) as u32)
        | RT2.place(rt2.id())
        | RN.place(rn.id())
        | RT.place(rt.id())
}

/// `ldp {s,d,q}t, {s,d,q}t2, [rn, #offset]`; `offset` in bytes.
pub const fn ldp_fp(size: FpSize, rt: VReg, rt2: VReg, rn: Gpr, offset: i32, mode: IndexMode) -> u32 {
    ldst_pair_fp(true, size, rt, rt2, rn, offset, mode)
}

/// `stp {s,d,q}t, {s,d,q}t2, [rn, #offset]`; `offset` in bytes.
pub const fn stp_fp(size: FpSize, rt: VReg, rt2: VReg, rn: Gpr, offset: i32, mode: IndexMode) -> u32 {
    ldst_pair_fp(false, size, rt, rt2, rn, offset, mode)
}

const fn ldst1_lane_s(load: bool, rt: VReg, lane: u32, rn: Gpr, post: bool) -> u32 {
    let rm = if post { RM.place(31) } else { 0 };
    0x0D00_8000
        | Q.place(lane >> 1)
        | POST.place(post as u32)
        | LOAD.place(load as u32)
        | rm
        | LANE_S.place(lane)
        | RN.place(rn.id())
        | RT.place(rt.id())
}

/// `ld1 {vt.s}[lane], [rn]` or, with `post`, `[rn], #4`.
pub const fn ld1_lane_s(rt: VReg, lane: u32, rn: Gpr, post: bool) -> u32 {
    ldst1_lane_s(true, rt, lane, rn, post)
}

/// `st1 {vt.s}[lane], [rn]` or, with `post`, `[rn], #4`.
pub const fn st1_lane_s(rt: VReg, lane: u32, rn: Gpr, post: bool) -> u32 {
    ldst1_lane_s(false, rt, lane, rn, post)
}

// ---------------------------------------------------------------------------
// SIMD arithmetic
// ---------------------------------------------------------------------------

/// `fmla vd.T, vn.T, vm.s[lane]` for single precision arrangements.
pub const fn fmla_elem(arr: VecArrangement, rd: VReg, rn: VReg, rm: VReg, lane: u32) -> u32 {
    0x0F80_1000
        | Q.place(arr.q())
        | ELEM_L.place(lane)
        | RM.place(rm.id())
        | ELEM_H.place(lane >> 1)
        | RN.place(rn.id())
        | RD.place(rd.id())
}

/// `fmax vd.T, vn.T, vm.T`.
pub const fn fmax_vec(arr: VecArrangement, rd: VReg, rn: VReg, rm: VReg) -> u32 {
    0x0E20_F400 | Q.place(arr.q()) | SZ.place(arr.sz()) | RM.place(rm.id()) | RN.place(rn.id()) | RD.place(rd.id())
}

/// `movi vd.{2s,4s}, #0`, or `movi vd.2d, #0` for [`VecArrangement::D2`].
pub const fn movi_zero(arr: VecArrangement, rd: VReg) -> u32 {
    match arr {
        VecArrangement::D2 => 0x6F00_E400 | RD.place(rd.id()),
        _ => 0x0F00_0400 | Q.place(arr.q()) | RD.place(rd.id()),
    }
}

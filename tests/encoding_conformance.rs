//! Encoder conformance against an independent assembler.
//!
//! Every expected word below was produced by `llvm-mc -triple=aarch64 -show-encoding`
//! for the assembly text next to it.

use tenjit::aarch64::encoder as enc;
use tenjit::aarch64::{FpSize, Gpr, IndexMode, Shift, VReg, VecArrangement, SP};

fn x(id: u8) -> Gpr {
    Gpr::x(id)
}

fn w(id: u8) -> Gpr {
    Gpr::w(id)
}

fn v(id: u8) -> VReg {
    VReg::new(id)
}

fn check(cases: &[(u32, u32, &str)]) {
    let mut failures = Vec::new();
    for &(got, expected, asm) in cases {
        if got != expected {
            failures.push(format!("{asm:<32} got {got:#010x}, expected {expected:#010x}"));
        }
    }
    assert!(failures.is_empty(), "encoding mismatches:\n{}", failures.join("\n"));
}

#[test]
fn test_integer_data_processing() {
    check(&[
        (enc::mov(x(8), x(0)), 0xAA00_03E8, "mov x8, x0"),
        (enc::mov(w(8), w(0)), 0x2A00_03E8, "mov w8, w0"),
        (enc::movz(x(17), 0x1234, 1), 0xD2A2_4691, "movz x17, #0x1234, lsl #16"),
        (enc::movk(x(17), 0xbeef, 2), 0xF2D7_DDF1, "movk x17, #0xbeef, lsl #32"),
        (enc::movz(w(17), 7, 0), 0x5280_00F1, "movz w17, #7"),
        (enc::movk(w(17), 1, 1), 0x72A0_0031, "movk w17, #1, lsl #16"),
        (enc::add_imm(x(8), x(8), 16, false), 0x9100_4108, "add x8, x8, #16"),
        (enc::add_imm(x(8), x(8), 1, true), 0x9140_0508, "add x8, x8, #1, lsl #12"),
        (enc::add_imm(w(8), w(8), 16, false), 0x1100_4108, "add w8, w8, #16"),
        (enc::sub_imm(x(8), x(8), 4095, false), 0xD13F_FD08, "sub x8, x8, #4095"),
        (enc::sub_imm(w(3), w(3), 1, false), 0x5100_0463, "sub w3, w3, #1"),
        (enc::add_reg(x(8), x(8), x(17), Shift::Lsl, 0), 0x8B11_0108, "add x8, x8, x17"),
        (enc::add_reg(x(8), x(8), x(17), Shift::Lsl, 2), 0x8B11_0908, "add x8, x8, x17, lsl #2"),
        (enc::sub_reg(x(9), x(9), x(17), Shift::Lsl, 0), 0xCB11_0129, "sub x9, x9, x17"),
        (enc::sub_reg(w(9), w(9), w(17), Shift::Lsl, 3), 0x4B11_0D29, "sub w9, w9, w17, lsl #3"),
        (enc::lsl_imm(x(3), x(3), 2), 0xD37E_F463, "lsl x3, x3, #2"),
        (enc::lsl_imm(w(3), w(3), 2), 0x531E_7463, "lsl w3, w3, #2"),
        (enc::lsr_imm(x(3), x(3), 2), 0xD342_FC63, "lsr x3, x3, #2"),
        (enc::lsr_imm(w(3), w(3), 5), 0x5305_7C63, "lsr w3, w3, #5"),
        (enc::mul(x(17), x(3), x(17)), 0x9B11_7C71, "mul x17, x3, x17"),
        (enc::mul(w(17), w(3), w(17)), 0x1B11_7C71, "mul w17, w3, w17"),
        (enc::madd(x(17), x(3), x(4), x(5)), 0x9B04_1471, "madd x17, x3, x4, x5"),
        (enc::ret(), 0xD65F_03C0, "ret"),
        (enc::nop(), 0xD503_201F, "nop"),
    ]);
}

#[test]
fn test_general_purpose_loads_and_stores() {
    use IndexMode::*;
    check(&[
        (enc::ldr_gp(x(1), x(2), 8, Offset), 0xF940_0441, "ldr x1, [x2, #8]"),
        (enc::str_gp(x(1), x(2), 16, Offset), 0xF900_0841, "str x1, [x2, #16]"),
        (enc::ldr_gp(w(1), x(2), 4, Offset), 0xB940_0441, "ldr w1, [x2, #4]"),
        (enc::str_gp(w(1), x(2), 12, Offset), 0xB900_0C41, "str w1, [x2, #12]"),
        (enc::ldr_gp(x(1), x(2), 8, PostIndex), 0xF840_8441, "ldr x1, [x2], #8"),
        (enc::str_gp(w(1), x(2), 4, PostIndex), 0xB800_4441, "str w1, [x2], #4"),
        (enc::ldr_gp(w(1), x(2), 4, PostIndex), 0xB840_4441, "ldr w1, [x2], #4"),
        (enc::str_gp(x(1), x(2), -8, PostIndex), 0xF81F_8441, "str x1, [x2], #-8"),
    ]);
}

#[test]
fn test_simd_scalar_loads_and_stores() {
    use FpSize::*;
    use IndexMode::*;
    check(&[
        (enc::stp_fp(D, v(8), v(9), SP, -16, PreIndex), 0x6DBF_27E8, "stp d8, d9, [sp, #-16]!"),
        (enc::ldp_fp(D, v(8), v(9), SP, 16, PostIndex), 0x6CC1_27E8, "ldp d8, d9, [sp], #16"),
        (enc::stp_fp(Q, v(0), v(1), x(8), 32, Offset), 0xAD01_0500, "stp q0, q1, [x8, #32]"),
        (enc::ldp_fp(S, v(0), v(1), x(8), 8, Offset), 0x2D41_0500, "ldp s0, s1, [x8, #8]"),
        (enc::ldr_fp(S, v(0), x(8), 4, Offset), 0xBD40_0500, "ldr s0, [x8, #4]"),
        (enc::ldr_fp(D, v(0), x(8), 8, Offset), 0xFD40_0500, "ldr d0, [x8, #8]"),
        (enc::ldr_fp(Q, v(0), x(8), 16, Offset), 0x3DC0_0500, "ldr q0, [x8, #16]"),
        (enc::str_fp(S, v(0), x(8), 4, Offset), 0xBD00_0500, "str s0, [x8, #4]"),
        (enc::str_fp(D, v(0), x(8), 8, Offset), 0xFD00_0500, "str d0, [x8, #8]"),
        (enc::str_fp(Q, v(0), x(8), 16, Offset), 0x3D80_0500, "str q0, [x8, #16]"),
        (enc::ldr_fp(S, v(0), x(8), 4, PostIndex), 0xBC40_4500, "ldr s0, [x8], #4"),
        (enc::ldr_fp(D, v(0), x(8), 8, PostIndex), 0xFC40_8500, "ldr d0, [x8], #8"),
        (enc::ldr_fp(Q, v(0), x(8), 16, PostIndex), 0x3CC1_0500, "ldr q0, [x8], #16"),
        (enc::str_fp(S, v(0), x(8), 4, PostIndex), 0xBC00_4500, "str s0, [x8], #4"),
        (enc::str_fp(D, v(0), x(8), 8, PostIndex), 0xFC00_8500, "str d0, [x8], #8"),
        (enc::str_fp(Q, v(0), x(8), 16, PostIndex), 0x3C81_0500, "str q0, [x8], #16"),
        (enc::ldr_fp(Q, v(4), x(15), 0, Offset), 0x3DC0_01E4, "ldr q4, [x15]"),
        (enc::ldr_fp(D, v(5), x(15), 16, Offset), 0xFD40_09E5, "ldr d5, [x15, #16]"),
        (enc::str_fp(Q, v(4), x(15), 0, Offset), 0x3D80_01E4, "str q4, [x15]"),
        (enc::str_fp(D, v(5), x(15), 16, Offset), 0xFD00_09E5, "str d5, [x15, #16]"),
    ]);
}

#[test]
fn test_simd_structure_loads_and_stores() {
    use VecArrangement::*;
    check(&[
        (enc::ld1_lane_s(v(0), 0, x(0), false), 0x0D40_8000, "ld1 {v0.s}[0], [x0]"),
        (enc::ld1_lane_s(v(0), 1, x(0), false), 0x0D40_9000, "ld1 {v0.s}[1], [x0]"),
        (enc::ld1_lane_s(v(0), 2, x(0), false), 0x4D40_8000, "ld1 {v0.s}[2], [x0]"),
        (enc::ld1_lane_s(v(0), 3, x(0), false), 0x4D40_9000, "ld1 {v0.s}[3], [x0]"),
        (enc::ld1_lane_s(v(5), 2, x(16), false), 0x4D40_8205, "ld1 {v5.s}[2], [x16]"),
        (enc::st1_lane_s(v(5), 2, x(16), false), 0x4D00_8205, "st1 {v5.s}[2], [x16]"),
        (enc::ld1_lane_s(v(0), 2, x(0), true), 0x4DDF_8000, "ld1 {v0.s}[2], [x0], #4"),
        (enc::st1_lane_s(v(0), 3, x(0), true), 0x4D9F_9000, "st1 {v0.s}[3], [x0], #4"),
    ]);
}

#[test]
fn test_simd_arithmetic() {
    use VecArrangement::*;
    check(&[
        (enc::fmla_elem(S4, v(0), v(1), v(2), 0), 0x4F82_1020, "fmla v0.4s, v1.4s, v2.s[0]"),
        (enc::fmla_elem(S4, v(0), v(1), v(2), 1), 0x4FA2_1020, "fmla v0.4s, v1.4s, v2.s[1]"),
        (enc::fmla_elem(S4, v(0), v(1), v(2), 2), 0x4F82_1820, "fmla v0.4s, v1.4s, v2.s[2]"),
        (enc::fmla_elem(S4, v(0), v(1), v(31), 3), 0x4FBF_1820, "fmla v0.4s, v1.4s, v31.s[3]"),
        (enc::fmla_elem(S2, v(0), v(1), v(2), 1), 0x0FA2_1020, "fmla v0.2s, v1.2s, v2.s[1]"),
        (enc::fmax_vec(S4, v(0), v(1), v(31)), 0x4E3F_F420, "fmax v0.4s, v1.4s, v31.4s"),
        (enc::fmax_vec(S2, v(0), v(1), v(31)), 0x0E3F_F420, "fmax v0.2s, v1.2s, v31.2s"),
        (enc::movi_zero(S4, v(31)), 0x4F00_041F, "movi v31.4s, #0"),
        (enc::movi_zero(D2, v(31)), 0x6F00_E41F, "movi v31.2d, #0"),
    ]);
}

// This module groups the AArch64 specific pieces of tenjit: the typed register operands and the
// pure instruction encoder. Both are stateless; emission state (word buffer, labels, branch
// fixups) lives in core::assembler. Generated code follows AAPCS64: arguments arrive in x0..x7,
// x8..x17 are free scratch, and v8..v15 have callee-saved low halves that kernels must preserve.

//! AArch64 target support.

pub mod encoder;
pub mod registers;

pub use encoder::{Field, IndexMode, Shift};
pub use registers::{FpSize, Gpr, RegWidth, VReg, VecArrangement, SP, XZR};

// This module provides CodeAssembler, the emission context shared by the kernel generators. It
// owns the instruction words of one kernel under construction together with a label table and a
// list of pending branch fixups. Branches to labels are emitted as placeholders; finish() runs a
// second pass that patches each placeholder with the word displacement between the branch and
// its bound label, so no call site computes branch offsets by hand. On top of the raw emit API
// it offers the small macro sequences every kernel needs: materializing 64-bit constants,
// adding arbitrary byte offsets to pointers, counted decrement-and-branch loops, and the fixed
// prologue/epilogue preserving the callee-saved SIMD registers d8..d15.

//! Label/fixup assembler for generated kernels.

use crate::aarch64::encoder::{self as enc, fields};
use crate::aarch64::{FpSize, Gpr, IndexMode, Shift, VReg, SP};

use super::code_buffer::ExecutableBuffer;
use super::error::{JitError, JitResult};

/// Handle to a code position that branches can target before it is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Branch forms that take a label operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Always,
    Cbz(Gpr),
    Cbnz(Gpr),
}

impl BranchKind {
    fn encode(self, displacement: i32) -> u32 {
        match self {
            BranchKind::Always => enc::b(displacement),
            BranchKind::Cbz(rt) => enc::cbz(rt, displacement),
            BranchKind::Cbnz(rt) => enc::cbnz(rt, displacement),
        }
    }

    /// Width of the displacement field in bits.
    fn range_bits(self) -> u32 {
        match self {
            BranchKind::Always => fields::IMM26.width,
            _ => fields::IMM19.width,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Word index of the placeholder branch.
    at: usize,
    label: Label,
    kind: BranchKind,
}

/// Code emitted by [`CodeAssembler::finish`].
#[derive(Debug)]
pub struct AssembledCode {
    pub buffer: ExecutableBuffer,
    pub labels: usize,
    pub fixups: usize,
}

/// Emission context for one kernel.
#[derive(Debug, Default)]
pub struct CodeAssembler {
    words: Vec<u32>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

/// Callee-saved SIMD registers, saved as `d` pairs.
const CALLEE_SAVED_PAIRS: [(u8, u8); 4] = [(8, 9), (10, 11), (12, 13), (14, 15)];

impl CodeAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position in words.
    pub fn position(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn label_create(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind `label` to the current position. Binding again moves the label.
    pub fn label_place(&mut self, label: Label) {
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(self.words.len());
        }
    }

    /// Emit a branch to `label`, resolved in [`finish`](Self::finish).
    pub fn branch(&mut self, kind: BranchKind, label: Label) {
        self.fixups.push(Fixup { at: self.words.len(), label, kind });
        self.words.push(kind.encode(0));
    }

    pub fn b(&mut self, label: Label) {
        self.branch(BranchKind::Always, label);
    }

    pub fn cbz(&mut self, rt: Gpr, label: Label) {
        self.branch(BranchKind::Cbz(rt), label);
    }

    pub fn cbnz(&mut self, rt: Gpr, label: Label) {
        self.branch(BranchKind::Cbnz(rt), label);
    }

    /// Patch every pending branch and hand the words over to an [`ExecutableBuffer`].
    pub fn finish(mut self) -> JitResult<AssembledCode> {
        for fixup in &self.fixups {
            let unbound = || JitError::bad_parameter(format!("branch at word {} targets an unbound label", fixup.at));
            let target = self.labels.get(fixup.label.0 as usize).copied().flatten().ok_or_else(unbound)?;
            let displacement = target as i64 - fixup.at as i64;
            let limit = 1i64 << (fixup.kind.range_bits() - 1);
            if displacement < -limit || displacement >= limit {
                return Err(JitError::bad_parameter(format!(
                    "branch displacement {displacement} at word {} out of range",
                    fixup.at
                )));
            }
            self.words[fixup.at] = fixup.kind.encode(displacement as i32);
        }
        log::trace!(
            "resolved {} fixups against {} labels in {} words",
            self.fixups.len(),
            self.labels.len(),
            self.words.len()
        );

        let mut buffer = ExecutableBuffer::new();
        buffer.extend(&self.words);
        Ok(AssembledCode { buffer, labels: self.labels.len(), fixups: self.fixups.len() })
    }

    // -----------------------------------------------------------------------
    // Macro sequences
    // -----------------------------------------------------------------------

    /// Materialize `value` in `rd` with one `movz` and a `movk` per further nonzero
    /// half-word.
    pub fn mov_imm(&mut self, rd: Gpr, value: u64) {
        if value == 0 {
            self.emit(enc::movz(rd, 0, 0));
            return;
        }
        let chunks = (rd.bits() / 16) as u64;
        let mut first = true;
        for hw in 0..chunks {
            let part = ((value >> (16 * hw)) & 0xFFFF) as u32;
            if part == 0 {
                continue;
            }
            if first {
                self.emit(enc::movz(rd, part, hw as u32));
                first = false;
            } else {
                self.emit(enc::movk(rd, part, hw as u32));
            }
        }
    }

    /// `rd = rn + value` for an arbitrary byte offset; `scratch` is clobbered when the
    /// offset does not fit an (optionally shifted) 12-bit immediate.
    pub fn add_const(&mut self, rd: Gpr, rn: Gpr, value: i64, scratch: Gpr) {
        let magnitude = value.unsigned_abs();
        let negative = value < 0;
        if magnitude == 0 {
            if rd != rn {
                self.emit(enc::mov(rd, rn));
            }
        } else if magnitude < 1 << 12 {
            let imm = magnitude as u32;
            self.emit(if negative {
                enc::sub_imm(rd, rn, imm, false)
            } else {
                enc::add_imm(rd, rn, imm, false)
            });
        } else if magnitude & 0xFFF == 0 && magnitude < 1 << 24 {
            let imm = (magnitude >> 12) as u32;
            self.emit(if negative {
                enc::sub_imm(rd, rn, imm, true)
            } else {
                enc::add_imm(rd, rn, imm, true)
            });
        } else {
            self.mov_imm(scratch, magnitude);
            self.emit(if negative {
                enc::sub_reg(rd, rn, scratch, Shift::Lsl, 0)
            } else {
                enc::add_reg(rd, rn, scratch, Shift::Lsl, 0)
            });
        }
    }

    /// `rd = rn + count * stride` with a runtime `stride` register.
    pub fn add_scaled(&mut self, rd: Gpr, rn: Gpr, count: u64, stride: Gpr, scratch: Gpr) {
        match count {
            0 => {
                if rd != rn {
                    self.emit(enc::mov(rd, rn));
                }
            }
            1 => self.emit(enc::add_reg(rd, rn, stride, Shift::Lsl, 0)),
            c if c.is_power_of_two() => {
                self.emit(enc::add_reg(rd, rn, stride, Shift::Lsl, c.trailing_zeros()))
            }
            c => {
                self.mov_imm(scratch, c);
                self.emit(enc::madd(rd, scratch, stride, rn));
            }
        }
    }

    /// Run `body` `trips` times with `counter` as the trip count register:
    /// `mov counter, #trips; head: body; sub counter, counter, #1; cbnz counter, head`.
    ///
    /// A single trip emits the body once without loop control; zero trips emit nothing.
    pub fn counted_loop(&mut self, counter: Gpr, trips: u64, body: impl FnOnce(&mut Self)) {
        match trips {
            0 => {}
            1 => body(self),
            _ => {
                self.mov_imm(counter, trips);
                let head = self.label_create();
                self.label_place(head);
                body(self);
                self.emit(enc::sub_imm(counter, counter, 1, false));
                self.cbnz(counter, head);
            }
        }
    }

    /// Save `d8`..`d15` on the stack.
    pub fn save_callee_saved_vregs(&mut self) {
        for (lo, hi) in CALLEE_SAVED_PAIRS {
            self.emit(enc::stp_fp(FpSize::D, VReg::new(lo), VReg::new(hi), SP, -16, IndexMode::PreIndex));
        }
    }

    /// Restore `d8`..`d15` in reverse order and return.
    pub fn restore_callee_saved_vregs_and_ret(&mut self) {
        for (lo, hi) in CALLEE_SAVED_PAIRS.iter().rev().copied() {
            self.emit(enc::ldp_fp(FpSize::D, VReg::new(lo), VReg::new(hi), SP, 16, IndexMode::PostIndex));
        }
        self.emit(enc::ret());
    }
}

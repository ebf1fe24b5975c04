//! Register operands for the AArch64 encoder.
//!
//! General purpose registers carry their width class (`W` or `X`) in the type so the
//! `sf` bit is derived rather than folded into the register number by hand.

use std::fmt;

/// Operand width of a general purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegWidth {
    W32,
    X64,
}

/// General purpose register. Number 31 is `xzr`/`wzr` or `sp` depending on the
/// instruction form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr {
    id: u8,
    width: RegWidth,
}

impl Gpr {
    pub const fn x(id: u8) -> Self {
        Self { id: id & 31, width: RegWidth::X64 }
    }

    pub const fn w(id: u8) -> Self {
        Self { id: id & 31, width: RegWidth::W32 }
    }

    /// Register number as placed in the instruction.
    pub const fn id(self) -> u32 {
        self.id as u32
    }

    pub const fn width(self) -> RegWidth {
        self.width
    }

    /// Value of the `sf` bit.
    pub const fn sf(self) -> u32 {
        match self.width {
            RegWidth::W32 => 0,
            RegWidth::X64 => 1,
        }
    }

    /// Operand size in bits.
    pub const fn bits(self) -> u32 {
        match self.width {
            RegWidth::W32 => 32,
            RegWidth::X64 => 64,
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.width, self.id) {
            (RegWidth::X64, 31) => write!(f, "xzr"),
            (RegWidth::W32, 31) => write!(f, "wzr"),
            (RegWidth::X64, id) => write!(f, "x{id}"),
            (RegWidth::W32, id) => write!(f, "w{id}"),
        }
    }
}

/// Stack pointer (register 31 in address positions).
pub const SP: Gpr = Gpr::x(31);
/// Zero register (register 31 in data positions).
pub const XZR: Gpr = Gpr::x(31);

/// SIMD and floating point register `v0`..`v31`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u8);

impl VReg {
    pub const COUNT: usize = 32;

    pub const fn new(id: u8) -> Self {
        Self(id & 31)
    }

    pub const fn id(self) -> u32 {
        self.0 as u32
    }

    /// The register `n` places after this one, wrapping at 32 as register lists do.
    pub const fn offset(self, n: u8) -> Self {
        Self::new(self.0.wrapping_add(n))
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Vector arrangement for data processing instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecArrangement {
    /// Two single precision lanes (64-bit vector).
    S2,
    /// Four single precision lanes (128-bit vector).
    S4,
    /// Two double precision lanes.
    D2,
}

impl VecArrangement {
    /// The `Q` bit.
    pub const fn q(self) -> u32 {
        match self {
            VecArrangement::S2 => 0,
            VecArrangement::S4 | VecArrangement::D2 => 1,
        }
    }

    /// The `sz` bit of floating point vector forms.
    pub const fn sz(self) -> u32 {
        match self {
            VecArrangement::S2 | VecArrangement::S4 => 0,
            VecArrangement::D2 => 1,
        }
    }
}

/// Access size of scalar SIMD loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpSize {
    /// 32 bits.
    S,
    /// 64 bits.
    D,
    /// 128 bits.
    Q,
}

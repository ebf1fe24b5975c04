// This module hosts the kernel generators. The tiling advisor picks register tiles under the
// SIMD register budget; the BRGEMM generator emits batch-reduce matrix multiplication kernels
// and the unary generator emits zero/identity/relu/transpose kernels. Both build on the label
// assembler from core and the encoder from aarch64, and both return typed kernel handles that
// own their ExecutableBuffer, so a kernel can never be called after its code is released. The
// GeneratedKernel trait exposes the common surface used for statistics and ELF dumps.

//! Kernel generators for tensor contractions.

pub mod brgemm;
mod columns;
pub mod tiling;
pub mod unary;

pub use brgemm::{BrgemmGenerator, BrgemmShape, GemmFn, GemmKernel, GemmStrides};
pub use tiling::{
    choose_elementwise_tile, choose_gemm_tile, ElementwiseTiling, GemmTiling, TileShape, TiledArea, NUM_VREGS,
};
pub use unary::{UnaryFn, UnaryGenerator, UnaryKernel, UnaryOp};

use crate::core::{ExecutableBuffer, JitError, JitResult};

/// Element type of a kernel. Only [`DType::F32`] has a code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    pub const fn size_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

/// Common surface of generated kernels.
pub trait GeneratedKernel {
    /// Kernel family name used in statistics and symbol names.
    fn family(&self) -> &'static str;

    /// The finalized code.
    fn buffer(&self) -> &ExecutableBuffer;

    /// Code size in instruction words.
    fn size_words(&self) -> usize {
        self.buffer().len_words()
    }

    /// A symbol name describing the kernel's specialization.
    fn symbol_name(&self) -> String;
}

/// Fail unless generated code can execute on this machine.
pub(crate) fn ensure_native_host() -> JitResult<()> {
    if cfg!(target_arch = "aarch64") {
        Ok(())
    } else {
        Err(JitError::UnsupportedHost { arch: std::env::consts::ARCH })
    }
}

/// Number of elements spanned by an access pattern: `inner` contiguous elements
/// repeated over `(count, stride)` axes. Zero when any count is zero; `None` on
/// overflow.
pub(crate) fn span_elements(inner: usize, axes: &[(usize, usize)]) -> Option<usize> {
    if inner == 0 || axes.iter().any(|&(count, _)| count == 0) {
        return Some(0);
    }
    axes.iter().try_fold(inner, |acc, &(count, stride)| {
        (count - 1).checked_mul(stride).and_then(|off| off.checked_add(acc))
    })
}

/// Convert an element stride to the `i64` the kernels take.
pub(crate) fn stride_arg(name: &str, value: usize) -> JitResult<i64> {
    i64::try_from(value).map_err(|_| JitError::bad_parameter(format!("{name} = {value} does not fit an i64")))
}

/// Largest extent accepted for any generated loop.
pub(crate) const MAX_LOOP_TRIPS: usize = u32::MAX as usize;

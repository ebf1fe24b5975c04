//! tenjit - just-in-time kernels for dense tensor contractions on AArch64.
//!
//! tenjit emits specialized machine code at runtime: batch-reduce GEMM
//! microkernels and elementwise zero/identity/relu/transpose kernels, each tiled
//! to the 32 SIMD registers of the target. A tensor contraction is described as a
//! list of loops; the primitive loops are absorbed by the generated kernel and
//! the remaining loops are walked sequentially or distributed over a rayon pool.
//!
//! # Primary Usage
//!
//! ```ignore
//! use tenjit::einsum::{ContractionConfig, DimType::*, ExecType::*, LoopDim, PrimType, TensorOperation};
//!
//! // C[m, n] += A[m, k] * B[k, n], all column-major 32 x 32
//! let config = ContractionConfig::new(
//!     PrimType::Gemm,
//!     vec![
//!         LoopDim::new(M, Prim, 32, [1, 0, 1]),
//!         LoopDim::new(N, Prim, 32, [0, 32, 32]),
//!         LoopDim::new(K, Prim, 32, [32, 1, 0]),
//!     ],
//! );
//! let op = TensorOperation::setup(config)?.compile()?;
//! op.execute(&a, &b, &mut c)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Executable memory, label assembler, errors, statistics, ELF output
//! - [`aarch64`] - Typed registers and the instruction encoder
//! - [`generator`] - Tiling advisor and the BRGEMM and unary kernel generators
//! - [`einsum`] - Contraction descriptions, loop normalization and the executor
//!
//! Code generation works on every host. Executing generated kernels requires an
//! aarch64 machine; the safe entry points return
//! [`JitError::UnsupportedHost`] elsewhere.

pub mod aarch64;
pub mod core;
pub mod einsum;
pub mod generator;

pub use crate::core::{ExecutableBuffer, GenerationStats, JitError, JitResult};
pub use crate::einsum::{CompiledOperation, ContractionConfig, OptimizeOptions, TensorOperation};
pub use crate::generator::{BrgemmGenerator, BrgemmShape, DType, GemmKernel, UnaryGenerator, UnaryKernel, UnaryOp};

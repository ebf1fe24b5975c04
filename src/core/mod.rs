// This module serves as the central hub for tenjit's target independent infrastructure. It
// exports the error taxonomy shared by all layers, the ExecutableBuffer that owns generated
// code and its executable mapping, the CodeAssembler that emits instruction words with label
// and fixup resolution, generation statistics, and the ELF writer used to inspect generated
// kernels with standard tools. Target specific encoding lives in the aarch64 module; the
// kernel generators in generator build on both.

//! Core tenjit infrastructure.
//!
//! # Key Components
//!
//! ## Executable memory (`code_buffer`)
//! - Append-only word buffer while building
//! - mmap/mprotect based finalization with instruction cache maintenance
//! - Typed reinterpretation of the entry point as a function pointer
//!
//! ## Assembly (`assembler`)
//! - Labels and branch fixups resolved in a second pass
//! - Constant materialization, pointer arithmetic and counted loop helpers
//!
//! ## Diagnostics (`stats`, `object_writer`)
//! - Per family kernel counters
//! - ELF relocatables for offline disassembly

pub mod assembler;
pub mod code_buffer;
pub mod error;
pub mod object_writer;
pub mod stats;

pub use assembler::{AssembledCode, BranchKind, CodeAssembler, Label};
pub use code_buffer::ExecutableBuffer;
pub use error::{JitError, JitResult};
pub use object_writer::write_elf;
pub use stats::GenerationStats;

// This module defines error types for the tenjit code generator using the thiserror crate for
// idiomatic Rust error handling. JitError is the single error enum shared by kernel generation,
// executable memory management, and tensor operation setup: BadParameter covers every rejected
// precondition (unsupported dtype, transposition flags, malformed loop descriptions), while
// AllocationFailure and PermissionFailure report mmap/mprotect failures that are fatal for the
// kernel being built. UnsupportedHost guards the safe kernel entry points on machines that are
// not aarch64, and the remaining variants wrap I/O and ELF writing failures of the dump
// helpers. The module also provides JitResult<T> as a convenience alias.

//! Error types for tenjit.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for kernel generation and tensor operations.
#[derive(Error, Debug)]
pub enum JitError {
    #[error("Bad parameter: {reason}")]
    BadParameter { reason: String },

    #[error("Executable memory allocation failed: {reason}")]
    AllocationFailure { reason: String },

    #[error("Changing memory permissions failed: {reason}")]
    PermissionFailure { reason: String },

    #[error("Generated AArch64 code cannot run on a {arch} host")]
    UnsupportedHost { arch: &'static str },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Object file emission failed: {reason}")]
    Object { reason: String },
}

impl JitError {
    /// Shorthand for the most common variant.
    pub fn bad_parameter(reason: impl Into<String>) -> Self {
        JitError::BadParameter { reason: reason.into() }
    }
}

/// Result type alias for generation and execution setup.
pub type JitResult<T> = Result<T, JitError>;

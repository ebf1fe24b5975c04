// This module hosts the tensor contraction layer built on the kernel generators. A contraction
// is described by a ContractionConfig (the loop list with sizes and strides plus the kinds of
// the main and touch kernels). ContractionConfig::optimize normalizes an arbitrary loop order,
// TensorOperation::setup validates the canonical form and derives the kernel parameters, and
// compile produces a CompiledOperation that executes sequentially or with the shared loops
// spread over rayon workers.

//! Tensor contractions on generated kernels.

pub mod config;
pub mod operation;
pub mod optimize;

pub use config::{ContractionConfig, DType, DimType, ExecType, LoopDim, PrimType};
pub use operation::{CompiledOperation, KernelInvocation, LeadingDims, MainKernel, PrimIds, TensorOperation};
pub use optimize::{OptimizeOptions, MAX_PRIM_EXTENT};

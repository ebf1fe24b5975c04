// This module defines the description of a tensor contraction as the executor consumes it.
// Every loop of the contraction is a LoopDim: its role in the contraction (C, M, N or K), how it
// is executed (walked sequentially, distributed across worker tasks, or absorbed by the
// primitive kernel), its extent, and its element stride in each of the two inputs and the
// output. ContractionConfig bundles the loops with the element type and the primitive kinds of
// the first-touch, main and last-touch kernels. from_arrays accepts the parallel-array form used
// by contraction planners and converts it into owned, typed storage.

//! Typed contraction descriptions.

use crate::core::{JitError, JitResult};
use crate::generator::UnaryOp;

pub use crate::generator::DType;

/// Role of a loop dimension in the contraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimType {
    /// Batch-like axis present in every operand.
    C,
    /// Row axis of the first input and the output.
    M,
    /// Column axis of the second input and the output.
    N,
    /// Reduction axis of both inputs.
    K,
}

/// How a loop dimension is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecType {
    /// Walked by the sequential loop walker.
    Seq,
    /// Handled inside the primitive kernel.
    Prim,
    /// Distributed across worker tasks.
    Shared,
}

/// Kind of a generated kernel in a contraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimType {
    None,
    Zero,
    Copy,
    Relu,
    Gemm,
    Brgemm,
    Transpose,
}

impl PrimType {
    /// Kernel kinds allowed before or after the main kernel.
    pub const fn is_touch(self) -> bool {
        matches!(self, PrimType::None | PrimType::Zero | PrimType::Copy | PrimType::Relu)
    }

    pub const fn is_gemm(self) -> bool {
        matches!(self, PrimType::Gemm | PrimType::Brgemm)
    }

    /// The unary kernel implementing this kind, if any.
    pub const fn unary_op(self) -> Option<UnaryOp> {
        match self {
            PrimType::Zero => Some(UnaryOp::Zero),
            PrimType::Copy => Some(UnaryOp::Identity),
            PrimType::Relu => Some(UnaryOp::Relu),
            PrimType::Transpose => Some(UnaryOp::Transpose),
            PrimType::None | PrimType::Gemm | PrimType::Brgemm => None,
        }
    }
}

/// One loop of a contraction. Strides are in elements; a zero stride means the
/// operand does not depend on the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopDim {
    pub dim_type: DimType,
    pub exec_type: ExecType,
    pub size: usize,
    pub stride_in0: usize,
    pub stride_in1: usize,
    pub stride_out: usize,
}

impl LoopDim {
    /// A loop with strides `[in0, in1, out]`.
    pub const fn new(dim_type: DimType, exec_type: ExecType, size: usize, strides: [usize; 3]) -> Self {
        Self {
            dim_type,
            exec_type,
            size,
            stride_in0: strides[0],
            stride_in1: strides[1],
            stride_out: strides[2],
        }
    }

    pub const fn is_prim(&self) -> bool {
        matches!(self.exec_type, ExecType::Prim)
    }

    pub const fn strides(&self) -> [usize; 3] {
        [self.stride_in0, self.stride_in1, self.stride_out]
    }

    pub(crate) fn with_strides(mut self, strides: [usize; 3]) -> Self {
        [self.stride_in0, self.stride_in1, self.stride_out] = strides;
        self
    }
}

/// Full description of a contraction: element type, kernel kinds and loops from
/// outermost to innermost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractionConfig {
    pub dtype: DType,
    pub first_touch: PrimType,
    pub main: PrimType,
    pub last_touch: PrimType,
    pub dims: Vec<LoopDim>,
}

impl ContractionConfig {
    /// An `F32` contraction without touch kernels.
    pub fn new(main: PrimType, dims: Vec<LoopDim>) -> Self {
        Self {
            dtype: DType::F32,
            first_touch: PrimType::None,
            main,
            last_touch: PrimType::None,
            dims,
        }
    }

    pub fn with_first_touch(mut self, prim: PrimType) -> Self {
        self.first_touch = prim;
        self
    }

    pub fn with_last_touch(mut self, prim: PrimType) -> Self {
        self.last_touch = prim;
        self
    }

    /// Build a config from parallel arrays, one entry per loop.
    ///
    /// Fails with `BadParameter` when the arrays differ in length or a size or
    /// stride is negative.
    #[allow(clippy::too_many_arguments)]
    pub fn from_arrays(
        dtype: DType,
        first_touch: PrimType,
        main: PrimType,
        last_touch: PrimType,
        dim_types: &[DimType],
        exec_types: &[ExecType],
        dim_sizes: &[i64],
        strides_in0: &[i64],
        strides_in1: &[i64],
        strides_out: &[i64],
    ) -> JitResult<Self> {
        let len = dim_types.len();
        let lengths = [exec_types.len(), dim_sizes.len(), strides_in0.len(), strides_in1.len(), strides_out.len()];
        if lengths.iter().any(|&l| l != len) {
            return Err(JitError::bad_parameter(format!(
                "dimension arrays differ in length: {len} dim types vs {lengths:?}"
            )));
        }

        let unsigned = |what: &str, i: usize, value: i64| {
            usize::try_from(value).map_err(|_| JitError::bad_parameter(format!("{what} of loop {i} is {value}")))
        };
        let dims = (0..len)
            .map(|i| {
                Ok(LoopDim {
                    dim_type: dim_types[i],
                    exec_type: exec_types[i],
                    size: unsigned("size", i, dim_sizes[i])?,
                    stride_in0: unsigned("in0 stride", i, strides_in0[i])?,
                    stride_in1: unsigned("in1 stride", i, strides_in1[i])?,
                    stride_out: unsigned("out stride", i, strides_out[i])?,
                })
            })
            .collect::<JitResult<Vec<_>>>()?;

        Ok(Self { dtype, first_touch, main, last_touch, dims })
    }

    /// Index of the first primitive loop, or the loop count if there is none.
    pub fn first_prim(&self) -> usize {
        self.dims.iter().position(LoopDim::is_prim).unwrap_or(self.dims.len())
    }
}

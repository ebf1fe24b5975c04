//! Normalization of contraction descriptions.
//!
//! [`ContractionConfig::optimize`] turns a caller supplied loop order into the
//! canonical form accepted by [`TensorOperation::setup`](super::TensorOperation::setup):
//! primitive loops identified, oversized primitive extents split, compatible
//! neighbours fused, and loops reordered so that shared loops lead, sequential loops
//! follow, and the primitive run closes the list.

use super::config::{ContractionConfig, DimType, ExecType, LoopDim, PrimType};
use crate::core::{JitError, JitResult};

/// Primitive M and K extents above this are split into a sequential outer loop.
pub const MAX_PRIM_EXTENT: usize = 64;

/// Options of [`ContractionConfig::optimize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeOptions {
    /// Promote the outermost sequential non-reduction loop to a shared loop.
    pub parallel: bool,
}

impl ContractionConfig {
    /// Normalize the loop list in place.
    ///
    /// Primitive loops are only identified when none is marked [`ExecType::Prim`];
    /// otherwise the marked ones are kept. Fails with `BadParameter` when no valid
    /// primitive run can be found.
    pub fn optimize(&mut self, options: OptimizeOptions) -> JitResult<()> {
        if !self.dims.iter().any(LoopDim::is_prim) {
            identify_primitives(self)?;
        }
        split_primitives(&mut self.dims);
        fuse_loops(&mut self.dims);
        reorder_loops(self);
        if options.parallel {
            promote_shared(&mut self.dims);
        }
        log::debug!("normalized loops: {:?}", self.dims);
        Ok(())
    }
}

fn find_prim(dims: &[LoopDim], skip: &[usize], pred: impl Fn(&LoopDim) -> bool) -> Option<usize> {
    dims.iter().enumerate().position(|(i, d)| !skip.contains(&i) && pred(d))
}

/// Index of the unmarked loop minimizing `key` among those passing `pred`.
fn min_prim(
    dims: &[LoopDim],
    skip: &[usize],
    pred: impl Fn(&LoopDim) -> bool,
    key: impl Fn(&LoopDim) -> usize,
) -> Option<usize> {
    dims.iter()
        .enumerate()
        .filter(|(i, d)| !skip.contains(i) && pred(*d))
        .min_by_key(|(_, d)| key(*d))
        .map(|(i, _)| i)
}

fn identify_primitives(config: &mut ContractionConfig) -> JitResult<()> {
    let dims = &config.dims;
    let missing = |what: &str| JitError::bad_parameter(format!("no loop qualifies as the primitive {what} loop"));

    let chosen = if config.main.is_gemm() {
        let m = find_prim(dims, &[], |d| d.dim_type == DimType::M && d.stride_in0 == 1 && d.stride_out == 1)
            .ok_or_else(|| missing("M"))?;
        let k = find_prim(dims, &[], |d| d.dim_type == DimType::K && d.stride_in1 == 1).ok_or_else(|| missing("K"))?;
        let n = min_prim(dims, &[], |d| d.dim_type == DimType::N && d.stride_out != 0, |d| d.stride_out)
            .ok_or_else(|| missing("N"))?;
        let mut chosen = vec![m, n, k];
        if config.main == PrimType::Brgemm {
            let batch = min_prim(dims, &chosen, |d| d.dim_type == DimType::K, |d| d.stride_in1)
                .ok_or_else(|| missing("batch-reduce"))?;
            chosen.push(batch);
        }
        chosen
    } else {
        let unit_in = |d: &LoopDim| d.stride_in0 == 1;
        let unit_out = |d: &LoopDim| d.stride_out == 1;
        match config.main {
            PrimType::Transpose => {
                let m = find_prim(dims, &[], unit_in).ok_or_else(|| missing("input-contiguous"))?;
                let n = find_prim(dims, &[m], unit_out).ok_or_else(|| missing("output-contiguous"))?;
                vec![m, n]
            }
            PrimType::Zero => {
                let m = find_prim(dims, &[], unit_out).ok_or_else(|| missing("output-contiguous"))?;
                let n = min_prim(dims, &[m], |d| d.stride_out != 0, |d| d.stride_out).ok_or_else(|| missing("column"))?;
                vec![m, n]
            }
            _ => {
                let m = find_prim(dims, &[], |d| unit_in(d) && unit_out(d)).ok_or_else(|| missing("contiguous"))?;
                let n = min_prim(dims, &[m], |d| d.stride_out != 0, |d| d.stride_out).ok_or_else(|| missing("column"))?;
                vec![m, n]
            }
        }
    };

    for i in chosen {
        config.dims[i].exec_type = ExecType::Prim;
    }
    Ok(())
}

/// Largest divisor of `size` in `2..=limit`.
fn largest_divisor(size: usize, limit: usize) -> Option<usize> {
    (2..=limit.min(size)).rev().find(|d| size % d == 0)
}

fn split_primitives(dims: &mut Vec<LoopDim>) {
    let mut i = 0;
    while i < dims.len() {
        let dim = dims[i];
        let splittable = dim.is_prim() && matches!(dim.dim_type, DimType::M | DimType::K);
        if splittable && dim.size > MAX_PRIM_EXTENT {
            if let Some(inner) = largest_divisor(dim.size, MAX_PRIM_EXTENT) {
                let outer = LoopDim {
                    exec_type: ExecType::Seq,
                    size: dim.size / inner,
                    ..dim.with_strides(dim.strides().map(|s| s * inner))
                };
                dims[i].size = inner;
                dims.insert(i, outer);
                i += 1;
            }
        }
        i += 1;
    }
}

/// Whether `outer` followed directly by `inner` walks the same elements as one loop.
fn fusable(outer: &LoopDim, inner: &LoopDim) -> bool {
    !outer.is_prim()
        && outer.dim_type == inner.dim_type
        && outer.exec_type == inner.exec_type
        && outer.strides().iter().zip(inner.strides()).all(|(&o, i)| o == i * inner.size)
}

fn fuse_loops(dims: &mut Vec<LoopDim>) {
    let mut i = 0;
    while i + 1 < dims.len() {
        if fusable(&dims[i], &dims[i + 1]) {
            let outer = dims.remove(i);
            dims[i].size *= outer.size;
        } else {
            i += 1;
        }
    }
}

fn reorder_loops(config: &mut ContractionConfig) {
    let (mut outer, prims): (Vec<LoopDim>, Vec<LoopDim>) = config.dims.iter().partition(|d| !d.is_prim());
    outer.sort_by(|a, b| {
        let group = |d: &LoopDim| d.exec_type != ExecType::Shared;
        group(a)
            .cmp(&group(b))
            .then(b.stride_out.cmp(&a.stride_out))
            .then(b.stride_in0.cmp(&a.stride_in0))
    });

    let rank = |d: &LoopDim| -> usize {
        if config.main.is_gemm() {
            match d.dim_type {
                // The reduction K carries unit stride in the second input.
                DimType::K if d.stride_in1 == 1 => 3,
                DimType::K => 0,
                DimType::M => 1,
                DimType::N => 2,
                DimType::C => 4,
            }
        } else {
            let leading = match config.main {
                PrimType::Zero => d.stride_out == 1,
                PrimType::Transpose => d.stride_in0 == 1,
                _ => d.stride_in0 == 1 && d.stride_out == 1,
            };
            usize::from(!leading)
        }
    };
    let mut prims = prims;
    prims.sort_by_key(rank);

    outer.extend(prims);
    config.dims = outer;
}

fn promote_shared(dims: &mut [LoopDim]) {
    let candidate = dims
        .iter()
        .position(|d| d.exec_type == ExecType::Seq && d.dim_type != DimType::K && d.stride_out != 0);
    let Some(pos) = candidate else {
        return;
    };
    dims[pos].exec_type = ExecType::Shared;
    // Keep shared loops ahead of sequential ones.
    let first_seq = dims.iter().position(|d| d.exec_type == ExecType::Seq).unwrap_or(pos);
    if first_seq < pos {
        dims[first_seq..=pos].rotate_right(1);
    }
}

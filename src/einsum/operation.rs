// This module implements the tensor contraction executor. A TensorOperation is created from a
// ContractionConfig by setup, which validates the loop list and derives everything the kernels
// need: the positions of the primitive M, N, K and batch loops, the leading dimensions and batch
// strides handed to the main kernel, how many leading loops are shared, and the number of
// elements each operand spans. compile consumes the operation and generates the main kernel
// (BRGEMM or unary) plus the optional first- and last-touch kernels, yielding a read-only
// CompiledOperation. Execution walks the non-primitive loops: the sequential walker recurses
// loop by loop, offsetting the operand pointers by index times stride, and calls the kernels at
// the innermost level; the parallel entry point flattens the shared loops into one index space,
// decodes each index on a rayon worker and continues with the sequential walker. The first- and
// last-touch flags are narrowed by every reduction loop, so the touch kernels run exactly before
// the first and after the last contribution to each output block.

//! Tensor contraction executor.

use rayon::prelude::*;

use super::config::{ContractionConfig, DType, DimType, ExecType, LoopDim, PrimType};
use super::optimize::OptimizeOptions;
use crate::core::{GenerationStats, JitError, JitResult};
use crate::generator::{
    ensure_native_host, span_elements, stride_arg, BrgemmGenerator, BrgemmShape, GemmKernel, GeneratedKernel,
    UnaryGenerator, UnaryKernel,
};

/// Positions of the primitive loops in the loop list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimIds {
    pub m: usize,
    pub n: usize,
    /// Reduction loop of a GEMM/BRGEMM main kernel.
    pub k: Option<usize>,
    /// Batch-reduce loop of a BRGEMM main kernel.
    pub batch: Option<usize>,
}

/// Strides handed to the main kernel, in elements.
///
/// Unary main kernels use `lda` for the input and `ldc` for the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeadingDims {
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub batch_stride_a: usize,
    pub batch_stride_b: usize,
}

/// Everything derived from a validated config.
#[derive(Debug, Clone, Copy)]
struct Layout {
    prim: PrimIds,
    leading: LeadingDims,
    /// Index of the first primitive loop.
    first_prim: usize,
    /// Number of leading shared loops.
    shared: usize,
    /// Elements spanned by in0, in1 and out; zero for an operand the kernels ignore.
    extents: [usize; 3],
    /// No two output elements are addressed by different non-reduction indices.
    disjoint_output: bool,
}

/// A validated contraction, ready to compile.
#[derive(Debug, Clone)]
pub struct TensorOperation {
    config: ContractionConfig,
    layout: Layout,
}

impl TensorOperation {
    /// Validate `config` and derive the kernel parameters.
    ///
    /// The loop list must already be in canonical form: shared loops first, then
    /// sequential loops, then the primitive run. [`ContractionConfig::optimize`]
    /// produces that form from an arbitrary loop order.
    pub fn setup(config: ContractionConfig) -> JitResult<Self> {
        let layout = analyze(&config)?;
        log::debug!(
            "set up {:?} contraction with {} loops: {:?}, leading dims {:?}",
            config.main,
            config.dims.len(),
            layout.prim,
            layout.leading
        );
        Ok(Self { config, layout })
    }

    /// [`TensorOperation::setup`] on the parallel-array form of a config.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_from_arrays(
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
        Self::setup(ContractionConfig::from_arrays(
            dtype,
            first_touch,
            main,
            last_touch,
            dim_types,
            exec_types,
            dim_sizes,
            strides_in0,
            strides_in1,
            strides_out,
        )?)
    }

    /// Normalize the owned config and derive again. On failure the operation keeps
    /// its previous config.
    pub fn optimize(&mut self, options: OptimizeOptions) -> JitResult<()> {
        let mut config = self.config.clone();
        config.optimize(options)?;
        self.layout = analyze(&config)?;
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &ContractionConfig {
        &self.config
    }

    pub fn prim_ids(&self) -> PrimIds {
        self.layout.prim
    }

    pub fn leading_dims(&self) -> LeadingDims {
        self.layout.leading
    }

    /// Generate the main kernel and the touch kernels.
    pub fn compile(self) -> JitResult<CompiledOperation> {
        let dims = &self.config.dims;
        let prim = self.layout.prim;
        let (m, n) = (dims[prim.m].size, dims[prim.n].size);

        let mut gemm_gen = BrgemmGenerator::new();
        let mut unary_gen = UnaryGenerator::new();
        let main = match self.config.main.unary_op() {
            Some(op) => MainKernel::Unary(unary_gen.generate(m, n, self.config.dtype, op)?),
            None => {
                let size = |id: Option<usize>| id.map_or(1, |i| dims[i].size);
                let shape = BrgemmShape {
                    dtype: self.config.dtype,
                    ..BrgemmShape::brgemm(m, n, size(prim.k), size(prim.batch))
                };
                MainKernel::Gemm(gemm_gen.generate(&shape)?)
            }
        };
        let mut touch = |kind: PrimType| kind.unary_op().map(|op| unary_gen.generate(m, n, DType::F32, op)).transpose();
        let first_touch = touch(self.config.first_touch)?;
        let last_touch = touch(self.config.last_touch)?;

        let leading = &self.layout.leading;
        let args = KernelArgs {
            lda: stride_arg("lda", leading.lda)?,
            ldb: stride_arg("ldb", leading.ldb)?,
            ldc: stride_arg("ldc", leading.ldc)?,
            batch_stride_a: stride_arg("batch_stride_a", leading.batch_stride_a)?,
            batch_stride_b: stride_arg("batch_stride_b", leading.batch_stride_b)?,
        };

        let mut stats = GenerationStats::new();
        stats.merge(gemm_gen.stats());
        stats.merge(unary_gen.stats());
        log::debug!(
            "compiled {:?} contraction: {} kernels, {} words",
            self.config.main,
            stats.kernels_generated,
            stats.total_words
        );

        Ok(CompiledOperation {
            config: self.config,
            layout: self.layout,
            args,
            main,
            first_touch,
            last_touch,
            stats,
        })
    }
}

fn bad(reason: impl Into<String>) -> JitError {
    JitError::bad_parameter(reason)
}

fn analyze(config: &ContractionConfig) -> JitResult<Layout> {
    if config.dtype != DType::F32 {
        return Err(bad(format!("dtype {:?} is not supported", config.dtype)));
    }
    if config.main == PrimType::None {
        return Err(bad("a main primitive is required"));
    }
    for (what, touch) in [("first", config.first_touch), ("last", config.last_touch)] {
        if !touch.is_touch() {
            return Err(bad(format!("{what}-touch primitive {touch:?} is not a unary kernel")));
        }
        if touch != PrimType::None && !config.main.is_gemm() {
            return Err(bad(format!("{what}-touch kernels need a GEMM main primitive, not {:?}", config.main)));
        }
    }

    let dims = &config.dims;
    if let Some(i) = dims.iter().position(|d| d.size == 0) {
        return Err(bad(format!("loop {i} has size zero")));
    }
    let first_prim = config.first_prim();
    if !dims[first_prim..].iter().all(LoopDim::is_prim) {
        return Err(bad("primitive loops must form the trailing run"));
    }
    let shared = dims.iter().take_while(|d| d.exec_type == ExecType::Shared).count();
    for (i, dim) in dims[..first_prim].iter().enumerate() {
        if dim.exec_type == ExecType::Shared {
            if i >= shared {
                return Err(bad(format!("shared loop {i} follows a sequential loop")));
            }
            if dim.dim_type == DimType::K || dim.stride_out == 0 {
                return Err(bad(format!("shared loop {i} does not address distinct output blocks")));
            }
        }
    }

    let (prim, leading) = if config.main.is_gemm() {
        analyze_gemm(config, first_prim)?
    } else {
        analyze_unary(config, first_prim)?
    };

    let span = |stride: fn(&LoopDim) -> usize| {
        span_elements(1, &dims.iter().map(|d| (d.size, stride(d))).collect::<Vec<_>>())
            .ok_or_else(|| bad("operand extent overflows"))
    };
    let mut extents = [span(|d| d.stride_in0)?, span(|d| d.stride_in1)?, span(|d| d.stride_out)?];
    if config.main.unary_op().is_some() {
        extents[1] = 0;
    }
    if config.main == PrimType::Zero {
        extents[0] = 0;
    }

    Ok(Layout {
        prim,
        leading,
        first_prim,
        shared,
        extents,
        disjoint_output: output_is_disjoint(dims),
    })
}

fn analyze_gemm(config: &ContractionConfig, first_prim: usize) -> JitResult<(PrimIds, LeadingDims)> {
    let dims = &config.dims;
    let (mut m, mut n, mut ks) = (None, None, Vec::new());
    for (i, dim) in dims.iter().enumerate().skip(first_prim) {
        let slot = match dim.dim_type {
            DimType::M => &mut m,
            DimType::N => &mut n,
            DimType::K => {
                ks.push(i);
                continue;
            }
            DimType::C => return Err(bad(format!("primitive loop {i} is a C loop"))),
        };
        if slot.replace(i).is_some() {
            return Err(bad(format!("primitive run has more than one {:?} loop", dim.dim_type)));
        }
    }
    let (Some(m), Some(n)) = (m, n) else {
        return Err(bad("primitive run needs one M and one N loop"));
    };
    let (k, batch) = match (config.main, ks.as_slice()) {
        (PrimType::Gemm, &[k]) => (k, None),
        (PrimType::Brgemm, &[batch, k]) => (k, Some(batch)),
        (main, ks) => {
            let want = if main == PrimType::Brgemm { 2 } else { 1 };
            return Err(bad(format!("{main:?} needs {want} primitive K loops, got {}", ks.len())));
        }
    };

    for (i, dim) in dims.iter().enumerate() {
        let independent = match dim.dim_type {
            DimType::M => dim.stride_in1 == 0,
            DimType::N => dim.stride_in0 == 0,
            DimType::K => dim.stride_out == 0,
            DimType::C => true,
        };
        if !independent {
            return Err(bad(format!(
                "loop {i} of type {:?} has a stride in an operand it does not index",
                dim.dim_type
            )));
        }
    }
    if dims[m].stride_in0 != 1 || dims[m].stride_out != 1 {
        return Err(bad("primitive M loop must have unit stride in in0 and out"));
    }
    if dims[k].stride_in1 != 1 {
        return Err(bad("primitive K loop must have unit stride in in1"));
    }

    let leading = LeadingDims {
        lda: dims[k].stride_in0,
        ldb: dims[n].stride_in1,
        ldc: dims[n].stride_out,
        batch_stride_a: batch.map_or(0, |b| dims[b].stride_in0),
        batch_stride_b: batch.map_or(0, |b| dims[b].stride_in1),
    };
    Ok((PrimIds { m, n, k: Some(k), batch }, leading))
}

fn analyze_unary(config: &ContractionConfig, first_prim: usize) -> JitResult<(PrimIds, LeadingDims)> {
    let dims = &config.dims;
    if dims.len() - first_prim != 2 {
        return Err(bad(format!("{:?} needs exactly two primitive loops", config.main)));
    }
    let (a, b) = (first_prim, first_prim + 1);

    let (m, n, leading) = if config.main == PrimType::Transpose {
        let (m, n) = if dims[a].stride_in0 == 1 { (a, b) } else { (b, a) };
        if dims[m].stride_in0 != 1 || dims[n].stride_out != 1 {
            return Err(bad("transpose needs one loop contiguous in in0 and the other contiguous in out"));
        }
        (m, n, LeadingDims { lda: dims[n].stride_in0, ldc: dims[m].stride_out, ..Default::default() })
    } else {
        let contiguous = dims[a].stride_out == 1 && (config.main == PrimType::Zero || dims[a].stride_in0 == 1);
        if !contiguous {
            return Err(bad("first primitive loop must be contiguous in the operands"));
        }
        (a, b, LeadingDims { lda: dims[b].stride_in0, ldc: dims[b].stride_out, ..Default::default() })
    };
    Ok((PrimIds { m, n, k: None, batch: None }, leading))
}

/// Whether the output strides of the non-reduction loops nest, so that distinct
/// index tuples address distinct output elements.
fn output_is_disjoint(dims: &[LoopDim]) -> bool {
    let mut axes: Vec<(usize, usize)> = dims
        .iter()
        .filter(|d| d.dim_type != DimType::K && d.size > 1)
        .map(|d| (d.stride_out, d.size))
        .collect();
    axes.sort_unstable();
    let mut covered = 1usize;
    for (stride, size) in axes {
        if stride < covered {
            return false;
        }
        match (size - 1).checked_mul(stride).and_then(|s| s.checked_add(covered)) {
            Some(next) => covered = next,
            None => return false,
        }
    }
    true
}

/// Kernel strides converted to the calling convention.
#[derive(Debug, Clone, Copy)]
struct KernelArgs {
    lda: i64,
    ldb: i64,
    ldc: i64,
    batch_stride_a: i64,
    batch_stride_b: i64,
}

/// Main kernel of a compiled contraction.
#[derive(Debug)]
pub enum MainKernel {
    Gemm(GemmKernel),
    Unary(UnaryKernel),
}

impl MainKernel {
    pub fn as_generated(&self) -> &dyn GeneratedKernel {
        match self {
            MainKernel::Gemm(kernel) => kernel,
            MainKernel::Unary(kernel) => kernel,
        }
    }
}

/// One kernel invocation of the loop walker: operand offsets in elements and the
/// touch flags in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelInvocation {
    pub in0: usize,
    pub in1: usize,
    pub out: usize,
    pub first: bool,
    pub last: bool,
}

#[derive(Clone, Copy)]
struct SendPtr(*mut f32);

// SAFETY: only used to hand operand base pointers to rayon workers that write
// disjoint output blocks.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    fn get(self) -> *mut f32 {
        self.0
    }
}

/// A compiled contraction. Read-only; safe to execute from several threads.
#[derive(Debug)]
pub struct CompiledOperation {
    config: ContractionConfig,
    layout: Layout,
    args: KernelArgs,
    main: MainKernel,
    first_touch: Option<UnaryKernel>,
    last_touch: Option<UnaryKernel>,
    stats: GenerationStats,
}

impl CompiledOperation {
    pub fn config(&self) -> &ContractionConfig {
        &self.config
    }

    pub fn prim_ids(&self) -> PrimIds {
        self.layout.prim
    }

    pub fn leading_dims(&self) -> LeadingDims {
        self.layout.leading
    }

    pub fn main_kernel(&self) -> &MainKernel {
        &self.main
    }

    pub fn first_touch_kernel(&self) -> Option<&UnaryKernel> {
        self.first_touch.as_ref()
    }

    pub fn last_touch_kernel(&self) -> Option<&UnaryKernel> {
        self.last_touch.as_ref()
    }

    /// Statistics of the kernels generated by `compile`.
    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    /// Every generated kernel, main kernel first.
    pub fn kernels(&self) -> Vec<&dyn GeneratedKernel> {
        let touches = self.first_touch.iter().chain(&self.last_touch).map(|k| k as &dyn GeneratedKernel);
        std::iter::once(self.main.as_generated()).chain(touches).collect()
    }

    /// Number of elements each of in0, in1 and out must hold. Zero for an operand the
    /// kernels never touch.
    pub fn operand_extents(&self) -> [usize; 3] {
        self.layout.extents
    }

    /// Visit every kernel invocation of a sequential execution, in order.
    pub fn walk(&self, mut visit: impl FnMut(KernelInvocation)) {
        self.walk_from(0, [0; 3], true, true, &mut visit);
    }

    /// Visit every kernel invocation of a parallel execution. Each flattened shared
    /// index is one rayon task, so `visit` runs concurrently and in no fixed order.
    pub fn walk_parallel(&self, visit: impl Fn(KernelInvocation) + Sync) {
        self.par_walk_from(true, true, &visit);
    }

    fn par_walk_from<F: Fn(KernelInvocation) + Sync>(&self, first: bool, last: bool, visit: &F) {
        let shared = &self.config.dims[..self.layout.shared];
        let tasks: usize = shared.iter().map(|d| d.size).product();
        log::trace!("dispatching {tasks} tasks over {} shared loops", shared.len());

        (0..tasks).into_par_iter().for_each(|flat| {
            let mut rest = flat;
            let mut base = [0usize; 3];
            for dim in shared.iter().rev() {
                let i = rest % dim.size;
                rest /= dim.size;
                for (offset, stride) in base.iter_mut().zip(dim.strides()) {
                    *offset += i * stride;
                }
            }
            self.walk_from(shared.len(), base, first, last, &mut |inv| visit(inv));
        });
    }

    fn walk_from<F: FnMut(KernelInvocation)>(
        &self,
        loop_id: usize,
        base: [usize; 3],
        first: bool,
        last: bool,
        visit: &mut F,
    ) {
        if loop_id >= self.layout.first_prim {
            visit(KernelInvocation { in0: base[0], in1: base[1], out: base[2], first, last });
            return;
        }
        let dim = &self.config.dims[loop_id];
        let reduction = dim.dim_type == DimType::K;
        for i in 0..dim.size {
            let offsets = [
                base[0] + i * dim.stride_in0,
                base[1] + i * dim.stride_in1,
                base[2] + i * dim.stride_out,
            ];
            let first = first && (!reduction || i == 0);
            let last = last && (!reduction || i + 1 == dim.size);
            self.walk_from(loop_id + 1, offsets, first, last, visit);
        }
    }

    fn check_operands(&self, in0: usize, in1: usize, out: usize) -> JitResult<()> {
        let names = ["in0", "in1", "out"];
        for ((name, have), need) in names.into_iter().zip([in0, in1, out]).zip(self.layout.extents) {
            if have < need {
                return Err(bad(format!("operand {name} holds {have} elements, contraction addresses {need}")));
            }
        }
        ensure_native_host()
    }

    /// Run the contraction sequentially on slices. `in1` is ignored by unary
    /// contractions and `in0` by zero contractions; pass empty slices there.
    pub fn execute(&self, in0: &[f32], in1: &[f32], out: &mut [f32]) -> JitResult<()> {
        self.check_operands(in0.len(), in1.len(), out.len())?;
        // SAFETY: every operand holds its extent, `out` is a unique borrow and the
        // host is aarch64.
        unsafe { self.execute_raw(in0.as_ptr(), in1.as_ptr(), out.as_mut_ptr()) };
        Ok(())
    }

    /// Run the contraction with the shared loops distributed over the rayon pool.
    ///
    /// Fails with `BadParameter` when shared loops are present but distinct indices
    /// may address the same output element.
    pub fn execute_parallel(&self, in0: &[f32], in1: &[f32], out: &mut [f32]) -> JitResult<()> {
        if self.layout.shared > 0 && !self.layout.disjoint_output {
            return Err(bad("output blocks of the shared loops may overlap"));
        }
        self.check_operands(in0.len(), in1.len(), out.len())?;
        // SAFETY: as in `execute`; shared loops write disjoint output blocks.
        unsafe { self.execute_iter_parallel(in0.as_ptr(), in1.as_ptr(), out.as_mut_ptr(), true, true) };
        Ok(())
    }

    /// Run the contraction sequentially on raw pointers.
    ///
    /// # Safety
    /// Must run on an aarch64 host. Each operand must be valid for
    /// [`operand_extents`](Self::operand_extents) elements (reads for the inputs,
    /// reads and writes for the output), and the output must not overlap the inputs.
    pub unsafe fn execute_raw(&self, in0: *const f32, in1: *const f32, out: *mut f32) {
        self.execute_iter(0, in0, in1, out, true, true);
    }

    /// Walk the loops from `loop_id` inward and invoke the kernels.
    ///
    /// # Safety
    /// As for [`execute_raw`](Self::execute_raw), with the pointers positioned at the
    /// block selected by the loops outside `loop_id`.
    pub unsafe fn execute_iter(
        &self,
        loop_id: usize,
        in0: *const f32,
        in1: *const f32,
        out: *mut f32,
        first: bool,
        last: bool,
    ) {
        self.walk_from(loop_id, [0; 3], first, last, &mut |inv| {
            // SAFETY: offsets stay within the operand extents guaranteed by the caller.
            unsafe { self.invoke(in0, in1, out, inv) }
        });
    }

    /// Distribute the shared loops over the rayon pool, one task per flattened
    /// shared index, each walking the remaining loops like [`walk_parallel`](Self::walk_parallel).
    ///
    /// # Safety
    /// As for [`execute_raw`](Self::execute_raw). Additionally the shared loops must
    /// address disjoint output blocks.
    pub unsafe fn execute_iter_parallel(
        &self,
        in0: *const f32,
        in1: *const f32,
        out: *mut f32,
        first: bool,
        last: bool,
    ) {
        let (in0, in1, out) = (SendPtr(in0 as *mut f32), SendPtr(in1 as *mut f32), SendPtr(out));
        self.par_walk_from(first, last, &|inv| {
            // SAFETY: the task owns the output block selected by its shared indices.
            unsafe { self.invoke(in0.get(), in1.get(), out.get(), inv) }
        });
    }

    unsafe fn invoke(&self, in0: *const f32, in1: *const f32, out: *mut f32, inv: KernelInvocation) {
        let a = in0.wrapping_add(inv.in0);
        let b = in1.wrapping_add(inv.in1);
        let c = out.wrapping_add(inv.out);
        let args = &self.args;
        match &self.main {
            MainKernel::Gemm(kernel) => {
                if inv.first {
                    if let Some(touch) = &self.first_touch {
                        touch_in_place(touch, c, args.ldc);
                    }
                }
                kernel.call(a, b, c, args.lda, args.ldb, args.ldc, args.batch_stride_a, args.batch_stride_b);
                if inv.last {
                    if let Some(touch) = &self.last_touch {
                        touch_in_place(touch, c, args.ldc);
                    }
                }
            }
            MainKernel::Unary(kernel) => kernel.call(a, c, args.lda, args.ldc),
        }
    }
}

/// Apply a touch kernel to the output block at `c`; zero gets a null input.
unsafe fn touch_in_place(touch: &UnaryKernel, c: *mut f32, ldc: i64) {
    let input = if touch.op().reads_input() { c as *const f32 } else { std::ptr::null() };
    touch.call(input, c, ldc, ldc);
}

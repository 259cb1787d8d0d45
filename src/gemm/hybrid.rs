//! Unpacked-A kernel driver.
//!
//! A is never repacked: the micro-kernel reads it through per-row slices,
//! which cover plain, indirect and convolution-shaped operands alike. B must
//! be pretransposed (or supplied in fixed format). Each work unit owns one
//! `OUT_HEIGHT × n_block` output tile and finishes it over the whole of K,
//! so the output is written once and units can be handed out in any size.

use std::marker::PhantomData;

use crate::convolution::{ConvolutionParameters, Convolver};
use crate::error::GemmResult;
use crate::ndrange::{NDRange, Window, WorkRange};
use crate::quantized::OutputStage;
use crate::traits::Element;
use crate::types::{iceildiv, roundup};
use crate::validation::validate_bindings;

use super::args::{GemmArgs, GemmMethod, KernelDescription};
use super::arrays::{ErasedArrays, GemmArrays, IndirectRows, SharedMutSlice};
use super::common::{GemmCommon, IGemmCommon};
use super::merge::{merge_tile, OutputTile};
use super::pretranspose::{BLayout, PretransposedB};
use super::strategy::HybridStrategy;
use super::workspace::{carve, region_bytes, Workspace};

pub struct GemmHybrid<'a, S: HybridStrategy<Lhs = To>, To: Element, Tr: Element> {
    args: GemmArgs,
    arrays: Option<GemmArrays<'a, To, To, Tr>>,
    indirect: Option<(usize, IndirectRows<'a, To>)>,
    convolver: Option<Convolver<To>>,
    layout: BLayout,
    k_block: usize,
    n_block: usize,
    /// (M tiles, batches, N blocks, multis).
    window: NDRange<4>,
    pretransposed: Option<PretransposedB<'a, S::Rhs>>,
    workspace: Workspace<'a>,
    nthreads: usize,
    _strategy: PhantomData<fn() -> S>,
}

impl<'a, S: HybridStrategy<Lhs = To>, To: Element, Tr: Element> GemmHybrid<'a, S, To, Tr> {
    pub fn new(args: &GemmArgs, _os: &OutputStage) -> Self {
        let layout = BLayout {
            n: args.n,
            k: args.k,
            k_sections: args.k_sections,
            nmulti: args.nmulti,
            out_width: S::OUT_WIDTH,
            k_unroll: S::K_UNROLL,
            col_sums: false,
        };
        let k_block = Self::compute_k_block(args, &layout);
        let n_block = Self::compute_n_block(args);
        let window = NDRange::new([
            iceildiv(args.m, S::OUT_HEIGHT),
            args.nbatches,
            iceildiv(args.n, n_block),
            args.nmulti,
        ]);
        let nthreads = args.max_threads.max(1);
        let per_thread = region_bytes::<S::Result>(iceildiv(n_block, S::OUT_WIDTH) * S::OUT_HEIGHT * S::OUT_WIDTH);

        log::debug!("{}: k_block={k_block} n_block={n_block} window={:?}", S::NAME, window.sizes());

        Self {
            args: args.clone(),
            arrays: None,
            indirect: None,
            convolver: None,
            layout,
            k_block,
            n_block,
            window,
            pretransposed: None,
            workspace: Workspace::new(per_thread, nthreads),
            nthreads,
            _strategy: PhantomData,
        }
    }

    /// Split K only when it is well past what a block of A rows keeps in L1.
    fn compute_k_block(args: &GemmArgs, layout: &BLayout) -> usize {
        let ktotal = layout.ktotal();
        if let Some(kb) = args.inner_block_size() {
            return roundup(kb, S::K_UNROLL).min(ktotal);
        }
        let target = 2048 / std::mem::size_of::<To>();
        if ktotal * 2 <= target * 3 {
            return ktotal;
        }
        let blocks = iceildiv(ktotal, target);
        roundup(iceildiv(ktotal, blocks), S::K_UNROLL)
    }

    fn compute_n_block(args: &GemmArgs) -> usize {
        let w = S::OUT_WIDTH;
        if let Some(nb) = args.outer_block_size() {
            return roundup(nb, w);
        }
        // Narrow outputs, or very tall ones, are not worth splitting in N.
        if args.n <= 64 || args.m / args.n.max(1) > 155 {
            return args.n;
        }
        if args.k <= 128 && args.max_threads <= 16 {
            return w * 3;
        }
        w
    }

    pub fn estimate_cycles(args: &GemmArgs, _os: &OutputStage) -> u64 {
        let params = S::performance(&args.ci);
        let ktotal = args.k_sections * roundup(args.k, S::K_UNROLL);
        let macs = (args.nbatches * args.nmulti) as f64
            * roundup(args.m, S::OUT_HEIGHT) as f64
            * roundup(args.n, S::OUT_WIDTH) as f64
            * ktotal as f64;
        let mut cycles = macs / params.kernel_macs_cycle as f64;

        let parallelism = iceildiv(args.m, S::OUT_HEIGHT)
            * args.nbatches
            * args.nmulti
            * iceildiv(args.n, Self::compute_n_block(args));
        if parallelism < args.max_threads {
            cycles *= args.max_threads as f64 / parallelism as f64;
        }
        cycles as u64
    }

    /// Point `rows[..active]` at columns `[p0, p1)` of section `s` for output
    /// rows starting at `y0`. Returns the real width (padding excluded).
    #[allow(clippy::too_many_arguments)]
    fn string_rows<'s>(
        &'s self,
        arrays: &'s GemmArrays<'a, To, To, Tr>,
        rows: &mut [&'s [To]],
        batch: usize,
        multi: usize,
        y0: usize,
        s: usize,
        p0: usize,
        p1: usize,
    ) -> usize {
        let k = self.args.k;

        if let Some((string_len, ind)) = self.indirect {
            let width = p1.min(string_len).saturating_sub(p0);
            if width > 0 {
                let section = &ind[(multi * self.args.nbatches + batch) * self.args.k_sections + s];
                for (r, row) in rows.iter_mut().enumerate() {
                    *row = &section[y0 + r][p0..p0 + width];
                }
            }
            return width;
        }

        let a = &arrays.a[multi * arrays.a_multi_stride + batch * arrays.a_batch_stride..];
        if let Some(conv) = &self.convolver {
            let rounded = self.layout.rounded_k();
            let cols = conv.process_columns(a, arrays.lda, s * rounded + p0, s * rounded + p1, rounded);
            let mut handler = cols.process_rows(y0, rows.len());
            let (width, offset) = handler.next_block(rows);
            if width > 0 {
                for row in rows.iter_mut() {
                    let pixel: &'s [To] = *row;
                    *row = &pixel[offset..offset + width];
                }
            }
            return width;
        }

        let width = p1.min(k).saturating_sub(p0);
        for (r, row) in rows.iter_mut().enumerate() {
            let start = (y0 + r) * arrays.lda + s * k + p0;
            *row = &a[start..start + width];
        }
        width
    }

    /// # Safety
    /// Same contract as `execute`; `scratch` belongs to this caller alone.
    unsafe fn run(
        &self,
        arrays: &GemmArrays<'a, To, To, Tr>,
        pb: &PretransposedB<'a, S::Rhs>,
        scratch: &mut [u8],
        start: usize,
        end: usize,
    ) {
        let (h, w) = (S::OUT_HEIGHT, S::OUT_WIDTH);
        let (m, n) = (self.args.m, self.args.n);
        let ktotal = self.layout.ktotal();
        let rounded = self.layout.rounded_k();
        let tile_len = h * w;

        let (tiles, _) = carve::<S::Result>(scratch, iceildiv(self.n_block, w) * tile_len);
        let mut rows: Vec<&[To]> = Vec::with_capacity(h);

        let mut it = self.window.iterator(start, end);
        while !it.done() {
            let (batch, multi) = (it.dim(1), it.dim(3));
            let y0 = it.dim(0) * h;
            let active = h.min(m - y0);
            let n0 = it.dim(2) * self.n_block;
            let nmax = (n0 + self.n_block).min(n);
            let stripes = iceildiv(nmax - n0, w);
            tiles[..stripes * tile_len].fill(<S::Result as Element>::ZERO);

            let mut k0 = 0;
            while k0 < ktotal {
                let kmax = (k0 + self.k_block).min(ktotal);
                let mut kp = k0;
                while kp < kmax {
                    let (s, p0) = (kp / rounded, kp % rounded);
                    let p1 = rounded.min(p0 + (kmax - kp));
                    rows.clear();
                    rows.resize(active, &[]);
                    let width = self.string_rows(arrays, &mut rows, batch, multi, y0, s, p0, p1);
                    if width > 0 {
                        for (j, tile) in tiles.chunks_exact_mut(tile_len).take(stripes).enumerate() {
                            let stripe = pb.stripe(&self.layout, multi, s * rounded + p0, n0 + j * w);
                            S::kernel(&rows, width, stripe, tile);
                        }
                    }
                    kp += p1 - p0;
                }
                k0 = kmax;
            }

            let c_base = multi * arrays.c_multi_stride + batch * arrays.c_batch_stride + y0 * arrays.ldc;
            for (j, tile) in tiles.chunks_exact(tile_len).take(stripes).enumerate() {
                let xs = n0 + j * w;
                let cols = w.min(nmax - xs);
                let bias = arrays.bias.map(|b| {
                    let first = multi * arrays.bias_multi_stride + xs;
                    &b[first..first + cols]
                });
                let dst = OutputTile { offset: c_base + xs, ldc: arrays.ldc, rows: active, cols };
                merge_tile(tile, w, &arrays.c, dst, bias, self.args.act, false, true);
            }
            it.next_dim0();
        }
    }
}

impl<'a, S: HybridStrategy<Lhs = To>, To: Element, Tr: Element> IGemmCommon<'a> for GemmHybrid<'a, S, To, Tr> {
    fn set_arrays_generic(&mut self, arrays: ErasedArrays<'a>) -> GemmResult<()> {
        self.try_set_arrays(arrays.into_typed::<To, To, Tr>()?)
    }

    fn get_window_size(&self) -> Window {
        Window::new([self.window.total_size(), 1, 1, 1, 1, 1])
    }

    unsafe fn execute(&self, work_range: &WorkRange, _thread_locator: &WorkRange, threadid: usize) {
        let Some(arrays) = self.arrays.as_ref() else {
            log::warn!("{}: execute before set_arrays", S::NAME);
            return;
        };
        let Some(pb) = self.pretransposed.as_ref() else {
            log::warn!("{}: execute before B was pretransposed", S::NAME);
            return;
        };
        let start = work_range.get_position(0);
        let end = work_range.get_position_end(0).min(self.window.total_size());
        if start >= end {
            return;
        }
        // SAFETY: forwarded from the caller; distinct thread ids give distinct scratch.
        unsafe { self.workspace.with_scratch(threadid, |scratch| self.run(arrays, pb, scratch, start, end)) }
    }

    fn get_config(&self) -> KernelDescription {
        KernelDescription {
            method: GemmMethod::GemmHybrid,
            name: S::NAME.to_string(),
            is_default: self.args.uses_default_selection(),
            cycle_estimate: Self::estimate_cycles(&self.args, &OutputStage::Nothing),
        }
    }

    fn set_nthreads(&mut self, nthreads: usize) {
        let max = self.args.max_threads.max(1);
        if nthreads > max {
            log::warn!("{}: set_nthreads({nthreads}) above configured {max}, clamping", S::NAME);
        }
        self.nthreads = self.workspace.set_nthreads(nthreads.clamp(1, max));
    }

    fn get_nthreads(&self) -> usize {
        self.nthreads
    }

    fn supports_dynamic_scheduling(&self) -> bool {
        true
    }

    fn get_working_size(&self) -> usize {
        self.workspace.required_size()
    }

    fn set_working_space(&mut self, workspace: &'a mut [u8]) -> GemmResult<()> {
        self.workspace.bind(workspace)
    }

    fn b_is_pretransposed(&self) -> bool {
        !self.args.fixed_format
    }

    fn b_pretranspose_required(&self) -> bool {
        !self.args.fixed_format
    }

    fn get_b_pretransposed_array_size(&self) -> usize {
        self.layout.size_bytes::<S::Rhs>()
    }

    fn get_b_pretranspose_window_size(&self) -> usize {
        self.layout.window_size()
    }

    fn set_pretransposed_b_data(&mut self, buffer: &'a [u8]) -> GemmResult<()> {
        self.pretransposed = Some(self.layout.view::<S::Rhs>(buffer)?);
        Ok(())
    }
}

impl<'a, S: HybridStrategy<Lhs = To>, To: Element, Tr: Element> GemmCommon<'a, To, To, Tr> for GemmHybrid<'a, S, To, Tr> {
    fn set_arrays(&mut self, arrays: GemmArrays<'a, To, To, Tr>) {
        if self.args.fixed_format {
            match bytemuck::try_cast_slice::<To, S::Rhs>(arrays.b) {
                Ok(data) if To::DATA_TYPE == <S::Rhs as Element>::DATA_TYPE => {
                    self.pretransposed = Some(PretransposedB {
                        col_sums: &[],
                        data,
                        stripe_stride: arrays.ldb,
                        multi_stride: arrays.b_multi_stride,
                    });
                }
                _ => log::warn!("{}: B cannot be read in fixed format, pretranspose it instead", S::NAME),
            }
        }
        self.arrays = Some(arrays);
    }

    fn try_set_arrays(&mut self, arrays: GemmArrays<'a, To, To, Tr>) -> GemmResult<()> {
        let conv = self.convolver.as_ref().map(Convolver::params);
        validate_bindings(&self.args, &arrays, self.pretransposed.is_some(), self.indirect, conv)?;
        self.set_arrays(arrays);
        Ok(())
    }

    unsafe fn pretranspose_b_array_part(
        &self,
        buffer: &SharedMutSlice<'_, u8>,
        b: &[To],
        ldb: usize,
        b_multi_stride: usize,
        start: usize,
        end: usize,
    ) -> GemmResult<()> {
        // SAFETY: unit ranges are disjoint per the caller's contract.
        unsafe { self.layout.pack_part::<To, S::Rhs>(None, buffer, b, ldb, b_multi_stride, start, end) }
    }

    fn set_indirect_parameters(&mut self, string_len: usize, rows: IndirectRows<'a, To>) {
        self.indirect = Some((string_len, rows));
    }

    fn set_convolution_parameters(&mut self, params: ConvolutionParameters) {
        self.convolver = Some(Convolver::new(params));
    }
}

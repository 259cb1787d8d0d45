//! Packed-A kernel driver.
//!
//! Work unit: one `OUT_HEIGHT`-row panel of one (batch, multi). For every K
//! block the panel is packed through the interleave family (plain, indirect
//! or convolution-shaped A), multiplied against every B stripe and merged
//! into C. Partial K blocks accumulate in C; bias lands with the first block
//! and the activation with the last.
//!
//! Requantizing instances run the whole K in one block so row sums, column
//! sums and the i32 tile are complete when the output stage runs.

use std::marker::PhantomData;

use crate::convolution::{ConvolutionParameters, Convolver};
use crate::error::GemmResult;
use crate::interleave::{
    convolution_interleave, indirect_interleave, interleave, packed_size, read_row_sums, row_sum_elements,
    sectioned_interleave,
};
use crate::ndrange::{NDRange, Window, WorkRange};
use crate::quantized::{OutputStage, Requantize32};
use crate::traits::Element;
use crate::types::{iceildiv, roundup, DataType};
use crate::validation::validate_bindings;

use super::args::{GemmArgs, GemmMethod, KernelDescription};
use super::arrays::{ErasedArrays, GemmArrays, IndirectRows, SharedMutSlice};
use super::common::{GemmCommon, IGemmCommon};
use super::merge::{merge_tile, requantize_tile, OutputTile};
use super::pretranspose::{BLayout, PretransposedB};
use super::strategy::InterleavedStrategy;
use super::workspace::{carve, region_bytes, Workspace};

pub struct GemmInterleaved<'a, S: InterleavedStrategy, To: Element, Tr: Element> {
    args: GemmArgs,
    qp: Option<Requantize32>,
    arrays: Option<GemmArrays<'a, To, To, Tr>>,
    indirect: Option<(usize, IndirectRows<'a, To>)>,
    convolver: Option<Convolver<To>>,
    layout: BLayout,
    k_block: usize,
    x_block: usize,
    /// (M panels, batches, multis).
    window: NDRange<3>,
    pretransposed: Option<PretransposedB<'a, S::Operand>>,
    workspace: Workspace<'a>,
    nthreads: usize,
    quant_bias: Option<(&'a [i32], usize)>,
    _strategy: PhantomData<fn() -> S>,
}

impl<'a, S: InterleavedStrategy, To: Element, Tr: Element> GemmInterleaved<'a, S, To, Tr> {
    pub fn new(args: &GemmArgs, os: &OutputStage) -> Self {
        let qp = match os.requantize() {
            Some(qp) if <S::Result as Element>::DATA_TYPE == DataType::S32 => Some(qp.clone()),
            Some(_) => {
                log::warn!("{}: requantization needs an i32 accumulator, ignoring output stage", S::NAME);
                None
            }
            None => None,
        };
        let layout = BLayout {
            n: args.n,
            k: args.k,
            k_sections: args.k_sections,
            nmulti: args.nmulti,
            out_width: S::OUT_WIDTH,
            k_unroll: S::K_UNROLL,
            col_sums: qp.is_some(),
        };
        let k_block = Self::compute_k_block(args, &layout, qp.is_some());
        let x_block = Self::compute_x_block(args, k_block);
        let window = NDRange::new([iceildiv(args.m, S::OUT_HEIGHT), args.nbatches, args.nmulti]);
        let nthreads = args.max_threads.max(1);
        let workspace = Workspace::new(Self::per_thread_bytes(&layout, k_block, qp.is_some()), nthreads);

        log::debug!(
            "{}: M={} N={} K={}x{} k_block={k_block} x_block={x_block} window={:?}",
            S::NAME,
            args.m,
            args.n,
            args.k_sections,
            args.k,
            window.sizes()
        );

        Self {
            args: args.clone(),
            qp,
            arrays: None,
            indirect: None,
            convolver: None,
            layout,
            k_block,
            x_block,
            window,
            pretransposed: None,
            workspace,
            nthreads,
            quant_bias: None,
            _strategy: PhantomData,
        }
    }

    // ── Blocking ─────────────────────────────────────────────────────

    /// K block: half of L1 holds one A panel row-block plus one B stripe
    /// block, then blocks are evened out over the total depth.
    fn compute_k_block(args: &GemmArgs, layout: &BLayout, quantized: bool) -> usize {
        let ktotal = layout.ktotal();
        if quantized {
            return ktotal;
        }
        if let Some(kb) = args.inner_block_size() {
            return roundup(kb, S::K_UNROLL).min(ktotal);
        }
        let elem = std::mem::size_of::<S::Operand>();
        let target = (args.ci.l1d / 2) / (elem * S::OUT_WIDTH.max(S::OUT_HEIGHT));
        let target = (target / S::K_UNROLL * S::K_UNROLL).max(S::K_UNROLL);
        let blocks = iceildiv(ktotal, target);
        roundup(iceildiv(ktotal, blocks), S::K_UNROLL)
    }

    /// N block: what remains of 90% of L2 after the A and B blocks, in
    /// whole stripes, evened out over N.
    fn compute_x_block(args: &GemmArgs, k_block: usize) -> usize {
        if let Some(xb) = args.outer_block_size() {
            return roundup(xb, S::OUT_WIDTH);
        }
        let elem = std::mem::size_of::<S::Operand>();
        let l2 = args.ci.l2 * 9 / 10;
        let used = k_block * elem * (S::OUT_WIDTH + S::OUT_HEIGHT);
        let x = l2.saturating_sub(used) / (elem * k_block);
        let x = (x / S::OUT_WIDTH * S::OUT_WIDTH).max(S::OUT_WIDTH);
        let blocks = iceildiv(args.n, x);
        roundup(iceildiv(args.n, blocks), S::OUT_WIDTH)
    }

    fn a_panel_len(layout: &BLayout, k_block: usize, quantized: bool) -> usize {
        packed_size::<S::Operand>(S::lhs_shape(), layout.ktotal(), 0, S::OUT_HEIGHT, 0, k_block, quantized)
    }

    fn per_thread_bytes(layout: &BLayout, k_block: usize, quantized: bool) -> usize {
        region_bytes::<S::Operand>(Self::a_panel_len(layout, k_block, quantized))
            + region_bytes::<S::Result>(S::OUT_HEIGHT * S::OUT_WIDTH)
            + region_bytes::<S::Operand>(layout.stripe_len())
            + region_bytes::<i32>(S::OUT_WIDTH)
    }

    /// Rough cycle count for the factory's ranking.
    pub fn estimate_cycles(args: &GemmArgs, os: &OutputStage) -> u64 {
        let params = S::performance(&args.ci);
        let ktotal = args.k_sections * roundup(args.k, S::K_UNROLL);
        let problems = (args.nbatches * args.nmulti) as f64;
        let m_round = roundup(args.m, S::OUT_HEIGHT) as f64;
        let n_round = roundup(args.n, S::OUT_WIDTH) as f64;
        let k_blocks = if os.requantize().is_some() {
            1
        } else {
            let layout = BLayout {
                n: args.n,
                k: args.k,
                k_sections: args.k_sections,
                nmulti: args.nmulti,
                out_width: S::OUT_WIDTH,
                k_unroll: S::K_UNROLL,
                col_sums: false,
            };
            iceildiv(ktotal, Self::compute_k_block(args, &layout, false))
        };

        let macs = problems * m_round * n_round * ktotal as f64;
        let prepare = problems * m_round * ktotal as f64 * std::mem::size_of::<To>() as f64;
        let merge = problems * (k_blocks * args.m * args.n * std::mem::size_of::<Tr>()) as f64;

        let mut cycles = macs / params.kernel_macs_cycle as f64
            + prepare / params.prepare_bytes_cycle as f64
            + merge / params.merge_bytes_cycle as f64;

        let parallelism = iceildiv(args.m, S::OUT_HEIGHT) * args.nbatches * args.nmulti;
        if parallelism < args.max_threads {
            cycles *= args.max_threads as f64 / parallelism as f64;
        }
        cycles as u64
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Pack rows `[y0, ymax)` of A over K `[k0, kmax)`. Returns elements written.
    #[allow(clippy::too_many_arguments)]
    fn pack_a(
        &self,
        arrays: &GemmArrays<'a, To, To, Tr>,
        out: &mut [S::Operand],
        batch: usize,
        multi: usize,
        y0: usize,
        ymax: usize,
        k0: usize,
        kmax: usize,
    ) -> usize {
        let shape = S::lhs_shape();
        let rounded = self.layout.rounded_k();
        let row_sums = self.qp.as_ref().map(|qp| qp.b_offset.wrapping_neg());
        let k = self.args.k;

        if let Some((string_len, rows)) = self.indirect {
            let first = (multi * self.args.nbatches + batch) * self.args.k_sections;
            let sections = &rows[first..first + self.args.k_sections];
            return indirect_interleave(shape, out, sections, string_len, rounded, y0, ymax, k0, kmax, row_sums);
        }

        let a = &arrays.a[multi * arrays.a_multi_stride + batch * arrays.a_batch_stride..];
        if let Some(conv) = &self.convolver {
            return convolution_interleave(shape, out, a, arrays.lda, conv, rounded, y0, ymax, k0, kmax, row_sums);
        }
        if self.args.k_sections == 1 {
            return interleave(shape, out, a, arrays.lda, y0, ymax, k0, kmax.min(k), row_sums);
        }

        // Sections side by side along each row of a plain A.
        sectioned_interleave(shape, out, a, arrays.lda, k, rounded, y0, ymax, k0, kmax, row_sums)
    }

    /// # Safety
    /// Same contract as `execute`; `scratch` belongs to this caller alone.
    unsafe fn run(&self, arrays: &GemmArrays<'a, To, To, Tr>, scratch: &mut [u8], start: usize, end: usize) {
        let (h, w) = (S::OUT_HEIGHT, S::OUT_WIDTH);
        let (m, n) = (self.args.m, self.args.n);
        let ktotal = self.layout.ktotal();
        let quantized = self.qp.is_some();

        let (a_panel, rest) = carve::<S::Operand>(scratch, Self::a_panel_len(&self.layout, self.k_block, quantized));
        let (tile, rest) = carve::<S::Result>(rest, h * w);
        let (b_scratch, rest) = carve::<S::Operand>(rest, self.layout.stripe_len());
        let (sum_scratch, _) = carve::<i32>(rest, w);

        let mut it = self.window.iterator(start, end);
        while !it.done() {
            let (batch, multi) = (it.dim(1), it.dim(2));
            let y0 = it.dim(0) * h;
            let ymax = (y0 + h).min(m);
            let c_base = multi * arrays.c_multi_stride + batch * arrays.c_batch_stride + y0 * arrays.ldc;

            let mut k0 = 0;
            while k0 < ktotal {
                let kmax = (k0 + self.k_block).min(ktotal);
                let written = self.pack_a(arrays, a_panel, batch, multi, y0, ymax, k0, kmax);
                let row_sums = if quantized {
                    read_row_sums(&a_panel[written - row_sum_elements::<S::Operand>(h)..written], h)
                } else {
                    Vec::new()
                };

                let mut x0 = 0;
                while x0 < n {
                    let xmax = (x0 + self.x_block).min(n);
                    for xs in (x0..xmax).step_by(w) {
                        let cols = w.min(n - xs);
                        let b_panel: &[S::Operand] = match &self.pretransposed {
                            Some(pb) => pb.stripe(&self.layout, multi, k0, xs),
                            None => {
                                self.layout.pack_stripe(b_scratch, arrays.b, arrays.ldb, arrays.b_multi_stride, multi, xs / w);
                                &b_scratch[k0 * w..]
                            }
                        };

                        tile.fill(<S::Result as Element>::ZERO);
                        S::kernel(a_panel, b_panel, kmax - k0, tile);

                        let dst = OutputTile { offset: c_base + xs, ldc: arrays.ldc, rows: ymax - y0, cols };
                        match &self.qp {
                            Some(qp) => {
                                let col_sums: &[i32] = match &self.pretransposed {
                                    Some(pb) if !pb.col_sums.is_empty() => pb.col_sums(&self.layout, multi, xs, cols),
                                    _ => {
                                        self.layout.col_sums_for(
                                            qp,
                                            sum_scratch,
                                            arrays.b,
                                            arrays.ldb,
                                            arrays.b_multi_stride,
                                            multi,
                                            xs,
                                            xs + cols,
                                        );
                                        &sum_scratch[..cols]
                                    }
                                };
                                let bias = self.quant_bias.map(|(b, stride)| &b[multi * stride + xs..multi * stride + xs + cols]);
                                let acc: &[i32] = bytemuck::cast_slice(&tile[..]);
                                requantize_tile(qp, acc, w, &arrays.c, dst, &row_sums, col_sums, bias, xs);
                            }
                            None => {
                                let bias = match (k0, arrays.bias) {
                                    (0, Some(b)) => {
                                        let first = multi * arrays.bias_multi_stride + xs;
                                        Some(&b[first..first + cols])
                                    }
                                    _ => None,
                                };
                                merge_tile(tile, w, &arrays.c, dst, bias, self.args.act, k0 != 0, kmax == ktotal);
                            }
                        }
                    }
                    x0 = xmax;
                }
                k0 = kmax;
            }
            it.next_dim0();
        }
    }
}

impl<'a, S: InterleavedStrategy, To: Element, Tr: Element> IGemmCommon<'a> for GemmInterleaved<'a, S, To, Tr> {
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
        let start = work_range.get_position(0);
        let end = work_range.get_position_end(0).min(self.window.total_size());
        if start >= end {
            return;
        }
        // SAFETY: forwarded from the caller; distinct thread ids give distinct scratch.
        unsafe { self.workspace.with_scratch(threadid, |scratch| self.run(arrays, scratch, start, end)) }
    }

    fn get_config(&self) -> KernelDescription {
        let os = match &self.qp {
            Some(qp) => OutputStage::Requantize32(qp.clone()),
            None => OutputStage::Nothing,
        };
        KernelDescription {
            method: GemmMethod::GemmInterleaved,
            name: S::NAME.to_string(),
            is_default: self.args.uses_default_selection(),
            cycle_estimate: Self::estimate_cycles(&self.args, &os),
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

    fn get_working_size(&self) -> usize {
        self.workspace.required_size()
    }

    fn set_working_space(&mut self, workspace: &'a mut [u8]) -> GemmResult<()> {
        self.workspace.bind(workspace)
    }

    fn b_is_pretransposed(&self) -> bool {
        !self.args.fixed_format
    }

    fn get_b_pretransposed_array_size(&self) -> usize {
        self.layout.size_bytes::<S::Operand>()
    }

    fn get_b_pretranspose_window_size(&self) -> usize {
        self.layout.window_size()
    }

    fn set_pretransposed_b_data(&mut self, buffer: &'a [u8]) -> GemmResult<()> {
        self.pretransposed = Some(self.layout.view::<S::Operand>(buffer)?);
        Ok(())
    }

    fn set_quantized_bias(&mut self, bias: &'a [i32], bias_multi_stride: usize) {
        self.quant_bias = Some((bias, bias_multi_stride));
    }
}

impl<'a, S: InterleavedStrategy, To: Element, Tr: Element> GemmCommon<'a, To, To, Tr>
    for GemmInterleaved<'a, S, To, Tr>
{
    fn set_arrays(&mut self, arrays: GemmArrays<'a, To, To, Tr>) {
        if self.args.fixed_format {
            match bytemuck::try_cast_slice::<To, S::Operand>(arrays.b) {
                Ok(data) if To::DATA_TYPE == <S::Operand as Element>::DATA_TYPE => {
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
        unsafe { self.layout.pack_part::<To, S::Operand>(self.qp.as_ref(), buffer, b, ldb, b_multi_stride, start, end) }
    }

    fn set_indirect_parameters(&mut self, string_len: usize, rows: IndirectRows<'a, To>) {
        self.indirect = Some((string_len, rows));
    }

    fn set_convolution_parameters(&mut self, params: ConvolutionParameters) {
        self.convolver = Some(Convolver::new(params));
    }
}

//! Layout of the pretransposed right-hand operand.
//!
//! B is stored stripe-major over the whole of `Ktotal = k_sections ×
//! roundup(K, k_unroll)`: every `out_width`-column stripe holds all K
//! sections back to back, so a kernel walking K reads one contiguous run.
//! Requantizing kernels keep the per-column offset sums in front of the
//! stripes.
//!
//! ```text
//! [col sums: nmulti × N i32, padded to 64 bytes]
//! [multi 0: stripe 0 | stripe 1 | ..][multi 1: ..]
//! ```

use crate::error::{GemmError, GemmResult};
use crate::interleave::transpose_interleave_b;
use crate::quantized::{compute_col_sums, Requantize32};
use crate::traits::Element;
use crate::types::roundup;

use super::args::WeightFormat;
use super::arrays::SharedMutSlice;

const COL_SUM_ALIGN: usize = 64;

/// Geometry of a pretransposed B buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BLayout {
    pub n: usize,
    pub k: usize,
    pub k_sections: usize,
    pub nmulti: usize,
    pub out_width: usize,
    pub k_unroll: usize,
    pub col_sums: bool,
}

impl BLayout {
    #[inline]
    pub fn rounded_k(&self) -> usize {
        roundup(self.k, self.k_unroll)
    }

    #[inline]
    pub fn ktotal(&self) -> usize {
        self.k_sections * self.rounded_k()
    }

    #[inline]
    pub fn n_stripes(&self) -> usize {
        self.n.div_ceil(self.out_width)
    }

    /// Elements in one stripe.
    #[inline]
    pub fn stripe_len(&self) -> usize {
        self.out_width * self.ktotal()
    }

    pub fn col_sum_bytes(&self) -> usize {
        if self.col_sums {
            roundup(self.nmulti * self.n * std::mem::size_of::<i32>(), COL_SUM_ALIGN)
        } else {
            0
        }
    }

    /// Total bytes for operand element type `T`.
    pub fn size_bytes<T>(&self) -> usize {
        self.col_sum_bytes() + self.nmulti * self.n_stripes() * self.stripe_len() * std::mem::size_of::<T>()
    }

    /// Pretranspose units: one per (multi, stripe).
    #[inline]
    pub fn window_size(&self) -> usize {
        self.nmulti * self.n_stripes()
    }

    /// Element offset of `(multi, k0, n0)` within the stripe data.
    #[inline]
    pub fn offset(&self, multi: usize, k0: usize, n0: usize) -> usize {
        (multi * self.n_stripes() + n0 / self.out_width) * self.stripe_len() + k0 * self.out_width
    }

    pub fn weight_format(&self) -> WeightFormat {
        WeightFormat::Interleaved { out_width: self.out_width, k_unroll: self.k_unroll }
    }

    /// Pack stripe `stripe` of B multi `multi` into `out`, section by section.
    /// Section `s` takes rows `[s·K, (s+1)·K)` of that multi.
    pub fn pack_stripe<Tw: Element, Top: Element>(
        &self,
        out: &mut [Top],
        b: &[Tw],
        ldb: usize,
        b_multi_stride: usize,
        multi: usize,
        stripe: usize,
    ) {
        let x0 = stripe * self.out_width;
        let xmax = (x0 + self.out_width).min(self.n);
        let section_len = self.rounded_k() * self.out_width;
        let b_multi = &b[multi * b_multi_stride..];
        for (s, dst) in out[..self.stripe_len()].chunks_exact_mut(section_len).enumerate() {
            let rows = &b_multi[s * self.k * ldb..];
            transpose_interleave_b(dst, rows, ldb, x0, xmax, 0, self.k, self.out_width, self.k_unroll);
        }
    }

    /// Offset sums for columns `[x0, xmax)` of B multi `multi`.
    #[allow(clippy::too_many_arguments)]
    pub fn col_sums_for<Tw: Element>(
        &self,
        qp: &Requantize32,
        out: &mut [i32],
        b: &[Tw],
        ldb: usize,
        b_multi_stride: usize,
        multi: usize,
        x0: usize,
        xmax: usize,
    ) {
        let b_multi = &b[multi * b_multi_stride + x0..];
        compute_col_sums(qp, b_multi, ldb, self.k_sections * self.k, xmax - x0, out);
    }

    /// Write units `[start, end)` into `buffer`.
    ///
    /// # Safety
    /// Concurrent calls must cover disjoint unit ranges of the same buffer.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pack_part<Tw: Element, Top: Element>(
        &self,
        qp: Option<&Requantize32>,
        buffer: &SharedMutSlice<'_, u8>,
        b: &[Tw],
        ldb: usize,
        b_multi_stride: usize,
        start: usize,
        end: usize,
    ) -> GemmResult<()> {
        let needed = self.size_bytes::<Top>();
        if buffer.len() < needed {
            return Err(GemmError::BufferTooSmall { what: "pretransposed B", needed, got: buffer.len() });
        }
        let n_stripes = self.n_stripes();
        let stripe_bytes = self.stripe_len() * std::mem::size_of::<Top>();
        let base = self.col_sum_bytes();

        for unit in start..end.min(self.window_size()) {
            let (multi, stripe) = (unit / n_stripes, unit % n_stripes);
            let first = base + unit * stripe_bytes;
            let bytes = buffer.slice_mut(first..first + stripe_bytes);
            let out: &mut [Top] = bytemuck::try_cast_slice_mut(bytes)?;
            self.pack_stripe(out, b, ldb, b_multi_stride, multi, stripe);

            if let (true, Some(qp)) = (self.col_sums, qp) {
                let x0 = stripe * self.out_width;
                let xmax = (x0 + self.out_width).min(self.n);
                let first = (multi * self.n + x0) * std::mem::size_of::<i32>();
                let bytes = buffer.slice_mut(first..first + (xmax - x0) * std::mem::size_of::<i32>());
                let sums: &mut [i32] = bytemuck::try_cast_slice_mut(bytes)?;
                self.col_sums_for(qp, sums, b, ldb, b_multi_stride, multi, x0, xmax);
            }
        }
        Ok(())
    }

    /// Split a finished buffer into its column sums and stripe data.
    pub fn view<'b, Top: Element>(&self, buffer: &'b [u8]) -> GemmResult<PretransposedB<'b, Top>> {
        let needed = self.size_bytes::<Top>();
        if buffer.len() < needed {
            return Err(GemmError::BufferTooSmall { what: "pretransposed B", needed, got: buffer.len() });
        }
        let (sums, data) = buffer[..needed].split_at(self.col_sum_bytes());
        let col_sums: &[i32] = if self.col_sums {
            bytemuck::try_cast_slice(&sums[..self.nmulti * self.n * std::mem::size_of::<i32>()])?
        } else {
            &[]
        };
        Ok(PretransposedB {
            col_sums,
            data: bytemuck::try_cast_slice(data)?,
            stripe_stride: self.stripe_len(),
            multi_stride: self.n_stripes() * self.stripe_len(),
        })
    }
}

/// Borrowed pretransposed B, either packed by this crate or supplied in
/// fixed format by the caller.
#[derive(Debug, Clone, Copy)]
pub struct PretransposedB<'b, Top> {
    /// `nmulti × N` offset sums (empty unless requantizing).
    pub col_sums: &'b [i32],
    pub data: &'b [Top],
    /// Elements between consecutive stripes.
    pub stripe_stride: usize,
    /// Elements between consecutive multis.
    pub multi_stride: usize,
}

impl<'b, Top> PretransposedB<'b, Top> {
    /// Stripe holding column `n0` of multi `multi`, starting at K position `k0`.
    #[inline]
    pub fn stripe(&self, layout: &BLayout, multi: usize, k0: usize, n0: usize) -> &'b [Top] {
        let base = multi * self.multi_stride + (n0 / layout.out_width) * self.stripe_stride;
        &self.data[base + k0 * layout.out_width..base + layout.stripe_len()]
    }

    #[inline]
    pub fn col_sums(&self, layout: &BLayout, multi: usize, n0: usize, width: usize) -> &'b [i32] {
        let start = multi * layout.n + n0;
        &self.col_sums[start..start + width]
    }
}

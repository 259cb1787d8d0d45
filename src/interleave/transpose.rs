//! Column-panel packing of the right-hand operand.

use crate::traits::Element;
use crate::types::{iceildiv, roundup};

/// Elements written by [`transpose_interleave_b`] for the same arguments.
pub fn transposed_size(x0: usize, xmax: usize, k0: usize, kmax: usize, out_width: usize, k_unroll: usize) -> usize {
    iceildiv(xmax - x0, out_width) * out_width * roundup(kmax - k0, k_unroll)
}

/// Pack `B[k0..kmax][x0..xmax]` (row-major, leading dimension `ldb`) into
/// `out_width`-column stripes. Within a stripe, each group of `k_unroll`
/// rows stores every column's `k_unroll` values contiguously:
///
/// ```text
/// stripe0: [k0..k0+U](x0) [k0..k0+U](x0+1) .. [k0+U..k0+2U](x0) ..
/// ```
///
/// Columns past `xmax` and rows past `kmax` are zero. Returns the number of
/// elements written.
#[allow(clippy::too_many_arguments)]
pub fn transpose_interleave_b<TIn: Element, TOut: Element>(
    out: &mut [TOut],
    b: &[TIn],
    ldb: usize,
    x0: usize,
    xmax: usize,
    k0: usize,
    kmax: usize,
    out_width: usize,
    k_unroll: usize,
) -> usize {
    let total = transposed_size(x0, xmax, k0, kmax, out_width, k_unroll);
    assert!(out.len() >= total, "transpose output {} < {total}", out.len());

    let k_groups = iceildiv(kmax - k0, k_unroll);
    let stripe_len = k_groups * out_width * k_unroll;

    for (s, stripe) in out[..total].chunks_exact_mut(stripe_len).enumerate() {
        let xs = x0 + s * out_width;
        for (g, group) in stripe.chunks_exact_mut(out_width * k_unroll).enumerate() {
            let kb = k0 + g * k_unroll;
            for (c, col) in group.chunks_exact_mut(k_unroll).enumerate() {
                let x = xs + c;
                for (u, d) in col.iter_mut().enumerate() {
                    let k = kb + u;
                    *d = if x < xmax && k < kmax { b[k * ldb + x].convert() } else { TOut::ZERO };
                }
            }
        }
    }
    total
}

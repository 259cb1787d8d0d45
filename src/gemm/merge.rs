//! Writing accumulator tiles back to the output.
//!
//! Rows are borrowed from the shared output one at a time, so concurrent
//! writers only need disjoint row segments.

use crate::quantized::{requantize_block_32, Requantize32};
use crate::traits::{Accumulator, Activation, Element};

use super::arrays::SharedMutSlice;

/// Output region a tile lands in: element offset of its top-left corner.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutputTile {
    pub offset: usize,
    pub ldc: usize,
    pub rows: usize,
    pub cols: usize,
}

impl OutputTile {
    /// # Safety
    /// No other live reference may overlap row `r` of this tile.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn row<'s, T>(&self, c: &'s SharedMutSlice<'_, T>, r: usize) -> &'s mut [T] {
        let start = self.offset + r * self.ldc;
        c.slice_mut(start..start + self.cols)
    }
}

/// Merge a `rows × cols` corner of `tile` (row stride `tile_stride`) into C.
///
/// With `append` the existing C values are accumulated into, otherwise
/// `bias` (already offset to the tile's first column) is added. The
/// activation runs only when `last` is set.
///
/// # Safety
/// No other thread may access the rows of `dst` concurrently.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn merge_tile<Tr: Accumulator, Tc: Element>(
    tile: &[Tr],
    tile_stride: usize,
    c: &SharedMutSlice<'_, Tc>,
    dst: OutputTile,
    bias: Option<&[Tc]>,
    act: Activation,
    append: bool,
    last: bool,
) {
    for r in 0..dst.rows {
        let src = &tile[r * tile_stride..r * tile_stride + dst.cols];
        let out = dst.row(c, r);
        for (i, (o, &v)) in out.iter_mut().zip(src).enumerate() {
            let mut v = v;
            if append {
                v = v.acc_add(o.convert());
            } else if let Some(bias) = bias {
                v = v.acc_add(bias[i].convert());
            }
            if last {
                v = v.activate(act);
            }
            *o = v.convert();
        }
    }
}

/// Requantize a finished i32 tile into C.
///
/// # Safety
/// No other thread may access the rows of `dst` concurrently.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn requantize_tile<Tc: Element>(
    qp: &Requantize32,
    tile: &[i32],
    tile_stride: usize,
    c: &SharedMutSlice<'_, Tc>,
    dst: OutputTile,
    row_sums: &[i32],
    col_sums: &[i32],
    bias: Option<&[i32]>,
    first_channel: usize,
) {
    for r in 0..dst.rows {
        let out = dst.row(c, r);
        requantize_block_32(
            qp,
            &tile[r * tile_stride..],
            tile_stride,
            1,
            dst.cols,
            &row_sums[r..r + 1],
            col_sums,
            bias,
            first_channel,
            out,
            dst.cols,
        );
    }
}

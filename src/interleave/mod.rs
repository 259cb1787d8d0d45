//! Operand repacking into panel-interleaved layout.
//!
//! All three entry points share one algorithm. Rows `[y0, ymax)` are taken in
//! groups of `rows_per_panel` and K `[k0, kmax)` is walked string by string
//! (a string is one kernel point's `rounded_stringlen` columns; plain
//! matrices are a single string). For every (group, string) the packer
//! writes `block`-wide column groups, row-interleaved:
//!
//! ```text
//! row0[0..B] row1[0..B] .. rowH-1[0..B] row0[B..2B] row1[B..2B] ..
//! ```
//!
//! Ragged trailing groups alias the group's first row. With row sums
//! enabled (integral outputs only) each group is followed by `rows_per_panel`
//! i32 sums, stored in-band in the output buffer.

pub mod registry;
pub mod transpose;

use crate::convolution::Convolver;
use crate::traits::Element;
use crate::types::{roundup, VLType};

pub use registry::{register_pack, with_pack_registry, PackFn, PackRegistry, Packer};
pub use transpose::{transpose_interleave_b, transposed_size};

/// Panel geometry a micro-kernel consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PanelShape {
    pub height_vectors: usize,
    pub block: usize,
    pub vl: VLType,
    /// Vector length in bytes for `VLType::Sve`; ignored otherwise.
    pub vector_bytes: usize,
}

impl PanelShape {
    pub const fn fixed(height_vectors: usize, block: usize) -> Self {
        Self { height_vectors, block, vl: VLType::None, vector_bytes: 0 }
    }

    pub const fn scalable(height_vectors: usize, block: usize, vector_bytes: usize) -> Self {
        Self { height_vectors, block, vl: VLType::Sve, vector_bytes }
    }

    /// Logical rows per panel for output element type `TOut`.
    pub fn rows_per_panel<TOut>(&self) -> usize {
        match self.vl {
            VLType::None => self.height_vectors,
            VLType::Sve => {
                let lanes = self.vector_bytes / std::mem::size_of::<TOut>() / self.block;
                self.height_vectors * lanes.max(1)
            }
        }
    }
}

/// `TOut` elements occupied by `rows` in-band i32 sums.
#[inline]
pub fn row_sum_elements<TOut>(rows: usize) -> usize {
    rows * std::mem::size_of::<i32>() / std::mem::size_of::<TOut>()
}

/// Packed columns one row group occupies for K range `[k0, kmax)`.
pub fn packed_group_width(block: usize, rounded_stringlen: usize, k0: usize, kmax: usize) -> usize {
    let mut k_left = kmax - k0;
    let mut stringpos = k0 % rounded_stringlen;
    let mut cols = 0;
    while k_left > 0 {
        let out_width = k_left.min(rounded_stringlen - stringpos);
        cols += roundup(out_width, block);
        k_left -= out_width;
        stringpos = 0;
    }
    cols
}

/// Output elements written for rows `[y0, ymax)` and K `[k0, kmax)`.
pub fn packed_size<TOut: Element>(
    shape: PanelShape,
    rounded_stringlen: usize,
    y0: usize,
    ymax: usize,
    k0: usize,
    kmax: usize,
    row_sums: bool,
) -> usize {
    let int_by = shape.rows_per_panel::<TOut>();
    let groups = (ymax - y0).div_ceil(int_by);
    let sums = if row_sums && TOut::IS_INTEGRAL { row_sum_elements::<TOut>(int_by) } else { 0 };
    groups * (int_by * packed_group_width(shape.block, rounded_stringlen, k0, kmax) + sums)
}

// ── Row sums ─────────────────────────────────────────────────────────

/// Per-row running sums: narrow i32 lanes folded into i64 totals every
/// `TOut::SUM_FOLD_INTERVAL` columns. The folded total is bit-identical to
/// summing every element directly, modulo 2^32.
struct RowSums {
    narrow: Vec<i32>,
    wide: Vec<i64>,
    pending: usize,
    fold_every: usize,
}

impl RowSums {
    fn new(rows: usize, fold_every: usize) -> Self {
        Self { narrow: vec![0; rows], wide: vec![0; rows], pending: 0, fold_every: fold_every.max(1) }
    }

    fn reset(&mut self) {
        self.narrow.fill(0);
        self.wide.fill(0);
        self.pending = 0;
    }

    fn fold(&mut self) {
        for (w, n) in self.wide.iter_mut().zip(self.narrow.iter_mut()) {
            *w += *n as i64;
            *n = 0;
        }
        self.pending = 0;
    }

    /// Absorb packed column groups of `block` columns by `rows` rows.
    fn accumulate<T: Element>(&mut self, packed: &[T], block: usize) {
        let rows = self.narrow.len();
        for panel in packed.chunks_exact(rows * block) {
            if self.pending + block > self.fold_every {
                self.fold();
            }
            for (sum, cols) in self.narrow.iter_mut().zip(panel.chunks_exact(block)) {
                for v in cols {
                    *sum += v.to_i32();
                }
            }
            self.pending += block;
        }
    }

    /// Store `sum * multiplier` for every row as native-endian i32.
    fn write<T: Element>(&mut self, out: &mut [T], multiplier: i32) {
        self.fold();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        for (dst, &total) in bytes.chunks_exact_mut(4).zip(&self.wide) {
            let v = (total as i32).wrapping_mul(multiplier);
            dst.copy_from_slice(&v.to_ne_bytes());
        }
    }
}

/// Read the in-band sums that follow a packed row group.
pub fn read_row_sums<T: Element>(packed: &[T], rows: usize) -> Vec<i32> {
    let bytes: &[u8] = bytemuck::cast_slice(&packed[..row_sum_elements::<T>(rows)]);
    bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned::<i32>).collect()
}

// ── Shared driver ────────────────────────────────────────────────────

/// Output cursor plus per-call state shared by the three entry points.
struct PanelWriter<'o, TIn, TOut> {
    out: &'o mut [TOut],
    pos: usize,
    packer: Packer<TIn, TOut>,
    int_by: usize,
    block: usize,
    sums: Option<(RowSums, i32)>,
}

impl<'o, TIn: Element, TOut: Element> PanelWriter<'o, TIn, TOut> {
    fn new(shape: PanelShape, out: &'o mut [TOut], row_sums: Option<i32>) -> Self {
        let int_by = shape.rows_per_panel::<TOut>();
        let sums = match row_sums {
            Some(m) if TOut::IS_INTEGRAL => Some((RowSums::new(int_by, TOut::SUM_FOLD_INTERVAL), m)),
            _ => None,
        };
        Self { out, pos: 0, packer: Packer::resolve(shape), int_by, block: shape.block, sums }
    }

    /// Pack one string of the current group. `rows` holds `int_by` entries.
    fn string(&mut self, rows: &[&[TIn]], in_width: usize, out_width: usize, offset: usize) {
        let n = roundup(out_width, self.block) * self.int_by;
        let dst = &mut self.out[self.pos..self.pos + n];
        self.packer.pack(dst, rows, in_width, self.int_by, offset);
        if let Some((sums, m)) = self.sums.as_mut() {
            if *m != 0 {
                sums.accumulate(dst, self.block);
            }
        }
        self.pos += n;
    }

    fn end_group(&mut self) {
        if let Some((sums, m)) = self.sums.as_mut() {
            let n = row_sum_elements::<TOut>(self.int_by);
            sums.write(&mut self.out[self.pos..self.pos + n], *m);
            sums.reset();
            self.pos += n;
        }
    }
}

/// Alias rows `[active, len)` to row 0.
#[inline]
fn alias_ragged<T>(rows: &mut [&[T]], active: usize) {
    if active > 0 {
        let first = rows[0];
        for r in &mut rows[active..] {
            *r = first;
        }
    }
}

// ── Entry points ─────────────────────────────────────────────────────

/// Pack rows `[y0, ymax)`, columns `[k0, kmax)` of a strided matrix.
///
/// `row_sums: Some(m)` appends per-row sums scaled by `m` (integral outputs).
/// Returns the number of elements written.
#[allow(clippy::too_many_arguments)]
pub fn interleave<TIn: Element, TOut: Element>(
    shape: PanelShape,
    out: &mut [TOut],
    input: &[TIn],
    ld: usize,
    y0: usize,
    ymax: usize,
    k0: usize,
    kmax: usize,
    row_sums: Option<i32>,
) -> usize {
    let mut w = PanelWriter::<TIn, TOut>::new(shape, out, row_sums);
    let int_by = w.int_by;
    let width = kmax - k0;
    let mut rows: Vec<&[TIn]> = vec![&[]; int_by];

    for ybase in (y0..ymax).step_by(int_by) {
        let active = (ymax - ybase).min(int_by);
        for (r, row) in rows.iter_mut().take(active).enumerate() {
            let start = (ybase + r) * ld;
            *row = &input[start..start + kmax];
        }
        alias_ragged(&mut rows, active);
        w.string(&rows, width, width, k0);
        w.end_group();
    }
    w.pos
}

/// Pack rows `[y0, ymax)`, columns `[k0, kmax)` of the virtual im2col matrix
/// of `input` under `conv`. `rounded_stringlen` is the per-kernel-point
/// column count after rounding.
#[allow(clippy::too_many_arguments)]
pub fn convolution_interleave<TIn: Element, TOut: Element>(
    shape: PanelShape,
    out: &mut [TOut],
    input: &[TIn],
    input_stride: usize,
    conv: &Convolver<TIn>,
    rounded_stringlen: usize,
    y0: usize,
    ymax: usize,
    k0: usize,
    kmax: usize,
    row_sums: Option<i32>,
) -> usize {
    let mut w = PanelWriter::<TIn, TOut>::new(shape, out, row_sums);
    let int_by = w.int_by;
    let cols = conv.process_columns(input, input_stride, k0, kmax, rounded_stringlen);
    let mut rows: Vec<&[TIn]> = vec![&[]; int_by];

    for ybase in (y0..ymax).step_by(int_by) {
        let active = (ymax - ybase).min(int_by);
        let mut conv_rows = cols.process_rows(ybase, active);
        while !conv_rows.finished() {
            let before = conv_rows.remaining();
            let (in_width, offset) = conv_rows.next_block(&mut rows);
            let out_width = before - conv_rows.remaining();
            alias_ragged(&mut rows, active);
            w.string(&rows, in_width, out_width, offset);
        }
        w.end_group();
    }
    w.pos
}

/// Pack rows `[y0, ymax)`, columns `[k0, kmax)` of a fully indirect operand:
/// `ptr[string][row]` is row `row` of kernel point `string`, holding
/// `stringlen` real elements.
#[allow(clippy::too_many_arguments)]
pub fn indirect_interleave<'a, TIn: Element, TOut: Element, S: AsRef<[&'a [TIn]]>>(
    shape: PanelShape,
    out: &mut [TOut],
    ptr: &[S],
    stringlen: usize,
    rounded_stringlen: usize,
    y0: usize,
    ymax: usize,
    k0: usize,
    kmax: usize,
    row_sums: Option<i32>,
) -> usize {
    let w = PanelWriter::<TIn, TOut>::new(shape, out, row_sums);
    walk_strings(w, stringlen, rounded_stringlen, y0, ymax, k0, kmax, move |string, y| ptr[string].as_ref()[y])
}

/// Pack rows `[y0, ymax)`, columns `[k0, kmax)` of a strided matrix whose
/// rows hold `sections` strings of `section_len` elements side by side.
/// Same layout as `indirect_interleave` over per-section row slices.
#[allow(clippy::too_many_arguments)]
pub fn sectioned_interleave<TIn: Element, TOut: Element>(
    shape: PanelShape,
    out: &mut [TOut],
    input: &[TIn],
    ld: usize,
    section_len: usize,
    rounded_stringlen: usize,
    y0: usize,
    ymax: usize,
    k0: usize,
    kmax: usize,
    row_sums: Option<i32>,
) -> usize {
    let w = PanelWriter::<TIn, TOut>::new(shape, out, row_sums);
    walk_strings(w, section_len, rounded_stringlen, y0, ymax, k0, kmax, move |string, y| {
        let start = y * ld + string * section_len;
        &input[start..start + section_len]
    })
}

/// Shared string walk: `row_at(string, y)` yields row `y` of string `string`.
#[allow(clippy::too_many_arguments)]
fn walk_strings<'r, TIn: Element + 'r, TOut: Element>(
    mut w: PanelWriter<'_, TIn, TOut>,
    stringlen: usize,
    rounded_stringlen: usize,
    y0: usize,
    ymax: usize,
    k0: usize,
    kmax: usize,
    row_at: impl Fn(usize, usize) -> &'r [TIn],
) -> usize {
    let int_by = w.int_by;
    let start_string = k0 / rounded_stringlen;
    let start_stringpos = k0 % rounded_stringlen;
    let mut rows: Vec<&'r [TIn]> = vec![&[]; int_by];

    for ybase in (y0..ymax).step_by(int_by) {
        let active = (ymax - ybase).min(int_by);
        let mut k_left = kmax - k0;
        let mut string = start_string;
        let mut stringpos = start_stringpos;

        while k_left > 0 {
            let in_width = k_left.min(stringlen.saturating_sub(stringpos));
            let out_width = k_left.min(rounded_stringlen - stringpos);
            for (r, row) in rows.iter_mut().take(active).enumerate() {
                *row = row_at(string, ybase + r);
            }
            alias_ragged(&mut rows, active);
            w.string(&rows, in_width, out_width, stringpos);

            k_left -= out_width;
            string += 1;
            stringpos = 0;
        }
        w.end_group();
    }
    w.pos
}

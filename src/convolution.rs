//! Convolution viewed as a GEMM without an im2col buffer.
//!
//! Column `k` of the virtual im2col matrix is channel `k % rounded` of kernel
//! point `k / rounded`; row `r` is output pixel `r`. The `Convolver` resolves
//! any block of that matrix to slices of the real input (or a shared pad
//! row) on demand.

use crate::traits::Element;

/// Logical shape of a single-image NHWC convolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvolutionParameters {
    pub input_width: usize,
    pub input_height: usize,
    pub input_channels: usize,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub output_width: usize,
    pub output_height: usize,
    pub output_stride_w: usize,
    pub output_stride_h: usize,
    pub padding_top: usize,
    pub padding_left: usize,
    /// Value read for every out-of-image tap, converted to the operand type.
    pub padding_value: f32,
}

impl ConvolutionParameters {
    /// Output extent along one axis for the given geometry.
    pub fn output_extent(input: usize, kernel: usize, stride: usize, pad_before: usize, pad_after: usize) -> usize {
        let padded = input + pad_before + pad_after;
        if stride == 0 || padded < kernel {
            return 0;
        }
        (padded - kernel) / stride + 1
    }

    #[inline]
    pub fn kernel_points(&self) -> usize {
        self.kernel_width * self.kernel_height
    }

    /// GEMM M for this convolution.
    #[inline]
    pub fn output_points(&self) -> usize {
        self.output_width * self.output_height
    }

    /// Elements per input pixel row of the virtual im2col matrix before rounding.
    #[inline]
    pub fn im2col_width(&self) -> usize {
        self.kernel_points() * self.input_channels
    }
}

/// Offset tables and pad row shared by every handler of one convolution.
#[derive(Debug, Clone)]
pub struct Convolver<T> {
    params: ConvolutionParameters,
    pad_row: Vec<T>,
    kernel_y: Vec<isize>,
    kernel_x: Vec<isize>,
}

impl<T: Element> Convolver<T> {
    pub fn new(params: ConvolutionParameters) -> Self {
        let points = params.kernel_points();
        let mut kernel_y = Vec::with_capacity(points);
        let mut kernel_x = Vec::with_capacity(points);
        for ky in 0..params.kernel_height {
            for kx in 0..params.kernel_width {
                kernel_y.push(ky as isize - params.padding_top as isize);
                kernel_x.push(kx as isize - params.padding_left as isize);
            }
        }
        Self {
            params,
            pad_row: vec![T::from_f32(params.padding_value); params.input_channels],
            kernel_y,
            kernel_x,
        }
    }

    #[inline]
    pub fn params(&self) -> &ConvolutionParameters {
        &self.params
    }

    /// Shared row returned for every out-of-image tap.
    #[inline]
    pub fn pad_row(&self) -> &[T] {
        &self.pad_row
    }

    /// `(dy, dx)` of kernel point `point` relative to an output pixel's base
    /// input coordinate, padding included.
    #[inline]
    pub fn kernel_offset(&self, point: usize) -> (isize, isize) {
        (self.kernel_y[point], self.kernel_x[point])
    }

    /// Bind an input image and a column range `[k_start, k_end)` of the
    /// virtual matrix. `input_stride` is the element distance between pixels.
    pub fn process_columns<'a>(
        &'a self,
        input: &'a [T],
        input_stride: usize,
        k_start: usize,
        k_end: usize,
        rounded_stringlen: usize,
    ) -> ColumnHandler<'a, T> {
        debug_assert!(rounded_stringlen >= self.params.input_channels);
        debug_assert!(k_end >= k_start);
        ColumnHandler {
            parent: self,
            input,
            input_stride,
            rounded_stringlen,
            start_pos: k_start / rounded_stringlen,
            start_offset: k_start % rounded_stringlen,
            length: k_end - k_start,
        }
    }
}

/// Convolver bound to one input and one column range.
#[derive(Debug, Clone, Copy)]
pub struct ColumnHandler<'a, T> {
    parent: &'a Convolver<T>,
    input: &'a [T],
    input_stride: usize,
    rounded_stringlen: usize,
    start_pos: usize,
    start_offset: usize,
    length: usize,
}

impl<'a, T: Element> ColumnHandler<'a, T> {
    /// Produce blocks for output rows `[start_row, start_row + active_height)`.
    pub fn process_rows(&self, start_row: usize, active_height: usize) -> RowHandler<'a, T> {
        let ow = self.parent.params.output_width.max(1);
        RowHandler {
            parent: *self,
            start_output_y: start_row / ow,
            start_output_x: start_row % ow,
            active_height,
            current_pos: self.start_pos,
            length_remaining: self.length,
        }
    }
}

/// Walks kernel points for a fixed set of output rows.
#[derive(Debug, Clone)]
pub struct RowHandler<'a, T> {
    parent: ColumnHandler<'a, T>,
    start_output_y: usize,
    start_output_x: usize,
    active_height: usize,
    current_pos: usize,
    length_remaining: usize,
}

impl<'a, T: Element> RowHandler<'a, T> {
    #[inline]
    pub fn finished(&self) -> bool {
        self.length_remaining == 0
    }

    /// Virtual columns not yet produced, padding included.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.length_remaining
    }

    /// Fill `rows[..active_height]` with the pixel slices (or the pad row)
    /// for the current kernel point and advance to the next one.
    ///
    /// Returns `(in_width, offset)`: each row's real data is
    /// `row[offset..offset + in_width]`; the remaining columns of this block
    /// up to the rounded string length are padding for the packer to fill.
    pub fn next_block(&mut self, rows: &mut [&'a [T]]) -> (usize, usize) {
        if self.finished() {
            return (0, 0);
        }
        assert!(rows.len() >= self.active_height, "row buffer shorter than active height");

        let col = &self.parent;
        let conv = col.parent;
        let p = &conv.params;
        let channels = p.input_channels;

        let offset = if self.current_pos == col.start_pos { col.start_offset } else { 0 };
        let in_width = self.length_remaining.min(channels.saturating_sub(offset));
        let out_width = self.length_remaining.min(col.rounded_stringlen - offset);

        let (dy, dx) = conv.kernel_offset(self.current_pos);
        let (ih, iw) = (p.input_height as isize, p.input_width as isize);
        let mut oy = self.start_output_y;
        let mut ox = self.start_output_x;

        for row in rows.iter_mut().take(self.active_height) {
            let iy = (oy * p.output_stride_h) as isize + dy;
            let ix = (ox * p.output_stride_w) as isize + dx;
            *row = if iy < 0 || iy >= ih || ix < 0 || ix >= iw {
                conv.pad_row()
            } else {
                let base = (iy as usize * p.input_width + ix as usize) * col.input_stride;
                &col.input[base..base + channels]
            };
            ox += 1;
            if ox == p.output_width {
                ox = 0;
                oy += 1;
            }
        }

        self.current_pos += 1;
        self.length_remaining -= out_width;
        (in_width, offset)
    }
}

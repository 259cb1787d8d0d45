//! Asymmetric-quantization output stage.
//!
//! With zero points `a_offset` and `b_offset`, the quantized product is
//!
//! ```text
//! Σ (a - a_off)(b - b_off) = Σab - b_off·Σa - a_off·Σb + K·a_off·b_off
//! ```
//!
//! The kernel computes `Σab`; the `-b_off·Σa` term arrives as in-band row
//! sums from the A packer and the remaining terms as per-column sums over B.
//! The corrected accumulator is then scaled back to the output type with a
//! fixed-point multiplier and shifts.

use crate::traits::Element;

/// Per-output-channel multipliers and shifts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerChannelRequant {
    pub muls: Vec<i32>,
    pub left_shifts: Vec<u32>,
    pub right_shifts: Vec<u32>,
}

/// Requantization parameters for a 32-bit accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requantize32 {
    pub a_offset: i32,
    pub b_offset: i32,
    pub c_offset: i32,
    pub per_layer_mul: i32,
    pub per_layer_left_shift: u32,
    pub per_layer_right_shift: u32,
    pub per_channel: Option<PerChannelRequant>,
    pub minval: i32,
    pub maxval: i32,
}

impl Requantize32 {
    /// Per-layer parameters clamped to the full range of `TOut`.
    pub fn per_layer<TOut: Element>(
        a_offset: i32,
        b_offset: i32,
        c_offset: i32,
        mul: i32,
        left_shift: u32,
        right_shift: u32,
    ) -> Self {
        let (minval, maxval) = output_range::<TOut>();
        Self {
            a_offset,
            b_offset,
            c_offset,
            per_layer_mul: mul,
            per_layer_left_shift: left_shift,
            per_layer_right_shift: right_shift,
            per_channel: None,
            minval,
            maxval,
        }
    }

    pub fn with_per_channel(mut self, pc: PerChannelRequant) -> Self {
        self.per_channel = Some(pc);
        self
    }

    pub fn with_clamp(mut self, minval: i32, maxval: i32) -> Self {
        self.minval = minval;
        self.maxval = maxval;
        self
    }

    /// `(mul, left_shift, right_shift)` for output column `channel`.
    #[inline]
    pub fn channel_params(&self, channel: usize) -> (i32, u32, u32) {
        match &self.per_channel {
            Some(pc) => (pc.muls[channel], pc.left_shifts[channel], pc.right_shifts[channel]),
            None => (self.per_layer_mul, self.per_layer_left_shift, self.per_layer_right_shift),
        }
    }

    /// Map a corrected accumulator to the clamped output value.
    #[inline]
    pub fn requantize_value(&self, v: i32, channel: usize) -> i32 {
        let (mul, left, right) = self.channel_params(channel);
        let shifted = saturating_shift_left(v, left);
        let scaled = rounding_divide_by_pot(saturating_rounding_doubling_high_mul(shifted, mul), right);
        scaled.saturating_add(self.c_offset).clamp(self.minval, self.maxval)
    }
}

/// Post-processing applied to the raw accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputStage {
    /// Accumulator type equals output type; only bias and activation apply.
    #[default]
    Nothing,
    Requantize32(Requantize32),
}

impl OutputStage {
    pub fn requantize(&self) -> Option<&Requantize32> {
        match self {
            OutputStage::Nothing => None,
            OutputStage::Requantize32(qp) => Some(qp),
        }
    }
}

fn output_range<T: Element>() -> (i32, i32) {
    match T::DATA_TYPE {
        crate::types::DataType::S8 => (i8::MIN as i32, i8::MAX as i32),
        crate::types::DataType::U8 => (0, u8::MAX as i32),
        crate::types::DataType::S16 => (i16::MIN as i32, i16::MAX as i32),
        crate::types::DataType::U16 => (0, u16::MAX as i32),
        _ => (i32::MIN, i32::MAX),
    }
}

#[inline(always)]
fn saturating_shift_left(v: i32, shift: u32) -> i32 {
    if shift == 0 {
        return v;
    }
    let wide = (v as i64) << shift.min(32);
    wide.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// `round(a * b / 2^31)`, saturating the single overflow case.
#[inline(always)]
pub fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = a as i64 * b as i64;
    let nudge: i64 = if ab >= 0 { 1 << 30 } else { 1 - (1 << 30) };
    ((ab + nudge) / (1i64 << 31)) as i32
}

/// `x / 2^exponent`, rounding half away from zero.
#[inline(always)]
pub fn rounding_divide_by_pot(x: i32, exponent: u32) -> i32 {
    if exponent == 0 {
        return x;
    }
    let exponent = exponent.min(31);
    let mask = (1i32 << exponent).wrapping_sub(1);
    let remainder = x & mask;
    let threshold = (mask >> 1) + (x < 0) as i32;
    (x >> exponent) + (remainder > threshold) as i32
}

/// `a_off·b_off·depth - a_off·Σ_k B[k][x]` for columns `[0, width)` of a
/// row-major `depth × width` block of B. Bias is applied at requantize time.
pub fn compute_col_sums<T: Element>(
    qp: &Requantize32,
    b: &[T],
    ldb: usize,
    depth: usize,
    width: usize,
    col_sums: &mut [i32],
) {
    assert!(col_sums.len() >= width, "column sum buffer too short");
    let base = qp.a_offset.wrapping_mul(qp.b_offset).wrapping_mul(depth as i32);
    for (x, out) in col_sums.iter_mut().take(width).enumerate() {
        let mut sum = 0i32;
        for k in 0..depth {
            sum = sum.wrapping_add(b[k * ldb + x].to_i32());
        }
        *out = base.wrapping_sub(sum.wrapping_mul(qp.a_offset));
    }
}

/// Requantize a `rows × cols` accumulator tile into `out`.
///
/// `row_sums[r]` and `col_sums[c]` are the offset corrections for the tile,
/// `bias[c]` the optional per-column bias, `first_channel` the output column
/// index of `c == 0` for per-channel parameters.
#[allow(clippy::too_many_arguments)]
pub fn requantize_block_32<TOut: Element>(
    qp: &Requantize32,
    acc: &[i32],
    acc_stride: usize,
    rows: usize,
    cols: usize,
    row_sums: &[i32],
    col_sums: &[i32],
    bias: Option<&[i32]>,
    first_channel: usize,
    out: &mut [TOut],
    out_stride: usize,
) {
    for r in 0..rows {
        let src = &acc[r * acc_stride..r * acc_stride + cols];
        let dst = &mut out[r * out_stride..r * out_stride + cols];
        for c in 0..cols {
            let mut v = src[c].wrapping_add(row_sums[r]).wrapping_add(col_sums[c]);
            if let Some(bias) = bias {
                v = v.wrapping_add(bias[c]);
            }
            dst[c] = TOut::from_i32(qp.requantize_value(v, first_channel + c));
        }
    }
}

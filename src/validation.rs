//! Configuration-time checks for GEMM problems and their operands.
//!
//! Kernels trust their inputs on the hot path; everything a caller can get
//! wrong is checked here instead, once, before execution.
//!
//! # Design
//!
//! - All functions return `GemmResult<()>` with an `InvalidArgument` or
//!   `BufferTooSmall` describing the first failure
//! - Extent arithmetic uses `checked_mul`/`checked_add`, so absurd strides
//!   are reported rather than wrapped

use crate::convolution::ConvolutionParameters;
use crate::error::{GemmError, GemmResult};
use crate::gemm::{GemmArgs, GemmArrays, IndirectRows};
use crate::quantized::Requantize32;

fn invalid(msg: String) -> GemmError {
    GemmError::InvalidArgument(msg)
}

/// Elements spanned by `count` blocks `stride` apart, the last `tail` long.
fn span(count: usize, stride: usize, tail: usize) -> GemmResult<usize> {
    count
        .saturating_sub(1)
        .checked_mul(stride)
        .and_then(|v| v.checked_add(tail))
        .ok_or_else(|| invalid(format!("extent overflow: {count} x {stride} + {tail}")))
}

/// Extent of a strided `[multi][batch][row][col]` operand.
fn extent(multi: (usize, usize), batch: (usize, usize), rows: (usize, usize), cols: usize) -> GemmResult<usize> {
    let inner = span(rows.0, rows.1, cols)?;
    let with_batch = span(batch.0, batch.1, 0)?.checked_add(inner);
    let with_multi = with_batch.and_then(|v| span(multi.0, multi.1, 0).ok()?.checked_add(v));
    with_multi.ok_or_else(|| invalid("operand extent overflows usize".into()))
}

#[inline]
fn check_len(what: &'static str, got: usize, needed: usize) -> GemmResult<()> {
    if got < needed {
        return Err(GemmError::BufferTooSmall { what, needed, got });
    }
    Ok(())
}

/// Validate the problem shape.
pub fn validate_gemm_args(args: &GemmArgs) -> GemmResult<()> {
    let dims = [
        ("M", args.m),
        ("N", args.n),
        ("K", args.k),
        ("k_sections", args.k_sections),
        ("nbatches", args.nbatches),
        ("nmulti", args.nmulti),
        ("max_threads", args.max_threads),
    ];
    if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
        return Err(invalid(format!("{name} must be > 0")));
    }
    let outputs = args
        .m
        .checked_mul(args.n)
        .and_then(|v| v.checked_mul(args.nbatches))
        .and_then(|v| v.checked_mul(args.nmulti));
    if outputs.is_none() || args.k.checked_mul(args.k_sections).is_none() {
        return Err(invalid(format!(
            "problem {}x{}x{}x{} with {} batches and {} multis overflows usize",
            args.m, args.n, args.k_sections, args.k, args.nbatches, args.nmulti
        )));
    }
    if let crate::traits::Activation::BoundedRelu { upper } = args.act {
        if !(upper > 0.0) {
            return Err(invalid(format!("bounded relu upper bound {upper} must be positive")));
        }
    }
    Ok(())
}

/// Check that `params` describes the im2col matrix of `args`: one row per
/// output point, one section per kernel point, one column per channel.
pub fn validate_convolution(args: &GemmArgs, params: &ConvolutionParameters) -> GemmResult<()> {
    if params.output_stride_w == 0 || params.output_stride_h == 0 {
        return Err(invalid("convolution strides must be > 0".into()));
    }
    if params.kernel_width == 0 || params.kernel_height == 0 || params.input_channels == 0 {
        return Err(invalid("convolution kernel and channel extents must be > 0".into()));
    }
    if params.output_points() != args.m {
        return Err(invalid(format!(
            "convolution has {} output points but M = {}",
            params.output_points(),
            args.m
        )));
    }
    if params.kernel_points() != args.k_sections {
        return Err(invalid(format!(
            "convolution has {} kernel points but k_sections = {}",
            params.kernel_points(),
            args.k_sections
        )));
    }
    if params.input_channels != args.k {
        return Err(invalid(format!("convolution has {} channels but K = {}", params.input_channels, args.k)));
    }
    if args.indirect_input {
        return Err(invalid("convolution input cannot also be indirect".into()));
    }
    Ok(())
}

/// Check requantization parameters for an output of `n` columns.
pub fn validate_requantize(qp: &Requantize32, n: usize) -> GemmResult<()> {
    if qp.minval > qp.maxval {
        return Err(invalid(format!("clamp range [{}, {}] is empty", qp.minval, qp.maxval)));
    }
    if qp.per_layer_left_shift >= 32 || qp.per_layer_right_shift >= 32 {
        return Err(invalid("per-layer shifts must be < 32".into()));
    }
    if let Some(pc) = &qp.per_channel {
        check_len("per-channel multiplier", pc.muls.len(), n)?;
        check_len("per-channel left shift", pc.left_shifts.len(), n)?;
        check_len("per-channel right shift", pc.right_shifts.len(), n)?;
        if pc.left_shifts.iter().chain(&pc.right_shifts).any(|&s| s >= 32) {
            return Err(invalid("per-channel shifts must be < 32".into()));
        }
    }
    Ok(())
}

/// Check a pointer-of-pointers operand: one entry per (multi, batch,
/// section), each listing `M` rows of at least `string_len` elements.
pub fn validate_indirect<T>(args: &GemmArgs, string_len: usize, rows: IndirectRows<'_, T>) -> GemmResult<()> {
    if string_len > args.k {
        return Err(invalid(format!("string length {string_len} exceeds K = {}", args.k)));
    }
    check_len("indirect section table", rows.len(), args.nmulti * args.nbatches * args.k_sections)?;
    for section in rows {
        check_len("indirect row list", section.len(), args.m)?;
        if let Some(short) = section.iter().find(|r| r.len() < string_len) {
            return Err(GemmError::BufferTooSmall { what: "indirect row", needed: string_len, got: short.len() });
        }
    }
    Ok(())
}

/// Check operand extents against the shape. `b_pretransposed` skips B,
/// `convolution` replaces the A check with one over the input image.
pub fn validate_arrays<To, Tw, Tr>(
    args: &GemmArgs,
    arrays: &GemmArrays<'_, To, Tw, Tr>,
    b_pretransposed: bool,
    convolution: Option<&ConvolutionParameters>,
) -> GemmResult<()> {
    let ktotal = args.k * args.k_sections;
    let problems = ((args.nmulti, arrays.a_multi_stride), (args.nbatches, arrays.a_batch_stride));

    match convolution {
        Some(p) => {
            if arrays.lda < p.input_channels {
                return Err(invalid(format!("input stride {} < channels {}", arrays.lda, p.input_channels)));
            }
            let pixels = p.input_width * p.input_height;
            let needed = extent(problems.0, problems.1, (pixels, arrays.lda), p.input_channels)?;
            check_len("convolution input", arrays.a.len(), needed)?;
        }
        None if args.indirect_input => {}
        None => {
            if arrays.lda < ktotal {
                return Err(invalid(format!("lda {} < K total {ktotal}", arrays.lda)));
            }
            let needed = extent(problems.0, problems.1, (args.m, arrays.lda), ktotal)?;
            check_len("A", arrays.a.len(), needed)?;
        }
    }

    if !b_pretransposed && !args.fixed_format {
        if arrays.ldb < args.n {
            return Err(invalid(format!("ldb {} < N {}", arrays.ldb, args.n)));
        }
        let needed = extent((args.nmulti, arrays.b_multi_stride), (1, 0), (ktotal, arrays.ldb), args.n)?;
        check_len("B", arrays.b.len(), needed)?;
    }

    if arrays.ldc < args.n {
        return Err(invalid(format!("ldc {} < N {}", arrays.ldc, args.n)));
    }
    let needed = extent(
        (args.nmulti, arrays.c_multi_stride),
        (args.nbatches, arrays.c_batch_stride),
        (args.m, arrays.ldc),
        args.n,
    )?;
    check_len("C", arrays.c.len(), needed)?;

    if let Some(bias) = arrays.bias {
        let needed = span(args.nmulti, arrays.bias_multi_stride, args.n)?;
        check_len("bias", bias.len(), needed)?;
    }
    Ok(())
}

/// Everything a kernel checks before adopting `arrays`.
pub fn validate_bindings<To, Tr>(
    args: &GemmArgs,
    arrays: &GemmArrays<'_, To, To, Tr>,
    b_pretransposed: bool,
    indirect: Option<(usize, IndirectRows<'_, To>)>,
    convolution: Option<&ConvolutionParameters>,
) -> GemmResult<()> {
    if let Some(p) = convolution {
        validate_convolution(args, p)?;
    }
    match (args.indirect_input, indirect) {
        (true, None) => {
            return Err(invalid("indirect input declared but no indirect rows were set".into()));
        }
        (false, Some(_)) => {
            return Err(invalid("indirect rows set on a problem not declared indirect".into()));
        }
        (true, Some((string_len, rows))) => validate_indirect(args, string_len, rows)?,
        (false, None) => {}
    }
    validate_arrays(args, arrays, b_pretransposed, convolution)
}

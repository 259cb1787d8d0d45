//! End-to-end GEMM tests against naive references.
//!
//! Every kernel family goes through the public factory, the same way a
//! caller would drive it:
//! - f32 interleaved and hybrid, with bias, activation, batches and multis
//! - f16 and int8 accumulation
//! - requantized u8/i8 output with zero points and per-channel parameters
//! - convolution and indirect A operands
//! - partition invariance and threaded execution

use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use igemm_kernels::gemm::GemmKernelList;
use igemm_kernels::{
    execute_sequential, gemm, get_gemm_method, has_opt_gemm, Activation, AlignedVec, ConvolutionParameters,
    Element, GemmArgs, GemmArrays, GemmConfig, GemmError, GemmMethod, GemmScheduler, OutputStage, PerChannelRequant,
    Requantize32, WeightFormat, WorkRange,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn forced(method: GemmMethod) -> GemmConfig {
    GemmConfig { method, ..Default::default() }
}

fn random_f32(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Drivers
// ═══════════════════════════════════════════════════════════════════════

/// Operands of one plain problem. Strides follow `GemmArrays`.
struct Operands<'p, T, Tr> {
    a: &'p [T],
    lda: usize,
    a_batch_stride: usize,
    a_multi_stride: usize,
    b: &'p [T],
    ldb: usize,
    b_multi_stride: usize,
    ldc: usize,
    c_batch_stride: usize,
    c_multi_stride: usize,
    bias: Option<&'p [Tr]>,
    bias_multi_stride: usize,
}

impl<'p, T, Tr> Operands<'p, T, Tr> {
    fn dense(a: &'p [T], lda: usize, b: &'p [T], ldb: usize, ldc: usize) -> Self {
        Self {
            a,
            lda,
            a_batch_stride: 0,
            a_multi_stride: 0,
            b,
            ldb,
            b_multi_stride: 0,
            ldc,
            c_batch_stride: 0,
            c_multi_stride: 0,
            bias: None,
            bias_multi_stride: 0,
        }
    }

    fn arrays<'x>(&self, c: &'x mut [Tr]) -> GemmArrays<'x, T, T, Tr>
    where
        'p: 'x,
    {
        let mut arrays = GemmArrays::new(self.a, self.lda, self.b, self.ldb, c, self.ldc)
            .with_batch_strides(self.a_batch_stride, self.c_batch_stride)
            .with_multi_strides(self.a_multi_stride, self.b_multi_stride, self.c_multi_stride);
        if let Some(bias) = self.bias {
            arrays = arrays.with_bias(bias, self.bias_multi_stride);
        }
        arrays
    }
}

/// Optional A-operand shapes beyond a plain strided matrix.
enum Lhs<'p, T> {
    Plain,
    Convolution(ConvolutionParameters),
    Indirect { string_len: usize, rows: &'p [Vec<&'p [T]>] },
}

/// Build the kernel `gemm` selects, pretranspose B and run the whole window.
fn run_gemm<T: GemmKernelList<Tr>, Tr: Element>(
    args: &GemmArgs,
    os: &OutputStage,
    ops: &Operands<'_, T, Tr>,
    lhs: Lhs<'_, T>,
    quant_bias: Option<&[i32]>,
    scheduler: Option<&GemmScheduler>,
    c: &mut [Tr],
) {
    let mut pretransposed;
    let mut workspace;
    let mut kernel = gemm::<T, Tr>(args, os).unwrap();
    match lhs {
        Lhs::Plain => {}
        Lhs::Convolution(p) => kernel.set_convolution_parameters(p),
        Lhs::Indirect { string_len, rows } => kernel.set_indirect_parameters(string_len, rows),
    }
    if let Some(bias) = quant_bias {
        kernel.set_quantized_bias(bias, 0);
    }

    pretransposed = AlignedVec::<u8>::zeroed(kernel.get_b_pretransposed_array_size());
    if kernel.b_is_pretransposed() {
        match scheduler {
            Some(s) => s
                .pretranspose::<T, T, Tr, _>(&mut *kernel, pretransposed.as_mut_slice(), ops.b, ops.ldb, ops.b_multi_stride)
                .unwrap(),
            None => kernel
                .pretranspose_b_array(pretransposed.as_mut_slice(), ops.b, ops.ldb, ops.b_multi_stride)
                .unwrap(),
        }
    }
    kernel.try_set_arrays(ops.arrays(c)).unwrap();

    match scheduler {
        Some(s) => {
            kernel.set_nthreads(s.num_threads());
            workspace = vec![0u8; kernel.get_working_size()];
            kernel.set_working_space(&mut workspace).unwrap();
            s.run(&mut *kernel);
            drop(kernel);
        }
        None => {
            execute_sequential(&mut *kernel);
            drop(kernel);
        }
    }
}

/// Run the window as the given ordered list of linear `[start, end)` cuts.
fn run_in_pieces<T: GemmKernelList<Tr>, Tr: Element>(
    args: &GemmArgs,
    ops: &Operands<'_, T, Tr>,
    cuts: &[(usize, usize)],
    c: &mut [Tr],
) {
    let mut pretransposed;
    let mut kernel = gemm::<T, Tr>(args, &OutputStage::Nothing).unwrap();
    pretransposed = AlignedVec::<u8>::zeroed(kernel.get_b_pretransposed_array_size());
    kernel.pretranspose_b_array(pretransposed.as_mut_slice(), ops.b, ops.ldb, ops.b_multi_stride).unwrap();
    kernel.set_arrays(ops.arrays(c));
    for &(start, end) in cuts {
        let range = WorkRange::from_slice(&[(start, end - start)]);
        // SAFETY: cuts are disjoint and run one at a time.
        unsafe { kernel.execute(&range, &range, 0) };
    }
    drop(kernel);
}

// ═══════════════════════════════════════════════════════════════════════
// References
// ═══════════════════════════════════════════════════════════════════════

/// `C[m][n] = act(bias[n] + Σ_k A[m][k] B[k][n])` over every batch and multi.
fn reference_f32(args: &GemmArgs, ops: &Operands<'_, f32, f32>, c: &mut [f32]) {
    let ktotal = args.k * args.k_sections;
    for multi in 0..args.nmulti {
        for batch in 0..args.nbatches {
            for m in 0..args.m {
                for n in 0..args.n {
                    let mut acc = match ops.bias {
                        Some(bias) => bias[multi * ops.bias_multi_stride + n],
                        None => 0.0,
                    };
                    for k in 0..ktotal {
                        let a = ops.a[multi * ops.a_multi_stride + batch * ops.a_batch_stride + m * ops.lda + k];
                        let b = ops.b[multi * ops.b_multi_stride + k * ops.ldb + n];
                        acc += a * b;
                    }
                    c[multi * ops.c_multi_stride + batch * ops.c_batch_stride + m * ops.ldc + n] =
                        args.act.apply(acc);
                }
            }
        }
    }
}

fn assert_close(got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        let err = (g - w).abs() / w.abs().max(1.0);
        assert!(err <= tol, "element {i}: got {g}, want {w} (err {err:.2e})");
    }
}

/// Explicit im2col of an NHWC image; out-of-image taps read `pad`.
fn im2col<T: Copy>(p: &ConvolutionParameters, input: &[T], pad: T) -> Vec<T> {
    let cols = p.kernel_points() * p.input_channels;
    let mut out = vec![pad; p.output_points() * cols];
    for oy in 0..p.output_height {
        for ox in 0..p.output_width {
            let row = oy * p.output_width + ox;
            for ky in 0..p.kernel_height {
                for kx in 0..p.kernel_width {
                    let iy = (oy * p.output_stride_h + ky) as isize - p.padding_top as isize;
                    let ix = (ox * p.output_stride_w + kx) as isize - p.padding_left as isize;
                    if iy < 0 || ix < 0 || iy >= p.input_height as isize || ix >= p.input_width as isize {
                        continue;
                    }
                    let src = (iy as usize * p.input_width + ix as usize) * p.input_channels;
                    let dst = row * cols + (ky * p.kernel_width + kx) * p.input_channels;
                    out[dst..dst + p.input_channels].copy_from_slice(&input[src..src + p.input_channels]);
                }
            }
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
// Float kernels
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn f32_interleaved_bias_relu_matches_reference() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(1);
    let (m, n, k) = (37, 29, 53);
    let a = random_f32(&mut rng, m * k);
    let b = random_f32(&mut rng, k * n);
    let bias = random_f32(&mut rng, n);
    let args = GemmArgs::new(m, n, k)
        .with_activation(Activation::Relu)
        .with_config(forced(GemmMethod::GemmInterleaved));
    let mut ops = Operands::dense(&a, k, &b, n, n);
    ops.bias = Some(&bias);

    let mut got = vec![f32::NAN; m * n];
    run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Plain, None, None, &mut got);
    let mut want = vec![0.0; m * n];
    reference_f32(&args, &ops, &mut want);
    assert_close(&got, &want, 1e-4);
    assert!(got.iter().all(|&v| v >= 0.0));
}

#[test]
fn f32_interleaved_small_k_block_accumulates() {
    // A forced K block of 8 splits K = 50 into seven passes over C.
    let mut rng = StdRng::seed_from_u64(2);
    let (m, n, k) = (9, 26, 50);
    let a = random_f32(&mut rng, m * k);
    let b = random_f32(&mut rng, k * n);
    let bias = random_f32(&mut rng, n);
    let cfg = GemmConfig { method: GemmMethod::GemmInterleaved, inner_block_size: 8, ..Default::default() };
    let args = GemmArgs::new(m, n, k).with_activation(Activation::BoundedRelu { upper: 0.5 }).with_config(cfg);
    let mut ops = Operands::dense(&a, k, &b, n, n);
    ops.bias = Some(&bias);

    let mut got = vec![0.0; m * n];
    run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Plain, None, None, &mut got);
    let mut want = vec![0.0; m * n];
    reference_f32(&args, &ops, &mut want);
    assert_close(&got, &want, 1e-4);
    assert!(got.iter().all(|&v| (0.0..=0.5).contains(&v)));
}

#[test]
fn f32_hybrid_matches_reference() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(3);
    let (m, n, k) = (25, 40, 70);
    let a = random_f32(&mut rng, m * k);
    let b = random_f32(&mut rng, k * n);
    let bias = random_f32(&mut rng, n);
    let args = GemmArgs::new(m, n, k).with_config(forced(GemmMethod::GemmHybrid));
    assert_eq!(get_gemm_method::<f32, f32>(&args, &OutputStage::Nothing).unwrap().name, "sgemm_hybrid_6x16");
    let mut ops = Operands::dense(&a, k, &b, n, n);
    ops.bias = Some(&bias);

    let mut got = vec![0.0; m * n];
    run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Plain, None, None, &mut got);
    let mut want = vec![0.0; m * n];
    reference_f32(&args, &ops, &mut want);
    assert_close(&got, &want, 1e-4);
}

#[test]
fn f32_batches_and_multis_with_padded_strides() {
    let mut rng = StdRng::seed_from_u64(4);
    let (m, n, k) = (11, 17, 13);
    let (lda, ldb, ldc) = (k + 3, n + 5, n + 2);
    let (nbatches, nmulti) = (2, 3);
    let a_batch = m * lda + 7;
    let a_multi = nbatches * a_batch;
    let b_multi = k * ldb + 1;
    let c_batch = m * ldc;
    let c_multi = nbatches * c_batch + 4;

    let a = random_f32(&mut rng, nmulti * a_multi);
    let b = random_f32(&mut rng, nmulti * b_multi);
    let bias = random_f32(&mut rng, nmulti * n);

    for method in [GemmMethod::GemmInterleaved, GemmMethod::GemmHybrid] {
        let args = GemmArgs::new(m, n, k).with_batches(nbatches).with_multis(nmulti).with_config(forced(method));
        let ops = Operands {
            a: &a,
            lda,
            a_batch_stride: a_batch,
            a_multi_stride: a_multi,
            b: &b,
            ldb,
            b_multi_stride: b_multi,
            ldc,
            c_batch_stride: c_batch,
            c_multi_stride: c_multi,
            bias: Some(&bias),
            bias_multi_stride: n,
        };

        let mut got = vec![0.0; nmulti * c_multi];
        run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Plain, None, None, &mut got);
        let mut want = vec![0.0; nmulti * c_multi];
        reference_f32(&args, &ops, &mut want);
        assert_close(&got, &want, 1e-4);
    }
}

#[test]
fn f16_interleaved_matches_reference() {
    let mut rng = StdRng::seed_from_u64(5);
    let (m, n, k) = (19, 14, 33);
    let a32: Vec<f32> = (0..m * k).map(|_| rng.gen_range(-4i32..=4) as f32 * 0.25).collect();
    let b32: Vec<f32> = (0..k * n).map(|_| rng.gen_range(-4i32..=4) as f32 * 0.25).collect();
    let a: Vec<f16> = a32.iter().map(|&v| f16::from_f32(v)).collect();
    let b: Vec<f16> = b32.iter().map(|&v| f16::from_f32(v)).collect();

    let args = GemmArgs::new(m, n, k);
    let mut got = vec![f16::ZERO; m * n];
    run_gemm(&args, &OutputStage::Nothing, &Operands::dense(&a, k, &b, n, n), Lhs::Plain, None, None, &mut got);

    let mut want = vec![0.0; m * n];
    reference_f32(&args, &Operands::dense(&a32, k, &b32, n, n), &mut want);
    // Quarter-step inputs keep every product and partial sum exact in f32.
    let got: Vec<f32> = got.iter().map(|v| v.to_f32()).collect();
    let want: Vec<f32> = want.iter().map(|&v| f16::from_f32(v).to_f32()).collect();
    assert_eq!(got, want);
}

#[test]
fn fixed_format_b_is_read_in_place() {
    let mut rng = StdRng::seed_from_u64(6);
    let (m, n, k) = (10, 30, 21);
    let a = random_f32(&mut rng, m * k);
    let b = random_f32(&mut rng, k * n);
    let args = GemmArgs::new(m, n, k).with_fixed_format(true).with_config(forced(GemmMethod::GemmInterleaved));

    let Some(WeightFormat::Interleaved { out_width, k_unroll }) = has_opt_gemm::<f32, f32>(&args, &OutputStage::Nothing)
    else {
        panic!("fixed-format f32 must report an interleaved layout");
    };
    let size = igemm_kernels::interleave::transposed_size(0, n, 0, k, out_width, k_unroll);
    let mut packed = vec![0.0f32; size];
    igemm_kernels::interleave::transpose_interleave_b(&mut packed, &b, n, 0, n, 0, k, out_width, k_unroll);
    let stripe_stride = k.div_ceil(k_unroll) * k_unroll * out_width;

    let mut got = vec![0.0; m * n];
    let mut kernel = gemm::<f32, f32>(&args, &OutputStage::Nothing).unwrap();
    assert!(!kernel.b_is_pretransposed());
    kernel.try_set_arrays(GemmArrays::new(&a, k, &packed, stripe_stride, &mut got, n)).unwrap();
    execute_sequential(&mut *kernel);
    drop(kernel);

    let mut want = vec![0.0; m * n];
    reference_f32(&args, &Operands::dense(&a, k, &b, n, n), &mut want);
    assert_close(&got, &want, 1e-4);
}

// ═══════════════════════════════════════════════════════════════════════
// Integer kernels
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn s8_to_s32_is_exact() {
    let mut rng = StdRng::seed_from_u64(7);
    let (m, n, k) = (13, 27, 45);
    let a: Vec<i8> = (0..m * k).map(|_| rng.gen()).collect();
    let b: Vec<i8> = (0..k * n).map(|_| rng.gen()).collect();
    let bias: Vec<i32> = (0..n).map(|_| rng.gen_range(-1000..1000)).collect();

    let args = GemmArgs::new(m, n, k);
    let mut ops = Operands::dense(&a, k, &b, n, n);
    ops.bias = Some(&bias);
    let mut got = vec![0i32; m * n];
    run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Plain, None, None, &mut got);

    for i in 0..m {
        for j in 0..n {
            let want: i32 = bias[j] + (0..k).map(|p| a[i * k + p] as i32 * b[p * n + j] as i32).sum::<i32>();
            assert_eq!(got[i * n + j], want, "C[{i}][{j}]");
        }
    }
}

#[test]
fn u8_requantized_with_offsets_and_bias() {
    let mut rng = StdRng::seed_from_u64(8);
    let (m, n, k) = (17, 23, 45);
    let a: Vec<u8> = (0..m * k).map(|_| rng.gen()).collect();
    let b: Vec<u8> = (0..k * n).map(|_| rng.gen()).collect();
    let bias: Vec<i32> = (0..n).map(|_| rng.gen_range(-5000..5000)).collect();
    // Scale ~ 1/2^11 so the corrected sums land inside u8.
    let qp = Requantize32::per_layer::<u8>(128, 120, 100, 1 << 30, 0, 10);
    let os = OutputStage::Requantize32(qp.clone());

    let args = GemmArgs::new(m, n, k);
    let mut got = vec![0u8; m * n];
    let ops = Operands::dense(&a, k, &b, n, n);
    run_gemm(&args, &os, &ops, Lhs::Plain, Some(&bias), None, &mut got);

    let mut distinct = std::collections::HashSet::new();
    for i in 0..m {
        for j in 0..n {
            let acc: i32 = (0..k)
                .map(|p| (a[i * k + p] as i32 - qp.a_offset) * (b[p * n + j] as i32 - qp.b_offset))
                .sum();
            let want = qp.requantize_value(acc + bias[j], j);
            assert_eq!(got[i * n + j] as i32, want, "C[{i}][{j}]");
            distinct.insert(want);
        }
    }
    assert!(distinct.len() > 8, "requantized output collapsed to {distinct:?}");
}

#[test]
fn s8_requantized_per_channel_threaded() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(9);
    let (m, n, k) = (40, 19, 64);
    let a: Vec<i8> = (0..m * k).map(|_| rng.gen()).collect();
    let b: Vec<i8> = (0..k * n).map(|_| rng.gen()).collect();
    let pc = PerChannelRequant {
        muls: (0..n).map(|c| (1 << 30) + (c as i32) * (1 << 24)).collect(),
        left_shifts: vec![0; n],
        right_shifts: (0..n).map(|c| 8 + (c % 4) as u32).collect(),
    };
    let qp = Requantize32::per_layer::<i8>(-3, 5, -10, 0, 0, 0).with_per_channel(pc);
    let os = OutputStage::Requantize32(qp.clone());

    let args = GemmArgs::new(m, n, k).with_max_threads(3);
    let scheduler = GemmScheduler::new(3).unwrap();
    let ops = Operands::dense(&a, k, &b, n, n);
    let mut got = vec![0i8; m * n];
    run_gemm(&args, &os, &ops, Lhs::Plain, None, Some(&scheduler), &mut got);

    for i in 0..m {
        for j in 0..n {
            let acc: i32 = (0..k)
                .map(|p| (a[i * k + p] as i32 - qp.a_offset) * (b[p * n + j] as i32 - qp.b_offset))
                .sum();
            assert_eq!(got[i * n + j] as i32, qp.requantize_value(acc, j), "C[{i}][{j}]");
        }
    }
}

#[test]
fn quantized_kernels_need_an_output_stage() {
    let args = GemmArgs::new(4, 4, 4);
    let err = gemm::<u8, u8>(&args, &OutputStage::Nothing).err().unwrap();
    assert!(matches!(err, GemmError::NoKernel));

    let bad = Requantize32::per_layer::<u8>(0, 0, 0, 1 << 30, 0, 40);
    let err = gemm::<u8, u8>(&args, &OutputStage::Requantize32(bad)).err().unwrap();
    assert!(matches!(err, GemmError::InvalidArgument(_)), "{err}");
}

#[test]
fn short_operands_rejected_at_bind() {
    let (m, n, k) = (6, 5, 4);
    let a = vec![0.0f32; m * k];
    let b = vec![0.0f32; k * n];
    let args = GemmArgs::new(m, n, k);

    let mut c = vec![0.0f32; m * n - 1];
    let mut kernel = gemm::<f32, f32>(&args, &OutputStage::Nothing).unwrap();
    let err = kernel.try_set_arrays(GemmArrays::new(&a, k, &b, n, &mut c, n)).unwrap_err();
    assert!(matches!(err, GemmError::BufferTooSmall { what: "C", .. }), "{err}");
    drop(kernel);

    let mut c = vec![0.0f32; m * n];
    let mut kernel = gemm::<f32, f32>(&args, &OutputStage::Nothing).unwrap();
    let err = kernel.try_set_arrays(GemmArrays::new(&a, k - 1, &b, n, &mut c, n)).unwrap_err();
    assert!(matches!(err, GemmError::InvalidArgument(_)), "{err}");
    drop(kernel);
}

// ═══════════════════════════════════════════════════════════════════════
// Convolution and indirect operands
// ═══════════════════════════════════════════════════════════════════════

fn conv_params() -> ConvolutionParameters {
    ConvolutionParameters {
        input_width: 6,
        input_height: 5,
        input_channels: 3,
        kernel_width: 3,
        kernel_height: 3,
        output_width: ConvolutionParameters::output_extent(6, 3, 1, 1, 1),
        output_height: ConvolutionParameters::output_extent(5, 3, 1, 1, 1),
        output_stride_w: 1,
        output_stride_h: 1,
        padding_top: 1,
        padding_left: 1,
        padding_value: 0.0,
    }
}

#[test]
fn convolution_matches_explicit_im2col() {
    init_logger();
    let p = conv_params();
    assert_eq!((p.output_width, p.output_height), (6, 5));
    let mut rng = StdRng::seed_from_u64(10);
    let n = 8;
    let input = random_f32(&mut rng, p.input_width * p.input_height * p.input_channels);
    let b = random_f32(&mut rng, p.im2col_width() * n);
    let cols = im2col(&p, &input, p.padding_value);

    for method in [GemmMethod::GemmInterleaved, GemmMethod::GemmHybrid] {
        let args = GemmArgs::new(p.output_points(), n, p.input_channels)
            .with_k_sections(p.kernel_points())
            .with_config(forced(method));
        let mut got = vec![0.0; p.output_points() * n];
        let ops = Operands::dense(&input, p.input_channels, &b, n, n);
        run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Convolution(p), None, None, &mut got);

        let mut want = vec![0.0; p.output_points() * n];
        reference_f32(&args, &Operands::dense(&cols, p.im2col_width(), &b, n, n), &mut want);
        assert_close(&got, &want, 1e-4);
    }
}

#[test]
fn strided_convolution_with_nonzero_padding_value() {
    let p = ConvolutionParameters {
        input_width: 7,
        input_height: 7,
        input_channels: 2,
        kernel_width: 3,
        kernel_height: 3,
        output_width: ConvolutionParameters::output_extent(7, 3, 2, 1, 1),
        output_height: ConvolutionParameters::output_extent(7, 3, 2, 1, 1),
        output_stride_w: 2,
        output_stride_h: 2,
        padding_top: 1,
        padding_left: 1,
        padding_value: 0.5,
    };
    assert_eq!(p.output_points(), 16);
    let mut rng = StdRng::seed_from_u64(11);
    let n = 5;
    let input = random_f32(&mut rng, 7 * 7 * 2);
    let b = random_f32(&mut rng, p.im2col_width() * n);
    let args = GemmArgs::new(p.output_points(), n, p.input_channels).with_k_sections(p.kernel_points());

    let mut got = vec![0.0; p.output_points() * n];
    let ops = Operands::dense(&input, p.input_channels, &b, n, n);
    run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Convolution(p), None, None, &mut got);

    let cols = im2col(&p, &input, p.padding_value);
    let mut want = vec![0.0; p.output_points() * n];
    reference_f32(&args, &Operands::dense(&cols, p.im2col_width(), &b, n, n), &mut want);
    assert_close(&got, &want, 1e-4);
}

#[test]
fn u8_requantized_convolution_pads_with_zero_point() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(14);
    let qp = Requantize32::per_layer::<u8>(121, 131, 90, 1 << 30, 0, 9);
    // Out-of-image taps read the input zero point, so they contribute nothing.
    let p = ConvolutionParameters { input_channels: 5, padding_value: qp.a_offset as f32, ..conv_params() };
    let n = 11;
    let input: Vec<u8> = (0..p.input_width * p.input_height * p.input_channels).map(|_| rng.gen()).collect();
    let b: Vec<u8> = (0..p.im2col_width() * n).map(|_| rng.gen()).collect();
    let bias: Vec<i32> = (0..n).map(|_| rng.gen_range(-3000..3000)).collect();
    let os = OutputStage::Requantize32(qp.clone());

    let args = GemmArgs::new(p.output_points(), n, p.input_channels).with_k_sections(p.kernel_points());
    let ops = Operands::dense(&input, p.input_channels, &b, n, n);
    let mut got = vec![0u8; p.output_points() * n];
    run_gemm(&args, &os, &ops, Lhs::Convolution(p), Some(&bias), None, &mut got);

    let cols = im2col(&p, &input, qp.a_offset as u8);
    let width = p.im2col_width();
    let mut distinct = std::collections::HashSet::new();
    for i in 0..p.output_points() {
        for j in 0..n {
            let acc: i32 = (0..width)
                .map(|q| (cols[i * width + q] as i32 - qp.a_offset) * (b[q * n + j] as i32 - qp.b_offset))
                .sum();
            let want = qp.requantize_value(acc + bias[j], j);
            assert_eq!(got[i * n + j] as i32, want, "C[{i}][{j}]");
            distinct.insert(want);
        }
    }
    assert!(distinct.len() > 8, "requantized output collapsed to {distinct:?}");
}

#[test]
fn indirect_rows_match_dense() {
    let mut rng = StdRng::seed_from_u64(12);
    let (m, n, k, sections) = (7, 9, 5, 3);
    // Row storage wider than K: only the first `k` values are read.
    let storage: Vec<Vec<i8>> = (0..sections * m).map(|_| (0..k + 2).map(|_| rng.gen()).collect()).collect();
    let rows: Vec<Vec<&[i8]>> =
        (0..sections).map(|s| (0..m).map(|r| storage[s * m + (m - 1 - r)].as_slice()).collect()).collect();
    let b: Vec<i8> = (0..sections * k * n).map(|_| rng.gen()).collect();

    let args = GemmArgs::new(m, n, k).with_k_sections(sections).with_indirect_input(true);
    let ops = Operands::dense(&[], 0, &b, n, n);
    let mut got = vec![0i32; m * n];
    run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Indirect { string_len: k, rows: &rows }, None, None, &mut got);

    for r in 0..m {
        for j in 0..n {
            let mut want = 0i32;
            for s in 0..sections {
                for p in 0..k {
                    want += rows[s][r][p] as i32 * b[(s * k + p) * n + j] as i32;
                }
            }
            assert_eq!(got[r * n + j], want, "C[{r}][{j}]");
        }
    }
}

#[test]
fn u8_requantized_indirect_rows() {
    let mut rng = StdRng::seed_from_u64(15);
    let (m, n, k, sections) = (11, 9, 7, 3);
    let storage: Vec<Vec<u8>> = (0..sections * m).map(|_| (0..k).map(|_| rng.gen()).collect()).collect();
    let rows: Vec<Vec<&[u8]>> =
        (0..sections).map(|s| (0..m).map(|r| storage[(s * m + r * 5) % storage.len()].as_slice()).collect()).collect();
    let b: Vec<u8> = (0..sections * k * n).map(|_| rng.gen()).collect();
    let qp = Requantize32::per_layer::<u8>(119, 126, 128, 1 << 30, 0, 9);
    let os = OutputStage::Requantize32(qp.clone());

    let args = GemmArgs::new(m, n, k).with_k_sections(sections).with_indirect_input(true);
    let ops = Operands::dense(&[], 0, &b, n, n);
    let mut got = vec![0u8; m * n];
    run_gemm(&args, &os, &ops, Lhs::Indirect { string_len: k, rows: &rows }, None, None, &mut got);

    for r in 0..m {
        for j in 0..n {
            let mut acc = 0i32;
            for s in 0..sections {
                for p in 0..k {
                    acc += (rows[s][r][p] as i32 - qp.a_offset) * (b[(s * k + p) * n + j] as i32 - qp.b_offset);
                }
            }
            assert_eq!(got[r * n + j] as i32, qp.requantize_value(acc, j), "C[{r}][{j}]");
        }
    }
}

#[test]
fn indirect_flag_must_match_bound_rows() {
    let (m, n, k) = (4, 6, 3);
    let storage = vec![1i8; m * k];
    let rows: Vec<Vec<&[i8]>> = vec![storage.chunks(k).collect()];
    let b = vec![1i8; k * n];

    // Declared indirect, but A handed over as a plain matrix.
    let args = GemmArgs::new(m, n, k).with_indirect_input(true);
    let mut c = vec![0i32; m * n];
    let mut kernel = gemm::<i8, i32>(&args, &OutputStage::Nothing).unwrap();
    let err = kernel.try_set_arrays(GemmArrays::new(&storage, k, &b, n, &mut c, n)).unwrap_err();
    assert!(matches!(err, GemmError::InvalidArgument(_)), "{err}");
    drop(kernel);

    // Rows supplied to a problem declared plain.
    let args = GemmArgs::new(m, n, k);
    let mut c = vec![0i32; m * n];
    let mut kernel = gemm::<i8, i32>(&args, &OutputStage::Nothing).unwrap();
    kernel.set_indirect_parameters(k, &rows);
    let err = kernel.try_set_arrays(GemmArrays::new(&storage, k, &b, n, &mut c, n)).unwrap_err();
    assert!(matches!(err, GemmError::InvalidArgument(_)), "{err}");
    drop(kernel);
}

#[test]
fn plain_sections_sit_side_by_side() {
    // k_sections > 1 over a plain A: section s is columns [s*K, (s+1)*K).
    let mut rng = StdRng::seed_from_u64(13);
    let (m, n, k, sections) = (12, 10, 3, 4);
    let a = random_f32(&mut rng, m * k * sections);
    let b = random_f32(&mut rng, k * sections * n);
    let args = GemmArgs::new(m, n, k).with_k_sections(sections);
    let ops = Operands::dense(&a, k * sections, &b, n, n);

    let mut got = vec![0.0; m * n];
    run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Plain, None, None, &mut got);
    let mut want = vec![0.0; m * n];
    reference_f32(&args, &ops, &mut want);
    assert_close(&got, &want, 1e-4);
}

// ═══════════════════════════════════════════════════════════════════════
// Partitioning
// ═══════════════════════════════════════════════════════════════════════

fn random_cuts(rng: &mut StdRng, total: usize) -> Vec<(usize, usize)> {
    let mut points: Vec<usize> = (1..total).filter(|_| rng.gen_bool(0.4)).collect();
    points.insert(0, 0);
    points.push(total);
    let mut cuts: Vec<(usize, usize)> = points.windows(2).map(|w| (w[0], w[1])).collect();
    // Execution order must not matter either.
    for i in (1..cuts.len()).rev() {
        cuts.swap(i, rng.gen_range(0..=i));
    }
    cuts
}

#[test]
fn any_partition_is_bit_identical() {
    let mut rng = StdRng::seed_from_u64(14);
    let (m, n, k) = (61, 45, 37);
    let a = random_f32(&mut rng, 2 * m * k);
    let b = random_f32(&mut rng, k * n);

    for method in [GemmMethod::GemmInterleaved, GemmMethod::GemmHybrid] {
        let args = GemmArgs::new(m, n, k).with_batches(2).with_config(forced(method));
        let mut ops = Operands::dense(&a, k, &b, n, n);
        ops.a_batch_stride = m * k;
        ops.c_batch_stride = m * n;

        let total = gemm::<f32, f32>(&args, &OutputStage::Nothing).unwrap().get_window_size().total_size();
        let mut whole = vec![0.0; 2 * m * n];
        run_in_pieces(&args, &ops, &[(0, total)], &mut whole);

        for _ in 0..4 {
            let cuts = random_cuts(&mut rng, total);
            let mut pieces = vec![f32::NAN; 2 * m * n];
            run_in_pieces(&args, &ops, &cuts, &mut pieces);
            assert!(
                whole.iter().zip(&pieces).all(|(x, y)| x.to_bits() == y.to_bits()),
                "{method:?} differs for cuts {cuts:?}"
            );
        }
    }
}

#[test]
fn threaded_run_matches_sequential() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(15);
    let (m, n, k) = (150, 70, 90);
    let a = random_f32(&mut rng, m * k);
    let b = random_f32(&mut rng, k * n);
    let scheduler = GemmScheduler::new(4).unwrap();

    for method in [GemmMethod::GemmInterleaved, GemmMethod::GemmHybrid] {
        let args = GemmArgs::new(m, n, k).with_max_threads(4).with_config(forced(method));
        let ops = Operands::dense(&a, k, &b, n, n);

        let mut seq = vec![0.0; m * n];
        run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Plain, None, None, &mut seq);
        let mut par = vec![0.0; m * n];
        run_gemm(&args, &OutputStage::Nothing, &ops, Lhs::Plain, None, Some(&scheduler), &mut par);
        assert!(seq.iter().zip(&par).all(|(x, y)| x.to_bits() == y.to_bits()), "{method:?}");
    }
}

#[test]
fn workspace_bound_before_run_on_larger_pool() {
    // Kernel lowered to one thread and its workspace bound before the pool
    // (four workers) ever sees it.
    init_logger();
    let mut rng = StdRng::seed_from_u64(16);
    let (m, n, k) = (90, 40, 33);
    let a = random_f32(&mut rng, m * k);
    let b = random_f32(&mut rng, k * n);
    let scheduler = GemmScheduler::new(4).unwrap();
    let ops = Operands::dense(&a, k, &b, n, n);
    let mut want = vec![0.0; m * n];
    let args = GemmArgs::new(m, n, k);
    reference_f32(&args, &ops, &mut want);

    for method in [GemmMethod::GemmInterleaved, GemmMethod::GemmHybrid] {
        let args = GemmArgs::new(m, n, k).with_max_threads(4).with_config(forced(method));
        let mut got = vec![0.0; m * n];
        let mut pretransposed;
        let mut workspace;
        let mut kernel = gemm::<f32, f32>(&args, &OutputStage::Nothing).unwrap();
        pretransposed = AlignedVec::<u8>::zeroed(kernel.get_b_pretransposed_array_size());
        kernel.pretranspose_b_array(pretransposed.as_mut_slice(), &b, n, 0).unwrap();
        kernel.set_nthreads(1);
        assert_eq!(kernel.get_nthreads(), 1);
        workspace = vec![0u8; kernel.get_working_size()];
        kernel.set_working_space(&mut workspace).unwrap();
        kernel.try_set_arrays(ops.arrays(&mut got)).unwrap();

        scheduler.run(&mut *kernel);
        // The pool never raises a count the bound workspace cannot hold.
        assert_eq!(kernel.get_nthreads(), 1);
        kernel.set_nthreads(4);
        assert_eq!(kernel.get_nthreads(), 1);
        drop(kernel);
        assert_close(&got, &want, 1e-4);
    }
}

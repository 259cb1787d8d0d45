//! Kernel selection.
//!
//! Every (A/B type, C type) pair has a static list of candidate
//! implementations. Selection filters the list by support and by the
//! caller's `GemmConfig`, then takes the lowest cycle estimate; ties go to
//! the earlier entry.

use half::f16;

use crate::error::{GemmError, GemmResult};
use crate::quantized::OutputStage;
use crate::traits::Element;
use crate::validation::{validate_gemm_args, validate_requantize};

use super::args::{GemmArgs, GemmMethod, KernelDescription, WeightFormat};
use super::common::GemmCommon;
use super::hybrid::GemmHybrid;
use super::interleaved::GemmInterleaved;
use super::strategy::{
    Bf16Interleaved8x12, HgemmInterleaved8x12, HybridStrategy, InterleavedStrategy, S8Interleaved8x12,
    SgemmHybrid6x16, SgemmInterleaved8x12, U8Interleaved8x12,
};

/// Boxed kernel borrowing arrays for `'a`.
pub type GemmKernel<'a, To, Tr> = Box<dyn GemmCommon<'a, To, To, Tr> + 'a>;

pub type InstantiateFn<To, Tr> = for<'x> fn(&'x GemmArgs, &OutputStage) -> GemmKernel<'x, To, Tr>;

/// One selectable kernel.
pub struct GemmImplementation<To: 'static, Tr: 'static> {
    pub method: GemmMethod,
    pub name: &'static str,
    /// Layout this kernel reads fixed-format B in.
    pub weight_format: WeightFormat,
    pub is_supported: fn(&GemmArgs, &OutputStage) -> bool,
    pub cycle_estimate: fn(&GemmArgs, &OutputStage) -> u64,
    pub instantiate: InstantiateFn<To, Tr>,
}

impl<To, Tr> GemmImplementation<To, Tr> {
    fn describe(&self, args: &GemmArgs, os: &OutputStage, is_default: bool) -> KernelDescription {
        KernelDescription {
            method: self.method,
            name: self.name.to_string(),
            is_default,
            cycle_estimate: (self.cycle_estimate)(args, os),
        }
    }

    /// Whether the caller's config allows this kernel.
    fn matches_config(&self, args: &GemmArgs) -> bool {
        let Some(cfg) = &args.cfg else { return true };
        if cfg.method != GemmMethod::Default && cfg.method != self.method {
            return false;
        }
        if !cfg.filter.is_empty() && !self.name.contains(cfg.filter.as_str()) {
            return false;
        }
        match cfg.weight_format {
            WeightFormat::Interleaved { .. } => cfg.weight_format == self.weight_format,
            _ => true,
        }
    }
}

/// Candidate kernels for A/B element type `Self` and C element type `Tr`.
pub trait GemmKernelList<Tr: Element>: Element {
    fn implementations() -> &'static [GemmImplementation<Self, Tr>];
}

// ── Constructors and predicates ──────────────────────────────────────

fn new_interleaved<'x, S: InterleavedStrategy, To: Element, Tr: Element>(
    args: &'x GemmArgs,
    os: &OutputStage,
) -> GemmKernel<'x, To, Tr> {
    Box::new(GemmInterleaved::<S, To, Tr>::new(args, os))
}

fn new_hybrid<'x, S: HybridStrategy<Lhs = To>, To: Element, Tr: Element>(
    args: &'x GemmArgs,
    os: &OutputStage,
) -> GemmKernel<'x, To, Tr> {
    Box::new(GemmHybrid::<S, To, Tr>::new(args, os))
}

fn interleaved_cycles<S: InterleavedStrategy, To: Element, Tr: Element>(args: &GemmArgs, os: &OutputStage) -> u64 {
    GemmInterleaved::<S, To, Tr>::estimate_cycles(args, os)
}

fn hybrid_cycles<S: HybridStrategy<Lhs = To>, To: Element, Tr: Element>(args: &GemmArgs, os: &OutputStage) -> u64 {
    GemmHybrid::<S, To, Tr>::estimate_cycles(args, os)
}

/// Fixed-format B is read as-is, which rules out per-section packing and
/// the column sums requantization needs.
fn fixed_format_ok(args: &GemmArgs, os: &OutputStage) -> bool {
    !args.fixed_format || (args.k_sections == 1 && os.requantize().is_none())
}

fn plain_output(args: &GemmArgs, os: &OutputStage) -> bool {
    os.requantize().is_none() && fixed_format_ok(args, os)
}

fn bf16_fast_mode(args: &GemmArgs, os: &OutputStage) -> bool {
    args.fast_mode && !args.fixed_format && os.requantize().is_none()
}

fn requantized(args: &GemmArgs, os: &OutputStage) -> bool {
    os.requantize().is_some() && !args.fixed_format
}

const fn interleaved_format<S: InterleavedStrategy>() -> WeightFormat {
    WeightFormat::Interleaved { out_width: S::OUT_WIDTH, k_unroll: S::K_UNROLL }
}

// ── Kernel lists ─────────────────────────────────────────────────────

impl GemmKernelList<f32> for f32 {
    fn implementations() -> &'static [GemmImplementation<f32, f32>] {
        static LIST: [GemmImplementation<f32, f32>; 3] = [
            GemmImplementation {
                method: GemmMethod::GemmHybrid,
                name: SgemmHybrid6x16::NAME,
                weight_format: WeightFormat::Interleaved {
                    out_width: SgemmHybrid6x16::OUT_WIDTH,
                    k_unroll: SgemmHybrid6x16::K_UNROLL,
                },
                is_supported: plain_output,
                cycle_estimate: hybrid_cycles::<SgemmHybrid6x16, f32, f32>,
                instantiate: new_hybrid::<SgemmHybrid6x16, f32, f32>,
            },
            GemmImplementation {
                method: GemmMethod::GemmInterleaved,
                name: Bf16Interleaved8x12::NAME,
                weight_format: interleaved_format::<Bf16Interleaved8x12>(),
                is_supported: bf16_fast_mode,
                cycle_estimate: interleaved_cycles::<Bf16Interleaved8x12, f32, f32>,
                instantiate: new_interleaved::<Bf16Interleaved8x12, f32, f32>,
            },
            GemmImplementation {
                method: GemmMethod::GemmInterleaved,
                name: SgemmInterleaved8x12::NAME,
                weight_format: interleaved_format::<SgemmInterleaved8x12>(),
                is_supported: plain_output,
                cycle_estimate: interleaved_cycles::<SgemmInterleaved8x12, f32, f32>,
                instantiate: new_interleaved::<SgemmInterleaved8x12, f32, f32>,
            },
        ];
        &LIST
    }
}

impl GemmKernelList<f16> for f16 {
    fn implementations() -> &'static [GemmImplementation<f16, f16>] {
        static LIST: [GemmImplementation<f16, f16>; 1] = [GemmImplementation {
            method: GemmMethod::GemmInterleaved,
            name: HgemmInterleaved8x12::NAME,
            weight_format: interleaved_format::<HgemmInterleaved8x12>(),
            is_supported: plain_output,
            cycle_estimate: interleaved_cycles::<HgemmInterleaved8x12, f16, f16>,
            instantiate: new_interleaved::<HgemmInterleaved8x12, f16, f16>,
        }];
        &LIST
    }
}

impl GemmKernelList<i32> for i8 {
    fn implementations() -> &'static [GemmImplementation<i8, i32>] {
        static LIST: [GemmImplementation<i8, i32>; 1] = [GemmImplementation {
            method: GemmMethod::GemmInterleaved,
            name: S8Interleaved8x12::NAME,
            weight_format: interleaved_format::<S8Interleaved8x12>(),
            is_supported: plain_output,
            cycle_estimate: interleaved_cycles::<S8Interleaved8x12, i8, i32>,
            instantiate: new_interleaved::<S8Interleaved8x12, i8, i32>,
        }];
        &LIST
    }
}

impl GemmKernelList<i32> for u8 {
    fn implementations() -> &'static [GemmImplementation<u8, i32>] {
        static LIST: [GemmImplementation<u8, i32>; 1] = [GemmImplementation {
            method: GemmMethod::GemmInterleaved,
            name: U8Interleaved8x12::NAME,
            weight_format: interleaved_format::<U8Interleaved8x12>(),
            is_supported: plain_output,
            cycle_estimate: interleaved_cycles::<U8Interleaved8x12, u8, i32>,
            instantiate: new_interleaved::<U8Interleaved8x12, u8, i32>,
        }];
        &LIST
    }
}

impl GemmKernelList<i8> for i8 {
    fn implementations() -> &'static [GemmImplementation<i8, i8>] {
        static LIST: [GemmImplementation<i8, i8>; 1] = [GemmImplementation {
            method: GemmMethod::GemmInterleaved,
            name: S8Interleaved8x12::NAME,
            weight_format: interleaved_format::<S8Interleaved8x12>(),
            is_supported: requantized,
            cycle_estimate: interleaved_cycles::<S8Interleaved8x12, i8, i8>,
            instantiate: new_interleaved::<S8Interleaved8x12, i8, i8>,
        }];
        &LIST
    }
}

impl GemmKernelList<u8> for u8 {
    fn implementations() -> &'static [GemmImplementation<u8, u8>] {
        static LIST: [GemmImplementation<u8, u8>; 1] = [GemmImplementation {
            method: GemmMethod::GemmInterleaved,
            name: U8Interleaved8x12::NAME,
            weight_format: interleaved_format::<U8Interleaved8x12>(),
            is_supported: requantized,
            cycle_estimate: interleaved_cycles::<U8Interleaved8x12, u8, u8>,
            instantiate: new_interleaved::<U8Interleaved8x12, u8, u8>,
        }];
        &LIST
    }
}

// ── Selection ────────────────────────────────────────────────────────

fn cheapest<'l, To, Tr>(
    candidates: impl Iterator<Item = &'l GemmImplementation<To, Tr>>,
    args: &GemmArgs,
    os: &OutputStage,
) -> Option<&'l GemmImplementation<To, Tr>> {
    candidates.min_by_key(|i| (i.cycle_estimate)(args, os))
}

/// The implementation `gemm` would instantiate, if any.
pub fn find_implementation<To: GemmKernelList<Tr>, Tr: Element>(
    args: &GemmArgs,
    os: &OutputStage,
) -> Option<&'static GemmImplementation<To, Tr>> {
    let supported = To::implementations().iter().filter(|i| (i.is_supported)(args, os));
    let chosen = cheapest(supported.filter(|i| i.matches_config(args)), args, os);
    if chosen.is_none() && args.cfg.is_some() {
        log::warn!("no kernel for M={} N={} K={} matches the gemm config", args.m, args.n, args.k);
    }
    chosen
}

/// Describe the kernel `gemm` would return.
pub fn get_gemm_method<To: GemmKernelList<Tr>, Tr: Element>(
    args: &GemmArgs,
    os: &OutputStage,
) -> GemmResult<KernelDescription> {
    let imp = find_implementation::<To, Tr>(args, os).ok_or(GemmError::NoKernel)?;
    Ok(imp.describe(args, os, args.uses_default_selection()))
}

/// Every kernel able to run this problem, ignoring the caller's config.
/// `is_default` marks the one the cost model alone would pick.
pub fn get_compatible_kernels<To: GemmKernelList<Tr>, Tr: Element>(
    args: &GemmArgs,
    os: &OutputStage,
) -> Vec<KernelDescription> {
    let supported: Vec<_> = To::implementations().iter().filter(|i| (i.is_supported)(args, os)).collect();
    let best = cheapest(supported.iter().copied(), args, os).map(|i| i.name);
    supported.iter().map(|i| i.describe(args, os, Some(i.name) == best)).collect()
}

/// Build the selected kernel for `args`.
pub fn gemm<'a, To: GemmKernelList<Tr>, Tr: Element>(
    args: &'a GemmArgs,
    os: &OutputStage,
) -> GemmResult<GemmKernel<'a, To, Tr>> {
    validate_gemm_args(args)?;
    if let Some(qp) = os.requantize() {
        validate_requantize(qp, args.n)?;
    }
    let imp = find_implementation::<To, Tr>(args, os).ok_or(GemmError::NoKernel)?;
    log::debug!(
        "gemm {}x{}x{} (sections {}, batches {}, multis {}): using {}",
        args.m,
        args.n,
        args.k,
        args.k_sections,
        args.nbatches,
        args.nmulti,
        imp.name
    );
    Ok((imp.instantiate)(args, os))
}

/// Whether an optimised kernel exists, and which B layout it wants.
///
/// Returns the kernel's interleaved layout for fixed-format problems,
/// `WeightFormat::Any` otherwise, and `None` when nothing can run it.
pub fn has_opt_gemm<To: GemmKernelList<Tr>, Tr: Element>(args: &GemmArgs, os: &OutputStage) -> Option<WeightFormat> {
    let imp = find_implementation::<To, Tr>(args, os)?;
    Some(if args.fixed_format { imp.weight_format } else { WeightFormat::Any })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemm::args::GemmConfig;
    use crate::gemm::common::IGemmCommon;
    use crate::quantized::Requantize32;

    #[test]
    fn test_f32_lists_both_methods() {
        let args = GemmArgs::new(64, 64, 64);
        let kernels = get_compatible_kernels::<f32, f32>(&args, &OutputStage::Nothing);
        let names: Vec<_> = kernels.iter().map(|k| k.name.as_str()).collect();
        eprintln!("{kernels:#?}");
        assert_eq!(names, vec!["sgemm_hybrid_6x16", "sgemm_interleaved_8x12"]);
        assert_eq!(kernels.iter().filter(|k| k.is_default).count(), 1);
    }

    #[test]
    fn test_fast_mode_adds_bf16() {
        let args = GemmArgs::new(64, 64, 64).with_fast_mode(true);
        let kernels = get_compatible_kernels::<f32, f32>(&args, &OutputStage::Nothing);
        assert!(kernels.iter().any(|k| k.name == "bf16fp32_interleaved_8x12"));
    }

    #[test]
    fn test_config_forces_method_and_filter() {
        let cfg = GemmConfig { method: GemmMethod::GemmInterleaved, ..Default::default() };
        let args = GemmArgs::new(6, 16, 8).with_config(cfg);
        let d = get_gemm_method::<f32, f32>(&args, &OutputStage::Nothing).unwrap();
        assert_eq!(d.method, GemmMethod::GemmInterleaved);
        assert!(!d.is_default);

        let cfg = GemmConfig { filter: "hybrid".into(), ..Default::default() };
        let args = GemmArgs::new(600, 600, 600).with_config(cfg);
        assert_eq!(get_gemm_method::<f32, f32>(&args, &OutputStage::Nothing).unwrap().name, "sgemm_hybrid_6x16");

        let cfg = GemmConfig { filter: "nonexistent".into(), ..Default::default() };
        let args = GemmArgs::new(8, 8, 8).with_config(cfg);
        assert!(matches!(get_gemm_method::<f32, f32>(&args, &OutputStage::Nothing), Err(GemmError::NoKernel)));
    }

    #[test]
    fn test_quantized_only_with_output_stage() {
        let args = GemmArgs::new(8, 8, 8);
        assert!(has_opt_gemm::<i8, i8>(&args, &OutputStage::Nothing).is_none());
        let os = OutputStage::Requantize32(Requantize32::per_layer::<i8>(0, 0, 0, 1 << 30, 0, 0));
        assert_eq!(has_opt_gemm::<i8, i8>(&args, &os), Some(WeightFormat::Any));
        assert!(has_opt_gemm::<i8, i32>(&args, &os).is_none());
    }

    #[test]
    fn test_fixed_format_reports_layout() {
        let args = GemmArgs::new(8, 8, 8).with_fixed_format(true);
        let cfg = GemmConfig { method: GemmMethod::GemmInterleaved, ..Default::default() };
        let wf = has_opt_gemm::<f32, f32>(&args.clone().with_config(cfg), &OutputStage::Nothing);
        assert_eq!(wf, Some(WeightFormat::Interleaved { out_width: 12, k_unroll: 1 }));
        assert!(has_opt_gemm::<f32, f32>(&args.with_k_sections(2), &OutputStage::Nothing).is_none());
    }

    #[test]
    fn test_gemm_validates() {
        let args = GemmArgs::new(0, 8, 8);
        assert!(gemm::<f32, f32>(&args, &OutputStage::Nothing).is_err());
        let args = GemmArgs::new(8, 8, 8);
        let k = gemm::<f16, f16>(&args, &OutputStage::Nothing).unwrap();
        assert_eq!(k.get_config().name, "hgemm_interleaved_8x12");
    }
}

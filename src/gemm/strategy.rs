//! Micro-kernel strategies.
//!
//! A strategy fixes the tile geometry, the operand types the micro-kernel
//! consumes and the accumulator it produces. The bundled kernels are
//! portable reference bodies; ISA-specific back-ends provide their own
//! strategies with the same geometry contract.

use half::{bf16, f16};

use crate::cpu_info::CpuInfo;
use crate::interleave::PanelShape;
use crate::traits::{Accumulator, Element};

/// Throughput figures used by the factory's cycle estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceParameters {
    pub kernel_macs_cycle: f32,
    pub prepare_bytes_cycle: f32,
    pub merge_bytes_cycle: f32,
}

/// Kernel consuming packed A panels and packed B stripes.
///
/// A panel: for each `K_UNROLL` group, `OUT_HEIGHT` rows of `K_UNROLL`
/// values. B stripe: for each group, `OUT_WIDTH` columns of `K_UNROLL`
/// values. The tile is `OUT_HEIGHT × OUT_WIDTH`, row-major.
pub trait InterleavedStrategy: Send + Sync + 'static {
    type Operand: Element;
    type Result: Accumulator;

    const NAME: &'static str;
    const OUT_HEIGHT: usize;
    const OUT_WIDTH: usize;
    const K_UNROLL: usize;

    fn lhs_shape() -> PanelShape {
        PanelShape::fixed(Self::OUT_HEIGHT, Self::K_UNROLL)
    }

    /// `tile += A_panel · B_stripe` over `k` columns (a multiple of `K_UNROLL`).
    fn kernel(a_panel: &[Self::Operand], b_stripe: &[Self::Operand], k: usize, tile: &mut [Self::Result]) {
        interleaved_kernel_generic::<Self>(a_panel, b_stripe, k, tile)
    }

    fn performance(ci: &CpuInfo) -> PerformanceParameters;
}

/// Portable body for any interleaved geometry.
pub fn interleaved_kernel_generic<S: InterleavedStrategy + ?Sized>(
    a_panel: &[S::Operand],
    b_stripe: &[S::Operand],
    k: usize,
    tile: &mut [S::Result],
) {
    let (h, w, u) = (S::OUT_HEIGHT, S::OUT_WIDTH, S::K_UNROLL);
    debug_assert_eq!(k % u, 0);
    let groups = k / u;
    assert!(a_panel.len() >= groups * h * u && b_stripe.len() >= groups * w * u);
    assert!(tile.len() >= h * w);

    for g in 0..groups {
        let a = &a_panel[g * h * u..(g + 1) * h * u];
        let b = &b_stripe[g * w * u..(g + 1) * w * u];
        for r in 0..h {
            let ar = &a[r * u..(r + 1) * u];
            let row = &mut tile[r * w..(r + 1) * w];
            for (acc, bc) in row.iter_mut().zip(b.chunks_exact(u)) {
                let mut v = *acc;
                for (&x, &y) in ar.iter().zip(bc) {
                    v = v.madd(x, y);
                }
                *acc = v;
            }
        }
    }
}

/// Kernel reading A directly through row slices.
///
/// B stripes use the same layout as for [`InterleavedStrategy`].
pub trait HybridStrategy: Send + Sync + 'static {
    type Lhs: Element;
    type Rhs: Element;
    type Result: Accumulator;

    const NAME: &'static str;
    const OUT_HEIGHT: usize;
    const OUT_WIDTH: usize;
    const K_UNROLL: usize;

    /// `tile[r] += Σ_kk rows[r][kk] · B[kk]` for `kk < width`, where
    /// `b_stripe` starts at the string's first K position.
    fn kernel(rows: &[&[Self::Lhs]], width: usize, b_stripe: &[Self::Rhs], tile: &mut [Self::Result]) {
        hybrid_kernel_generic::<Self>(rows, width, b_stripe, tile)
    }

    fn performance(ci: &CpuInfo) -> PerformanceParameters;
}

/// Portable body for any hybrid geometry. `rows.len()` is the active height.
pub fn hybrid_kernel_generic<S: HybridStrategy + ?Sized>(
    rows: &[&[S::Lhs]],
    width: usize,
    b_stripe: &[S::Rhs],
    tile: &mut [S::Result],
) {
    let (w, u) = (S::OUT_WIDTH, S::K_UNROLL);
    for (r, row) in rows.iter().enumerate() {
        let out = &mut tile[r * w..(r + 1) * w];
        for (kk, &av) in row[..width].iter().enumerate() {
            let base = (kk / u) * w * u + kk % u;
            for (c, acc) in out.iter_mut().enumerate() {
                *acc = acc.madd(av, b_stripe[base + c * u]);
            }
        }
    }
}

// ── Bundled strategies ───────────────────────────────────────────────

/// f32 × f32 → f32, 8×12 tiles.
pub struct SgemmInterleaved8x12;

impl InterleavedStrategy for SgemmInterleaved8x12 {
    type Operand = f32;
    type Result = f32;
    const NAME: &'static str = "sgemm_interleaved_8x12";
    const OUT_HEIGHT: usize = 8;
    const OUT_WIDTH: usize = 12;
    const K_UNROLL: usize = 1;

    fn performance(_ci: &CpuInfo) -> PerformanceParameters {
        PerformanceParameters { kernel_macs_cycle: 16.0, prepare_bytes_cycle: 4.0, merge_bytes_cycle: 2.0 }
    }
}

/// f16 × f16 accumulated in f32, 8×12 tiles.
pub struct HgemmInterleaved8x12;

impl InterleavedStrategy for HgemmInterleaved8x12 {
    type Operand = f16;
    type Result = f32;
    const NAME: &'static str = "hgemm_interleaved_8x12";
    const OUT_HEIGHT: usize = 8;
    const OUT_WIDTH: usize = 12;
    const K_UNROLL: usize = 1;

    fn performance(_ci: &CpuInfo) -> PerformanceParameters {
        PerformanceParameters { kernel_macs_cycle: 24.0, prepare_bytes_cycle: 4.0, merge_bytes_cycle: 2.0 }
    }
}

/// f32 operands rounded to bf16 pairs, accumulated in f32. Fast mode only.
pub struct Bf16Interleaved8x12;

impl InterleavedStrategy for Bf16Interleaved8x12 {
    type Operand = bf16;
    type Result = f32;
    const NAME: &'static str = "bf16fp32_interleaved_8x12";
    const OUT_HEIGHT: usize = 8;
    const OUT_WIDTH: usize = 12;
    const K_UNROLL: usize = 2;

    fn performance(_ci: &CpuInfo) -> PerformanceParameters {
        PerformanceParameters { kernel_macs_cycle: 31.0, prepare_bytes_cycle: 4.5, merge_bytes_cycle: 2.0 }
    }
}

/// i8 × i8 → i32 dot-product quads, 8×12 tiles.
pub struct S8Interleaved8x12;

impl InterleavedStrategy for S8Interleaved8x12 {
    type Operand = i8;
    type Result = i32;
    const NAME: &'static str = "s8s32_interleaved_8x12";
    const OUT_HEIGHT: usize = 8;
    const OUT_WIDTH: usize = 12;
    const K_UNROLL: usize = 4;

    fn performance(_ci: &CpuInfo) -> PerformanceParameters {
        PerformanceParameters { kernel_macs_cycle: 62.0, prepare_bytes_cycle: 4.0, merge_bytes_cycle: 2.0 }
    }
}

/// u8 × u8 → i32 dot-product quads, 8×12 tiles.
pub struct U8Interleaved8x12;

impl InterleavedStrategy for U8Interleaved8x12 {
    type Operand = u8;
    type Result = i32;
    const NAME: &'static str = "u8u32_interleaved_8x12";
    const OUT_HEIGHT: usize = 8;
    const OUT_WIDTH: usize = 12;
    const K_UNROLL: usize = 4;

    fn performance(_ci: &CpuInfo) -> PerformanceParameters {
        PerformanceParameters { kernel_macs_cycle: 62.0, prepare_bytes_cycle: 4.0, merge_bytes_cycle: 2.0 }
    }
}

/// f32 hybrid, 6×16 tiles.
pub struct SgemmHybrid6x16;

impl HybridStrategy for SgemmHybrid6x16 {
    type Lhs = f32;
    type Rhs = f32;
    type Result = f32;
    const NAME: &'static str = "sgemm_hybrid_6x16";
    const OUT_HEIGHT: usize = 6;
    const OUT_WIDTH: usize = 16;
    const K_UNROLL: usize = 1;

    fn performance(_ci: &CpuInfo) -> PerformanceParameters {
        PerformanceParameters { kernel_macs_cycle: 14.0, prepare_bytes_cycle: 0.0, merge_bytes_cycle: 0.0 }
    }
}

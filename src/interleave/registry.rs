//! Pack-kernel registry.
//!
//! A pack kernel writes one panel chunk: `height` rows of `block`-wide column
//! groups, row-interleaved per group. Back-ends register specialised bodies
//! keyed by (input type, output type, panel shape); anything unregistered
//! falls back to the runtime-shaped generic body.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use half::{bf16, f16};

use super::PanelShape;
use crate::traits::Element;

/// `pack(out, rows, width, height, row_offset)`.
///
/// Writes `out.len() / (height * block)` column groups. Column `c` of row `r`
/// is `rows[r][row_offset + c]` for `c < width` and zero otherwise. `rows`
/// must hold at least `height` entries; callers alias ragged rows.
pub type PackFn<TIn, TOut> = fn(&mut [TOut], &[&[TIn]], usize, usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PackKey {
    input: TypeId,
    output: TypeId,
    shape: PanelShape,
}

impl PackKey {
    fn of<TIn: 'static, TOut: 'static>(shape: PanelShape) -> Self {
        Self { input: TypeId::of::<TIn>(), output: TypeId::of::<TOut>(), shape }
    }
}

/// Registered pack bodies, type-erased per (TIn, TOut).
pub struct PackRegistry {
    entries: HashMap<PackKey, Box<dyn Any + Send + Sync>>,
}

impl PackRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        PackRegistry { entries: HashMap::new() }
    }

    /// Register (or replace) the body for `shape`.
    pub fn register<TIn: Element, TOut: Element>(&mut self, shape: PanelShape, f: PackFn<TIn, TOut>) {
        self.entries.insert(PackKey::of::<TIn, TOut>(shape), Box::new(f));
    }

    pub fn get<TIn: Element, TOut: Element>(&self, shape: PanelShape) -> Option<PackFn<TIn, TOut>> {
        self.entries
            .get(&PackKey::of::<TIn, TOut>(shape))
            .and_then(|b| b.downcast_ref::<PackFn<TIn, TOut>>())
            .copied()
    }

    /// Number of registered bodies.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Registry holding the fixed-shape bodies used by the bundled strategies.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();

        // ── 8-row panels, block 1 ──
        reg.register::<f32, f32>(PanelShape::fixed(8, 1), pack_fixed::<f32, f32, 8, 1>);
        reg.register::<f16, f16>(PanelShape::fixed(8, 1), pack_fixed::<f16, f16, 8, 1>);

        // ── 8-row panels, block 2 (bf16 dot-product pairs) ──
        reg.register::<f32, bf16>(PanelShape::fixed(8, 2), pack_fixed::<f32, bf16, 8, 2>);

        // ── 8-row panels, block 4 (int8 dot-product quads) ──
        reg.register::<i8, i8>(PanelShape::fixed(8, 4), pack_fixed::<i8, i8, 8, 4>);
        reg.register::<u8, u8>(PanelShape::fixed(8, 4), pack_fixed::<u8, u8, 8, 4>);

        reg
    }
}

impl Default for PackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static PACK_REGISTRY: OnceLock<RwLock<PackRegistry>> = OnceLock::new();

fn global() -> &'static RwLock<PackRegistry> {
    PACK_REGISTRY.get_or_init(|| RwLock::new(PackRegistry::with_defaults()))
}

/// Run `f` on the process-wide registry, populated with defaults on first use.
pub fn with_pack_registry<R>(f: impl FnOnce(&PackRegistry) -> R) -> R {
    let reg = global().read().unwrap_or_else(PoisonError::into_inner);
    f(&reg)
}

/// Register (or replace) a process-wide pack body for `shape`.
///
/// Every interleave call resolves its body when it starts, so a body
/// registered here is used by all later `interleave`, `indirect_interleave`
/// and `convolution_interleave` calls.
pub fn register_pack<TIn: Element, TOut: Element>(shape: PanelShape, f: PackFn<TIn, TOut>) {
    let mut reg = global().write().unwrap_or_else(PoisonError::into_inner);
    reg.register::<TIn, TOut>(shape, f);
    log::debug!(
        "registered {:?} -> {:?} pack body for {shape:?}",
        TIn::DATA_TYPE,
        TOut::DATA_TYPE
    );
}

/// Real columns `[offset, offset + width)` of a row; empty when `width` is 0
/// so that offsets inside channel padding are never dereferenced.
#[inline(always)]
pub(crate) fn segment<T>(row: &[T], offset: usize, width: usize) -> &[T] {
    if width == 0 { &[] } else { &row[offset..offset + width] }
}

/// Runtime-shaped fallback body.
pub fn pack_generic<TIn: Element, TOut: Element>(
    out: &mut [TOut],
    rows: &[&[TIn]],
    width: usize,
    height: usize,
    row_offset: usize,
    block: usize,
) {
    assert!(rows.len() >= height, "{} rows for a {height}-row panel", rows.len());
    let group = height * block;
    assert_eq!(out.len() % group, 0, "output not a whole number of column groups");

    for (bi, panel) in out.chunks_exact_mut(group).enumerate() {
        let base = bi * block;
        for (r, dst) in panel.chunks_exact_mut(block).enumerate() {
            let src = segment(rows[r], row_offset, width);
            for (k, d) in dst.iter_mut().enumerate() {
                *d = match src.get(base + k) {
                    Some(v) => v.convert(),
                    None => TOut::ZERO,
                };
            }
        }
    }
}

/// Fixed-shape body; `H` and `B` are compile-time so the inner loops unroll.
pub fn pack_fixed<TIn: Element, TOut: Element, const H: usize, const B: usize>(
    out: &mut [TOut],
    rows: &[&[TIn]],
    width: usize,
    height: usize,
    row_offset: usize,
) {
    assert_eq!(height, H, "panel height mismatch");
    assert!(rows.len() >= H, "{} rows for a {H}-row panel", rows.len());
    assert_eq!(out.len() % (H * B), 0, "output not a whole number of column groups");

    let mut src: [&[TIn]; H] = [&[]; H];
    for (s, row) in src.iter_mut().zip(rows) {
        *s = segment(row, row_offset, width);
    }

    let full = width / B;
    for (bi, panel) in out.chunks_exact_mut(H * B).enumerate() {
        let base = bi * B;
        if bi < full {
            for r in 0..H {
                let s = &src[r][base..base + B];
                let d = &mut panel[r * B..(r + 1) * B];
                for k in 0..B {
                    d[k] = s[k].convert();
                }
            }
        } else {
            for r in 0..H {
                for k in 0..B {
                    panel[r * B + k] = match src[r].get(base + k) {
                        Some(v) => v.convert(),
                        None => TOut::ZERO,
                    };
                }
            }
        }
    }
}

/// Resolved pack body for one interleave call.
#[derive(Clone, Copy)]
pub enum Packer<TIn, TOut> {
    Registered(PackFn<TIn, TOut>),
    Generic { block: usize },
}

impl<TIn: Element, TOut: Element> Packer<TIn, TOut> {
    /// Registered body for `shape` if there is one, generic otherwise.
    pub fn resolve(shape: PanelShape) -> Self {
        match with_pack_registry(|reg| reg.get::<TIn, TOut>(shape)) {
            Some(f) => Packer::Registered(f),
            None => Packer::Generic { block: shape.block },
        }
    }

    #[inline]
    pub fn pack(&self, out: &mut [TOut], rows: &[&[TIn]], width: usize, height: usize, row_offset: usize) {
        match *self {
            Packer::Registered(f) => f(out, rows, width, height, row_offset),
            Packer::Generic { block } => pack_generic(out, rows, width, height, row_offset, block),
        }
    }
}

use std::fmt::Debug;

use bytemuck::Pod;
use half::{bf16, f16};

use crate::types::DataType;

/// Activation applied in the merge epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    /// ReLU clamped to `[0, upper]`.
    BoundedRelu { upper: f32 },
}

impl Activation {
    #[inline(always)]
    pub fn apply(self, v: f32) -> f32 {
        match self {
            Activation::None => v,
            Activation::Relu => v.max(0.0),
            Activation::BoundedRelu { upper } => v.max(0.0).min(upper),
        }
    }
}

/// Element trait for every operand type the packers and kernels accept.
///
/// `Pod` lets workspace and pretranspose byte buffers be viewed as typed
/// panels without copies.
pub trait Element: Debug + Copy + Default + PartialEq + Send + Sync + Pod + 'static {
    const ZERO: Self;
    const DATA_TYPE: DataType;
    const IS_INTEGRAL: bool;
    /// Elements a narrow row-sum accumulator may absorb before folding.
    const SUM_FOLD_INTERVAL: usize;

    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
    /// Saturating for types narrower than 32 bits.
    fn from_i32(v: i32) -> Self;
    fn to_i32(self) -> i32;

    /// Integer-to-integer conversions go through i32, everything else through f32.
    #[inline(always)]
    fn convert<U: Element>(self) -> U {
        if Self::IS_INTEGRAL && U::IS_INTEGRAL {
            U::from_i32(self.to_i32())
        } else {
            U::from_f32(self.to_f32())
        }
    }
}

macro_rules! impl_int_element {
    ($t:ty, $dt:expr, $fold:expr) => {
        impl Element for $t {
            const ZERO: Self = 0;
            const DATA_TYPE: DataType = $dt;
            const IS_INTEGRAL: bool = true;
            const SUM_FOLD_INTERVAL: usize = $fold;

            #[inline(always)] fn from_f32(v: f32) -> Self { v as $t }
            #[inline(always)] fn to_f32(self) -> f32 { self as f32 }
            #[inline(always)]
            fn from_i32(v: i32) -> Self {
                v.clamp(<$t>::MIN as i32, <$t>::MAX as i32) as $t
            }
            #[inline(always)] fn to_i32(self) -> i32 { self as i32 }
        }
    };
}

impl_int_element!(i8, DataType::S8, 4096);
impl_int_element!(u8, DataType::U8, 4096);
impl_int_element!(i16, DataType::S16, 4096);
impl_int_element!(u16, DataType::U16, 4096);

impl Element for i32 {
    const ZERO: Self = 0;
    const DATA_TYPE: DataType = DataType::S32;
    const IS_INTEGRAL: bool = true;
    const SUM_FOLD_INTERVAL: usize = 1;

    #[inline(always)] fn from_f32(v: f32) -> Self { v as i32 }
    #[inline(always)] fn to_f32(self) -> f32 { self as f32 }
    #[inline(always)] fn from_i32(v: i32) -> Self { v }
    #[inline(always)] fn to_i32(self) -> i32 { self }
}

impl Element for f32 {
    const ZERO: Self = 0.0;
    const DATA_TYPE: DataType = DataType::F32;
    const IS_INTEGRAL: bool = false;
    const SUM_FOLD_INTERVAL: usize = 1;

    #[inline(always)] fn from_f32(v: f32) -> Self { v }
    #[inline(always)] fn to_f32(self) -> f32 { self }
    #[inline(always)] fn from_i32(v: i32) -> Self { v as f32 }
    #[inline(always)] fn to_i32(self) -> i32 { self as i32 }
}

impl Element for f16 {
    const ZERO: Self = f16::ZERO;
    const DATA_TYPE: DataType = DataType::F16;
    const IS_INTEGRAL: bool = false;
    const SUM_FOLD_INTERVAL: usize = 1;

    #[inline(always)] fn from_f32(v: f32) -> Self { f16::from_f32(v) }
    #[inline(always)] fn to_f32(self) -> f32 { f16::to_f32(self) }
    #[inline(always)] fn from_i32(v: i32) -> Self { f16::from_f32(v as f32) }
    #[inline(always)] fn to_i32(self) -> i32 { f16::to_f32(self) as i32 }
}

impl Element for bf16 {
    const ZERO: Self = bf16::ZERO;
    const DATA_TYPE: DataType = DataType::BF16;
    const IS_INTEGRAL: bool = false;
    const SUM_FOLD_INTERVAL: usize = 1;

    #[inline(always)] fn from_f32(v: f32) -> Self { bf16::from_f32(v) }
    #[inline(always)] fn to_f32(self) -> f32 { bf16::to_f32(self) }
    #[inline(always)] fn from_i32(v: i32) -> Self { bf16::from_f32(v as f32) }
    #[inline(always)] fn to_i32(self) -> i32 { bf16::to_f32(self) as i32 }
}

/// Accumulator types a micro-kernel sums products into.
pub trait Accumulator: Element {
    /// `self + a * b`, wrapping for integer accumulators.
    fn madd<A: Element, B: Element>(self, a: A, b: B) -> Self;
    fn acc_add(self, other: Self) -> Self;
    fn activate(self, act: Activation) -> Self;
}

impl Accumulator for f32 {
    #[inline(always)]
    fn madd<A: Element, B: Element>(self, a: A, b: B) -> Self {
        self + a.to_f32() * b.to_f32()
    }

    #[inline(always)] fn acc_add(self, other: Self) -> Self { self + other }

    #[inline(always)]
    fn activate(self, act: Activation) -> Self { act.apply(self) }
}

impl Accumulator for i32 {
    #[inline(always)]
    fn madd<A: Element, B: Element>(self, a: A, b: B) -> Self {
        self.wrapping_add(a.to_i32().wrapping_mul(b.to_i32()))
    }

    #[inline(always)] fn acc_add(self, other: Self) -> Self { self.wrapping_add(other) }

    #[inline(always)]
    fn activate(self, act: Activation) -> Self {
        match act {
            Activation::None => self,
            Activation::Relu => self.max(0),
            Activation::BoundedRelu { upper } => self.max(0).min(upper as i32),
        }
    }
}

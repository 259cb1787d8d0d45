//! Data type tags, vector-length classes and small integer helpers.

/// Runtime tag for the element types this crate packs and multiplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    BF16,
    S8,
    U8,
    S16,
    U16,
    S32,
}

impl DataType {
    /// Size of one element in bytes.
    #[inline]
    pub const fn size_of(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::F16 | DataType::BF16 | DataType::S16 | DataType::U16 => 2,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    #[inline]
    pub const fn is_integral(self) -> bool {
        !matches!(self, DataType::F32 | DataType::F16 | DataType::BF16)
    }
}

/// Vector-length class a packing routine is specialised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VLType {
    /// Fixed-width vectors: one panel row per height slot.
    #[default]
    None,
    /// Scalable vectors: each height slot holds `vector_bytes / elem / block` rows.
    Sve,
}

#[inline(always)]
pub const fn iceildiv(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[inline(always)]
pub const fn roundup(a: usize, b: usize) -> usize {
    iceildiv(a, b) * b
}

//! Operand bindings handed to a kernel.
//!
//! Memory is always owned by the caller. The output is shared between
//! concurrent `execute()` calls, each writing a disjoint region, so it is
//! held as a [`SharedMutSlice`] rather than a `&mut` borrow.

use std::marker::PhantomData;
use std::ops::Range;

use crate::error::{GemmError, GemmResult};
use crate::traits::Element;
use crate::types::DataType;

/// A mutable slice that several threads may write through, provided every
/// writer touches a disjoint range.
pub struct SharedMutSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: access is only granted through `unsafe` methods whose contract
// requires disjoint ranges across threads.
unsafe impl<T: Send> Send for SharedMutSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedMutSlice<'_, T> {}

impl<'a, T> SharedMutSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self { ptr: slice.as_mut_ptr(), len: slice.len(), _marker: PhantomData }
    }

    /// Empty binding.
    pub fn empty() -> Self {
        Self { ptr: std::ptr::NonNull::dangling().as_ptr(), len: 0, _marker: PhantomData }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    /// Mutable view of `range`.
    ///
    /// # Safety
    /// No other live reference obtained from this slice may overlap `range`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [T] {
        assert!(range.start <= range.end && range.end <= self.len, "range {range:?} outside 0..{}", self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(range.start), range.end - range.start)
    }

    /// Give up shared write access and view the whole slice immutably.
    pub fn into_slice(self) -> &'a [T] {
        // SAFETY: `self` was built from a unique `&'a mut [T]`; consuming it
        // ends every borrow handed out by `slice_mut`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T> std::fmt::Debug for SharedMutSlice<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMutSlice").field("len", &self.len).finish()
    }
}

/// Pointer-of-pointers operand: entry `(multi * nbatches + batch) * k_sections
/// + section` lists the M row slices of that section.
pub type IndirectRows<'a, T> = &'a [Vec<&'a [T]>];

/// Typed operand bundle for one GEMM.
///
/// A is `To`, B is `Tw`, C and bias are `Tr`. Strides are in elements.
#[derive(Debug)]
pub struct GemmArrays<'a, To, Tw, Tr> {
    pub a: &'a [To],
    pub lda: usize,
    pub a_batch_stride: usize,
    pub a_multi_stride: usize,
    pub b: &'a [Tw],
    pub ldb: usize,
    pub b_multi_stride: usize,
    pub c: SharedMutSlice<'a, Tr>,
    pub ldc: usize,
    pub c_batch_stride: usize,
    pub c_multi_stride: usize,
    pub bias: Option<&'a [Tr]>,
    pub bias_multi_stride: usize,
}

impl<'a, To, Tw, Tr> GemmArrays<'a, To, Tw, Tr> {
    pub fn new(a: &'a [To], lda: usize, b: &'a [Tw], ldb: usize, c: &'a mut [Tr], ldc: usize) -> Self {
        Self {
            a,
            lda,
            a_batch_stride: 0,
            a_multi_stride: 0,
            b,
            ldb,
            b_multi_stride: 0,
            c: SharedMutSlice::new(c),
            ldc,
            c_batch_stride: 0,
            c_multi_stride: 0,
            bias: None,
            bias_multi_stride: 0,
        }
    }

    pub fn with_batch_strides(mut self, a_batch_stride: usize, c_batch_stride: usize) -> Self {
        self.a_batch_stride = a_batch_stride;
        self.c_batch_stride = c_batch_stride;
        self
    }

    pub fn with_multi_strides(mut self, a_multi_stride: usize, b_multi_stride: usize, c_multi_stride: usize) -> Self {
        self.a_multi_stride = a_multi_stride;
        self.b_multi_stride = b_multi_stride;
        self.c_multi_stride = c_multi_stride;
        self
    }

    pub fn with_bias(mut self, bias: &'a [Tr], bias_multi_stride: usize) -> Self {
        self.bias = Some(bias);
        self.bias_multi_stride = bias_multi_stride;
        self
    }
}

// ── Type-erased bindings ─────────────────────────────────────────────

/// Read-only byte view tagged with its element type.
#[derive(Debug, Clone, Copy)]
pub struct ErasedSlice<'a> {
    pub dtype: DataType,
    pub bytes: &'a [u8],
}

impl<'a> ErasedSlice<'a> {
    pub fn new<T: Element>(s: &'a [T]) -> Self {
        Self { dtype: T::DATA_TYPE, bytes: bytemuck::cast_slice(s) }
    }

    pub fn typed<T: Element>(self) -> GemmResult<&'a [T]> {
        if self.dtype != T::DATA_TYPE {
            return Err(GemmError::DataTypeMismatch { expected: T::DATA_TYPE, found: self.dtype });
        }
        Ok(bytemuck::try_cast_slice(self.bytes)?)
    }
}

/// Mutable byte view tagged with its element type.
#[derive(Debug)]
pub struct ErasedSliceMut<'a> {
    pub dtype: DataType,
    pub bytes: &'a mut [u8],
}

impl<'a> ErasedSliceMut<'a> {
    pub fn new<T: Element>(s: &'a mut [T]) -> Self {
        Self { dtype: T::DATA_TYPE, bytes: bytemuck::cast_slice_mut(s) }
    }

    pub fn into_typed<T: Element>(self) -> GemmResult<&'a mut [T]> {
        if self.dtype != T::DATA_TYPE {
            return Err(GemmError::DataTypeMismatch { expected: T::DATA_TYPE, found: self.dtype });
        }
        Ok(bytemuck::try_cast_slice_mut(self.bytes)?)
    }
}

/// `GemmArrays` with element types checked at bind time instead of compile time.
#[derive(Debug)]
pub struct ErasedArrays<'a> {
    pub a: ErasedSlice<'a>,
    pub lda: usize,
    pub a_batch_stride: usize,
    pub a_multi_stride: usize,
    pub b: ErasedSlice<'a>,
    pub ldb: usize,
    pub b_multi_stride: usize,
    pub c: ErasedSliceMut<'a>,
    pub ldc: usize,
    pub c_batch_stride: usize,
    pub c_multi_stride: usize,
    pub bias: Option<ErasedSlice<'a>>,
    pub bias_multi_stride: usize,
}

impl<'a> ErasedArrays<'a> {
    pub fn into_typed<To: Element, Tw: Element, Tr: Element>(self) -> GemmResult<GemmArrays<'a, To, Tw, Tr>> {
        let bias = match self.bias {
            Some(b) => Some(b.typed::<Tr>()?),
            None => None,
        };
        Ok(GemmArrays {
            a: self.a.typed::<To>()?,
            lda: self.lda,
            a_batch_stride: self.a_batch_stride,
            a_multi_stride: self.a_multi_stride,
            b: self.b.typed::<Tw>()?,
            ldb: self.ldb,
            b_multi_stride: self.b_multi_stride,
            c: SharedMutSlice::new(self.c.into_typed::<Tr>()?),
            ldc: self.ldc,
            c_batch_stride: self.c_batch_stride,
            c_multi_stride: self.c_multi_stride,
            bias,
            bias_multi_stride: self.bias_multi_stride,
        })
    }
}

impl<'a, To: Element, Tw: Element, Tr: Element> From<GemmArrays<'a, To, Tw, Tr>> for ErasedArrays<'a> {
    fn from(g: GemmArrays<'a, To, Tw, Tr>) -> Self {
        let len = g.c.len();
        let ptr = g.c.ptr;
        // SAFETY: `g.c` was created from a unique `&'a mut [Tr]` and is consumed here.
        let c: &'a mut [Tr] = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        ErasedArrays {
            a: ErasedSlice::new(g.a),
            lda: g.lda,
            a_batch_stride: g.a_batch_stride,
            a_multi_stride: g.a_multi_stride,
            b: ErasedSlice::new(g.b),
            ldb: g.ldb,
            b_multi_stride: g.b_multi_stride,
            c: ErasedSliceMut::new(c),
            ldc: g.ldc,
            c_batch_stride: g.c_batch_stride,
            c_multi_stride: g.c_multi_stride,
            bias: g.bias.map(ErasedSlice::new),
            bias_multi_stride: g.bias_multi_stride,
        }
    }
}

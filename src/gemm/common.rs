//! The contract every multiply kernel implements.
//!
//! Life cycle: construct → `set_arrays` → optionally pretranspose B →
//! any number of `execute` calls over disjoint slices of the window → done.
//! Kernels may be rebound with new arrays of the same shape and rerun.
//!
//! The window returned by `get_window_size` is one-dimensional: dimension 0
//! holds the total work and `execute` treats positions `[get_position(0),
//! get_position_end(0))` as a linear range over the kernel's own iteration
//! space.

use crate::convolution::ConvolutionParameters;
use crate::error::GemmResult;
use crate::ndrange::{Window, WorkRange};

use super::args::KernelDescription;
use super::arrays::{ErasedArrays, GemmArrays, IndirectRows, SharedMutSlice};

/// Element-type-erased kernel surface.
///
/// Everything past `get_config` is an optional capability with a no-op
/// default.
pub trait IGemmCommon<'a>: Send + Sync {
    /// Bind operands whose element types are checked at runtime.
    fn set_arrays_generic(&mut self, arrays: ErasedArrays<'a>) -> GemmResult<()>;

    fn get_window_size(&self) -> Window;

    /// Compute the outputs of `work_range`.
    ///
    /// # Safety
    /// Concurrent calls must use disjoint `work_range`s and distinct
    /// `threadid`s. Bound arrays (and pretransposed B, when required) must
    /// be set.
    unsafe fn execute(&self, work_range: &WorkRange, thread_locator: &WorkRange, threadid: usize);

    fn get_config(&self) -> KernelDescription;

    /// Lower the number of threads that will call `execute`.
    fn set_nthreads(&mut self, _nthreads: usize) {}

    /// Threads with a workspace slot of their own. Kernels without
    /// per-thread state take any number.
    fn get_nthreads(&self) -> usize {
        usize::MAX
    }

    /// Whether many small work ranges are as efficient as a few large ones.
    fn supports_dynamic_scheduling(&self) -> bool {
        false
    }

    /// Bytes of workspace wanted for the current thread count.
    fn get_working_size(&self) -> usize {
        0
    }

    fn set_working_space(&mut self, _workspace: &'a mut [u8]) -> GemmResult<()> {
        Ok(())
    }

    fn b_is_pretransposed(&self) -> bool {
        false
    }

    fn b_pretranspose_required(&self) -> bool {
        false
    }

    /// Bytes needed by `pretranspose_b_array`.
    fn get_b_pretransposed_array_size(&self) -> usize {
        0
    }

    /// Units of work `pretranspose_b_array_part` can be split into.
    fn get_b_pretranspose_window_size(&self) -> usize {
        1
    }

    /// Adopt a fully written pretransposed B.
    fn set_pretransposed_b_data(&mut self, _buffer: &'a [u8]) -> GemmResult<()> {
        Ok(())
    }

    /// Per-column i32 bias for requantizing kernels.
    fn set_quantized_bias(&mut self, _bias: &'a [i32], _bias_multi_stride: usize) {}
}

/// Typed kernel surface for A = `To`, B = `Tw`, C = `Tr`.
pub trait GemmCommon<'a, To, Tw, Tr>: IGemmCommon<'a> {
    fn set_arrays(&mut self, arrays: GemmArrays<'a, To, Tw, Tr>);

    /// `set_arrays` after checking operand extents against the problem.
    /// Indirect and convolution parameters must already be set.
    fn try_set_arrays(&mut self, arrays: GemmArrays<'a, To, Tw, Tr>) -> GemmResult<()> {
        self.set_arrays(arrays);
        Ok(())
    }

    /// Write pretranspose units `[start, end)` of B into `buffer`.
    ///
    /// # Safety
    /// Concurrent calls must use disjoint unit ranges of the same buffer.
    unsafe fn pretranspose_b_array_part(
        &self,
        _buffer: &SharedMutSlice<'_, u8>,
        _b: &[Tw],
        _ldb: usize,
        _b_multi_stride: usize,
        _start: usize,
        _end: usize,
    ) -> GemmResult<()> {
        Ok(())
    }

    /// Pretranspose all of B into `buffer` and adopt it.
    fn pretranspose_b_array(
        &mut self,
        buffer: &'a mut [u8],
        b: &[Tw],
        ldb: usize,
        b_multi_stride: usize,
    ) -> GemmResult<()> {
        let shared = SharedMutSlice::new(buffer);
        let units = self.get_b_pretranspose_window_size();
        // SAFETY: single caller covering every unit once.
        unsafe { self.pretranspose_b_array_part(&shared, b, ldb, b_multi_stride, 0, units)? };
        self.set_pretransposed_b_data(shared.into_slice())
    }

    /// Wire in a pointer-of-pointers A operand; `string_len` is the real
    /// length of each section.
    fn set_indirect_parameters(&mut self, _string_len: usize, _rows: IndirectRows<'a, To>) {}

    /// Treat A as the input image of a convolution.
    fn set_convolution_parameters(&mut self, _params: ConvolutionParameters) {}
}

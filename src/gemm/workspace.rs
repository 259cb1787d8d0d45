//! Per-thread scratch carved from the caller's workspace.
//!
//! Each `execute` caller owns `per_thread` bytes selected by its thread id.
//! Without a bound workspace (or with an out-of-range id) the scratch comes
//! from a thread-local aligned buffer instead.

use crate::cpu_info::AlignedVec;
use crate::error::{GemmError, GemmResult};
use crate::traits::Element;
use crate::types::roundup;

use super::arrays::SharedMutSlice;

pub(crate) const WORKSPACE_ALIGN: usize = 64;

thread_local! {
    static SCRATCH: std::cell::Cell<AlignedVec<u8>> = std::cell::Cell::new(AlignedVec::new());
}

/// Bytes one region of `len` elements of `T` occupies, padded for alignment.
#[inline]
pub(crate) fn region_bytes<T>(len: usize) -> usize {
    roundup(len * std::mem::size_of::<T>(), WORKSPACE_ALIGN)
}

/// Split a typed region of `len` elements off the front of `bytes`.
///
/// `bytes` must start on a `WORKSPACE_ALIGN` boundary; the remainder does too.
pub(crate) fn carve<T: Element>(bytes: &mut [u8], len: usize) -> (&mut [T], &mut [u8]) {
    let (head, tail) = bytes.split_at_mut(region_bytes::<T>(len));
    (bytemuck::cast_slice_mut(&mut head[..len * std::mem::size_of::<T>()]), tail)
}

#[derive(Debug)]
pub(crate) struct Workspace<'a> {
    buffer: Option<SharedMutSlice<'a, u8>>,
    per_thread: usize,
    nthreads: usize,
}

impl<'a> Workspace<'a> {
    pub fn new(per_thread: usize, nthreads: usize) -> Self {
        Self { buffer: None, per_thread: roundup(per_thread, WORKSPACE_ALIGN), nthreads: nthreads.max(1) }
    }

    /// Total bytes asked of the caller, including alignment slack.
    pub fn required_size(&self) -> usize {
        self.per_thread * self.nthreads + WORKSPACE_ALIGN
    }

    /// Adopt `nthreads` slots, capped by the slots a bound buffer holds.
    /// Returns the count adopted.
    pub fn set_nthreads(&mut self, nthreads: usize) -> usize {
        let mut nthreads = nthreads.max(1);
        if let Some(buf) = &self.buffer {
            let slots = (buf.len() / self.per_thread.max(1)).max(1);
            if nthreads > slots {
                log::warn!("workspace bound for {slots} threads, ignoring request for {nthreads}");
                nthreads = slots;
            }
        }
        self.nthreads = nthreads;
        nthreads
    }

    pub fn bind(&mut self, buffer: &'a mut [u8]) -> GemmResult<()> {
        let needed = self.required_size();
        if buffer.len() < needed {
            return Err(GemmError::BufferTooSmall { what: "workspace", needed, got: buffer.len() });
        }
        let skip = buffer.as_ptr().align_offset(WORKSPACE_ALIGN);
        self.buffer = Some(SharedMutSlice::new(&mut buffer[skip..]));
        Ok(())
    }

    /// Run `f` on this thread's scratch.
    ///
    /// # Safety
    /// Concurrent callers must pass distinct `threadid`s.
    pub unsafe fn with_scratch<R>(&self, threadid: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        if let (Some(buf), true) = (&self.buffer, threadid < self.nthreads) {
            let start = threadid * self.per_thread;
            return f(buf.slice_mut(start..start + self.per_thread));
        }

        if self.buffer.is_some() {
            log::debug!("thread id {threadid} beyond {} workspace slots, using thread-local scratch", self.nthreads);
        }
        let mut scratch = SCRATCH.with(|c| c.take());
        if scratch.len() < self.per_thread {
            scratch.resize_zeroed(self.per_thread);
        }
        let r = f(&mut scratch.as_mut_slice()[..self.per_thread]);
        SCRATCH.with(|c| c.set(scratch));
        r
    }
}

//! Running kernels on a rayon thread pool.
//!
//! The window is cut into disjoint slices along its largest dimension and
//! each slice is executed by whichever pool worker picks it up. Workers are
//! identified to the kernel by their pool index, which selects their slot
//! of the kernel's workspace.

use rayon::prelude::*;

use crate::error::{GemmError, GemmResult};
use crate::gemm::{GemmCommon, IGemmCommon, SharedMutSlice};
use crate::ndrange::{Window, WorkRange, WINDOW_DIMS};

/// Slices handed out per thread when the kernel tolerates fine-grained work.
const DYNAMIC_PARTS_PER_THREAD: usize = 4;

/// Split `window` into at most `parts` disjoint ranges along its largest
/// dimension. Every other dimension is covered whole by every range.
pub fn split_window(window: &Window, parts: usize) -> Vec<WorkRange> {
    let sizes = *window.sizes();
    let dim = (0..WINDOW_DIMS).max_by_key(|&d| (sizes[d], std::cmp::Reverse(d))).unwrap_or(0);
    let total = sizes[dim];
    let parts = parts.clamp(1, total);
    let chunk = total.div_ceil(parts);

    (0..total)
        .step_by(chunk)
        .map(|start| {
            let mut positions = [0usize; WINDOW_DIMS];
            let mut range_sizes = sizes;
            positions[dim] = start;
            range_sizes[dim] = chunk.min(total - start);
            WorkRange::new(positions, range_sizes)
        })
        .collect()
}

/// Execute the whole window on the calling thread.
pub fn execute_sequential<'a, G: IGemmCommon<'a> + ?Sized>(gemm: &mut G) {
    let all = WorkRange::from_range(gemm.get_window_size());
    // SAFETY: `&mut` excludes every other caller; one range covers the window.
    unsafe { gemm.execute(&all, &all, 0) }
}

/// Owns a dedicated pool sized for GEMM work.
pub struct GemmScheduler {
    pool: rayon::ThreadPool,
    nthreads: usize,
}

impl GemmScheduler {
    pub fn new(nthreads: usize) -> GemmResult<Self> {
        let nthreads = nthreads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .thread_name(|idx| format!("igemm-worker{idx}"))
            .build()?;
        log::debug!("gemm scheduler started with {nthreads} threads");
        Ok(Self { pool, nthreads })
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.nthreads
    }

    /// Run every unit of `gemm`'s window. Arrays (and pretransposed B, when
    /// the kernel requires it) must already be bound.
    ///
    /// The kernel's thread count is only ever lowered to the pool size;
    /// pool workers beyond it run on thread-local scratch.
    pub fn run<'a, G: IGemmCommon<'a> + ?Sized>(&self, gemm: &mut G) {
        let nthreads = gemm.get_nthreads();
        if self.nthreads < nthreads {
            gemm.set_nthreads(self.nthreads);
        }
        let window = gemm.get_window_size();
        let parts = if gemm.supports_dynamic_scheduling() {
            self.nthreads * DYNAMIC_PARTS_PER_THREAD
        } else {
            self.nthreads
        };
        let ranges = split_window(&window, parts);
        log::trace!("window {:?} split into {} parts", window.sizes(), ranges.len());

        let gemm: &G = gemm;
        let nparts = ranges.len();
        self.pool.install(|| {
            ranges.par_iter().enumerate().for_each(|(i, range)| {
                let threadid = rayon::current_thread_index().unwrap_or(0);
                let locator = WorkRange::from_slice(&[(i, 1), (0, nparts)]);
                // SAFETY: ranges are disjoint and a pool worker runs one
                // range at a time, so thread ids are distinct among callers.
                unsafe { gemm.execute(range, &locator, threadid) }
            })
        });
    }

    /// Pretranspose B on the pool and hand the buffer to `gemm`.
    pub fn pretranspose<'a, To, Tw, Tr, G>(
        &self,
        gemm: &mut G,
        buffer: &'a mut [u8],
        b: &[Tw],
        ldb: usize,
        b_multi_stride: usize,
    ) -> GemmResult<()>
    where
        Tw: Sync,
        G: GemmCommon<'a, To, Tw, Tr> + ?Sized,
    {
        let needed = gemm.get_b_pretransposed_array_size();
        if buffer.len() < needed {
            return Err(GemmError::BufferTooSmall { what: "pretransposed B", needed, got: buffer.len() });
        }
        let units = gemm.get_b_pretranspose_window_size();
        let chunk = units.div_ceil(self.nthreads).max(1);
        let shared = SharedMutSlice::new(buffer);

        let starts: Vec<usize> = (0..units).step_by(chunk).collect();
        let g: &G = gemm;
        let results: Vec<GemmResult<()>> = self.pool.install(|| {
            starts
                .par_iter()
                .map(|&start| {
                    let end = (start + chunk).min(units);
                    // SAFETY: chunks of units are disjoint.
                    unsafe { g.pretranspose_b_array_part(&shared, b, ldb, b_multi_stride, start, end) }
                })
                .collect()
        });
        results.into_iter().collect::<GemmResult<()>>()?;
        gemm.set_pretransposed_b_data(shared.into_slice())
    }
}

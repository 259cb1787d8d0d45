//! Host description consumed by kernel selection and blocking.
//!
//! Cache sizes come from CPUID leaf 4 (x86_64) or sysfs (Linux), falling back
//! to conservative defaults. Detection runs once; the result is cached in a
//! static `OnceLock` and copied into every `GemmArgs`.

use std::sync::OnceLock;

/// Cache geometry and core count of the executing machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub l1d: usize,
    pub l2: usize,
    pub l3: usize,
    pub num_cpus: usize,
    /// Scalable vector length in bytes, 0 when the host has none.
    pub sve_vector_bytes: usize,
}

impl CpuInfo {
    /// Fixed description used by tests and by callers that want
    /// reproducible blocking independent of the host.
    pub const fn generic() -> Self {
        Self {
            l1d: 32 * 1024,
            l2: 512 * 1024,
            l3: 8 * 1024 * 1024,
            num_cpus: 1,
            sve_vector_bytes: 0,
        }
    }

    pub fn has_sve(&self) -> bool {
        self.sve_vector_bytes > 0
    }
}

impl Default for CpuInfo {
    fn default() -> Self {
        *cpu_info()
    }
}

static CPU_INFO: OnceLock<CpuInfo> = OnceLock::new();

/// Detected host description.
pub fn cpu_info() -> &'static CpuInfo {
    CPU_INFO.get_or_init(|| {
        let (l1d, l2, l3) = detect_cache_sizes();
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let info = CpuInfo { l1d, l2, l3, num_cpus, sve_vector_bytes: detect_sve_vector_bytes() };
        log::debug!("cpu_info: {info:?}");
        info
    })
}

// ── Cache size detection ─────────────────────────────────────────────

/// (L1D bytes, L2 bytes, L3 bytes)
fn detect_cache_sizes() -> (usize, usize, usize) {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(sizes) = detect_x86_cache() {
            return sizes;
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(sizes) = detect_sysfs_cache() {
            return sizes;
        }
    }
    log::warn!("cache detection failed, using generic cache sizes");
    let g = CpuInfo::generic();
    (g.l1d, g.l2, g.l3)
}

#[cfg(target_arch = "x86_64")]
fn detect_x86_cache() -> Option<(usize, usize, usize)> {
    let mut l1d: Option<usize> = None;
    let mut l2: Option<usize> = None;
    let mut l3: Option<usize> = None;

    for sub in 0..16u32 {
        let info = std::arch::x86_64::__cpuid_count(4, sub);
        let cache_type = info.eax & 0x1F;
        if cache_type == 0 {
            break;
        }
        let level = (info.eax >> 5) & 0x7;
        let line = (info.ebx & 0xFFF) as usize + 1;
        let partitions = ((info.ebx >> 12) & 0x3FF) as usize + 1;
        let ways = ((info.ebx >> 22) & 0x3FF) as usize + 1;
        let sets = info.ecx as usize + 1;
        let size = line * partitions * ways * sets;

        match (level, cache_type) {
            (1, 1) => l1d = Some(size),
            (2, 2) | (2, 3) => l2 = Some(size),
            (3, 2) | (3, 3) => l3 = Some(size),
            _ => {}
        }
    }

    Some((l1d?, l2?, l3.unwrap_or(8 * 1024 * 1024)))
}

#[cfg(target_os = "linux")]
fn parse_sysfs_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if let Some(kb) = s.strip_suffix('K') {
        Some(kb.parse::<usize>().ok()? * 1024)
    } else if let Some(mb) = s.strip_suffix('M') {
        Some(mb.parse::<usize>().ok()? * 1024 * 1024)
    } else {
        s.parse().ok()
    }
}

#[cfg(target_os = "linux")]
fn detect_sysfs_cache() -> Option<(usize, usize, usize)> {
    let mut l1d: Option<usize> = None;
    let mut l2: Option<usize> = None;
    let mut l3: Option<usize> = None;

    for idx in 0..8 {
        let base = format!("/sys/devices/system/cpu/cpu0/cache/index{idx}");
        let read = |name: &str| std::fs::read_to_string(format!("{base}/{name}")).ok();
        let (Some(level), Some(ctype), Some(size)) = (read("level"), read("type"), read("size")) else {
            continue;
        };
        let Some(size) = parse_sysfs_size(&size) else { continue };
        let Ok(level) = level.trim().parse::<u32>() else { continue };

        match (level, ctype.trim()) {
            (1, "Data") => l1d = Some(size),
            (2, "Unified") => l2 = Some(size),
            (3, "Unified") => l3 = Some(size),
            _ => {}
        }
    }

    Some((l1d?, l2?, l3.unwrap_or(8 * 1024 * 1024)))
}

fn detect_sve_vector_bytes() -> usize {
    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    {
        if std::arch::is_aarch64_feature_detected!("sve") {
            return std::fs::read_to_string("/proc/sys/abi/sve_default_vector_length")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(16);
        }
    }
    0
}

// ── Cache-line aligned buffer ─────────────────────────────────────────

/// Zero-initialised buffer aligned to 64 bytes (cache line).
///
/// Backs packed panels, per-thread workspace and pretransposed B so that
/// byte buffers can be reinterpreted as any `Pod` element type.
pub struct AlignedVec<T> {
    ptr: *mut T,
    len: usize,
}

// SAFETY: AlignedVec uniquely owns its allocation, like Vec<T>.
unsafe impl<T: Send> Send for AlignedVec<T> {}
unsafe impl<T: Sync> Sync for AlignedVec<T> {}

impl<T: bytemuck::Zeroable + Copy> AlignedVec<T> {
    const ALIGN: usize = 64;

    #[inline]
    pub fn new() -> Self {
        Self { ptr: std::ptr::null_mut(), len: 0 }
    }

    /// Allocate `len` zeroed elements.
    pub fn zeroed(len: usize) -> Self {
        let mut v = Self::new();
        v.resize_zeroed(len);
        v
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn layout(len: usize) -> std::alloc::Layout {
        let elem = std::mem::size_of::<T>().max(1);
        match std::alloc::Layout::from_size_align(len * elem, Self::ALIGN.max(std::mem::align_of::<T>())) {
            Ok(layout) => layout,
            Err(_) => panic!("AlignedVec: layout overflow for {len} elements"),
        }
    }

    /// Reallocate to exactly `len` zeroed elements when the length changes.
    /// Previous contents are discarded.
    pub fn resize_zeroed(&mut self, len: usize) {
        if len == self.len {
            bytemuck::fill_zeroes(self.as_mut_slice());
            return;
        }
        self.dealloc();
        if len > 0 {
            assert!(std::mem::size_of::<T>() > 0, "ZST not supported");
            let layout = Self::layout(len);
            // SAFETY: layout has non-zero size; zeroed memory is a valid T.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) as *mut T };
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            self.ptr = ptr;
            self.len = len;
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: ptr owns len initialised elements.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.ptr.is_null() {
            return &mut [];
        }
        // SAFETY: ptr owns len initialised elements, uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn dealloc(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: allocated in resize_zeroed with the same layout.
            unsafe { std::alloc::dealloc(self.ptr as *mut u8, Self::layout(self.len)) };
            self.ptr = std::ptr::null_mut();
            self.len = 0;
        }
    }
}

impl<T> Drop for AlignedVec<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            let elem = std::mem::size_of::<T>().max(1);
            if let Ok(layout) =
                std::alloc::Layout::from_size_align(self.len * elem, 64usize.max(std::mem::align_of::<T>()))
            {
                // SAFETY: allocated by resize_zeroed with this layout.
                unsafe { std::alloc::dealloc(self.ptr as *mut u8, layout) };
            }
        }
    }
}

impl<T: bytemuck::Zeroable + Copy> Default for AlignedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

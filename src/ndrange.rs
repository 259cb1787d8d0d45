//! Fixed-arity iteration spaces and sub-ranges.
//!
//! `NDRange` describes all the work of an operation, `NDCoordinate` a
//! half-open slice of it. Linear positions decompose into per-dimension
//! indices through a prefix-product table, dimension 0 varying fastest.

/// Arity of every GEMM execution window.
pub const WINDOW_DIMS: usize = 6;

/// Whole-operation execution window.
pub type Window = NDRange<WINDOW_DIMS>;

/// Slice of a `Window` handed to one `execute()` call.
pub type WorkRange = NDCoordinate<WINDOW_DIMS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NDRange<const D: usize> {
    sizes: [usize; D],
    totalsizes: [usize; D],
}

impl<const D: usize> NDRange<D> {
    /// Zero extents are coerced to 1.
    pub fn new(sizes: [usize; D]) -> Self {
        let mut s = [1usize; D];
        let mut totalsizes = [1usize; D];
        let mut acc = 1usize;
        for i in 0..D {
            s[i] = sizes[i].max(1);
            acc *= s[i];
            totalsizes[i] = acc;
        }
        Self { sizes: s, totalsizes }
    }

    /// Leading extents from `sizes`; missing trailing dimensions are 1.
    pub fn from_slice(sizes: &[usize]) -> Self {
        assert!(sizes.len() <= D, "{} extents given for a {D}-d range", sizes.len());
        let mut s = [1usize; D];
        s[..sizes.len()].copy_from_slice(sizes);
        Self::new(s)
    }

    #[inline]
    pub fn get_size(&self, d: usize) -> usize {
        self.sizes[d]
    }

    #[inline]
    pub fn sizes(&self) -> &[usize; D] {
        &self.sizes
    }

    /// Product of extents `0..=d`.
    #[inline]
    pub fn total_size_upto(&self, d: usize) -> usize {
        self.totalsizes[d]
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        if D == 0 { 1 } else { self.totalsizes[D - 1] }
    }

    /// Index along `d` of linear position `pos`.
    #[inline]
    pub fn dim_of(&self, pos: usize, d: usize) -> usize {
        let mut r = pos;
        if d + 1 < D {
            r %= self.totalsizes[d];
        }
        if d > 0 {
            r /= self.totalsizes[d - 1];
        }
        r
    }

    /// Linear position of a multi-dimensional index.
    pub fn linear_index(&self, idx: &[usize; D]) -> usize {
        let mut p = 0;
        for d in 0..D {
            let stride = if d == 0 { 1 } else { self.totalsizes[d - 1] };
            p += idx[d] * stride;
        }
        p
    }

    /// Iterate linear positions `[start, end)`.
    pub fn iterator(&self, start: usize, end: usize) -> NDRangeIterator<D> {
        NDRangeIterator { range: *self, pos: start, end }
    }
}

/// Cursor over a linear sub-range of an `NDRange`.
#[derive(Debug, Clone, Copy)]
pub struct NDRangeIterator<const D: usize> {
    range: NDRange<D>,
    pos: usize,
    end: usize,
}

impl<const D: usize> NDRangeIterator<D> {
    #[inline]
    pub fn dim(&self, d: usize) -> usize {
        self.range.dim_of(self.pos, d)
    }

    #[inline]
    pub fn done(&self) -> bool {
        self.pos >= self.end
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn next_dim0(&mut self) {
        self.pos += 1;
    }

    /// Skip to the first position of the next dimension-0 row.
    #[inline]
    pub fn next_dim1(&mut self) {
        self.pos += self.range.sizes[0] - self.dim(0);
    }

    /// Exclusive bound on dimension 0 reachable before crossing into the
    /// next row or hitting `end`.
    #[inline]
    pub fn dim0_max(&self) -> usize {
        let d0 = self.dim(0);
        let offset = self.end.saturating_sub(self.pos).min(self.range.sizes[0] - d0);
        d0 + offset
    }
}

/// Per-dimension half-open sub-range `[position, position + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NDCoordinate<const D: usize> {
    range: NDRange<D>,
    positions: [usize; D],
}

impl<const D: usize> NDCoordinate<D> {
    pub fn new(positions: [usize; D], sizes: [usize; D]) -> Self {
        Self { range: NDRange::new(sizes), positions }
    }

    /// Leading `(position, size)` pairs; missing dimensions are `(0, 1)`.
    pub fn from_slice(pairs: &[(usize, usize)]) -> Self {
        assert!(pairs.len() <= D, "{} pairs given for a {D}-d coordinate", pairs.len());
        let mut positions = [0usize; D];
        let mut sizes = [1usize; D];
        for (d, &(p, s)) in pairs.iter().enumerate() {
            positions[d] = p;
            sizes[d] = s;
        }
        Self::new(positions, sizes)
    }

    /// The whole of `range`, positioned at the origin.
    pub fn from_range(range: NDRange<D>) -> Self {
        Self { range, positions: [0; D] }
    }

    #[inline]
    pub fn get_position(&self, d: usize) -> usize {
        self.positions[d]
    }

    #[inline]
    pub fn set_position(&mut self, d: usize, v: usize) {
        self.positions[d] = v;
    }

    #[inline]
    pub fn get_size(&self, d: usize) -> usize {
        self.range.get_size(d)
    }

    #[inline]
    pub fn get_position_end(&self, d: usize) -> usize {
        self.positions[d] + self.range.get_size(d)
    }

    #[inline]
    pub fn range(&self) -> &NDRange<D> {
        &self.range
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.range.total_size()
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains(&self, other: &NDCoordinate<D>) -> bool {
        (0..D).all(|d| {
            other.get_position(d) >= self.get_position(d)
                && other.get_position_end(d) <= self.get_position_end(d)
        })
    }
}

impl<const D: usize> From<NDRange<D>> for NDCoordinate<D> {
    fn from(range: NDRange<D>) -> Self {
        Self::from_range(range)
    }
}

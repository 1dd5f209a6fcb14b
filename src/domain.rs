use core::fmt;
use smallvec::SmallVec;

/// Maximum dimensionality of a domain.
pub const MAX_DIM: usize = 3;

/// Axis-aligned rectangle of integer points with inclusive bounds.
///
/// Unused dimensions are pinned to `0..=0`, so volumes and intersections do
/// not need to look at `dim`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Domain {
    dim: u8,
    lo: [i64; MAX_DIM],
    hi: [i64; MAX_DIM],
}

impl Domain {
    /// One-dimensional rectangle `lo..=hi`.
    #[must_use]
    pub fn rect1(lo: i64, hi: i64) -> Self {
        Self::new(1, [lo, 0, 0], [hi, 0, 0])
    }

    /// Two-dimensional rectangle.
    #[must_use]
    pub fn rect2(lo: [i64; 2], hi: [i64; 2]) -> Self {
        Self::new(2, [lo[0], lo[1], 0], [hi[0], hi[1], 0])
    }

    /// Three-dimensional rectangle.
    #[must_use]
    pub fn rect3(lo: [i64; 3], hi: [i64; 3]) -> Self {
        Self::new(3, lo, hi)
    }

    /// Rectangle with explicit dimensionality.
    ///
    /// # Panics
    /// If `dim` is zero or exceeds `MAX_DIM`.
    #[must_use]
    pub fn new(dim: u8, lo: [i64; MAX_DIM], hi: [i64; MAX_DIM]) -> Self {
        assert!((1..=MAX_DIM as u8).contains(&dim), "Domain::new: [1]");
        let mut domain = Self { dim, lo, hi };
        for axis in usize::from(dim)..MAX_DIM {
            domain.lo[axis] = 0;
            domain.hi[axis] = 0;
        }
        domain
    }

    /// Dimensionality.
    #[must_use]
    pub fn dim(&self) -> u8 {
        self.dim
    }

    /// Lower bounds.
    #[must_use]
    pub fn lo(&self) -> [i64; MAX_DIM] {
        self.lo
    }

    /// Upper bounds (inclusive).
    #[must_use]
    pub fn hi(&self) -> [i64; MAX_DIM] {
        self.hi
    }

    /// Whether no point lies inside.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        (0..MAX_DIM).any(|axis| self.lo[axis] > self.hi[axis])
    }

    /// Number of points.
    #[must_use]
    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (0..MAX_DIM)
            .map(|axis| self.hi[axis].abs_diff(self.lo[axis]) + 1)
            .product()
    }

    /// Shared points, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if self.dim != other.dim {
            return None;
        }
        let mut result = *self;
        for axis in 0..MAX_DIM {
            result.lo[axis] = self.lo[axis].max(other.lo[axis]);
            result.hi[axis] = self.hi[axis].min(other.hi[axis]);
        }
        (!result.is_empty()).then_some(result)
    }

    /// Whether the two rectangles share a point.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    /// Whether every point of `other` lies inside `self`.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.is_empty()
            || (self.dim == other.dim
                && (0..MAX_DIM).all(|axis| {
                    self.lo[axis] <= other.lo[axis] && other.hi[axis] <= self.hi[axis]
                }))
    }

    /// Points of `self` outside `other`, as disjoint rectangles.
    #[must_use]
    pub fn subtract(&self, other: &Self) -> SmallVec<[Self; 6]> {
        let mut pieces = SmallVec::new();
        let Some(overlap) = self.intersection(other) else {
            if !self.is_empty() {
                pieces.push(*self);
            }
            return pieces;
        };
        // Peel slabs below and above the overlap one axis at a time.
        let mut rest = *self;
        for axis in 0..usize::from(self.dim) {
            if rest.lo[axis] < overlap.lo[axis] {
                let mut below = rest;
                below.hi[axis] = overlap.lo[axis] - 1;
                pieces.push(below);
                rest.lo[axis] = overlap.lo[axis];
            }
            if rest.hi[axis] > overlap.hi[axis] {
                let mut above = rest;
                above.lo[axis] = overlap.hi[axis] + 1;
                pieces.push(above);
                rest.hi[axis] = overlap.hi[axis];
            }
        }
        pieces
    }

    /// Smallest rectangle containing both.
    #[must_use]
    pub fn union_bounds(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut result = *self;
        for axis in 0..MAX_DIM {
            result.lo[axis] = self.lo[axis].min(other.lo[axis]);
            result.hi[axis] = self.hi[axis].max(other.hi[axis]);
        }
        result
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dim = usize::from(self.dim);
        write!(f, "{:?}..={:?}", &self.lo[..dim], &self.hi[..dim])
    }
}

/// Whether some rectangle of `lhs` shares a point with some rectangle of
/// `rhs`.
pub(crate) fn sets_intersect(lhs: &[Domain], rhs: &[Domain]) -> bool {
    lhs.iter().any(|l| rhs.iter().any(|r| l.intersects(r)))
}

/// Whether the union of `lhs` covers every point of `rhs`.
pub(crate) fn set_covers(lhs: &[Domain], rhs: &[Domain]) -> bool {
    let mut remaining: Vec<Domain> = rhs.iter().filter(|d| !d.is_empty()).copied().collect();
    for cover in lhs {
        remaining = remaining
            .iter()
            .flat_map(|piece| piece.subtract(cover))
            .collect();
        if remaining.is_empty() {
            return true;
        }
    }
    remaining.is_empty()
}

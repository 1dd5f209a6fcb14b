use crate::types::AddressSpaceId;
use core::{fmt, ops::Sub};
use derive_more::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, Not};

/// Maximum number of fields a single field space can allocate.
pub const MAX_FIELDS: usize = 128;
/// Maximum number of address spaces a `NodeSet` can name.
pub const MAX_ADDRESS_SPACES: usize = 128;

/// Bitmask over field indexes of one field space.
#[derive(
    Default, Clone, Copy, PartialEq, Eq, Hash, BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, Not,
)]
pub struct FieldMask(u128);

impl FieldMask {
    /// The empty mask.
    pub const EMPTY: Self = Self(0);

    /// Mask with the lowest `count` indexes set.
    #[must_use]
    pub fn first(count: usize) -> Self {
        if count >= MAX_FIELDS {
            Self(u128::MAX)
        } else {
            Self((1u128 << count) - 1)
        }
    }

    /// Mask with a single index set.
    #[must_use]
    pub fn single(index: usize) -> Self {
        let mut mask = Self::EMPTY;
        mask.set(index);
        mask
    }

    /// Reconstruct a mask from its raw bits.
    #[must_use]
    pub const fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    /// Raw bits of the mask.
    #[must_use]
    pub const fn bits(self) -> u128 {
        self.0
    }

    /// Set the bit for field index `index`.
    pub fn set(&mut self, index: usize) {
        assert!(index < MAX_FIELDS, "FieldMask::set: [1]");
        self.0 |= 1 << index;
    }

    /// Clear the bit for field index `index`.
    pub fn unset(&mut self, index: usize) {
        assert!(index < MAX_FIELDS, "FieldMask::unset: [1]");
        self.0 &= !(1 << index);
    }

    /// Whether field index `index` is set.
    #[must_use]
    pub fn contains(self, index: usize) -> bool {
        index < MAX_FIELDS && self.0 & (1 << index) != 0
    }

    /// Whether no field is set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether the two masks share at least one field.
    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether every field of `other` is also set here.
    #[must_use]
    pub fn covers(self, other: Self) -> bool {
        other.0 & !self.0 == 0
    }

    /// Number of set fields.
    #[must_use]
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest set index, if any.
    #[must_use]
    pub fn first_set(self) -> Option<usize> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as usize)
    }

    /// Iterate over set indexes in increasing order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let index = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(index)
        })
    }
}

impl Sub for FieldMask {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl core::ops::SubAssign for FieldMask {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl FromIterator<usize> for FieldMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for index in iter {
            mask.set(index);
        }
        mask
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Set of address spaces.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, BitAnd, BitOr, BitOrAssign, Not)]
pub struct NodeSet(u128);

impl NodeSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Set containing only `space`.
    #[must_use]
    pub fn single(space: AddressSpaceId) -> Self {
        let mut set = Self::EMPTY;
        set.add(space);
        set
    }

    /// Add an address space.
    pub fn add(&mut self, space: AddressSpaceId) {
        let index = usize::from(space.0);
        assert!(index < MAX_ADDRESS_SPACES, "NodeSet::add: [1]");
        self.0 |= 1 << index;
    }

    /// Remove an address space.
    pub fn remove(&mut self, space: AddressSpaceId) {
        let index = usize::from(space.0);
        if index < MAX_ADDRESS_SPACES {
            self.0 &= !(1 << index);
        }
    }

    /// Whether `space` is a member.
    #[must_use]
    pub fn contains(self, space: AddressSpaceId) -> bool {
        let index = usize::from(space.0);
        index < MAX_ADDRESS_SPACES && self.0 & (1 << index) != 0
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of members.
    #[must_use]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members without those of `other`.
    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterate over the members in increasing order.
    pub fn iter(self) -> impl Iterator<Item = AddressSpaceId> {
        FieldMask(self.0)
            .iter()
            .map(|index| AddressSpaceId(index as u16))
    }
}

impl FromIterator<AddressSpaceId> for NodeSet {
    fn from_iter<I: IntoIterator<Item = AddressSpaceId>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for space in iter {
            set.add(space);
        }
        set
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|space| space.0)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_algebra() {
        let a: FieldMask = [0, 3, 5].into_iter().collect();
        let b: FieldMask = [3, 7].into_iter().collect();
        assert_eq!((a & b).iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!((a - b).iter().collect::<Vec<_>>(), vec![0, 5]);
        assert_eq!((a | b).count(), 4);
        assert!(a.intersects(b));
        assert!((a | b).covers(a));
        assert!(!a.covers(b));
        assert_eq!(FieldMask::first(3).iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(FieldMask::EMPTY.first_set(), None);
        assert_eq!(b.first_set(), Some(3));
    }

    #[test]
    fn node_sets() {
        let mut set = NodeSet::single(AddressSpaceId(2));
        set.add(AddressSpaceId(9));
        assert_eq!(set.len(), 2);
        assert!(set.contains(AddressSpaceId(9)));
        set.remove(AddressSpaceId(2));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![AddressSpaceId(9)]);
        assert!(set.without(NodeSet::single(AddressSpaceId(9))).is_empty());
    }
}

use crate::{
    mask::FieldMask,
    sync::Arc,
    types::{FieldId, FieldSpace, HashMap, IndexMap},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldInfo {
    pub(crate) size: usize,
    pub(crate) index: usize,
}

/// Placement of one field inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldLayout {
    /// Bit index of the field in its space's masks.
    pub index: usize,
    /// Byte offset of the field's first block.
    pub offset: usize,
    /// Size of one element of the field.
    pub size: usize,
}

/// Byte layout of an instance: which fields it holds and where.
///
/// Fields are laid out in increasing index order; each field occupies
/// `size * blocking_factor` bytes per block, so a blocking factor of one is
/// array-of-structs and a blocking factor equal to the volume is
/// struct-of-arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDescription {
    mask: FieldMask,
    blocking_factor: usize,
    element_size: usize,
    fields: IndexMap<FieldId, FieldLayout>,
}

impl LayoutDescription {
    /// Fields held by the layout.
    #[must_use]
    pub fn mask(&self) -> FieldMask {
        self.mask
    }

    /// Elements per block.
    #[must_use]
    pub fn blocking_factor(&self) -> usize {
        self.blocking_factor
    }

    /// Sum of the element sizes of all fields.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Placement of `field`, if the layout holds it.
    #[must_use]
    pub fn field(&self, field: FieldId) -> Option<&FieldLayout> {
        self.fields.get(&field)
    }

    /// Placements of every field in the layout.
    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &FieldLayout)> {
        self.fields.iter().map(|(&fid, layout)| (fid, layout))
    }

    /// Placements of the fields of `mask`.
    pub fn fields_in(&self, mask: FieldMask) -> impl Iterator<Item = (FieldId, &FieldLayout)> {
        self.fields()
            .filter(move |(_, layout)| mask.contains(layout.index))
    }

    /// Whether this layout can stand in for a request.
    #[must_use]
    pub fn matches(&self, needed: FieldMask, blocking_factor: Option<usize>) -> bool {
        self.mask.covers(needed) && blocking_factor.is_none_or(|bf| bf == self.blocking_factor)
    }
}

/// One field space and its allocated fields.
#[derive(Debug)]
pub(crate) struct FieldSpaceNode {
    pub(crate) handle: FieldSpace,
    pub(crate) fields: IndexMap<FieldId, FieldInfo>,
    pub(crate) allocated: FieldMask,
    layouts: HashMap<(u128, usize), Arc<LayoutDescription>>,
}

impl FieldSpaceNode {
    pub(crate) fn new(handle: FieldSpace) -> Self {
        Self {
            handle,
            fields: IndexMap::default(),
            allocated: FieldMask::EMPTY,
            layouts: HashMap::default(),
        }
    }

    /// Lowest free field index below `limit`.
    pub(crate) fn free_index(&self, limit: usize) -> Option<usize> {
        (0..limit).find(|&index| !self.allocated.contains(index))
    }

    pub(crate) fn insert(&mut self, fid: FieldId, size: usize, index: usize) {
        self.allocated.set(index);
        self.fields.insert(fid, FieldInfo { size, index });
    }

    pub(crate) fn remove(&mut self, fid: FieldId) -> Option<FieldInfo> {
        let info = self.fields.shift_remove(&fid)?;
        self.allocated.unset(info.index);
        let freed = FieldMask::single(info.index);
        self.layouts
            .retain(|(bits, _), _| !FieldMask::from_bits(*bits).intersects(freed));
        Some(info)
    }

    pub(crate) fn field_of_index(&self, index: usize) -> Option<FieldId> {
        self.fields
            .iter()
            .find_map(|(&fid, info)| (info.index == index).then_some(fid))
    }

    /// Memoized layout for `mask` with the given blocking factor.
    pub(crate) fn layout(&mut self, mask: FieldMask, blocking_factor: usize) -> Arc<LayoutDescription> {
        let key = (mask.bits(), blocking_factor);
        if let Some(layout) = self.layouts.get(&key) {
            return Arc::clone(layout);
        }
        let mut ordered: Vec<_> = self
            .fields
            .iter()
            .filter(|(_, info)| mask.contains(info.index))
            .map(|(&fid, info)| (fid, *info))
            .collect();
        ordered.sort_by_key(|(_, info)| info.index);
        let mut fields = IndexMap::default();
        let mut element_size = 0;
        for (fid, info) in ordered {
            fields.insert(
                fid,
                FieldLayout {
                    index: info.index,
                    offset: element_size * blocking_factor,
                    size: info.size,
                },
            );
            element_size += info.size;
        }
        let layout = Arc::new(LayoutDescription {
            mask,
            blocking_factor,
            element_size,
            fields,
        });
        self.layouts.insert(key, Arc::clone(&layout));
        layout
    }
}

use crate::{
    domain::Domain,
    types::{Color, IndexMap, IndexPartition, IndexSpace},
};

/// One index space: a named set of points.
#[derive(Debug, Clone)]
pub(crate) struct IndexSpaceNode {
    pub(crate) handle: IndexSpace,
    /// Disjoint-or-not rectangles whose union is the space.
    pub(crate) components: Vec<Domain>,
    pub(crate) parent: Option<IndexPartition>,
    pub(crate) color: Color,
    pub(crate) depth: u32,
    pub(crate) partitions: IndexMap<Color, IndexPartition>,
}

impl IndexSpaceNode {
    /// Bounding rectangle of all components.
    pub(crate) fn bounds(&self) -> Domain {
        self.components
            .iter()
            .copied()
            .reduce(|lhs, rhs| lhs.union_bounds(&rhs))
            .unwrap_or_else(|| Domain::rect1(0, -1))
    }

    pub(crate) fn volume(&self) -> u64 {
        self.components.iter().map(Domain::volume).sum()
    }

    /// Smallest color not yet used by a partition of this space.
    pub(crate) fn next_partition_color(&self) -> Color {
        (0..).find(|c| !self.partitions.contains_key(c)).unwrap_or(Color::MAX)
    }
}

/// One index partition: a coloring of its parent into subspaces.
#[derive(Debug, Clone)]
pub(crate) struct IndexPartNode {
    pub(crate) handle: IndexPartition,
    pub(crate) parent: IndexSpace,
    pub(crate) color: Color,
    pub(crate) depth: u32,
    pub(crate) disjoint: bool,
    pub(crate) subspaces: IndexMap<Color, IndexSpace>,
}

impl IndexPartNode {
    pub(crate) fn colors(&self) -> impl Iterator<Item = Color> + '_ {
        self.subspaces.keys().copied()
    }
}

/// First pair of colors whose domains overlap in an explicit coloring.
pub(crate) fn overlapping_colors(coloring: &IndexMap<Color, Domain>) -> Option<(Color, Color)> {
    let entries: Vec<(Color, Domain)> = coloring.iter().map(|(c, d)| (*c, *d)).collect();
    for (i, (lhs_color, lhs)) in entries.iter().enumerate() {
        for (rhs_color, rhs) in &entries[i + 1..] {
            if lhs.intersects(rhs) {
                return Some((*lhs_color, *rhs_color));
            }
        }
    }
    None
}

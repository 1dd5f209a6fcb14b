mod field;
mod index;

pub use crate::shape::field::{FieldLayout, LayoutDescription};
pub(crate) use crate::shape::{
    field::FieldSpaceNode,
    index::{IndexPartNode, IndexSpaceNode},
};
use crate::{
    config::ForestConfig,
    domain::{self, Domain},
    mask::FieldMask,
    sync::{Arc, Mutex, RwLock},
    types::{
        AddressSpaceId, Color, FieldId, FieldSpace, HashMap, IndexMap, IndexPartition, IndexSpace,
        LogicalRegion, RegionTreeId,
    },
};
use derive_more::Display;
use thiserror::Error;
use tracing::debug;

/// Error kind for shape mutations and queries.
///
/// These are contract violations by the caller; the runtime treats them as
/// fatal.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ShapeError {
    /// The index space does not exist.
    #[error("unknown index space {0}")]
    UnknownIndexSpace(IndexSpace),
    /// The index partition does not exist.
    #[error("unknown index partition {0}")]
    UnknownIndexPartition(IndexPartition),
    /// The field space does not exist.
    #[error("unknown field space {0}")]
    UnknownFieldSpace(FieldSpace),
    /// The field is not allocated in the field space.
    #[error("field {field} is not allocated in {space}")]
    UnknownField {
        /// Field space searched.
        space: FieldSpace,
        /// Missing field.
        field: FieldId,
    },
    /// The region tree does not exist.
    #[error("unknown region tree {0}")]
    UnknownTree(RegionTreeId),
    /// No child with this color exists.
    #[error("{parent} has no child with color {color}")]
    UnknownColor {
        /// Node searched.
        parent: IndexNode,
        /// Missing color.
        color: Color,
    },
    /// The node still has children and cannot be destroyed.
    #[error("{0} still has live children")]
    LiveChildren(IndexNode),
    /// The field space is still used by a region tree.
    #[error("{0} is still used by a region tree")]
    FieldSpaceInUse(FieldSpace),
    /// A partition declared disjoint has overlapping children.
    #[error("partition {partition} declared disjoint but colors {left} and {right} overlap")]
    DisjointnessViolation {
        /// Offending partition.
        partition: IndexPartition,
        /// First overlapping color.
        left: Color,
        /// Second overlapping color.
        right: Color,
    },
    /// A subspace has points outside its parent.
    #[error("subspace with color {color} is not contained in {parent}")]
    SubspaceOutOfBounds {
        /// Parent space.
        parent: IndexSpace,
        /// Offending color.
        color: Color,
    },
    /// The color is already taken.
    #[error("{parent} already has a child with color {color}")]
    DuplicateColor {
        /// Node whose children collide.
        parent: IndexNode,
        /// Colliding color.
        color: Color,
    },
    /// The field id is already allocated.
    #[error("field {field} is already allocated in {space}")]
    DuplicateField {
        /// Field space.
        space: FieldSpace,
        /// Colliding field.
        field: FieldId,
    },
    /// No free field index is left.
    #[error("{0} has no free field index")]
    FieldSpaceFull(FieldSpace),
    /// Regions can only be rooted at index spaces without a parent.
    #[error("{0} is not a top-level index space")]
    NotTopLevel(IndexSpace),
    /// The path start is not an ancestor of the path end.
    #[error("{ancestor} is not an ancestor of {descendant}")]
    NotAncestor {
        /// Claimed ancestor.
        ancestor: String,
        /// Claimed descendant.
        descendant: String,
    },
}

/// A node of the index tree: a space or a partition.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexNode {
    /// An index space.
    Space(IndexSpace),
    /// An index partition.
    Partition(IndexPartition),
}

#[derive(Debug, Default)]
struct ShapeTables {
    next_space: u32,
    next_partition: u32,
    next_field_space: u32,
    next_tree: u32,
    spaces: HashMap<IndexSpace, IndexSpaceNode>,
    partitions: HashMap<IndexPartition, IndexPartNode>,
    field_spaces: HashMap<FieldSpace, FieldSpaceNode>,
    trees: HashMap<RegionTreeId, LogicalRegion>,
}

impl ShapeTables {
    fn space(&self, handle: IndexSpace) -> Result<&IndexSpaceNode, ShapeError> {
        self.spaces
            .get(&handle)
            .ok_or(ShapeError::UnknownIndexSpace(handle))
    }

    fn partition(&self, handle: IndexPartition) -> Result<&IndexPartNode, ShapeError> {
        self.partitions
            .get(&handle)
            .ok_or(ShapeError::UnknownIndexPartition(handle))
    }

    fn field_space(&self, handle: FieldSpace) -> Result<&FieldSpaceNode, ShapeError> {
        self.field_spaces
            .get(&handle)
            .ok_or(ShapeError::UnknownFieldSpace(handle))
    }

    fn field_space_mut(&mut self, handle: FieldSpace) -> Result<&mut FieldSpaceNode, ShapeError> {
        self.field_spaces
            .get_mut(&handle)
            .ok_or(ShapeError::UnknownFieldSpace(handle))
    }

    fn components(&self, node: IndexNode) -> Result<Vec<Domain>, ShapeError> {
        match node {
            IndexNode::Space(handle) => Ok(self.space(handle)?.components.clone()),
            IndexNode::Partition(handle) => {
                let mut components = Vec::new();
                for &sub in self.partition(handle)?.subspaces.values() {
                    components.extend_from_slice(&self.space(sub)?.components);
                }
                Ok(components)
            }
        }
    }
}

/// Index spaces, index partitions and field spaces of one forest.
///
/// Pairwise intersection and domination results are memoized because the
/// shape is read far more often than it changes; every destruction clears
/// the memo.
#[derive(Debug)]
pub struct ShapeTree {
    verify_disjointness: bool,
    max_fields: usize,
    tables: RwLock<ShapeTables>,
    intersections: Mutex<HashMap<(IndexNode, IndexNode), bool>>,
    dominators: Mutex<HashMap<(IndexNode, IndexNode), bool>>,
}

impl ShapeTree {
    pub(crate) fn new(config: &ForestConfig) -> Self {
        // Handles carry the creating address space in their top byte.
        let base = u32::from(config.address_space.0) << 24;
        Self {
            verify_disjointness: config.verify_disjointness,
            max_fields: config.max_fields_per_space,
            tables: RwLock::new(ShapeTables {
                next_space: base,
                next_partition: base,
                next_field_space: base,
                next_tree: base,
                ..ShapeTables::default()
            }),
            intersections: Mutex::new(HashMap::default()),
            dominators: Mutex::new(HashMap::default()),
        }
    }

    fn clear_memo(&self) {
        self.intersections.lock().clear();
        self.dominators.lock().clear();
    }

    // ----- index spaces -------------------------------------------------

    /// Create a top-level index space covering `domain`.
    pub fn create_index_space(&self, domain: Domain) -> IndexSpace {
        self.create_index_space_from(vec![domain])
    }

    /// Create a top-level index space that is the union of `components`.
    pub fn create_index_space_from(&self, components: Vec<Domain>) -> IndexSpace {
        let mut tables = self.tables.write();
        let handle = IndexSpace(tables.next_space);
        tables.next_space += 1;
        tables.spaces.insert(
            handle,
            IndexSpaceNode {
                handle,
                components,
                parent: None,
                color: 0,
                depth: 0,
                partitions: IndexMap::default(),
            },
        );
        debug!(%handle, "created index space");
        handle
    }

    /// Destroy an index space that has no partitions.
    ///
    /// # Errors
    /// `LiveChildren` if the space is still partitioned.
    pub fn destroy_index_space(&self, handle: IndexSpace) -> Result<(), ShapeError> {
        let mut tables = self.tables.write();
        let node = tables.space(handle)?;
        if !node.partitions.is_empty() {
            return Err(ShapeError::LiveChildren(IndexNode::Space(handle)));
        }
        let (parent, color) = (node.parent, node.color);
        if let Some(parent) = parent
            && let Some(part) = tables.partitions.get_mut(&parent)
        {
            part.subspaces.shift_remove(&color);
        }
        tables.spaces.remove(&handle);
        drop(tables);
        self.clear_memo();
        debug!(%handle, "destroyed index space");
        Ok(())
    }

    /// Partition `parent` by an explicit coloring.
    ///
    /// When `verify` (or the forest-wide verification flag) is set, a
    /// partition declared disjoint is checked pairwise.
    ///
    /// # Errors
    /// `DisjointnessViolation` when verification fails, `SubspaceOutOfBounds`
    /// when a color is not contained in the parent, `DuplicateColor` when the
    /// partition color is taken.
    pub fn create_index_partition(
        &self,
        parent: IndexSpace,
        coloring: impl IntoIterator<Item = (Color, Domain)>,
        disjoint: bool,
        color: Option<Color>,
        verify: bool,
    ) -> Result<IndexPartition, ShapeError> {
        let coloring: IndexMap<Color, Domain> = coloring.into_iter().collect();
        let mut tables = self.tables.write();
        let parent_node = tables.space(parent)?;
        let color = color.unwrap_or_else(|| parent_node.next_partition_color());
        if parent_node.partitions.contains_key(&color) {
            return Err(ShapeError::DuplicateColor {
                parent: IndexNode::Space(parent),
                color,
            });
        }
        for (&child_color, child) in &coloring {
            if !domain::set_covers(&parent_node.components, core::slice::from_ref(child)) {
                return Err(ShapeError::SubspaceOutOfBounds {
                    parent,
                    color: child_color,
                });
            }
        }
        let depth = parent_node.depth + 1;
        let handle = IndexPartition(tables.next_partition);
        if disjoint
            && (verify || self.verify_disjointness)
            && let Some((left, right)) = index::overlapping_colors(&coloring)
        {
            return Err(ShapeError::DisjointnessViolation {
                partition: handle,
                left,
                right,
            });
        }
        tables.next_partition += 1;
        let mut subspaces = IndexMap::default();
        for (child_color, child) in coloring {
            let sub = IndexSpace(tables.next_space);
            tables.next_space += 1;
            tables.spaces.insert(
                sub,
                IndexSpaceNode {
                    handle: sub,
                    components: vec![child],
                    parent: Some(handle),
                    color: child_color,
                    depth: depth + 1,
                    partitions: IndexMap::default(),
                },
            );
            subspaces.insert(child_color, sub);
        }
        tables.partitions.insert(
            handle,
            IndexPartNode {
                handle,
                parent,
                color,
                depth,
                disjoint,
                subspaces,
            },
        );
        if let Some(parent_node) = tables.spaces.get_mut(&parent) {
            parent_node.partitions.insert(color, handle);
        }
        debug!(%handle, %parent, disjoint, "created index partition");
        Ok(handle)
    }

    /// Destroy a partition and its subspaces.
    ///
    /// # Errors
    /// `LiveChildren` if any subspace is itself partitioned.
    pub fn destroy_index_partition(&self, handle: IndexPartition) -> Result<(), ShapeError> {
        let mut tables = self.tables.write();
        let part = tables.partition(handle)?;
        for &sub in part.subspaces.values() {
            if !tables.space(sub)?.partitions.is_empty() {
                return Err(ShapeError::LiveChildren(IndexNode::Space(sub)));
            }
        }
        let (parent, color) = (part.parent, part.color);
        let subspaces: Vec<_> = part.subspaces.values().copied().collect();
        for sub in subspaces {
            tables.spaces.remove(&sub);
        }
        tables.partitions.remove(&handle);
        if let Some(parent_node) = tables.spaces.get_mut(&parent) {
            parent_node.partitions.shift_remove(&color);
        }
        drop(tables);
        self.clear_memo();
        debug!(%handle, "destroyed index partition");
        Ok(())
    }

    /// Partition of `parent` with `color`.
    ///
    /// # Errors
    /// If the space or the color is unknown.
    pub fn get_index_partition(&self, parent: IndexSpace, color: Color) -> Result<IndexPartition, ShapeError> {
        let tables = self.tables.read();
        tables
            .space(parent)?
            .partitions
            .get(&color)
            .copied()
            .ok_or(ShapeError::UnknownColor {
                parent: IndexNode::Space(parent),
                color,
            })
    }

    /// Subspace of `parent` with `color`.
    ///
    /// # Errors
    /// If the partition or the color is unknown.
    pub fn get_index_subspace(&self, parent: IndexPartition, color: Color) -> Result<IndexSpace, ShapeError> {
        let tables = self.tables.read();
        tables
            .partition(parent)?
            .subspaces
            .get(&color)
            .copied()
            .ok_or(ShapeError::UnknownColor {
                parent: IndexNode::Partition(parent),
                color,
            })
    }

    /// Subspaces of a partition in creation order.
    ///
    /// # Errors
    /// If the partition is unknown.
    pub fn get_index_subspaces(&self, parent: IndexPartition) -> Result<Vec<(Color, IndexSpace)>, ShapeError> {
        let tables = self.tables.read();
        Ok(tables
            .partition(parent)?
            .subspaces
            .iter()
            .map(|(color, sub)| (*color, *sub))
            .collect())
    }

    /// Space a partition colors.
    ///
    /// # Errors
    /// If the partition is unknown.
    pub fn get_parent_index_space(&self, handle: IndexPartition) -> Result<IndexSpace, ShapeError> {
        Ok(self.tables.read().partition(handle)?.parent)
    }

    /// Partition a subspace belongs to, if any.
    ///
    /// # Errors
    /// If the space is unknown.
    pub fn get_parent_index_partition(&self, handle: IndexSpace) -> Result<Option<IndexPartition>, ShapeError> {
        Ok(self.tables.read().space(handle)?.parent)
    }

    /// Color of a subspace inside its partition (zero for top-level spaces).
    ///
    /// # Errors
    /// If the space is unknown.
    pub fn get_index_space_color(&self, handle: IndexSpace) -> Result<Color, ShapeError> {
        Ok(self.tables.read().space(handle)?.color)
    }

    /// Color of a partition inside its parent space.
    ///
    /// # Errors
    /// If the partition is unknown.
    pub fn get_index_partition_color(&self, handle: IndexPartition) -> Result<Color, ShapeError> {
        Ok(self.tables.read().partition(handle)?.color)
    }

    /// Rectangles making up the space.
    ///
    /// # Errors
    /// If the space is unknown.
    pub fn get_domain(&self, handle: IndexSpace) -> Result<Vec<Domain>, ShapeError> {
        self.tables.read().components(IndexNode::Space(handle))
    }

    /// Number of points in the space.
    ///
    /// # Errors
    /// If the space is unknown.
    pub fn get_volume(&self, handle: IndexSpace) -> Result<u64, ShapeError> {
        Ok(self.tables.read().space(handle)?.volume())
    }

    /// Bounding rectangle of the space.
    ///
    /// # Errors
    /// If the space is unknown.
    pub fn get_bounds(&self, handle: IndexSpace) -> Result<Domain, ShapeError> {
        Ok(self.tables.read().space(handle)?.bounds())
    }

    /// Whether the partition was declared disjoint.
    ///
    /// # Errors
    /// If the partition is unknown.
    pub fn is_disjoint(&self, handle: IndexPartition) -> Result<bool, ShapeError> {
        Ok(self.tables.read().partition(handle)?.disjoint)
    }

    /// Whether the subspaces cover every point of the parent.
    ///
    /// # Errors
    /// If the partition is unknown.
    pub fn is_complete(&self, handle: IndexPartition) -> Result<bool, ShapeError> {
        let parent = self.get_parent_index_space(handle)?;
        self.dominates(IndexNode::Partition(handle), IndexNode::Space(parent))
    }

    /// Whether two children of one partition cannot share a point.
    ///
    /// # Errors
    /// If the partition or a color is unknown.
    pub fn are_children_disjoint(&self, handle: IndexPartition, lhs: Color, rhs: Color) -> Result<bool, ShapeError> {
        if lhs == rhs {
            return Ok(false);
        }
        if self.is_disjoint(handle)? {
            return Ok(true);
        }
        let lhs = self.get_index_subspace(handle, lhs)?;
        let rhs = self.get_index_subspace(handle, rhs)?;
        Ok(!self.intersects_with(IndexNode::Space(lhs), IndexNode::Space(rhs))?)
    }

    /// Whether the two nodes share at least one point.
    ///
    /// # Errors
    /// If either node is unknown.
    pub fn intersects_with(&self, lhs: IndexNode, rhs: IndexNode) -> Result<bool, ShapeError> {
        if lhs == rhs {
            return Ok(true);
        }
        let key = if lhs <= rhs { (lhs, rhs) } else { (rhs, lhs) };
        if let Some(&hit) = self.intersections.lock().get(&key) {
            return Ok(hit);
        }
        let result = {
            let tables = self.tables.read();
            domain::sets_intersect(&tables.components(lhs)?, &tables.components(rhs)?)
        };
        self.intersections.lock().insert(key, result);
        Ok(result)
    }

    /// Whether every point of `rhs` is a point of `lhs`.
    ///
    /// # Errors
    /// If either node is unknown.
    pub fn dominates(&self, lhs: IndexNode, rhs: IndexNode) -> Result<bool, ShapeError> {
        if lhs == rhs {
            return Ok(true);
        }
        if let Some(&hit) = self.dominators.lock().get(&(lhs, rhs)) {
            return Ok(hit);
        }
        let result = {
            let tables = self.tables.read();
            domain::set_covers(&tables.components(lhs)?, &tables.components(rhs)?)
        };
        self.dominators.lock().insert((lhs, rhs), result);
        Ok(result)
    }

    // ----- field spaces -------------------------------------------------

    /// Create an empty field space.
    pub fn create_field_space(&self) -> FieldSpace {
        let mut tables = self.tables.write();
        let handle = FieldSpace(tables.next_field_space);
        tables.next_field_space += 1;
        tables.field_spaces.insert(handle, FieldSpaceNode::new(handle));
        handle
    }

    /// Destroy a field space no region tree uses any more.
    ///
    /// # Errors
    /// `FieldSpaceInUse` if a region tree still names it.
    pub fn destroy_field_space(&self, handle: FieldSpace) -> Result<(), ShapeError> {
        let mut tables = self.tables.write();
        tables.field_space(handle)?;
        if tables.trees.values().any(|root| root.field_space == handle) {
            return Err(ShapeError::FieldSpaceInUse(handle));
        }
        tables.field_spaces.remove(&handle);
        Ok(())
    }

    /// Allocate field `fid` with element size `size`; returns its mask
    /// index.
    ///
    /// # Errors
    /// `DuplicateField` or `FieldSpaceFull`.
    pub fn allocate_field(&self, handle: FieldSpace, fid: FieldId, size: usize) -> Result<usize, ShapeError> {
        let limit = self.max_fields;
        let mut tables = self.tables.write();
        let node = tables.field_space_mut(handle)?;
        if node.fields.contains_key(&fid) {
            return Err(ShapeError::DuplicateField { space: handle, field: fid });
        }
        let index = node.free_index(limit).ok_or(ShapeError::FieldSpaceFull(handle))?;
        node.insert(fid, size, index);
        Ok(index)
    }

    /// Free field `fid`, releasing its mask index.
    ///
    /// # Errors
    /// `UnknownField` if it is not allocated.
    pub fn free_field(&self, handle: FieldSpace, fid: FieldId) -> Result<(), ShapeError> {
        let mut tables = self.tables.write();
        tables
            .field_space_mut(handle)?
            .remove(fid)
            .map(drop)
            .ok_or(ShapeError::UnknownField { space: handle, field: fid })
    }

    /// Mask of the given fields.
    ///
    /// # Errors
    /// `UnknownField` for the first field that is not allocated.
    pub fn get_field_mask(&self, handle: FieldSpace, fields: &[FieldId]) -> Result<FieldMask, ShapeError> {
        let tables = self.tables.read();
        let node = tables.field_space(handle)?;
        fields
            .iter()
            .map(|fid| {
                node.fields
                    .get(fid)
                    .map(|info| info.index)
                    .ok_or(ShapeError::UnknownField { space: handle, field: *fid })
            })
            .collect()
    }

    /// Mask index of `fid`.
    ///
    /// # Errors
    /// `UnknownField` if it is not allocated.
    pub fn get_field_index(&self, handle: FieldSpace, fid: FieldId) -> Result<usize, ShapeError> {
        Ok(self.get_field_mask(handle, &[fid])?.first_set().unwrap_or_default())
    }

    /// Element size of `fid`.
    ///
    /// # Errors
    /// `UnknownField` if it is not allocated.
    pub fn get_field_size(&self, handle: FieldSpace, fid: FieldId) -> Result<usize, ShapeError> {
        let tables = self.tables.read();
        tables
            .field_space(handle)?
            .fields
            .get(&fid)
            .map(|info| info.size)
            .ok_or(ShapeError::UnknownField { space: handle, field: fid })
    }

    /// Field ids of the set bits of `mask`, in index order.
    ///
    /// # Errors
    /// If the field space is unknown.
    pub fn get_field_set(&self, handle: FieldSpace, mask: FieldMask) -> Result<Vec<FieldId>, ShapeError> {
        let tables = self.tables.read();
        let node = tables.field_space(handle)?;
        Ok(mask.iter().filter_map(|index| node.field_of_index(index)).collect())
    }

    /// Fields of `mask` that `layout` places under the field id currently
    /// allocated at that index. A freed and reallocated index drops out.
    pub(crate) fn current_fields(&self, handle: FieldSpace, layout: &LayoutDescription, mask: FieldMask) -> FieldMask {
        let tables = self.tables.read();
        let Ok(node) = tables.field_space(handle) else {
            return FieldMask::EMPTY;
        };
        layout
            .fields_in(mask)
            .filter(|(fid, placed)| node.fields.get(fid).is_some_and(|info| info.index == placed.index))
            .map(|(_, placed)| placed.index)
            .collect()
    }

    /// Allocated fields with their sizes and indexes.
    ///
    /// # Errors
    /// If the field space is unknown.
    pub fn get_fields(&self, handle: FieldSpace) -> Result<Vec<(FieldId, usize, usize)>, ShapeError> {
        let tables = self.tables.read();
        Ok(tables
            .field_space(handle)?
            .fields
            .iter()
            .map(|(fid, info)| (*fid, info.size, info.index))
            .collect())
    }

    /// Memoized layout of `mask` with `blocking_factor`.
    ///
    /// # Errors
    /// If the field space is unknown.
    pub fn layout(
        &self,
        handle: FieldSpace,
        mask: FieldMask,
        blocking_factor: usize,
    ) -> Result<Arc<LayoutDescription>, ShapeError> {
        let mut tables = self.tables.write();
        Ok(tables.field_space_mut(handle)?.layout(mask, blocking_factor))
    }

    // ----- region trees -------------------------------------------------

    /// Create a new region tree rooted at a top-level index space.
    ///
    /// # Errors
    /// `NotTopLevel` if the space has a parent partition.
    pub fn create_logical_region(&self, space: IndexSpace, field_space: FieldSpace) -> Result<LogicalRegion, ShapeError> {
        let mut tables = self.tables.write();
        if tables.space(space)?.parent.is_some() {
            return Err(ShapeError::NotTopLevel(space));
        }
        tables.field_space(field_space)?;
        let tree_id = RegionTreeId(tables.next_tree);
        tables.next_tree += 1;
        let region = LogicalRegion {
            index_space: space,
            field_space,
            tree_id,
        };
        tables.trees.insert(tree_id, region);
        debug!(%region, "created region tree");
        Ok(region)
    }

    /// Forget a region tree.
    ///
    /// # Errors
    /// `UnknownTree` if the tree does not exist.
    pub fn destroy_logical_region(&self, region: LogicalRegion) -> Result<(), ShapeError> {
        self.tables
            .write()
            .trees
            .remove(&region.tree_id)
            .map(drop)
            .ok_or(ShapeError::UnknownTree(region.tree_id))
    }

    /// Root region of a tree.
    ///
    /// # Errors
    /// `UnknownTree` if the tree does not exist.
    pub fn tree_root(&self, tree_id: RegionTreeId) -> Result<LogicalRegion, ShapeError> {
        self.tables
            .read()
            .trees
            .get(&tree_id)
            .copied()
            .ok_or(ShapeError::UnknownTree(tree_id))
    }

    // ----- replication --------------------------------------------------

    pub(crate) fn export_space(&self, handle: IndexSpace) -> Result<IndexSpaceNode, ShapeError> {
        self.tables.read().space(handle).cloned()
    }

    pub(crate) fn export_partition(&self, handle: IndexPartition) -> Result<IndexPartNode, ShapeError> {
        self.tables.read().partition(handle).cloned()
    }

    /// Install a replicated space, keeping an existing identical one.
    pub(crate) fn import_space(&self, node: IndexSpaceNode) -> bool {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.spaces.get(&node.handle) {
            return existing.components == node.components
                && existing.parent == node.parent
                && existing.color == node.color;
        }
        if let Some(parent) = node.parent
            && let Some(part) = tables.partitions.get_mut(&parent)
        {
            part.subspaces.insert(node.color, node.handle);
        }
        tables.spaces.insert(node.handle, node);
        true
    }

    /// Install a replicated partition, keeping an existing identical one.
    pub(crate) fn import_partition(&self, node: IndexPartNode) -> bool {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.partitions.get(&node.handle) {
            return existing.parent == node.parent
                && existing.color == node.color
                && existing.disjoint == node.disjoint;
        }
        let Some(parent) = tables.spaces.get_mut(&node.parent) else {
            return false;
        };
        parent.partitions.insert(node.color, node.handle);
        let mut node = node;
        // Subspaces register themselves as they arrive.
        node.subspaces.clear();
        tables.partitions.insert(node.handle, node);
        true
    }

    pub(crate) fn import_field_space(&self, handle: FieldSpace, fields: &[(FieldId, usize, usize)]) -> bool {
        let mut tables = self.tables.write();
        let node = tables
            .field_spaces
            .entry(handle)
            .or_insert_with(|| FieldSpaceNode::new(handle));
        for &(fid, size, index) in fields {
            match node.fields.get(&fid) {
                Some(info) if info.size == size && info.index == index => {}
                Some(_) => return false,
                None if node.allocated.contains(index) => return false,
                None => node.insert(fid, size, index),
            }
        }
        true
    }

    pub(crate) fn import_tree(&self, region: LogicalRegion) -> bool {
        let mut tables = self.tables.write();
        match tables.trees.get(&region.tree_id) {
            Some(existing) => *existing == region,
            None => {
                tables.trees.insert(region.tree_id, region);
                true
            }
        }
    }

    /// Address space that created a handle.
    #[must_use]
    pub fn handle_origin(raw: u32) -> AddressSpaceId {
        AddressSpaceId((raw >> 24) as u16)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn tree() -> ShapeTree {
        ShapeTree::new(&ForestConfig::default())
    }

    fn quarters() -> Vec<(Color, Domain)> {
        (0..4).map(|i| (i, Domain::rect1(i64::from(i) * 25, i64::from(i) * 25 + 24))).collect()
    }

    #[test]
    fn partition_queries() {
        let shape = tree();
        let root = shape.create_index_space(Domain::rect1(0, 99));
        let part = shape
            .create_index_partition(root, quarters(), true, None, true)
            .expect("disjoint quarters");
        assert!(shape.is_disjoint(part).unwrap());
        assert!(shape.is_complete(part).unwrap());
        let sub0 = shape.get_index_subspace(part, 0).unwrap();
        let sub1 = shape.get_index_subspace(part, 1).unwrap();
        assert_eq!(shape.get_volume(sub0).unwrap(), 25);
        assert!(!shape.intersects_with(IndexNode::Space(sub0), IndexNode::Space(sub1)).unwrap());
        assert!(shape.dominates(IndexNode::Space(root), IndexNode::Space(sub1)).unwrap());
        assert!(!shape.dominates(IndexNode::Space(sub1), IndexNode::Space(root)).unwrap());
        assert_eq!(shape.get_index_partition(root, 0).unwrap(), part);
        assert!(shape.are_children_disjoint(part, 0, 3).unwrap());
    }

    #[test]
    fn verified_disjointness_rejects_overlap() {
        let shape = tree();
        let root = shape.create_index_space(Domain::rect1(0, 99));
        let overlapping = [(0, Domain::rect1(0, 60)), (1, Domain::rect1(50, 99))];
        let err = shape
            .create_index_partition(root, overlapping, true, None, true)
            .unwrap_err();
        assert!(matches!(err, ShapeError::DisjointnessViolation { left: 0, right: 1, .. }));
        let aliased = shape
            .create_index_partition(root, overlapping, false, None, false)
            .unwrap();
        assert!(shape.is_complete(aliased).unwrap());
        assert!(!shape.are_children_disjoint(aliased, 0, 1).unwrap());
    }

    #[test]
    fn destroy_with_live_children_is_reported() {
        let shape = tree();
        let root = shape.create_index_space(Domain::rect1(0, 99));
        let part = shape.create_index_partition(root, quarters(), true, None, false).unwrap();
        let sub = shape.get_index_subspace(part, 2).unwrap();
        let nested = shape
            .create_index_partition(sub, [(0, Domain::rect1(50, 54))], true, None, false)
            .unwrap();
        assert_eq!(
            shape.destroy_index_space(root),
            Err(ShapeError::LiveChildren(IndexNode::Space(root)))
        );
        assert_eq!(
            shape.destroy_index_partition(part),
            Err(ShapeError::LiveChildren(IndexNode::Space(sub)))
        );
        shape.destroy_index_partition(nested).unwrap();
        shape.destroy_index_partition(part).unwrap();
        shape.destroy_index_space(root).unwrap();
    }

    #[test]
    fn fields_and_layouts() {
        let shape = tree();
        let fs = shape.create_field_space();
        assert_eq!(shape.allocate_field(fs, 10, 8).unwrap(), 0);
        assert_eq!(shape.allocate_field(fs, 11, 4).unwrap(), 1);
        assert!(matches!(
            shape.allocate_field(fs, 10, 8),
            Err(ShapeError::DuplicateField { .. })
        ));
        let mask = shape.get_field_mask(fs, &[10, 11]).unwrap();
        let layout = shape.layout(fs, mask, 100).unwrap();
        assert_eq!(layout.element_size(), 12);
        assert_eq!(layout.field(11).unwrap().offset, 800);
        assert!(Arc::ptr_eq(&layout, &shape.layout(fs, mask, 100).unwrap()));
        assert_eq!(shape.current_fields(fs, &layout, mask), mask);
        shape.free_field(fs, 10).unwrap();
        assert_eq!(shape.allocate_field(fs, 12, 2).unwrap(), 0);
        assert_eq!(shape.get_field_set(fs, mask).unwrap(), vec![12, 11]);
        // Index 0 now belongs to field 12; the old layout only still holds 11.
        assert_eq!(shape.current_fields(fs, &layout, mask), FieldMask::single(1));
        let fresh = shape.layout(fs, mask, 100).unwrap();
        assert!(!Arc::ptr_eq(&layout, &fresh));
        assert!(fresh.field(12).is_some());
    }
}

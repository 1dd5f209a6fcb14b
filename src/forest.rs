//! The forest: sole owner of the shape, the region tree arena, the view and
//! manager registries and the outboxes other modules write to.

use crate::{
    config::ForestConfig,
    directory::{Invalidation, StateDirectory},
    event::{Event, EventTable},
    mask::FieldMask,
    physical::{CopyRequest, MemoryUsage},
    semantic::{SemanticHandle, SemanticInfo, SemanticTag},
    shape::{IndexNode, ShapeError, ShapeTree},
    sync::{Arc, AtomicU64, AtomicUsize, Mutex, Ordering, RwLock},
    tree::{NodeArena, NodeId, RegionTreeNode, RegionTreePath, TreeHandle},
    types::{
        Color, ContextId, DistributedId, HashMap, HashSet, IndexMap, IndexPartition, IndexSpace, LogicalPartition,
        LogicalRegion, MemoryId, OperationId, RegionRequirement, RequirementTarget,
    },
    view::{LogicalView, PhysicalManager},
};
use smallvec::SmallVec;
use tracing::debug;

/// Committed-set size below which no sweep runs.
const COMMITTED_SWEEP_MIN: usize = 1024;

/// Dependence analysis and physical coherence state of one address space.
///
/// All tables live here and every operation goes through a shared
/// reference, so one forest can serve many contexts from many threads.
#[derive(Debug)]
pub struct RegionTreeForest {
    pub(crate) config: ForestConfig,
    pub(crate) shape: ShapeTree,
    pub(crate) nodes: NodeArena,
    pub(crate) events: EventTable,
    pub(crate) managers: RwLock<IndexMap<DistributedId, Arc<PhysicalManager>>>,
    pub(crate) views: RwLock<HashMap<DistributedId, Arc<LogicalView>>>,
    /// Materialized views keyed by (manager, node).
    pub(crate) materialized: Mutex<HashMap<(DistributedId, NodeId), Arc<LogicalView>>>,
    pub(crate) memories: Mutex<IndexMap<MemoryId, MemoryUsage>>,
    pub(crate) directories: Mutex<HashMap<ContextId, Arc<StateDirectory>>>,
    /// Committed operations that logical users may still name.
    pub(crate) committed: Mutex<HashSet<OperationId>>,
    /// Size of `committed` that triggers the next sweep.
    committed_sweep_at: AtomicUsize,
    pub(crate) semantic: RwLock<HashMap<(SemanticHandle, SemanticTag), SemanticInfo>>,
    pub(crate) copies: Mutex<Vec<CopyRequest>>,
    pub(crate) messages: Mutex<Vec<Invalidation>>,
    /// Managers nobody references any more, with the event their last users
    /// finish at.
    pub(crate) garbage: Mutex<Vec<(DistributedId, Event)>>,
    pub(crate) issued_copies: AtomicUsize,
    did_counter: AtomicU64,
    close_counter: AtomicU64,
    context_counter: AtomicU64,
}

impl Default for RegionTreeForest {
    fn default() -> Self {
        Self::new(ForestConfig::default())
    }
}

impl RegionTreeForest {
    /// Empty forest.
    #[must_use]
    pub fn new(config: ForestConfig) -> Self {
        Self {
            shape: ShapeTree::new(&config),
            nodes: NodeArena::default(),
            events: EventTable::new(config.address_space.0),
            managers: RwLock::new(IndexMap::default()),
            views: RwLock::new(HashMap::default()),
            materialized: Mutex::new(HashMap::default()),
            memories: Mutex::new(IndexMap::default()),
            directories: Mutex::new(HashMap::default()),
            committed: Mutex::new(HashSet::default()),
            committed_sweep_at: AtomicUsize::new(COMMITTED_SWEEP_MIN),
            semantic: RwLock::new(HashMap::default()),
            copies: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            garbage: Mutex::new(Vec::new()),
            issued_copies: AtomicUsize::new(0),
            did_counter: AtomicU64::new(1),
            close_counter: AtomicU64::new(0),
            context_counter: AtomicU64::new(0),
            config,
        }
    }

    /// Configuration the forest was built with.
    #[must_use]
    pub fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Index spaces, partitions and field spaces.
    #[must_use]
    pub fn shape(&self) -> &ShapeTree {
        &self.shape
    }

    /// Completion events.
    #[must_use]
    pub fn events(&self) -> &EventTable {
        &self.events
    }

    // ----- contexts ------------------------------------------------------

    /// Fresh context id.
    pub fn allocate_context(&self) -> ContextId {
        let raw = self.context_counter.fetch_add(1, Ordering::Relaxed);
        ContextId(u32::try_from(raw).expect("RegionTreeForest::allocate_context: [1]"))
    }

    /// Drop every logical and physical state of `ctx`.
    pub fn free_context(&self, ctx: ContextId) {
        for node in self.nodes.all() {
            drop(node.logical().take(ctx));
            let state = node.physical().take(ctx);
            for entry in state.valid_views.values().chain(state.reduction_views.values()) {
                self.remove_valid_reference(&entry.view);
            }
        }
        self.directories.lock().remove(&ctx);
        debug!(%ctx, "freed context");
    }

    // ----- nodes ---------------------------------------------------------

    pub(crate) fn node(&self, id: NodeId) -> Arc<RegionTreeNode> {
        self.nodes.get(id)
    }

    /// Node of `region`, created on first use.
    ///
    /// # Errors
    /// If the region's index space or tree is unknown.
    pub fn region_node(&self, region: LogicalRegion) -> Result<NodeId, ShapeError> {
        let handle = TreeHandle::Region(region);
        if let Some(id) = self.nodes.lookup(handle) {
            return Ok(id);
        }
        match self.shape.get_parent_index_partition(region.index_space)? {
            Some(parent) => {
                let parent = self.partition_node(LogicalPartition {
                    index_partition: parent,
                    field_space: region.field_space,
                    tree_id: region.tree_id,
                })?;
                let color = self.shape.get_index_space_color(region.index_space)?;
                Ok(self.nodes.insert(handle, Some(parent), color))
            }
            None => {
                let root = self.shape.tree_root(region.tree_id)?;
                if root != region {
                    return Err(ShapeError::NotTopLevel(region.index_space));
                }
                Ok(self.nodes.insert(handle, None, 0))
            }
        }
    }

    /// Node of `partition`, created on first use.
    ///
    /// # Errors
    /// If the partition or its tree is unknown.
    pub fn partition_node(&self, partition: LogicalPartition) -> Result<NodeId, ShapeError> {
        let handle = TreeHandle::Partition(partition);
        if let Some(id) = self.nodes.lookup(handle) {
            return Ok(id);
        }
        let parent = self.region_node(LogicalRegion {
            index_space: self.shape.get_parent_index_space(partition.index_partition)?,
            field_space: partition.field_space,
            tree_id: partition.tree_id,
        })?;
        let color = self.shape.get_index_partition_color(partition.index_partition)?;
        Ok(self.nodes.insert(handle, Some(parent), color))
    }

    /// Child of `node` with `color`, created on first use.
    ///
    /// # Errors
    /// `UnknownColor` if the shape has no such child.
    pub fn child_node(&self, node: NodeId, color: Color) -> Result<NodeId, ShapeError> {
        let current = self.node(node);
        if let Some(child) = current.child(color) {
            return Ok(child);
        }
        match current.handle {
            TreeHandle::Region(region) => self.partition_node(self.get_logical_partition_by_color(region, color)?),
            TreeHandle::Partition(partition) => {
                self.region_node(self.get_logical_subregion_by_color(partition, color)?)
            }
        }
    }

    /// What `node` names.
    #[must_use]
    pub fn node_handle(&self, node: NodeId) -> TreeHandle {
        self.node(node).handle
    }

    /// Parent of `node`, `None` at a tree root.
    #[must_use]
    pub fn parent_node(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).parent
    }

    /// Partition `handle` of `parent`.
    ///
    /// # Errors
    /// `NotAncestor` if `handle` does not partition `parent`'s index space.
    pub fn get_logical_partition(
        &self,
        parent: LogicalRegion,
        handle: IndexPartition,
    ) -> Result<LogicalPartition, ShapeError> {
        if self.shape.get_parent_index_space(handle)? != parent.index_space {
            return Err(ShapeError::NotAncestor {
                ancestor: parent.to_string(),
                descendant: handle.to_string(),
            });
        }
        Ok(LogicalPartition {
            index_partition: handle,
            field_space: parent.field_space,
            tree_id: parent.tree_id,
        })
    }

    /// Partition of `parent` with `color`.
    ///
    /// # Errors
    /// `UnknownColor` if there is none.
    pub fn get_logical_partition_by_color(
        &self,
        parent: LogicalRegion,
        color: Color,
    ) -> Result<LogicalPartition, ShapeError> {
        let handle = self.shape.get_index_partition(parent.index_space, color)?;
        self.get_logical_partition(parent, handle)
    }

    /// Subregion `handle` of `parent`.
    ///
    /// # Errors
    /// `NotAncestor` if `handle` is not a subspace of `parent`'s partition.
    pub fn get_logical_subregion(
        &self,
        parent: LogicalPartition,
        handle: IndexSpace,
    ) -> Result<LogicalRegion, ShapeError> {
        if self.shape.get_parent_index_partition(handle)? != Some(parent.index_partition) {
            return Err(ShapeError::NotAncestor {
                ancestor: parent.to_string(),
                descendant: handle.to_string(),
            });
        }
        Ok(LogicalRegion {
            index_space: handle,
            field_space: parent.field_space,
            tree_id: parent.tree_id,
        })
    }

    /// Subregion of `parent` with `color`.
    ///
    /// # Errors
    /// `UnknownColor` if there is none.
    pub fn get_logical_subregion_by_color(
        &self,
        parent: LogicalPartition,
        color: Color,
    ) -> Result<LogicalRegion, ShapeError> {
        let handle = self.shape.get_index_subspace(parent.index_partition, color)?;
        self.get_logical_subregion(parent, handle)
    }

    // ----- paths ---------------------------------------------------------

    /// Path from `parent` down to `target`.
    ///
    /// # Errors
    /// `NotAncestor` if `parent` is not an ancestor of `target`.
    pub fn initialize_path(&self, parent: NodeId, target: NodeId) -> Result<RegionTreePath, ShapeError> {
        let mut nodes = SmallVec::<[NodeId; 8]>::new();
        let mut colors = SmallVec::<[Color; 8]>::new();
        let mut current = Some(target);
        while let Some(id) = current {
            let node = self.node(id);
            nodes.push(id);
            colors.push(node.color);
            if id == parent {
                nodes.reverse();
                colors.reverse();
                return Ok(RegionTreePath::new(nodes, colors));
            }
            current = node.parent;
        }
        Err(ShapeError::NotAncestor {
            ancestor: self.node(parent).handle.to_string(),
            descendant: self.node(target).handle.to_string(),
        })
    }

    /// Path of a requirement, from its parent region to its target.
    ///
    /// # Errors
    /// On unknown handles, or if the target is not below the parent.
    pub fn requirement_path(&self, req: &RegionRequirement) -> Result<RegionTreePath, ShapeError> {
        let start = self.region_node(req.parent)?;
        let target = match req.target {
            RequirementTarget::Region(region) => self.region_node(region)?,
            RequirementTarget::Partition(partition) => self.partition_node(partition)?,
        };
        self.initialize_path(start, target)
    }

    /// Fields named by a requirement.
    ///
    /// # Errors
    /// On unknown fields.
    pub fn requirement_mask(&self, req: &RegionRequirement) -> Result<FieldMask, ShapeError> {
        self.shape.get_field_mask(req.field_space(), &req.fields)
    }

    // ----- tree relations ------------------------------------------------

    /// Whether children `lhs` and `rhs` of `node` share no points.
    pub(crate) fn children_disjoint(&self, node: &RegionTreeNode, lhs: Color, rhs: Color) -> bool {
        if lhs == rhs {
            return false;
        }
        match node.handle {
            TreeHandle::Partition(partition) => self
                .shape
                .are_children_disjoint(partition.index_partition, lhs, rhs)
                .unwrap_or(false),
            TreeHandle::Region(region) => {
                let space = region.index_space;
                match (
                    self.shape.get_index_partition(space, lhs),
                    self.shape.get_index_partition(space, rhs),
                ) {
                    (Ok(lhs), Ok(rhs)) => !self
                        .shape
                        .intersects_with(IndexNode::Partition(lhs), IndexNode::Partition(rhs))
                        .unwrap_or(true),
                    _ => false,
                }
            }
        }
    }

    /// Whether two nodes may share points. Nodes of different trees never
    /// do; shape errors count as an intersection.
    pub(crate) fn nodes_intersect(&self, lhs: NodeId, rhs: NodeId) -> bool {
        if lhs == rhs {
            return true;
        }
        let (lhs_handle, rhs_handle) = (self.node(lhs).handle, self.node(rhs).handle);
        if lhs_handle.tree_id() != rhs_handle.tree_id() {
            return false;
        }
        if self.is_ancestor_or_self(lhs, rhs) || self.is_ancestor_or_self(rhs, lhs) {
            return true;
        }
        self.shape
            .intersects_with(lhs_handle.index_node(), rhs_handle.index_node())
            .unwrap_or(true)
    }

    /// Whether `lhs` covers every point of `rhs`.
    pub(crate) fn node_dominates(&self, lhs: NodeId, rhs: NodeId) -> bool {
        if self.is_ancestor_or_self(lhs, rhs) {
            return true;
        }
        let (lhs_handle, rhs_handle) = (self.node(lhs).handle, self.node(rhs).handle);
        lhs_handle.tree_id() == rhs_handle.tree_id()
            && self
                .shape
                .dominates(lhs_handle.index_node(), rhs_handle.index_node())
                .unwrap_or(false)
    }

    /// Whether `ancestor` is `node` or above it.
    pub(crate) fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let depth = self.node(ancestor).depth;
        let mut current = self.node(node);
        loop {
            if current.id == ancestor {
                return true;
            }
            match current.parent {
                Some(parent) if current.depth > depth => current = self.node(parent),
                _ => return false,
            }
        }
    }

    /// Nearest region at or above `node`.
    pub(crate) fn region_of(&self, node: NodeId) -> NodeId {
        let current = self.node(node);
        if current.is_region() {
            node
        } else {
            current.parent.expect("RegionTreeForest::region_of: [1]")
        }
    }

    /// Root of `node`'s tree.
    pub(crate) fn root_of(&self, node: NodeId) -> NodeId {
        let mut current = self.node(node);
        while let Some(parent) = current.parent {
            current = self.node(parent);
        }
        current.id
    }

    /// Colors leading from the tree root down to `node`.
    pub(crate) fn node_path(&self, node: NodeId) -> Vec<Color> {
        let mut colors = Vec::new();
        let mut current = self.node(node);
        while let Some(parent) = current.parent {
            colors.push(current.color);
            current = self.node(parent);
        }
        colors.reverse();
        colors
    }

    // ----- operations ----------------------------------------------------

    /// `op` has committed; its users may now be pruned.
    pub fn commit_operation(&self, op: OperationId) {
        let size = {
            let mut committed = self.committed.lock();
            committed.insert(op);
            committed.len()
        };
        if size >= self.committed_sweep_at.load(Ordering::Relaxed) {
            self.sweep_committed();
        }
    }

    /// Whether `op` has committed. Only answered reliably while some
    /// logical user still names `op`; ids nothing refers to any more are
    /// forgotten.
    #[must_use]
    pub fn is_committed(&self, op: OperationId) -> bool {
        self.committed.lock().contains(&op)
    }

    /// Forget committed operations no logical user names any more.
    pub(crate) fn sweep_committed(&self) {
        // Node locks are never taken while `committed` is held.
        let mut referenced = HashSet::<OperationId>::default();
        for node in self.nodes.all() {
            for state in node.logical().iter_mut() {
                referenced.extend(state.users_on(FieldMask::from_bits(u128::MAX)).map(|user| user.op));
            }
        }
        let (before, after) = {
            let mut committed = self.committed.lock();
            let before = committed.len();
            committed.retain(|op| referenced.contains(op));
            (before, committed.len())
        };
        self.committed_sweep_at
            .store((after * 2).max(COMMITTED_SWEEP_MIN), Ordering::Relaxed);
        debug!(before, after, "swept committed operations");
    }

    pub(crate) fn next_close_id(&self) -> OperationId {
        OperationId(OperationId::CLOSE_BASE + self.close_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_did(&self) -> DistributedId {
        DistributedId::compose(
            self.config.address_space,
            self.did_counter.fetch_add(1, Ordering::Relaxed),
        )
    }

    // ----- outboxes ------------------------------------------------------

    pub(crate) fn record_copy(&self, request: CopyRequest) {
        self.copies.lock().push(request);
        self.issued_copies.fetch_add(1, Ordering::AcqRel);
    }

    /// Copies issued since the last drain, in issue order.
    pub fn drain_copies(&self) -> Vec<CopyRequest> {
        core::mem::take(&mut *self.copies.lock())
    }

    /// Number of copies issued over the forest's lifetime.
    #[must_use]
    pub fn issued_copy_count(&self) -> usize {
        self.issued_copies.load(Ordering::Acquire)
    }

    /// Invalidations the directory produced since the last drain.
    pub fn drain_messages(&self) -> Vec<Invalidation> {
        core::mem::take(&mut *self.messages.lock())
    }

    /// Remote-holder directory of `ctx`.
    pub fn state_directory(&self, ctx: ContextId) -> Arc<StateDirectory> {
        Arc::clone(
            self.directories
                .lock()
                .entry(ctx)
                .or_insert_with(|| Arc::new(StateDirectory::new(ctx))),
        )
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::domain::Domain;

    fn forest_with_tree() -> (RegionTreeForest, LogicalRegion, IndexPartition) {
        let forest = RegionTreeForest::default();
        let shape = forest.shape();
        let space = shape.create_index_space(Domain::rect1(0, 99));
        let coloring = (0..4u32).map(|c| (c, Domain::rect1(i64::from(c) * 25, i64::from(c) * 25 + 24)));
        let part = shape
            .create_index_partition(space, coloring, true, None, false)
            .unwrap();
        let fs = shape.create_field_space();
        shape.allocate_field(fs, 0, 8).unwrap();
        let region = shape.create_logical_region(space, fs).unwrap();
        (forest, region, part)
    }

    #[test]
    fn nodes_are_created_lazily_from_the_leaf() {
        let (forest, root, part) = forest_with_tree();
        let partition = forest.get_logical_partition(root, part).unwrap();
        let sub = forest.get_logical_subregion_by_color(partition, 2).unwrap();
        let leaf = forest.region_node(sub).unwrap();
        let root_node = forest.region_node(root).unwrap();
        let part_node = forest.partition_node(partition).unwrap();
        assert_eq!(forest.parent_node(leaf), Some(part_node));
        assert_eq!(forest.parent_node(part_node), Some(root_node));
        assert_eq!(forest.child_node(part_node, 2).unwrap(), leaf);
        assert_eq!(forest.node_path(leaf), vec![0, 2]);
        assert_eq!(forest.root_of(leaf), root_node);
    }

    #[test]
    fn paths_run_top_down() {
        let (forest, root, part) = forest_with_tree();
        let partition = forest.get_logical_partition(root, part).unwrap();
        let sub = forest.get_logical_subregion_by_color(partition, 1).unwrap();
        let root_node = forest.region_node(root).unwrap();
        let leaf = forest.region_node(sub).unwrap();
        let path = forest.initialize_path(root_node, leaf).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.start(), root_node);
        assert_eq!(path.target(), leaf);
        assert_eq!(path.next_color(0), Some(0));
        assert_eq!(path.next_color(1), Some(1));
        assert_eq!(path.next_color(2), None);
        assert!(matches!(
            forest.initialize_path(leaf, root_node),
            Err(ShapeError::NotAncestor { .. })
        ));
    }

    #[test]
    fn disjoint_siblings_do_not_intersect() {
        let (forest, root, part) = forest_with_tree();
        let partition = forest.get_logical_partition(root, part).unwrap();
        let a = forest.region_node(forest.get_logical_subregion_by_color(partition, 0).unwrap()).unwrap();
        let b = forest.region_node(forest.get_logical_subregion_by_color(partition, 3).unwrap()).unwrap();
        let root_node = forest.region_node(root).unwrap();
        assert!(!forest.nodes_intersect(a, b));
        assert!(forest.nodes_intersect(root_node, a));
        assert!(forest.node_dominates(root_node, b));
        assert!(!forest.node_dominates(a, root_node));
        let part_node = forest.partition_node(partition).unwrap();
        assert!(forest.children_disjoint(&forest.node(part_node), 0, 3));
        assert_eq!(forest.region_of(part_node), root_node);
    }

    #[test]
    fn close_ids_are_reserved() {
        let forest = RegionTreeForest::default();
        assert!(forest.next_close_id().is_close());
        assert_ne!(forest.next_close_id(), forest.next_close_id());
        assert_ne!(forest.allocate_context(), forest.allocate_context());
    }
}

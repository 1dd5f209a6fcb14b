use crate::{
    logical::state::LogicalState,
    physical::state::PhysicalState,
    shape::IndexNode,
    sync::{Arc, Mutex, MutexGuard, RwLock},
    types::{Color, ContextId, FieldSpace, HashMap, IndexMap, LogicalPartition, LogicalRegion, RegionTreeId},
};
use derive_more::{Display, From};
use smallvec::SmallVec;

/// Index of a region tree node inside the forest's arena.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("n{_0}")]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a region tree node names.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeHandle {
    /// A logical region.
    Region(LogicalRegion),
    /// A logical partition.
    Partition(LogicalPartition),
}

impl TreeHandle {
    /// Tree the node belongs to.
    #[must_use]
    pub fn tree_id(&self) -> RegionTreeId {
        match self {
            Self::Region(region) => region.tree_id,
            Self::Partition(partition) => partition.tree_id,
        }
    }

    /// Field space shared by the whole tree.
    #[must_use]
    pub fn field_space(&self) -> FieldSpace {
        match self {
            Self::Region(region) => region.field_space,
            Self::Partition(partition) => partition.field_space,
        }
    }

    /// Index tree node naming the points.
    #[must_use]
    pub fn index_node(&self) -> IndexNode {
        match self {
            Self::Region(region) => IndexNode::Space(region.index_space),
            Self::Partition(partition) => IndexNode::Partition(partition.index_partition),
        }
    }

    /// Whether this is a region.
    #[must_use]
    pub fn is_region(&self) -> bool {
        matches!(self, Self::Region(_))
    }
}

/// Per-context slots of one node, indexed by context id.
#[derive(Debug)]
pub(crate) struct ContextTable<T>(Vec<T>);

impl<T> Default for ContextTable<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> ContextTable<T> {
    /// Slots of every context that has touched the node.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.0.iter_mut()
    }
}

impl<T: Default> ContextTable<T> {
    pub(crate) fn get_mut(&mut self, ctx: ContextId) -> &mut T {
        let index = ctx.index();
        if self.0.len() <= index {
            self.0.resize_with(index + 1, T::default);
        }
        &mut self.0[index]
    }

    pub(crate) fn get(&self, ctx: ContextId) -> Option<&T> {
        self.0.get(ctx.index())
    }

    pub(crate) fn take(&mut self, ctx: ContextId) -> T {
        self.0
            .get_mut(ctx.index())
            .map(core::mem::take)
            .unwrap_or_default()
    }
}

/// One logical region or partition with its per-context state.
#[derive(Debug)]
pub(crate) struct RegionTreeNode {
    pub(crate) id: NodeId,
    pub(crate) handle: TreeHandle,
    pub(crate) parent: Option<NodeId>,
    pub(crate) color: Color,
    pub(crate) depth: u32,
    children: RwLock<IndexMap<Color, NodeId>>,
    logical: Mutex<ContextTable<LogicalState>>,
    physical: Mutex<ContextTable<PhysicalState>>,
}

impl RegionTreeNode {
    pub(crate) fn is_region(&self) -> bool {
        self.handle.is_region()
    }

    pub(crate) fn child(&self, color: Color) -> Option<NodeId> {
        self.children.read().get(&color).copied()
    }

    pub(crate) fn known_children(&self) -> Vec<(Color, NodeId)> {
        self.children
            .read()
            .iter()
            .map(|(color, id)| (*color, *id))
            .collect()
    }

    pub(crate) fn logical(&self) -> MutexGuard<'_, ContextTable<LogicalState>> {
        self.logical.lock()
    }

    pub(crate) fn physical(&self) -> MutexGuard<'_, ContextTable<PhysicalState>> {
        self.physical.lock()
    }
}

#[derive(Debug, Default)]
struct NodeTables {
    nodes: Vec<Arc<RegionTreeNode>>,
    lookup: HashMap<TreeHandle, NodeId>,
}

/// Arena of region tree nodes; handles resolve to `NodeId`s once and are
/// never reused.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    tables: RwLock<NodeTables>,
}

impl NodeArena {
    pub(crate) fn get(&self, id: NodeId) -> Arc<RegionTreeNode> {
        Arc::clone(
            self.tables
                .read()
                .nodes
                .get(id.index())
                .expect("NodeArena::get: [1]"),
        )
    }

    pub(crate) fn lookup(&self, handle: TreeHandle) -> Option<NodeId> {
        self.tables.read().lookup.get(&handle).copied()
    }

    pub(crate) fn insert(&self, handle: TreeHandle, parent: Option<NodeId>, color: Color) -> NodeId {
        let mut tables = self.tables.write();
        if let Some(&existing) = tables.lookup.get(&handle) {
            return existing;
        }
        let depth = parent
            .and_then(|p| tables.nodes.get(p.index()))
            .map_or(0, |p| p.depth + 1);
        let id = NodeId(u32::try_from(tables.nodes.len()).expect("NodeArena::insert: [1]"));
        let node = Arc::new(RegionTreeNode {
            id,
            handle,
            parent,
            color,
            depth,
            children: RwLock::new(IndexMap::default()),
            logical: Mutex::new(ContextTable::default()),
            physical: Mutex::new(ContextTable::default()),
        });
        if let Some(parent) = parent.and_then(|p| tables.nodes.get(p.index())) {
            parent.children.write().insert(color, id);
        }
        tables.nodes.push(node);
        tables.lookup.insert(handle, id);
        id
    }

    pub(crate) fn all(&self) -> Vec<Arc<RegionTreeNode>> {
        self.tables.read().nodes.clone()
    }
}

/// Nodes from a requirement's parent region down to its target, top-down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTreePath {
    nodes: SmallVec<[NodeId; 8]>,
    colors: SmallVec<[Color; 8]>,
}

impl RegionTreePath {
    pub(crate) fn new(nodes: SmallVec<[NodeId; 8]>, colors: SmallVec<[Color; 8]>) -> Self {
        debug_assert_eq!(nodes.len(), colors.len());
        Self { nodes, colors }
    }

    /// First node (the parent region).
    #[must_use]
    pub fn start(&self) -> NodeId {
        self.nodes[0]
    }

    /// Last node (the requirement's target).
    #[must_use]
    pub fn target(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    /// All nodes, top-down.
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Paths always contain at least their start.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Color of the child following position `index`, if any.
    #[must_use]
    pub fn next_color(&self, index: usize) -> Option<Color> {
        self.colors.get(index + 1).copied()
    }
}

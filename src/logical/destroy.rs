//! Analysis of deletions.
//!
//! A deleting operation is ordered after every user of what it deletes in
//! its context, like a fence restricted to the deleted nodes and fields.
//! The state of those nodes and fields is then dropped in every context, so
//! nothing recorded for them survives into a later reuse of a handle or a
//! field index. Removing the shape itself stays with the shape API.

use crate::{
    forest::RegionTreeForest,
    mask::FieldMask,
    operation::Operation,
    shape::{IndexNode, ShapeError},
    tree::{NodeId, RegionTreeNode, TreeHandle},
    types::{
        ContextId, DependenceType, FieldId, FieldSpace, IndexMap, IndexPartition, IndexSpace, LogicalPartition,
        LogicalRegion, OperationId,
    },
};
use tracing::debug;

impl RegionTreeForest {
    /// Order `op`, which deletes `handle`, after every user of a region
    /// over it, and drop those regions' state.
    ///
    /// # Errors
    /// If `handle` or `region` is unknown.
    pub fn analyze_destroy_index_space(
        &self,
        ctx: ContextId,
        handle: IndexSpace,
        op: &dyn Operation,
        region: LogicalRegion,
    ) -> Result<(), ShapeError> {
        self.shape.get_domain(handle)?;
        self.analyze_destroy(ctx, op, region, FieldMask::from_bits(u128::MAX), |node| {
            node.handle.index_node() == IndexNode::Space(handle)
        })
    }

    /// Order `op`, which deletes `handle`, after every user of a partition
    /// over it, and drop those partitions' state.
    ///
    /// # Errors
    /// If `handle` or `region` is unknown.
    pub fn analyze_destroy_index_partition(
        &self,
        ctx: ContextId,
        handle: IndexPartition,
        op: &dyn Operation,
        region: LogicalRegion,
    ) -> Result<(), ShapeError> {
        self.shape.is_disjoint(handle)?;
        self.analyze_destroy(ctx, op, region, FieldMask::from_bits(u128::MAX), |node| {
            node.handle.index_node() == IndexNode::Partition(handle)
        })
    }

    /// Order `op`, which deletes field space `handle`, after every user of
    /// a tree over it, and drop those trees' state.
    ///
    /// # Errors
    /// If `handle` or `region` is unknown.
    pub fn analyze_destroy_field_space(
        &self,
        ctx: ContextId,
        handle: FieldSpace,
        op: &dyn Operation,
        region: LogicalRegion,
    ) -> Result<(), ShapeError> {
        self.shape.get_fields(handle)?;
        self.analyze_destroy(ctx, op, region, FieldMask::from_bits(u128::MAX), |node| {
            node.parent.is_none() && node.handle.field_space() == handle
        })
    }

    /// Order `op`, which frees `fields` of `handle`, after every user of
    /// them, and drop them from the state of every tree over `handle`.
    ///
    /// Once the fields are freed, their indexes may be handed to new
    /// fields; nothing recorded for the old ones is found again.
    ///
    /// # Errors
    /// If `handle`, a field, or `region` is unknown.
    pub fn analyze_destroy_fields(
        &self,
        ctx: ContextId,
        handle: FieldSpace,
        fields: &[FieldId],
        op: &dyn Operation,
        region: LogicalRegion,
    ) -> Result<(), ShapeError> {
        let mask = self.shape.get_field_mask(handle, fields)?;
        self.analyze_destroy(ctx, op, region, mask, |node| {
            node.parent.is_none() && node.handle.field_space() == handle
        })
    }

    /// Order `op`, which deletes `handle`, after every user of it and its
    /// subtree, and drop that subtree's state.
    ///
    /// # Errors
    /// If `handle` or `region` is unknown.
    pub fn analyze_destroy_logical_region(
        &self,
        ctx: ContextId,
        handle: LogicalRegion,
        op: &dyn Operation,
        region: LogicalRegion,
    ) -> Result<(), ShapeError> {
        self.shape.tree_root(handle.tree_id)?;
        self.analyze_destroy(ctx, op, region, FieldMask::from_bits(u128::MAX), |node| {
            node.handle == TreeHandle::Region(handle)
        })
    }

    /// Order `op`, which deletes `handle`, after every user of it and its
    /// subtree, and drop that subtree's state.
    ///
    /// # Errors
    /// If `handle` or `region` is unknown.
    pub fn analyze_destroy_logical_partition(
        &self,
        ctx: ContextId,
        handle: LogicalPartition,
        op: &dyn Operation,
        region: LogicalRegion,
    ) -> Result<(), ShapeError> {
        self.shape.tree_root(handle.tree_id)?;
        self.analyze_destroy(ctx, op, region, FieldMask::from_bits(u128::MAX), |node| {
            node.handle == TreeHandle::Partition(handle)
        })
    }

    fn analyze_destroy(
        &self,
        ctx: ContextId,
        op: &dyn Operation,
        region: LogicalRegion,
        mask: FieldMask,
        deleted: impl Fn(&RegionTreeNode) -> bool,
    ) -> Result<(), ShapeError> {
        self.region_node(region)?;
        let roots: Vec<NodeId> = self
            .nodes
            .all()
            .into_iter()
            .filter(|node| deleted(node))
            .map(|node| node.id)
            .collect();
        let mut edges = IndexMap::<OperationId, DependenceType>::default();
        for &root in &roots {
            for (target, kind) in self.fence_edges(ctx, op.unique_id(), root, mask) {
                edges.entry(target).or_insert(kind);
            }
        }
        for &root in &roots {
            self.drop_subtree_state(root, mask);
        }
        debug!(op = %op.unique_id(), %region, %mask, nodes = roots.len(), edges = edges.len(), "destroy analysis");
        for (target, kind) in edges {
            op.register_dependence(target, kind);
        }
        Ok(())
    }

    /// Drop `mask` from the logical and physical state of `root`'s subtree
    /// in every context, and stop `root` being open at its parent.
    fn drop_subtree_state(&self, root: NodeId, mask: FieldMask) {
        let top = self.node(root);
        if let Some(parent) = top.parent {
            let parent = self.node(parent);
            for state in parent.logical().iter_mut() {
                state.close_child(top.color, mask);
            }
            for state in parent.physical().iter_mut() {
                state.close_child(top.color, mask);
            }
        }
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let current = self.node(id);
            for state in current.logical().iter_mut() {
                drop(state.invalidate(mask));
            }
            let removed: Vec<_> = current
                .physical()
                .iter_mut()
                .flat_map(|state| state.invalidate(mask).0)
                .collect();
            for stale in removed {
                self.remove_valid_reference(&stale);
            }
            stack.extend(current.known_children().into_iter().map(|(_, child)| child));
        }
    }
}

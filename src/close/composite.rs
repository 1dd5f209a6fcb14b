use crate::{
    close::CloseOutcome,
    event::Event,
    forest::RegionTreeForest,
    mask::FieldMask,
    physical::CopyKind,
    sync::Arc,
    tree::{NodeId, TreeHandle},
    types::{Color, ContextId},
    view::{LogicalView, ManagerKind, PhysicalManager, ViewKind},
};
use tracing::{debug, trace};

/// Snapshot of a closed subtree.
///
/// Instead of copying the subtree into one instance at close time, a
/// composite close records which views were valid where. Readers later
/// replay the snapshot into their own instance, parents before children.
#[derive(Debug)]
pub struct CompositeView {
    root: Arc<CompositeNode>,
    valid_mask: FieldMask,
}

impl CompositeView {
    pub(crate) fn new(root: Arc<CompositeNode>, valid_mask: FieldMask) -> Self {
        Self { root, valid_mask }
    }

    /// Root of the captured subtree.
    #[must_use]
    pub fn root(&self) -> &Arc<CompositeNode> {
        &self.root
    }

    /// Fields the snapshot holds current data for.
    #[must_use]
    pub fn valid_mask(&self) -> FieldMask {
        self.valid_mask
    }

    /// Every view the snapshot keeps alive.
    #[must_use]
    pub fn captured_views(&self) -> Vec<Arc<LogicalView>> {
        let mut views = Vec::new();
        self.root.collect_views(&mut views);
        views
    }
}

#[derive(Debug, Clone, Copy)]
struct ChildInfo {
    open_fields: FieldMask,
}

/// One node of a composite snapshot.
#[derive(Debug)]
pub struct CompositeNode {
    node: NodeId,
    dirty_mask: FieldMask,
    valid_views: Vec<(Arc<LogicalView>, FieldMask)>,
    reductions: Vec<(Arc<LogicalView>, FieldMask)>,
    children: Vec<(Arc<CompositeNode>, ChildInfo)>,
}

impl CompositeNode {
    pub(crate) fn from_parts(
        node: NodeId,
        dirty_mask: FieldMask,
        valid_views: Vec<(Arc<LogicalView>, FieldMask)>,
        reductions: Vec<(Arc<LogicalView>, FieldMask)>,
        children: Vec<(Arc<CompositeNode>, FieldMask)>,
    ) -> Self {
        Self {
            node,
            dirty_mask,
            valid_views,
            reductions,
            children: children
                .into_iter()
                .map(|(child, open_fields)| (child, ChildInfo { open_fields }))
                .collect(),
        }
    }

    /// Region tree node captured.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Fields dirty at this node when it was captured.
    #[must_use]
    pub fn dirty_mask(&self) -> FieldMask {
        self.dirty_mask
    }

    /// Captured children with the fields they were open for.
    pub fn children(&self) -> impl Iterator<Item = (&Arc<CompositeNode>, FieldMask)> {
        self.children.iter().map(|(child, info)| (child, info.open_fields))
    }

    /// Views valid at the node when it was captured.
    #[must_use]
    pub fn valid_views(&self) -> &[(Arc<LogicalView>, FieldMask)] {
        &self.valid_views
    }

    /// Reductions pending at the node when it was captured.
    #[must_use]
    pub fn reductions(&self) -> &[(Arc<LogicalView>, FieldMask)] {
        &self.reductions
    }

    fn collect_views(&self, out: &mut Vec<Arc<LogicalView>>) {
        for (view, _) in self.valid_views.iter().chain(&self.reductions) {
            if !out.iter().any(|seen| seen.did == view.did) {
                out.push(Arc::clone(view));
            }
        }
        for (child, _) in &self.children {
            child.collect_views(out);
        }
    }

    fn sources(&self, mask: FieldMask) -> Vec<(Arc<LogicalView>, FieldMask)> {
        self.valid_views
            .iter()
            .filter(|(view, _)| view.is_materialized())
            .filter_map(|(view, fields)| {
                let overlap = *fields & mask;
                (!overlap.is_empty()).then(|| (Arc::clone(view), overlap))
            })
            .collect()
    }
}

impl RegionTreeForest {
    /// A composite close needs a region whose closed children all are
    /// complete partitions.
    pub(super) fn composite_close_legal(&self, node: NodeId, children: &[(Color, NodeId, FieldMask)]) -> bool {
        self.node(node).is_region()
            && children.iter().all(|&(_, child, _)| match self.node(child).handle {
                TreeHandle::Partition(partition) => self
                    .shape
                    .is_complete(partition.index_partition)
                    .unwrap_or(false),
                TreeHandle::Region(_) => false,
            })
    }

    pub(super) fn perform_composite_close(
        &self,
        ctx: ContextId,
        node_id: NodeId,
        children: &[(Color, NodeId, FieldMask)],
        dirty: FieldMask,
        leave_open: &[Color],
    ) -> CloseOutcome {
        let node = self.node(node_id);
        let reductions = node
            .physical()
            .get(ctx)
            .map(|state| state.reductions_on(dirty))
            .unwrap_or_default();
        let root = CompositeNode {
            node: node_id,
            dirty_mask: dirty,
            valid_views: self.find_valid_views(ctx, node_id, dirty),
            reductions,
            children: children
                .iter()
                .filter_map(|&(_, child, fields)| {
                    let open_fields = fields & dirty;
                    self.capture_composite(ctx, child, open_fields)
                        .map(|captured| (captured, ChildInfo { open_fields }))
                })
                .collect(),
        };
        let view = Arc::new(LogicalView::new(
            self.next_did(),
            node_id,
            ViewKind::Composite(CompositeView::new(Arc::new(root), dirty)),
        ));
        self.register_view(&view);
        self.update_valid_views(ctx, node_id, dirty, &view, true);
        self.drop_reductions(ctx, node_id, dirty);
        let mut left_open = Vec::new();
        for &(color, child, fields) in children {
            if leave_open.contains(&color) {
                self.reset_left_open(ctx, child, fields, &view);
                left_open.push(color);
            } else {
                self.invalidate_subtree(ctx, child, fields);
                node.physical().get_mut(ctx).close_child(color, fields);
            }
        }
        debug!(node = %node_id, view = %view.did, %dirty, "closed into composite view");
        CloseOutcome {
            event: Event::NO_EVENT,
            copies_issued: 0,
            target: Some(view),
            composite: true,
            left_open,
        }
    }

    /// Snapshot the dirty data of `mask` in the subtree at `node`.
    fn capture_composite(&self, ctx: ContextId, node_id: NodeId, mask: FieldMask) -> Option<Arc<CompositeNode>> {
        if mask.is_empty() {
            return None;
        }
        let node = self.node(node_id);
        let (dirty_mask, valid_views, reductions, open) = node
            .physical()
            .get(ctx)
            .map(|state| {
                let dirty = state.dirty_mask & mask;
                (
                    dirty,
                    state.views_on(dirty),
                    state.reductions_on(mask),
                    state.open_children_on(mask),
                )
            })
            .unwrap_or_default();
        let children: Vec<_> = open
            .into_iter()
            .filter_map(|(color, open_fields)| {
                let child = node.child(color)?;
                self.capture_composite(ctx, child, open_fields)
                    .map(|captured| (captured, ChildInfo { open_fields }))
            })
            .collect();
        if dirty_mask.is_empty() && reductions.is_empty() && children.is_empty() {
            return None;
        }
        Some(Arc::new(CompositeNode {
            node: node_id,
            dirty_mask,
            valid_views,
            reductions,
            children,
        }))
    }

    /// Materialize `mask` of a composite view into `dst` at `dst_node`.
    pub(crate) fn issue_composite_copies(
        &self,
        composite: &Arc<LogicalView>,
        dst: &Arc<LogicalView>,
        dst_node: NodeId,
        mask: FieldMask,
        after: Event,
    ) -> Event {
        let Some(snapshot) = composite.as_composite() else {
            return Event::NO_EVENT;
        };
        let Some(dst_manager) = dst.manager() else {
            return Event::NO_EVENT;
        };
        trace!(composite = %composite.did, dst = %dst.did, %mask, "replaying composite view");
        self.replay_composite_node(&snapshot.root, dst, dst_manager, dst_node, mask & snapshot.valid_mask, after)
    }

    fn replay_composite_node(
        &self,
        cnode: &CompositeNode,
        dst: &Arc<LogicalView>,
        dst_manager: &Arc<PhysicalManager>,
        dst_node: NodeId,
        mask: FieldMask,
        after: Event,
    ) -> Event {
        if mask.is_empty() || !self.nodes_intersect(cnode.node, dst_node) {
            return Event::NO_EVENT;
        }
        // Copies are bounded by whichever of the two nodes is smaller.
        let copy_node = if self.is_ancestor_or_self(cnode.node, dst_node) {
            dst_node
        } else {
            cnode.node
        };
        let sources: Vec<_> = cnode
            .sources(mask)
            .into_iter()
            .filter(|(view, _)| !view.manager().is_some_and(|m| m.same_instance(dst_manager)))
            .collect();
        let mut done = vec![after];
        if !sources.is_empty() {
            done.extend(self.issue_grouped_copies(dst_manager, copy_node, &sources, after).into_keys());
        }
        let parent_done = self.events.merge_events(done);
        let mut events = vec![parent_done];
        for (child, info) in &cnode.children {
            events.push(self.replay_composite_node(
                child,
                dst,
                dst_manager,
                dst_node,
                mask & info.open_fields,
                parent_done,
            ));
        }
        let children_done = self.events.merge_events(events);
        if cnode.reductions.is_empty() {
            return children_done;
        }
        self.flush_reductions(&cnode.reductions, dst, copy_node, mask, children_done)
    }

    /// Replay a composite snapshot into an instance of another tree, pairing
    /// `src_mask` with `dst_mask`. Buffered reductions are applied after the
    /// instance data of their subtree.
    pub(crate) fn replay_composite_across(
        &self,
        cnode: &CompositeNode,
        src_mask: FieldMask,
        (dst, dst_node, dst_mask): (&Arc<PhysicalManager>, NodeId, FieldMask),
        precondition: Event,
    ) -> Event {
        let mut done = vec![precondition];
        for (view, _) in cnode.sources(src_mask) {
            if let Some(src) = view.manager() {
                done.push(self.issue_across_copy(
                    CopyKind::Copy,
                    (src, cnode.node, src_mask),
                    (dst, dst_node, dst_mask),
                    precondition,
                ));
            }
        }
        let parent_done = self.events.merge_events(done);
        let mut events = vec![parent_done];
        for (child, info) in &cnode.children {
            if info.open_fields.intersects(src_mask) {
                events.push(self.replay_composite_across(child, src_mask, (dst, dst_node, dst_mask), parent_done));
            }
        }
        let children_done = self.events.merge_events(events);
        let fold = matches!(dst.kind, ManagerKind::FoldReduction(_));
        let mut reduced = vec![children_done];
        for (view, fields) in &cnode.reductions {
            let ViewKind::Reduction(src) = &view.kind else {
                continue;
            };
            let Some(redop) = src.kind.redop() else {
                continue;
            };
            if !fields.intersects(src_mask) {
                continue;
            }
            trace!(node = %cnode.node, reduction = %src.did, %redop, "replaying reduction across trees");
            reduced.push(self.issue_across_copy(
                CopyKind::Reduce { redop, fold },
                (src, cnode.node, src_mask),
                (dst, dst_node, dst_mask),
                children_done,
            ));
        }
        self.events.merge_events(reduced)
    }
}

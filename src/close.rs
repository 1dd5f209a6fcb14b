//! Physical closes: folding the data of open children back into a node.
//!
//! A close writes the dirty fields of the closed subtrees into one target
//! instance at the nearest region (or captures them in a composite view) and
//! invalidates the closed children. Children closed with leave-open stay
//! open and see the target as their only valid view.

mod composite;

pub use crate::close::composite::{CompositeNode, CompositeView};
use crate::{
    event::Event,
    forest::RegionTreeForest,
    mask::FieldMask,
    operation::CloseOp,
    physical::{CloseTarget, InstanceRef, MappingDecision, MappingError},
    sync::{Arc, Ordering},
    tree::NodeId,
    types::{Color, ContextId, LogicalRegion, FieldId},
    view::{LogicalView, ManagerKind},
};
use tracing::{debug, warn};

/// What a physical close did.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    /// Event after which the closed data is in the target.
    pub event: Event,
    /// Copies issued by the close.
    pub copies_issued: usize,
    /// View the data was closed into; `None` when nothing was dirty.
    pub target: Option<Arc<LogicalView>>,
    /// Whether `target` is a composite view.
    pub composite: bool,
    /// Children that stayed open.
    pub left_open: Vec<Color>,
}

impl CloseOutcome {
    fn noop(left_open: Vec<Color>) -> Self {
        Self {
            event: Event::NO_EVENT,
            copies_issued: 0,
            target: None,
            composite: false,
            left_open,
        }
    }
}

impl RegionTreeForest {
    /// Perform the physical side of a close inserted by the logical
    /// analysis.
    ///
    /// # Errors
    /// `StateBusy` if the node is held, `NoValidMemory` if no target fits.
    pub fn perform_close_operation(
        &self,
        ctx: ContextId,
        close: &CloseOp,
        decision: &MappingDecision,
    ) -> Result<CloseOutcome, MappingError> {
        let _hold = self.hold_state(ctx, close.node, true)?;
        let outcome = self.close_children(
            ctx,
            close.node,
            &close.targets,
            &close.leave_open,
            CloseTarget::Select(decision),
        )?;
        debug!(close = %close.id, node = %close.node, copies = outcome.copies_issued, "performed close");
        Ok(outcome)
    }

    /// Close every child of `node` open on `mask`, except that the
    /// `leave_open` children stay open after the write-back.
    ///
    /// # Errors
    /// `StateBusy` if the node is held, `NoValidMemory` if no target fits.
    pub fn close_physical_node(
        &self,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
        leave_open: &[Color],
        decision: &MappingDecision,
    ) -> Result<CloseOutcome, MappingError> {
        let _hold = self.hold_state(ctx, node, true)?;
        let children = self.physical_open_children(ctx, node);
        let children: Vec<_> = children
            .into_iter()
            .filter_map(|(color, fields)| {
                let fields = fields & mask;
                (!fields.is_empty()).then_some((color, fields))
            })
            .collect();
        self.close_children(ctx, node, &children, leave_open, CloseTarget::Select(decision))
    }

    /// Write everything below `region` in `ctx` back into `target` (a
    /// mapping of the region in the enclosing context).
    ///
    /// # Errors
    /// On unknown regions or fields.
    pub fn close_physical_context(
        &self,
        ctx: ContextId,
        region: LogicalRegion,
        fields: &[FieldId],
        target: &InstanceRef,
    ) -> Result<Event, MappingError> {
        let node = self.region_node(region)?;
        let mask = self.shape.get_field_mask(region.field_space, fields)?;
        let _hold = self.hold_state(ctx, node, true)?;
        let view = self.view_for(target.view(), node);
        let children: Vec<_> = self
            .physical_open_children(ctx, node)
            .into_iter()
            .filter_map(|(color, fields)| {
                let fields = fields & mask;
                (!fields.is_empty()).then_some((color, fields))
            })
            .collect();
        let outcome = self.close_children(ctx, node, &children, &[], CloseTarget::Explicit(&view))?;
        let valid = self.find_valid_views(ctx, node, mask);
        let local = self.issue_update_copies(&view, node, mask, &valid, outcome.event);
        Ok(self.events.merge_events([outcome.event, local]))
    }

    /// Close `children` of `node`, writing their dirty data into `target`.
    pub(crate) fn close_children(
        &self,
        ctx: ContextId,
        node_id: NodeId,
        children: &[(Color, FieldMask)],
        leave_open: &[Color],
        target: CloseTarget<'_>,
    ) -> Result<CloseOutcome, MappingError> {
        let node = self.node(node_id);
        let copies_before = self.issued_copies.load(Ordering::Acquire);
        let mut dirty = FieldMask::EMPTY;
        let mut resolved = Vec::with_capacity(children.len());
        for &(color, fields) in children {
            match node.child(color) {
                Some(child) => {
                    dirty |= self.subtree_dirty(ctx, child, fields);
                    resolved.push((color, child, fields));
                }
                None => node.physical().get_mut(ctx).close_child(color, fields),
            }
        }
        let left_open: Vec<Color> = resolved
            .iter()
            .map(|(color, _, _)| *color)
            .filter(|color| leave_open.contains(color))
            .collect();
        if dirty.is_empty() {
            for &(color, child, fields) in &resolved {
                if !leave_open.contains(&color) {
                    self.invalidate_subtree(ctx, child, fields);
                    node.physical().get_mut(ctx).close_child(color, fields);
                }
            }
            return Ok(CloseOutcome::noop(left_open));
        }
        let region = self.region_of(node_id);
        let composite = matches!(target, CloseTarget::Select(decision) if decision.create_composite);
        if composite {
            if self.composite_close_legal(node_id, &resolved) {
                return Ok(self.perform_composite_close(ctx, node_id, &resolved, dirty, leave_open));
            }
            warn!(node = %node_id, "composite close needs complete partitions; closing to an instance");
        }
        let (target, ready) = match target {
            CloseTarget::Select(decision) => self.select_close_target(ctx, region, dirty, decision)?,
            CloseTarget::Explicit(view) => {
                let view = self.view_for(view, region);
                let valid = self.find_valid_views(ctx, region, dirty);
                let ready = self.issue_update_copies(&view, region, dirty, &valid, Event::NO_EVENT);
                (view, ready)
            }
        };
        let mut events = vec![ready];
        for &(_, child, fields) in &resolved {
            self.close_subtree_into(ctx, child, fields & dirty, &target, &mut events);
        }
        let event = self.events.merge_events(events);
        self.update_valid_views(ctx, region, dirty, &target, true);
        for &(color, child, fields) in &resolved {
            if leave_open.contains(&color) {
                self.reset_left_open(ctx, child, fields, &target);
            } else {
                self.invalidate_subtree(ctx, child, fields);
                node.physical().get_mut(ctx).close_child(color, fields);
            }
        }
        let copies_issued = self.issued_copies.load(Ordering::Acquire) - copies_before;
        debug!(node = %node_id, target = %target.did, %dirty, copies_issued, "closed children");
        Ok(CloseOutcome {
            event,
            copies_issued,
            target: Some(target),
            composite: false,
            left_open,
        })
    }

    /// Pick the instance a close at `region` writes into and bring it up
    /// to date with the data valid at the region itself.
    pub(crate) fn select_close_target(
        &self,
        ctx: ContextId,
        region: NodeId,
        mask: FieldMask,
        decision: &MappingDecision,
    ) -> Result<(Arc<LogicalView>, Event), MappingError> {
        let valid = self.find_valid_views(ctx, region, mask);
        let bf = decision.blocking_factor;
        for &memory in &decision.memory_ranking {
            let existing = valid
                .iter()
                .filter(|(view, _)| {
                    view.is_materialized()
                        && view.memory() == Some(memory)
                        && view.manager().is_some_and(|m| m.layout.matches(mask, bf))
                })
                .max_by_key(|(_, fields)| (*fields & mask).count())
                .map(|(view, _)| Arc::clone(view));
            let view = match existing {
                Some(view) => view,
                None => match self.create_instance_at(region, mask, memory, bf, ManagerKind::Instance)? {
                    Some(manager) => self.materialized_view(&manager, region),
                    None => continue,
                },
            };
            let ready = self.issue_update_copies(&view, region, mask, &valid, Event::NO_EVENT);
            return Ok((view, ready));
        }
        warn!(node = %region, ranking = ?decision.memory_ranking, "no memory can host the close target");
        Err(MappingError::NoValidMemory {
            ranking: decision.memory_ranking.clone(),
        })
    }

    /// Copy the dirty data of the subtree at `node` into `target`, parents
    /// before children.
    fn close_subtree_into(
        &self,
        ctx: ContextId,
        node_id: NodeId,
        mask: FieldMask,
        target: &Arc<LogicalView>,
        events: &mut Vec<Event>,
    ) {
        if mask.is_empty() {
            return;
        }
        let node = self.node(node_id);
        let (views, dirty, reductions, open) = node
            .physical()
            .get(ctx)
            .map(|state| {
                let dirty = state.dirty_mask & mask;
                (
                    state.views_on(dirty),
                    dirty,
                    state.reductions_on(mask),
                    state.open_children_on(mask),
                )
            })
            .unwrap_or_default();
        if node.is_region() && !dirty.is_empty() {
            let dst = self.view_for(target, node_id);
            events.push(self.issue_update_copies(&dst, node_id, dirty, &views, Event::NO_EVENT));
        }
        for (color, fields) in open {
            if let Some(child) = node.child(color) {
                self.close_subtree_into(ctx, child, fields, target, events);
            }
        }
        if !reductions.is_empty() {
            let dst = self.view_for(target, node_id);
            let fields = reductions.iter().fold(FieldMask::EMPTY, |acc, (_, f)| acc | *f);
            events.push(self.flush_reductions(&reductions, &dst, node_id, fields, Event::NO_EVENT));
        }
    }

    /// A leave-open child keeps only the close target as valid data.
    fn reset_left_open(&self, ctx: ContextId, child: NodeId, mask: FieldMask, target: &Arc<LogicalView>) {
        self.invalidate_subtree(ctx, child, mask);
        if self.node(child).is_region() {
            let view = self.view_for(target, child);
            self.update_valid_views(ctx, child, mask, &view, false);
        }
    }

    /// `view`'s instance seen from `node`; composite views are shared as-is.
    pub(crate) fn view_for(&self, view: &Arc<LogicalView>, node: NodeId) -> Arc<LogicalView> {
        match view.manager() {
            Some(manager) if view.node != node => self.materialized_view(manager, node),
            _ => Arc::clone(view),
        }
    }
}

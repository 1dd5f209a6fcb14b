//! Logical dependence analysis.
//!
//! Every requirement walks its region tree path from the parent region to
//! its target. At each node, children that would conflict with the user are
//! closed first, the next child is opened in the user's mode, and the user is
//! checked against the users recorded at that node. Users are only recorded
//! at their destination. Fields on which every current user was found to be
//! dependent start a new epoch, so older users there are never checked again.

mod close;
mod destroy;
pub(crate) mod state;

pub use crate::logical::state::{LogicalUser, OpenState};
use crate::{
    forest::RegionTreeForest,
    logical::{
        close::{plan_closes, ChildClose},
        state::LogicalState,
    },
    mask::FieldMask,
    operation::{CloseOp, Operation},
    shape::ShapeError,
    sync::{self, Mutex},
    tree::NodeId,
    types::{
        check_dependence_type, Color, ContextId, DependenceType, FieldId, IndexMap, LogicalRegion, OperationId,
        RegionRequirement, RegionUsage,
    },
    utils::SplitAtHalf,
};
use tracing::{debug, trace};

/// One requirement of one operation, queued for analysis.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisRequest<'a> {
    /// Operation owning the requirement.
    pub op: &'a dyn Operation,
    /// Index of the requirement within the operation.
    pub idx: u32,
    /// The requirement.
    pub req: &'a RegionRequirement,
}

/// Requirements of one context, in program order.
#[derive(Debug, Clone)]
pub struct ContextBatch<'a> {
    /// Context the requests belong to.
    pub ctx: ContextId,
    /// Requests, analyzed sequentially.
    pub requests: Vec<AnalysisRequest<'a>>,
}

impl RegionTreeForest {
    /// Compute the mapping dependences of requirement `idx` of `op` and
    /// report them (and any closes inserted on the way) to `op`.
    ///
    /// # Errors
    /// If the requirement names unknown regions or fields.
    pub fn perform_dependence_analysis(
        &self,
        ctx: ContextId,
        op: &dyn Operation,
        idx: u32,
        req: &RegionRequirement,
    ) -> Result<(), ShapeError> {
        let path = self.requirement_path(req)?;
        let mask = self.requirement_mask(req)?;
        let user = LogicalUser {
            op: op.unique_id(),
            idx,
            usage: req.usage,
            mask,
            timeout: self.config.logical_user_timeout,
        };
        let mut edges = IndexMap::<OperationId, DependenceType>::default();
        for (depth, &node_id) in path.nodes().iter().enumerate() {
            let node = self.node(node_id);
            let next_child = path.next_color(depth);
            let closes = {
                let table = node.logical();
                table
                    .get(ctx)
                    .map(|state| {
                        plan_closes(state, &req.usage, mask, next_child, |lhs, rhs| {
                            self.children_disjoint(&node, lhs, rhs)
                        })
                    })
                    .unwrap_or_default()
            };
            if !closes.is_empty() {
                let close = self.perform_logical_close(ctx, &node, &closes);
                op.register_close(&close);
            }
            let mut table = node.logical();
            let state = table.get_mut(ctx);
            if let Some(child) = next_child {
                state.open_child(child, mask, OpenState::requested_by(&req.usage));
            }
            let dominated = self.check_users(&mut state.curr_epoch_users, &user, mask, &mut edges);
            let rest = mask - dominated;
            if !rest.is_empty() {
                self.check_users(&mut state.prev_epoch_users, &user, rest, &mut edges);
            }
            if next_child.is_none() {
                state.advance_epoch(dominated);
                state.curr_epoch_users.push(user.clone());
            }
        }
        trace!(op = %user.op, idx, edges = edges.len(), "dependence analysis done");
        for (target, kind) in edges {
            op.register_dependence(target, kind);
        }
        Ok(())
    }

    /// Analyze several contexts in parallel; each batch stays sequential.
    ///
    /// A batch stops at its first failing request.
    ///
    /// # Errors
    /// The first error any batch hit.
    pub fn analyze_contexts(&self, batches: &[ContextBatch<'_>]) -> Result<(), ShapeError> {
        let first_error = Mutex::new(None);
        self.analyze_batches(batches, &first_error);
        first_error.lock().take().map_or(Ok(()), Err)
    }

    fn analyze_batches(&self, batches: &[ContextBatch<'_>], first_error: &Mutex<Option<ShapeError>>) {
        match batches {
            [] => {}
            [batch] => {
                for request in &batch.requests {
                    if let Err(error) =
                        self.perform_dependence_analysis(batch.ctx, request.op, request.idx, request.req)
                    {
                        first_error.lock().get_or_insert(error);
                        break;
                    }
                }
            }
            _ => {
                let (lhs, rhs) = batches.split_at_half();
                sync::join(
                    || self.analyze_batches(lhs, first_error),
                    || self.analyze_batches(rhs, first_error),
                );
            }
        }
    }

    /// Close every child of `node` open on `mask`, reporting the close and a
    /// dependence on it to `op`.
    pub fn close_logical_node(
        &self,
        ctx: ContextId,
        op: &dyn Operation,
        node: NodeId,
        mask: FieldMask,
    ) -> Option<CloseOp> {
        let node = self.node(node);
        let closes: Vec<ChildClose> = {
            let table = node.logical();
            table
                .get(ctx)
                .map(|state| state.open_children_on(mask))
                .unwrap_or_default()
                .into_iter()
                .map(|(color, mask)| ChildClose {
                    color,
                    mask,
                    leave_open: false,
                })
                .collect()
        };
        if closes.is_empty() {
            return None;
        }
        let close = self.perform_logical_close(ctx, &node, &closes);
        op.register_close(&close);
        op.register_dependence(close.id, DependenceType::TrueDependence);
        Some(close)
    }

    /// Order `op` after every user of `region` and its subtree, then record
    /// it as the sole current user of the region.
    ///
    /// # Errors
    /// If the region is unknown.
    pub fn perform_fence_analysis(
        &self,
        ctx: ContextId,
        op: &dyn Operation,
        region: LogicalRegion,
    ) -> Result<(), ShapeError> {
        let node = self.region_node(region)?;
        let all = FieldMask::from_bits(u128::MAX);
        let edges = self.fence_edges(ctx, op.unique_id(), node, all);
        {
            let target = self.node(node);
            let mut table = target.logical();
            let state = table.get_mut(ctx);
            state.prev_epoch_users.clear();
            state.curr_epoch_users.clear();
            state.curr_epoch_users.push(LogicalUser {
                op: op.unique_id(),
                idx: 0,
                usage: RegionUsage::read_write(),
                mask: all,
                timeout: self.config.logical_user_timeout,
            });
        }
        debug!(op = %op.unique_id(), %region, edges = edges.len(), "fence analysis");
        for (target, kind) in edges {
            op.register_dependence(target, kind);
        }
        Ok(())
    }

    /// Order `op` after every user of `region` and drop the region's logical
    /// state in `ctx`.
    ///
    /// # Errors
    /// If the region is unknown.
    pub fn perform_deletion_analysis(
        &self,
        ctx: ContextId,
        op: &dyn Operation,
        region: LogicalRegion,
    ) -> Result<(), ShapeError> {
        let node = self.region_node(region)?;
        let edges = self.fence_edges(ctx, op.unique_id(), node, FieldMask::from_bits(u128::MAX));
        self.invalidate_logical_subtree(ctx, node);
        if let Some(parent) = self.node(node).parent {
            let color = self.node(node).color;
            let parent = self.node(parent);
            parent.logical().get_mut(ctx).close_child(color, FieldMask::from_bits(u128::MAX));
        }
        debug!(op = %op.unique_id(), %region, edges = edges.len(), "deletion analysis");
        for (target, kind) in edges {
            op.register_dependence(target, kind);
        }
        Ok(())
    }

    /// Reset the logical state of `region`'s subtree in `ctx`.
    ///
    /// # Errors
    /// If the region is unknown.
    pub fn initialize_logical_context(&self, ctx: ContextId, region: LogicalRegion) -> Result<(), ShapeError> {
        let node = self.region_node(region)?;
        self.invalidate_logical_subtree(ctx, node);
        Ok(())
    }

    /// Drop the logical state of `region`'s subtree in `ctx`.
    ///
    /// # Errors
    /// If the region is unknown.
    pub fn invalidate_logical_context(&self, ctx: ContextId, region: LogicalRegion) -> Result<(), ShapeError> {
        self.initialize_logical_context(ctx, region)
    }

    /// Let the application manage coherence of `fields` of `region` in
    /// `ctx`. Until released, simultaneous requirements on those fields at
    /// or below `region` may map to any instance.
    ///
    /// # Errors
    /// If the region or a field is unknown.
    pub fn acquire_user_coherence(
        &self,
        ctx: ContextId,
        region: LogicalRegion,
        fields: &[FieldId],
    ) -> Result<(), ShapeError> {
        let node = self.region_node(region)?;
        let mask = self.shape.get_field_mask(region.field_space, fields)?;
        self.node(node).logical().get_mut(ctx).user_coherence |= mask;
        debug!(%ctx, %region, %mask, "acquired user coherence");
        Ok(())
    }

    /// Hand coherence of `fields` of `region` in `ctx` back to the runtime.
    ///
    /// # Errors
    /// If the region or a field is unknown.
    pub fn release_user_coherence(
        &self,
        ctx: ContextId,
        region: LogicalRegion,
        fields: &[FieldId],
    ) -> Result<(), ShapeError> {
        let node = self.region_node(region)?;
        let mask = self.shape.get_field_mask(region.field_space, fields)?;
        self.node(node).logical().get_mut(ctx).user_coherence -= mask;
        debug!(%ctx, %region, %mask, "released user coherence");
        Ok(())
    }

    /// Fields of `req` whose coherence the application holds at its target
    /// or any region above it.
    ///
    /// # Errors
    /// If the requirement names unknown regions or fields.
    pub fn user_coherence(&self, ctx: ContextId, req: &RegionRequirement) -> Result<FieldMask, ShapeError> {
        let path = self.requirement_path(req)?;
        let mask = self.requirement_mask(req)?;
        Ok(self.user_coherence_at(ctx, path.target(), mask))
    }

    pub(crate) fn user_coherence_at(&self, ctx: ContextId, node: NodeId, mask: FieldMask) -> FieldMask {
        let mut acquired = FieldMask::EMPTY;
        let mut current = Some(node);
        while let Some(id) = current {
            let level = self.node(id);
            if let Some(state) = level.logical().get(ctx) {
                acquired |= state.user_coherence;
            }
            current = level.parent;
        }
        acquired & mask
    }

    /// Users recorded at `node` in `ctx`, previous epoch first.
    #[must_use]
    pub fn logical_users(&self, ctx: ContextId, node: NodeId) -> Vec<LogicalUser> {
        self.node(node)
            .logical()
            .get(ctx)
            .map(|state| state.users_on(FieldMask::from_bits(u128::MAX)).cloned().collect())
            .unwrap_or_default()
    }

    /// Open children of `node` in `ctx` with their fields and modes.
    #[must_use]
    pub fn logical_open_children(&self, ctx: ContextId, node: NodeId) -> Vec<(Color, FieldMask, OpenState)> {
        let node = self.node(node);
        let table = node.logical();
        let Some(state) = table.get(ctx) else {
            return Vec::new();
        };
        state
            .field_states
            .iter()
            .flat_map(|run| {
                run.open_children
                    .iter()
                    .map(move |(&color, &fields)| (color, fields, run.open_state))
            })
            .collect()
    }

    /// Check `user` against `users` on `mask`, recording ordering edges.
    ///
    /// Returns the fields on which every overlapping user was dependent.
    pub(crate) fn check_users(
        &self,
        users: &mut Vec<LogicalUser>,
        user: &LogicalUser,
        mask: FieldMask,
        edges: &mut IndexMap<OperationId, DependenceType>,
    ) -> FieldMask {
        let mut dependent = FieldMask::EMPTY;
        let mut independent = FieldMask::EMPTY;
        users.retain_mut(|prev| {
            let overlap = prev.mask & mask;
            if overlap.is_empty() {
                return self.age_user(prev);
            }
            if prev.op == user.op {
                independent |= overlap;
                return true;
            }
            if self.is_committed(prev.op) {
                return false;
            }
            let kind = check_dependence_type(&prev.usage, &user.usage);
            if kind.orders() {
                edges.entry(prev.op).or_insert(kind);
                dependent |= overlap;
                true
            } else {
                independent |= overlap;
                self.age_user(prev)
            }
        });
        dependent - independent
    }

    /// Count one skipped check; once the timeout runs out, committed users
    /// are dropped and the others get a fresh timeout.
    fn age_user(&self, user: &mut LogicalUser) -> bool {
        if user.timeout > 1 {
            user.timeout -= 1;
            return true;
        }
        if self.is_committed(user.op) {
            trace!(op = %user.op, "pruned committed logical user");
            return false;
        }
        user.timeout = self.config.logical_user_timeout;
        true
    }

    /// Edges ordering `op` after every user of `mask` above, at or below
    /// `node` in `ctx`.
    pub(crate) fn fence_edges(
        &self,
        ctx: ContextId,
        op: OperationId,
        node: NodeId,
        mask: FieldMask,
    ) -> IndexMap<OperationId, DependenceType> {
        let mut edges = IndexMap::default();
        let mut ancestor = self.node(node).parent;
        while let Some(id) = ancestor {
            let current = self.node(id);
            if let Some(state) = current.logical().get(ctx) {
                self.collect_fence_edges(op, state, mask, &mut edges);
            }
            ancestor = current.parent;
        }
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let current = self.node(id);
            if let Some(state) = current.logical().get(ctx) {
                self.collect_fence_edges(op, state, mask, &mut edges);
            }
            stack.extend(current.known_children().into_iter().map(|(_, child)| child));
        }
        edges
    }

    fn collect_fence_edges(
        &self,
        op: OperationId,
        state: &LogicalState,
        mask: FieldMask,
        edges: &mut IndexMap<OperationId, DependenceType>,
    ) {
        for user in state.users_on(mask) {
            if user.op != op && !self.is_committed(user.op) {
                let kind = check_dependence_type(&user.usage, &RegionUsage::read_write());
                edges.entry(user.op).or_insert(kind);
            }
        }
    }

    fn invalidate_logical_subtree(&self, ctx: ContextId, node: NodeId) {
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let current = self.node(id);
            drop(current.logical().take(ctx));
            stack.extend(current.known_children().into_iter().map(|(_, child)| child));
        }
    }
}

use crate::{
    forest::RegionTreeForest,
    logical::state::{LogicalState, LogicalUser, OpenState},
    mask::FieldMask,
    operation::CloseOp,
    tree::{NodeId, RegionTreeNode},
    types::{check_dependence_type, Color, ContextId, DependenceType, IndexMap, OperationId, RegionUsage},
};
use tracing::debug;

/// A child that must be closed before a user may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildClose {
    pub(crate) color: Color,
    pub(crate) mask: FieldMask,
    pub(crate) leave_open: bool,
}

/// Children of a node that conflict with a user heading to `next_child`
/// (or arriving at the node when `next_child` is `None`).
pub(crate) fn plan_closes(
    state: &LogicalState,
    usage: &RegionUsage,
    mask: FieldMask,
    next_child: Option<Color>,
    disjoint: impl Fn(Color, Color) -> bool,
) -> Vec<ChildClose> {
    let mut planned = IndexMap::<Color, (FieldMask, bool)>::default();
    let mut plan = |color: Color, fields: FieldMask, leave_open: bool| {
        let entry = planned.entry(color).or_insert((FieldMask::EMPTY, true));
        entry.0 |= fields;
        entry.1 &= leave_open;
    };
    // Siblings disjoint from the next child never interfere with it.
    let bypasses = |color: Color| next_child.is_some_and(|next| next == color || disjoint(color, next));
    for run in &state.field_states {
        let overlap = run.valid_fields & mask;
        if overlap.is_empty() {
            continue;
        }
        match run.open_state {
            OpenState::ReadOnly => {
                if usage.is_read_only() {
                    continue;
                }
                for (&color, &fields) in &run.open_children {
                    let fields = fields & overlap;
                    if !fields.is_empty() && !bypasses(color) {
                        plan(color, fields, false);
                    }
                }
            }
            OpenState::ReadWrite => {
                for (&color, &fields) in &run.open_children {
                    let fields = fields & overlap;
                    if !fields.is_empty() && !bypasses(color) {
                        plan(color, fields, usage.is_read_only());
                    }
                }
            }
            OpenState::SingleReduce(redop) | OpenState::MultiReduce(redop) => {
                if usage.redop() == Some(redop) {
                    continue;
                }
                let sole = matches!(run.open_state, OpenState::SingleReduce(_));
                for (&color, &fields) in &run.open_children {
                    let fields = fields & overlap;
                    if fields.is_empty() || (sole && next_child == Some(color)) {
                        continue;
                    }
                    plan(color, fields, false);
                }
            }
        }
    }
    planned
        .into_iter()
        .map(|(color, (mask, leave_open))| ChildClose {
            color,
            mask,
            leave_open,
        })
        .collect()
}

impl RegionTreeForest {
    /// Close `closes` below `node` and register the close as a user there.
    pub(crate) fn perform_logical_close(
        &self,
        ctx: ContextId,
        node: &RegionTreeNode,
        closes: &[ChildClose],
    ) -> CloseOp {
        let mut dependences = IndexMap::<OperationId, DependenceType>::default();
        let mut closing_mask = FieldMask::EMPTY;
        let close_usage = RegionUsage::read_write();
        for close in closes {
            closing_mask |= close.mask;
            let Some(child) = node.child(close.color) else {
                continue;
            };
            for user in self.take_subtree_users(ctx, child, close.mask) {
                let kind = check_dependence_type(&user.usage, &close_usage);
                if kind.orders() && !self.is_committed(user.op) {
                    dependences.entry(user.op).or_insert(kind);
                }
            }
        }
        let close_user = LogicalUser {
            op: self.next_close_id(),
            idx: 0,
            usage: close_usage,
            mask: closing_mask,
            timeout: self.config.logical_user_timeout,
        };
        {
            let mut table = node.logical();
            let state = table.get_mut(ctx);
            for close in closes {
                state.close_child(close.color, close.mask);
                if close.leave_open {
                    state.open_child(close.color, close.mask, OpenState::ReadOnly);
                }
            }
            let dominated =
                self.check_users(&mut state.curr_epoch_users, &close_user, closing_mask, &mut dependences);
            let rest = closing_mask - dominated;
            if !rest.is_empty() {
                self.check_users(&mut state.prev_epoch_users, &close_user, rest, &mut dependences);
            }
            state.advance_epoch(dominated);
            state.curr_epoch_users.push(close_user.clone());
        }
        let close = CloseOp {
            id: close_user.op,
            node: node.id,
            closing_mask,
            targets: closes.iter().map(|c| (c.color, c.mask)).collect(),
            leave_open: closes.iter().filter(|c| c.leave_open).map(|c| c.color).collect(),
            dependences: dependences.into_iter().collect(),
        };
        debug!(
            close = %close.id,
            node = %close.node,
            mask = %closing_mask,
            children = close.targets.len(),
            "inserted logical close"
        );
        close
    }

    /// Remove every user and open child on `mask` from the subtree rooted at
    /// `node`, returning the removed users.
    pub(crate) fn take_subtree_users(&self, ctx: ContextId, node: NodeId, mask: FieldMask) -> Vec<LogicalUser> {
        let node = self.node(node);
        let (mut users, closed) = {
            let mut table = node.logical();
            let state = table.get_mut(ctx);
            (state.take_users(mask), state.close_all(mask))
        };
        for (color, fields) in closed {
            if let Some(child) = node.child(color) {
                users.extend(self.take_subtree_users(ctx, child, fields));
            }
        }
        users
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::types::ReductionOpId;

    fn mask(indices: &[usize]) -> FieldMask {
        indices.iter().copied().collect()
    }

    fn never_disjoint(_: Color, _: Color) -> bool {
        false
    }

    #[test]
    fn readers_keep_read_only_children_open() {
        let mut state = LogicalState::default();
        state.open_child(0, mask(&[0]), OpenState::ReadOnly);
        let closes = plan_closes(&state, &RegionUsage::read_only(), mask(&[0]), Some(1), never_disjoint);
        assert!(closes.is_empty());
        let closes = plan_closes(&state, &RegionUsage::read_write(), mask(&[0]), Some(1), never_disjoint);
        assert_eq!(closes, vec![ChildClose {
            color: 0,
            mask: mask(&[0]),
            leave_open: false
        }]);
    }

    #[test]
    fn disjoint_siblings_are_bypassed() {
        let mut state = LogicalState::default();
        state.open_child(0, mask(&[0]), OpenState::ReadWrite);
        let closes = plan_closes(&state, &RegionUsage::read_write(), mask(&[0]), Some(1), |_, _| true);
        assert!(closes.is_empty());
        let closes = plan_closes(&state, &RegionUsage::read_write(), mask(&[0]), None, |_, _| true);
        assert_eq!(closes.len(), 1);
    }

    #[test]
    fn readers_arriving_over_writers_leave_them_open() {
        let mut state = LogicalState::default();
        state.open_child(2, mask(&[0, 1]), OpenState::ReadWrite);
        let closes = plan_closes(&state, &RegionUsage::read_only(), mask(&[1]), None, never_disjoint);
        assert_eq!(closes, vec![ChildClose {
            color: 2,
            mask: mask(&[1]),
            leave_open: true
        }]);
    }

    #[test]
    fn matching_reductions_stay_open() {
        let redop = ReductionOpId(7);
        let reduce = RegionUsage::new(
            crate::types::PrivilegeMode::Reduce(redop),
            crate::types::CoherenceProperty::Exclusive,
        );
        let mut state = LogicalState::default();
        state.open_child(0, mask(&[0]), OpenState::SingleReduce(redop));
        assert!(plan_closes(&state, &reduce, mask(&[0]), Some(1), never_disjoint).is_empty());
        assert!(plan_closes(&state, &RegionUsage::read_write(), mask(&[0]), Some(0), never_disjoint).is_empty());
        assert_eq!(
            plan_closes(&state, &RegionUsage::read_only(), mask(&[0]), Some(1), never_disjoint).len(),
            1
        );
    }
}

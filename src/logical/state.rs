use crate::{
    mask::FieldMask,
    types::{Color, IndexMap, OperationId, ReductionOpId, RegionUsage},
};
use derive_more::Display;

/// Mode in which a set of children is open for some fields.
///
/// Fields without any open child are closed; closed fields have no entry.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenState {
    /// Children only read.
    ReadOnly,
    /// At most one non-disjoint child may write.
    ReadWrite,
    /// Exactly one child reduces with this operator.
    #[display("SingleReduce({_0})")]
    SingleReduce(ReductionOpId),
    /// Several children reduce with the same operator.
    #[display("MultiReduce({_0})")]
    MultiReduce(ReductionOpId),
}

impl OpenState {
    /// Mode requested by a user passing through a node.
    pub(crate) fn requested_by(usage: &RegionUsage) -> Self {
        if let Some(redop) = usage.redop() {
            Self::SingleReduce(redop)
        } else if usage.is_read_only() {
            Self::ReadOnly
        } else {
            Self::ReadWrite
        }
    }

    pub(crate) fn redop(self) -> Option<ReductionOpId> {
        match self {
            Self::SingleReduce(redop) | Self::MultiReduce(redop) => Some(redop),
            Self::ReadOnly | Self::ReadWrite => None,
        }
    }

    fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::ReadOnly, Self::ReadOnly) => Self::ReadOnly,
            (lhs, rhs) if lhs.redop().is_some() && lhs.redop() == rhs.redop() => lhs,
            _ => Self::ReadWrite,
        }
    }
}

/// Children open in one mode over a set of fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldState {
    pub(crate) valid_fields: FieldMask,
    pub(crate) open_state: OpenState,
    pub(crate) open_children: IndexMap<Color, FieldMask>,
}

/// A logical user recorded at the node it targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalUser {
    /// The operation.
    pub op: OperationId,
    /// Requirement index within the operation.
    pub idx: u32,
    /// How the requirement accesses its fields.
    pub usage: RegionUsage,
    /// Fields still attributed to this user.
    pub mask: FieldMask,
    pub(crate) timeout: u32,
}

/// Logical state of one node in one context.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogicalState {
    pub(crate) field_states: Vec<FieldState>,
    pub(crate) curr_epoch_users: Vec<LogicalUser>,
    pub(crate) prev_epoch_users: Vec<LogicalUser>,
    /// Fields whose coherence the application manages itself.
    pub(crate) user_coherence: FieldMask,
}

impl LogicalState {
    /// Open children with the fields they are open for, in every mode.
    pub(crate) fn open_children(&self) -> IndexMap<Color, FieldMask> {
        let mut result = IndexMap::<Color, FieldMask>::default();
        for state in &self.field_states {
            for (&color, &mask) in &state.open_children {
                *result.entry(color).or_default() |= mask;
            }
        }
        result
    }

    /// Open children restricted to `mask`.
    pub(crate) fn open_children_on(&self, mask: FieldMask) -> IndexMap<Color, FieldMask> {
        let mut result = self.open_children();
        result.retain(|_, fields| {
            *fields &= mask;
            !fields.is_empty()
        });
        result
    }

    /// Stop tracking `child` as open on `mask`.
    pub(crate) fn close_child(&mut self, child: Color, mask: FieldMask) {
        for state in &mut self.field_states {
            if let Some(fields) = state.open_children.get_mut(&child) {
                *fields -= mask;
                if fields.is_empty() {
                    state.open_children.shift_remove(&child);
                }
            }
            state.valid_fields = state
                .open_children
                .values()
                .fold(FieldMask::EMPTY, |acc, fields| acc | *fields);
        }
        self.field_states.retain(|state| !state.valid_fields.is_empty());
    }

    /// Forget every open child on `mask`.
    pub(crate) fn close_all(&mut self, mask: FieldMask) -> IndexMap<Color, FieldMask> {
        let closed = self.open_children_on(mask);
        for (&color, &fields) in &closed {
            self.close_child(color, fields);
        }
        closed
    }

    /// Open `child` on `mask` in `requested` mode, folding every run that
    /// already covers some of those fields into one run.
    pub(crate) fn open_child(&mut self, child: Color, mask: FieldMask, requested: OpenState) {
        if mask.is_empty() {
            return;
        }
        let mut mode = requested;
        let mut children = IndexMap::<Color, FieldMask>::default();
        children.insert(child, mask);
        for state in &mut self.field_states {
            let overlap = state.valid_fields & mask;
            if overlap.is_empty() {
                continue;
            }
            mode = mode.combine(state.open_state);
            for (&color, fields) in &mut state.open_children {
                let moved = *fields & overlap;
                if !moved.is_empty() {
                    *children.entry(color).or_default() |= moved;
                    *fields -= moved;
                }
            }
            state.open_children.retain(|_, fields| !fields.is_empty());
            state.valid_fields -= overlap;
        }
        self.field_states.retain(|state| !state.valid_fields.is_empty());
        if let Some(redop) = mode.redop() {
            mode = if children.len() > 1 {
                OpenState::MultiReduce(redop)
            } else {
                OpenState::SingleReduce(redop)
            };
        }
        self.field_states.push(FieldState {
            valid_fields: mask,
            open_state: mode,
            open_children: children,
        });
    }

    /// Users of either epoch overlapping `mask`, in arrival order.
    pub(crate) fn users_on(&self, mask: FieldMask) -> impl Iterator<Item = &LogicalUser> {
        self.prev_epoch_users
            .iter()
            .chain(&self.curr_epoch_users)
            .filter(move |user| user.mask.intersects(mask))
    }

    /// Drop `mask` from every user, returning the operations that lost
    /// fields.
    pub(crate) fn take_users(&mut self, mask: FieldMask) -> Vec<LogicalUser> {
        let mut taken = Vec::new();
        for users in [&mut self.prev_epoch_users, &mut self.curr_epoch_users] {
            users.retain_mut(|user| {
                let overlap = user.mask & mask;
                if !overlap.is_empty() {
                    taken.push(LogicalUser {
                        mask: overlap,
                        ..user.clone()
                    });
                    user.mask -= overlap;
                }
                !user.mask.is_empty()
            });
        }
        taken
    }

    /// Start a new epoch on `dominated`: previous users there are no longer
    /// needed and current users become previous.
    pub(crate) fn advance_epoch(&mut self, dominated: FieldMask) {
        if dominated.is_empty() {
            return;
        }
        self.prev_epoch_users.retain_mut(|user| {
            user.mask -= dominated;
            !user.mask.is_empty()
        });
        let mut moved = Vec::new();
        self.curr_epoch_users.retain_mut(|user| {
            let overlap = user.mask & dominated;
            if !overlap.is_empty() {
                moved.push(LogicalUser {
                    mask: overlap,
                    ..user.clone()
                });
                user.mask -= overlap;
            }
            !user.mask.is_empty()
        });
        self.prev_epoch_users.extend(moved);
    }

    /// Forget users, open children and user coherence on `mask`. Returns the
    /// children that were open.
    pub(crate) fn invalidate(&mut self, mask: FieldMask) -> IndexMap<Color, FieldMask> {
        drop(self.take_users(mask));
        self.user_coherence -= mask;
        self.close_all(mask)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::types::ReductionOpId;

    fn mask(indices: &[usize]) -> FieldMask {
        indices.iter().copied().collect()
    }

    #[test]
    fn opening_folds_overlapping_runs() {
        let mut state = LogicalState::default();
        state.open_child(0, mask(&[0]), OpenState::ReadOnly);
        state.open_child(1, mask(&[0, 1]), OpenState::ReadOnly);
        assert_eq!(state.field_states.len(), 1);
        assert_eq!(state.field_states[0].open_state, OpenState::ReadOnly);
        state.open_child(1, mask(&[1]), OpenState::ReadWrite);
        let modes: Vec<_> = state.field_states.iter().map(|s| s.open_state).collect();
        assert!(modes.contains(&OpenState::ReadWrite));
        assert_eq!(state.open_children_on(mask(&[0, 1]))[&1], mask(&[0, 1]));
    }

    #[test]
    fn reductions_become_multi_with_a_second_child() {
        let redop = ReductionOpId(3);
        let mut state = LogicalState::default();
        state.open_child(0, mask(&[2]), OpenState::SingleReduce(redop));
        state.open_child(1, mask(&[2]), OpenState::SingleReduce(redop));
        assert_eq!(state.field_states[0].open_state, OpenState::MultiReduce(redop));
        state.close_child(0, mask(&[2]));
        assert_eq!(state.open_children().len(), 1);
    }

    #[test]
    fn epochs_move_dominated_users() {
        let mut state = LogicalState::default();
        let user = |op, fields: &[usize]| LogicalUser {
            op: OperationId(op),
            idx: 0,
            usage: RegionUsage::read_write(),
            mask: mask(fields),
            timeout: 1,
        };
        state.prev_epoch_users.push(user(1, &[0]));
        state.curr_epoch_users.push(user(2, &[0, 1]));
        state.advance_epoch(mask(&[0]));
        assert_eq!(state.prev_epoch_users, vec![user(2, &[0])]);
        assert_eq!(state.curr_epoch_users, vec![user(2, &[1])]);
        let taken = state.take_users(mask(&[1]));
        assert_eq!(taken.len(), 1);
        assert!(state.curr_epoch_users.is_empty());
    }

    #[test]
    fn invalidation_keeps_other_fields() {
        let mut state = LogicalState::default();
        state.open_child(0, mask(&[0, 1]), OpenState::ReadWrite);
        state.curr_epoch_users.push(LogicalUser {
            op: OperationId(4),
            idx: 0,
            usage: RegionUsage::read_only(),
            mask: mask(&[0, 1]),
            timeout: 1,
        });
        state.user_coherence = mask(&[0, 1]);
        let closed = state.invalidate(mask(&[1]));
        assert_eq!(closed[&0], mask(&[1]));
        assert_eq!(state.curr_epoch_users[0].mask, mask(&[0]));
        assert_eq!(state.user_coherence, mask(&[0]));
        assert_eq!(state.open_children()[&0], mask(&[0]));
    }
}

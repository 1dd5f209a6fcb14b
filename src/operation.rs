use crate::{
    mask::FieldMask,
    tree::NodeId,
    types::{Color, DependenceType, OperationId},
};
use core::fmt::Debug;

/// An operation submitted for dependence analysis.
///
/// The forest calls back into the operation to report every mapping
/// dependence it discovers and every close it had to insert in front of it.
/// Implementations must tolerate concurrent calls when several contexts are
/// analyzed in parallel.
pub trait Operation: Debug + Send + Sync {
    /// Identifier of the operation; never a close id.
    fn unique_id(&self) -> OperationId;

    /// `self` must not start before `target` under `kind`.
    fn register_dependence(&self, target: OperationId, kind: DependenceType);

    /// A close was inserted on the path to one of `self`'s requirements; the
    /// scheduler must run it (via `perform_close_operation`) before `self`
    /// maps.
    fn register_close(&self, close: &CloseOp) {
        let _ = close;
    }
}

/// A close inserted by the logical analysis.
///
/// Closing folds the state of open children back into `node` for
/// `closing_mask`. Children listed in `leave_open` stay open read-only after
/// the write-back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOp {
    /// Reserved identifier, distinct from every user operation.
    pub id: OperationId,
    /// Node whose children are being closed.
    pub node: NodeId,
    /// Fields folded back into `node`.
    pub closing_mask: FieldMask,
    /// Children being closed, with their closed fields.
    pub targets: Vec<(Color, FieldMask)>,
    /// Children that stay open (read-only) after the close.
    pub leave_open: Vec<Color>,
    /// Operations the close must wait for.
    pub dependences: Vec<(OperationId, DependenceType)>,
}

impl CloseOp {
    /// Whether the close waits on `op`.
    #[must_use]
    pub fn depends_on(&self, op: OperationId) -> bool {
        self.dependences.iter().any(|(target, _)| *target == op)
    }

    /// Colors of the closed children.
    pub fn closed_children(&self) -> impl Iterator<Item = Color> + '_ {
        self.targets.iter().map(|(color, _)| *color)
    }
}

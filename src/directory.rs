//! Directory of remote copies of physical state.
//!
//! For every context the owner remembers which address spaces were sent
//! which fields of which subtrees, and which of them may write. Entries are
//! kept per subtree: a send below an existing entry for the same space
//! widens that entry, and a send above existing entries absorbs them.

use crate::{
    forest::RegionTreeForest,
    mask::{FieldMask, NodeSet},
    sync::{Arc, Mutex},
    tree::NodeId,
    types::{AddressSpaceId, ContextId, IndexMap},
};
use derive_more::Display;
use tracing::debug;

/// What a remote space is allowed to do with state it was sent.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Read the state; other holders may keep theirs.
    Read,
    /// Modify the state; every other holder is invalidated first.
    Write,
}

/// Tells `target` to drop its copy of `mask` of the subtree at `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    /// Context of the state.
    pub ctx: ContextId,
    /// Address space whose copy is stale.
    pub target: AddressSpaceId,
    /// Root of the stale subtree.
    pub node: NodeId,
    /// Stale fields.
    pub mask: FieldMask,
}

/// Tree queries the directory needs.
pub(crate) trait TreeRelations {
    fn tree_root(&self, node: NodeId) -> NodeId;

    fn subtrees_intersect(&self, lhs: NodeId, rhs: NodeId) -> bool;

    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool;
}

impl TreeRelations for RegionTreeForest {
    fn tree_root(&self, node: NodeId) -> NodeId {
        self.root_of(node)
    }

    fn subtrees_intersect(&self, lhs: NodeId, rhs: NodeId) -> bool {
        self.nodes_intersect(lhs, rhs)
    }

    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.is_ancestor_or_self(ancestor, node)
    }
}

/// Spaces sharing the same valid fields at one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RemoteNodeState {
    remote_nodes: NodeSet,
    valid_fields: FieldMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriteOwner {
    node: NodeId,
    space: AddressSpaceId,
    fields: FieldMask,
}

#[derive(Debug, Default)]
struct RemoteTreeState {
    /// A space appears in at most one group per node.
    node_states: IndexMap<NodeId, Vec<RemoteNodeState>>,
    write_owners: Vec<WriteOwner>,
}

impl RemoteTreeState {
    fn fields_of(&self, node: NodeId, space: AddressSpaceId) -> FieldMask {
        self.node_states
            .get(&node)
            .and_then(|groups| groups.iter().find(|g| g.remote_nodes.contains(space)))
            .map_or(FieldMask::EMPTY, |group| group.valid_fields)
    }

    fn set_fields(&mut self, node: NodeId, space: AddressSpaceId, fields: FieldMask) {
        let groups = self.node_states.entry(node).or_default();
        for group in groups.iter_mut() {
            group.remote_nodes.remove(space);
        }
        if !fields.is_empty() {
            match groups.iter_mut().find(|g| g.valid_fields == fields) {
                Some(group) => group.remote_nodes.add(space),
                None => groups.push(RemoteNodeState {
                    remote_nodes: NodeSet::single(space),
                    valid_fields: fields,
                }),
            }
        }
        groups.retain(|g| !g.remote_nodes.is_empty());
        if groups.is_empty() {
            self.node_states.shift_remove(&node);
        }
    }

    /// (node, space, fields) entries on nodes intersecting `node`.
    fn holders_near(
        &self,
        relations: &impl TreeRelations,
        node: NodeId,
        mask: FieldMask,
    ) -> Vec<(NodeId, AddressSpaceId, FieldMask)> {
        self.node_states
            .iter()
            .filter(|(entry, _)| relations.subtrees_intersect(**entry, node))
            .flat_map(|(entry, groups)| {
                groups.iter().flat_map(move |group| {
                    let overlap = group.valid_fields & mask;
                    group
                        .remote_nodes
                        .iter()
                        .filter(move |_| !overlap.is_empty())
                        .map(move |space| (*entry, space, overlap))
                })
            })
            .collect()
    }

    fn demote_owners(
        &mut self,
        relations: &impl TreeRelations,
        node: NodeId,
        mask: FieldMask,
        keep: Option<AddressSpaceId>,
    ) {
        for owner in &mut self.write_owners {
            if Some(owner.space) != keep && relations.subtrees_intersect(owner.node, node) {
                owner.fields -= mask;
            }
        }
        self.write_owners.retain(|owner| !owner.fields.is_empty());
    }
}

#[derive(Debug, Default)]
struct RemoteForestState {
    /// Keyed by tree root.
    tree_states: IndexMap<NodeId, RemoteTreeState>,
}

/// Remote holders of one context's physical state.
#[derive(Debug)]
pub struct StateDirectory {
    ctx: ContextId,
    state: Mutex<RemoteForestState>,
}

impl StateDirectory {
    pub(crate) fn new(ctx: ContextId) -> Self {
        Self {
            ctx,
            state: Mutex::new(RemoteForestState::default()),
        }
    }

    /// Record that `mask` of the subtree at `node` was sent to `target`.
    ///
    /// A write send invalidates every other holder of those fields and
    /// makes `target` their write owner; a read send demotes every write
    /// owner. Returns the invalidations to deliver.
    pub(crate) fn update_remote_state(
        &self,
        relations: &impl TreeRelations,
        target: AddressSpaceId,
        node: NodeId,
        mask: FieldMask,
        access: Access,
    ) -> Vec<Invalidation> {
        let mut state = self.state.lock();
        let tree = state.tree_states.entry(relations.tree_root(node)).or_default();
        let mut invalidations = Vec::new();
        match access {
            Access::Write => {
                for (entry, space, fields) in tree.holders_near(relations, node, mask) {
                    if space == target {
                        continue;
                    }
                    let remaining = tree.fields_of(entry, space) - fields;
                    tree.set_fields(entry, space, remaining);
                    invalidations.push(Invalidation {
                        ctx: self.ctx,
                        target: space,
                        node: entry,
                        mask: fields,
                    });
                }
                tree.demote_owners(relations, node, mask, Some(target));
            }
            Access::Read => tree.demote_owners(relations, node, mask, None),
        }
        // Widen an enclosing entry of the same space rather than nesting.
        let anchor = tree
            .node_states
            .keys()
            .copied()
            .find(|entry| relations.contains(*entry, node) && !tree.fields_of(*entry, target).is_empty())
            .unwrap_or(node);
        let widened = tree.fields_of(anchor, target) | mask;
        tree.set_fields(anchor, target, widened);
        let absorbed: Vec<NodeId> = tree
            .node_states
            .keys()
            .copied()
            .filter(|entry| *entry != anchor && relations.contains(anchor, *entry))
            .collect();
        for entry in absorbed {
            let remaining = tree.fields_of(entry, target) - mask;
            tree.set_fields(entry, target, remaining);
        }
        if access == Access::Write {
            match tree
                .write_owners
                .iter_mut()
                .find(|owner| owner.node == node && owner.space == target)
            {
                Some(owner) => owner.fields |= mask,
                // Owned at the written node, not at the widened entry.
                None => tree.write_owners.push(WriteOwner {
                    node,
                    space: target,
                    fields: mask,
                }),
            }
        }
        invalidations
    }

    /// Invalidate every holder except `source` of `mask` on subtrees that
    /// intersect `node`, forgetting them.
    pub(crate) fn issue_invalidations(
        &self,
        relations: &impl TreeRelations,
        node: NodeId,
        mask: FieldMask,
        source: AddressSpaceId,
    ) -> Vec<Invalidation> {
        let mut state = self.state.lock();
        let Some(tree) = state.tree_states.get_mut(&relations.tree_root(node)) else {
            return Vec::new();
        };
        let mut invalidations = Vec::new();
        for (entry, space, fields) in tree.holders_near(relations, node, mask) {
            if space == source {
                continue;
            }
            let remaining = tree.fields_of(entry, space) - fields;
            tree.set_fields(entry, space, remaining);
            invalidations.push(Invalidation {
                ctx: self.ctx,
                target: space,
                node: entry,
                mask: fields,
            });
        }
        tree.demote_owners(relations, node, mask, Some(source));
        invalidations
    }

    /// Holders recorded exactly at `node`, with their fields.
    #[must_use]
    pub fn holders(&self, node: NodeId) -> Vec<(AddressSpaceId, FieldMask)> {
        let state = self.state.lock();
        state
            .tree_states
            .values()
            .filter_map(|tree| tree.node_states.get(&node))
            .flatten()
            .flat_map(|group| group.remote_nodes.iter().map(move |space| (space, group.valid_fields)))
            .collect()
    }

    /// Every (node, space, fields) write ownership.
    #[must_use]
    pub fn write_owners(&self) -> Vec<(NodeId, AddressSpaceId, FieldMask)> {
        let state = self.state.lock();
        state
            .tree_states
            .values()
            .flat_map(|tree| tree.write_owners.iter().map(|o| (o.node, o.space, o.fields)))
            .collect()
    }

    /// Every (node, spaces, fields) group.
    #[must_use]
    pub fn entries(&self) -> Vec<(NodeId, NodeSet, FieldMask)> {
        let state = self.state.lock();
        state
            .tree_states
            .values()
            .flat_map(|tree| {
                tree.node_states
                    .iter()
                    .flat_map(|(node, groups)| groups.iter().map(|g| (*node, g.remote_nodes, g.valid_fields)))
            })
            .collect()
    }
}

impl RegionTreeForest {
    /// Record a send of `mask` of `node`'s subtree in `ctx` to `target`,
    /// queueing the invalidations a write send causes.
    pub fn update_remote_state(
        &self,
        ctx: ContextId,
        target: AddressSpaceId,
        node: NodeId,
        mask: FieldMask,
        access: Access,
    ) {
        let invalidations = self
            .state_directory(ctx)
            .update_remote_state(self, target, node, mask, access);
        self.queue_invalidations(invalidations);
    }

    /// Local writers made remote copies of `mask` at `node` stale.
    pub(crate) fn issue_invalidations(&self, ctx: ContextId, node: NodeId, mask: FieldMask) {
        let directory = self.directories.lock().get(&ctx).map(Arc::clone);
        let Some(directory) = directory else {
            return;
        };
        let invalidations = directory.issue_invalidations(self, node, mask, self.config.address_space);
        self.queue_invalidations(invalidations);
    }

    fn queue_invalidations(&self, invalidations: Vec<Invalidation>) {
        if invalidations.is_empty() {
            return;
        }
        for invalidation in &invalidations {
            debug!(
                ctx = %invalidation.ctx,
                target = %invalidation.target,
                node = %invalidation.node,
                mask = %invalidation.mask,
                "invalidating remote state"
            );
        }
        self.messages.lock().extend(invalidations);
    }
}

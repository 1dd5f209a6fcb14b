//! Physical mapping: choosing instances and keeping them current.
//!
//! Mapping a requirement is three steps. `premap_physical_region` walks the
//! path and closes children whose data would interfere. `map_physical_region`
//! picks an instance in one of the mapper's memories. Finally,
//! `register_physical_region` issues the copies that make the instance
//! current and records the user. Each step holds the target's physical state
//! lock; a busy state is reported as `MappingError::StateBusy` with an event
//! to retry after.

mod copy;
pub(crate) mod state;

pub use crate::physical::copy::{compute_precondition_sets, CopyKind, CopyRequest, PreconditionSet};
pub(crate) use crate::physical::copy::{read_usage, reduce_usage, write_usage};
use crate::{
    event::Event,
    forest::RegionTreeForest,
    mask::{FieldMask, NodeSet},
    shape::ShapeError,
    sync::{Arc, AtomicUsize, Mutex},
    tree::{NodeId, RegionTreePath, TreeHandle},
    types::{
        CoherenceProperty, Color, ContextId, DistributedId, FieldId, IndexMap, LogicalRegion, MemoryId,
        ReductionOpId, RegionRequirement, RegionUsage, RequirementTarget,
    },
    view::{LogicalView, ManagerKind, PhysicalManager, PhysicalUser},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Error kind for physical mapping.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum MappingError {
    /// No memory in the ranking could host the instance.
    #[error("no memory in {ranking:?} can host the instance")]
    NoValidMemory {
        /// Memories tried, in order.
        ranking: Vec<MemoryId>,
    },
    /// Another mapping holds the node's physical state.
    #[error("physical state of {node} is busy; retry after {wait_on}")]
    StateBusy {
        /// Node whose state is held.
        node: NodeId,
        /// Event after which a retry may succeed.
        wait_on: Event,
    },
    /// Instances can only be mapped for regions.
    #[error("{0} is not a region")]
    NotARegion(NodeId),
    /// The view cannot serve as a mapping target.
    #[error("view {0} cannot be the target of a mapping")]
    UnmappableView(DistributedId),
    /// Copy across with mismatched field lists.
    #[error("copy names {src} source fields but {dst} destination fields")]
    FieldCountMismatch {
        /// Source field count.
        src: usize,
        /// Destination field count.
        dst: usize,
    },
    /// The region tree shape rejected a lookup.
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Choices a mapper makes for one requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingDecision {
    /// Memories to try, best first.
    pub memory_ranking: Vec<MemoryId>,
    /// Blocking factor of new instances; `None` accepts any layout and
    /// creates struct-of-arrays.
    pub blocking_factor: Option<usize>,
    /// Close into a composite view instead of a physical instance.
    pub create_composite: bool,
    /// Create list reduction instances instead of fold instances.
    pub reduction_list: bool,
}

impl MappingDecision {
    /// Decision trying `ranking` in order.
    #[must_use]
    pub fn new(ranking: impl IntoIterator<Item = MemoryId>) -> Self {
        Self {
            memory_ranking: ranking.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Require a blocking factor.
    #[must_use]
    pub fn with_blocking_factor(mut self, blocking_factor: usize) -> Self {
        self.blocking_factor = Some(blocking_factor.max(1));
        self
    }

    /// Prefer composite closes.
    #[must_use]
    pub fn with_composite(mut self, enabled: bool) -> Self {
        self.create_composite = enabled;
        self
    }

    /// Prefer list reduction instances.
    #[must_use]
    pub fn with_reduction_list(mut self, enabled: bool) -> Self {
        self.reduction_list = enabled;
        self
    }
}

/// Result of `map_physical_region`: the chosen view and the fields to make
/// current in it.
#[derive(Debug, Clone)]
pub struct MappingRef {
    view: Arc<LogicalView>,
    needed_fields: FieldMask,
}

impl MappingRef {
    /// Chosen view.
    #[must_use]
    pub fn view(&self) -> &Arc<LogicalView> {
        &self.view
    }

    /// Fields the requirement needs.
    #[must_use]
    pub fn needed_fields(&self) -> FieldMask {
        self.needed_fields
    }
}

/// A registered mapping: the instance and when it may be used.
#[derive(Debug, Clone)]
pub struct InstanceRef {
    ready_event: Event,
    view: Arc<LogicalView>,
}

impl InstanceRef {
    /// Event after which the instance holds current data and no earlier
    /// conflicting user is still running.
    #[must_use]
    pub fn ready_event(&self) -> Event {
        self.ready_event
    }

    /// View the user was registered through.
    #[must_use]
    pub fn view(&self) -> &Arc<LogicalView> {
        &self.view
    }

    /// Backing instance.
    #[must_use]
    pub fn manager(&self) -> Option<&Arc<PhysicalManager>> {
        self.view.manager()
    }
}

/// Capacity accounting of one memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes the memory can hold.
    pub capacity: usize,
    /// Bytes held by live instances.
    pub used: usize,
}

/// Hold on a node's physical state lock, released on drop.
pub(crate) struct StateHold<'a> {
    forest: &'a RegionTreeForest,
    ctx: ContextId,
    node: NodeId,
}

impl Drop for StateHold<'_> {
    fn drop(&mut self) {
        self.forest.release_physical_state(self.ctx, self.node);
    }
}

impl RegionTreeForest {
    // ----- memories and instances ----------------------------------------

    /// Make `memory` available with `capacity` bytes.
    pub fn register_memory(&self, memory: MemoryId, capacity: usize) {
        self.memories.lock().entry(memory).or_default().capacity = capacity;
    }

    /// Capacity accounting of `memory`.
    #[must_use]
    pub fn memory_usage(&self, memory: MemoryId) -> Option<MemoryUsage> {
        self.memories.lock().get(&memory).copied()
    }

    pub(crate) fn release_memory(&self, memory: MemoryId, bytes: usize) {
        if let Some(usage) = self.memories.lock().get_mut(&memory) {
            usage.used = usage.used.saturating_sub(bytes);
        }
    }

    fn reserve_memory(&self, memory: MemoryId, bytes: usize) -> bool {
        let mut memories = self.memories.lock();
        match memories.get_mut(&memory) {
            Some(usage) if usage.used + bytes <= usage.capacity => {
                usage.used += bytes;
                true
            }
            _ => false,
        }
    }

    /// Create an instance of `region` holding `fields` in `memory`.
    ///
    /// # Errors
    /// `NoValidMemory` if the memory is unknown or full.
    pub fn create_instance(
        &self,
        region: LogicalRegion,
        fields: &[FieldId],
        memory: MemoryId,
        blocking_factor: Option<usize>,
    ) -> Result<Arc<PhysicalManager>, MappingError> {
        let node = self.region_node(region)?;
        let mask = self.shape.get_field_mask(region.field_space, fields)?;
        self.create_instance_at(node, mask, memory, blocking_factor, ManagerKind::Instance)?
            .ok_or_else(|| MappingError::NoValidMemory {
                ranking: vec![memory],
            })
    }

    /// Create an instance for `node`, or `None` if `memory` cannot hold it.
    pub(crate) fn create_instance_at(
        &self,
        node: NodeId,
        mask: FieldMask,
        memory: MemoryId,
        blocking_factor: Option<usize>,
        kind: ManagerKind,
    ) -> Result<Option<Arc<PhysicalManager>>, MappingError> {
        let TreeHandle::Region(region) = self.node(node).handle else {
            return Err(MappingError::NotARegion(node));
        };
        let volume = usize::try_from(self.shape.get_volume(region.index_space)?).unwrap_or(usize::MAX);
        let blocking_factor = blocking_factor.unwrap_or(volume.max(1));
        let layout = self.shape.layout(region.field_space, mask, blocking_factor)?;
        let size = volume.saturating_mul(layout.element_size());
        if !self.reserve_memory(memory, size) {
            debug!(%memory, size, "memory cannot host instance");
            return Ok(None);
        }
        let manager = Arc::new(PhysicalManager {
            did: self.next_did(),
            owner: self.config.address_space,
            memory,
            region: node,
            kind,
            layout,
            size,
            use_event: Event::NO_EVENT,
            users: Mutex::new(Vec::new()),
            valid_refs: AtomicUsize::new(0),
            subscribers: Mutex::new(NodeSet::EMPTY),
        });
        self.managers.write().insert(manager.did, Arc::clone(&manager));
        debug!(manager = %manager.did, %memory, %node, %kind, size, "created instance");
        Ok(Some(manager))
    }

    fn find_existing_instance(
        &self,
        memory: MemoryId,
        node: NodeId,
        mask: FieldMask,
        blocking_factor: Option<usize>,
    ) -> Option<Arc<PhysicalManager>> {
        self.managers
            .read()
            .values()
            .find(|manager| {
                manager.memory == memory
                    && manager.kind == ManagerKind::Instance
                    && manager.layout.matches(mask, blocking_factor)
                    && self.is_ancestor_or_self(manager.region, node)
                    && self.holds_current_fields(manager, node, mask)
            })
            .cloned()
    }

    /// Whether `manager` was laid out for the fields now allocated at every
    /// index of `mask`.
    pub(crate) fn holds_current_fields(&self, manager: &PhysicalManager, node: NodeId, mask: FieldMask) -> bool {
        let field_space = self.node(node).handle.field_space();
        self.shape.current_fields(field_space, &manager.layout, mask).covers(mask)
    }

    // ----- state lock ----------------------------------------------------

    /// Acquire `node`'s physical state lock in `ctx`.
    ///
    /// Returns `None` when the lock was granted right away; otherwise the
    /// request is queued and owns the lock once the returned event triggers.
    /// Grants are FIFO.
    pub fn acquire_physical_state(&self, ctx: ContextId, node: NodeId, exclusive: bool) -> Option<Event> {
        let node = self.node(node);
        let mut table = node.physical();
        table
            .get_mut(ctx)
            .lock
            .acquire(exclusive, || self.events.create_user_event())
    }

    /// Release one hold of `node`'s physical state lock in `ctx`.
    pub fn release_physical_state(&self, ctx: ContextId, node: NodeId) {
        let wake = {
            let node = self.node(node);
            let mut table = node.physical();
            table.get_mut(ctx).lock.release()
        };
        for event in wake {
            self.events.trigger(event);
        }
    }

    pub(crate) fn hold_state(
        &self,
        ctx: ContextId,
        node: NodeId,
        exclusive: bool,
    ) -> Result<StateHold<'_>, MappingError> {
        let result = {
            let target = self.node(node);
            let mut table = target.physical();
            table
                .get_mut(ctx)
                .lock
                .try_acquire(exclusive, || self.events.create_user_event())
        };
        match result {
            Ok(()) => Ok(StateHold {
                forest: self,
                ctx,
                node,
            }),
            Err(wait_on) => {
                debug!(%node, %wait_on, "physical state busy");
                Err(MappingError::StateBusy { node, wait_on })
            }
        }
    }

    // ----- mapping -------------------------------------------------------

    /// Close every child on `path` whose data would interfere with `req`,
    /// open the path, and flush reductions the requirement bypasses.
    ///
    /// # Errors
    /// `StateBusy` if the target is held, or any error of the closes.
    pub fn premap_physical_region(
        &self,
        ctx: ContextId,
        path: &RegionTreePath,
        req: &RegionRequirement,
        decision: &MappingDecision,
    ) -> Result<(), MappingError> {
        let mask = self.requirement_mask(req)?;
        let _hold = self.hold_state(ctx, path.target(), true)?;
        for (depth, &node_id) in path.nodes().iter().enumerate() {
            let next = path.next_color(depth);
            let node = self.node(node_id);
            let candidates = node
                .physical()
                .get(ctx)
                .map(|state| state.open_children_on(mask))
                .unwrap_or_default();
            let mut to_close = Vec::new();
            for (color, fields) in candidates {
                if next == Some(color) {
                    continue;
                }
                if let Some(next) = next
                    && self.children_disjoint(&node, color, next)
                {
                    continue;
                }
                let interferes = !req.usage.is_read_only()
                    || node
                        .child(color)
                        .is_some_and(|child| !self.subtree_dirty(ctx, child, fields).is_empty());
                if interferes {
                    to_close.push((color, fields));
                }
            }
            if !to_close.is_empty() {
                self.close_children(ctx, node_id, &to_close, &[], CloseTarget::Select(decision))?;
            }
            if let Some(next) = next {
                node.physical().get_mut(ctx).open_child(next, mask);
                if node.is_region() {
                    self.flush_bypassed_reductions(ctx, node_id, mask, &req.usage, decision)?;
                }
            }
        }
        Ok(())
    }

    fn flush_bypassed_reductions(
        &self,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
        usage: &RegionUsage,
        decision: &MappingDecision,
    ) -> Result<(), MappingError> {
        let pending: Vec<_> = self
            .node(node)
            .physical()
            .get(ctx)
            .map(|state| state.reductions_on(mask))
            .unwrap_or_default()
            .into_iter()
            .filter(|(view, _)| view.manager().and_then(|m| m.kind.redop()) != usage.redop())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let fields = pending.iter().fold(FieldMask::EMPTY, |acc, (_, f)| acc | *f);
        let (target, ready) = self.select_close_target(ctx, node, fields, decision)?;
        self.flush_reductions(&pending, &target, node, fields, ready);
        self.drop_reductions(ctx, node, fields);
        self.update_valid_views(ctx, node, fields, &target, true);
        Ok(())
    }

    /// Pick an instance for `req` at the end of `path`.
    ///
    /// Valid instances in a ranked memory are preferred, then existing
    /// instances there, then a new instance. With the write-after-read
    /// optimization enabled, a writer that would wait on in-flight readers
    /// gets a fresh instance when one fits. Simultaneous requirements map to
    /// the instance already holding their data, anywhere, unless the
    /// application acquired their coherence.
    ///
    /// # Errors
    /// `NoValidMemory` if nothing fits anywhere in the ranking.
    pub fn map_physical_region(
        &self,
        ctx: ContextId,
        path: &RegionTreePath,
        req: &RegionRequirement,
        decision: &MappingDecision,
    ) -> Result<MappingRef, MappingError> {
        let node = path.target();
        if !self.node(node).is_region() {
            return Err(MappingError::NotARegion(node));
        }
        let mask = self.requirement_mask(req)?;
        let _hold = self.hold_state(ctx, node, false)?;
        if let Some(redop) = req.usage.redop() {
            return self.map_reduction(ctx, node, mask, redop, decision);
        }
        let bf = decision.blocking_factor;
        let valid = self.find_valid_views(ctx, node, mask);
        if req.usage.prop == CoherenceProperty::Simultaneous
            && !(mask - self.user_coherence_at(ctx, node, mask)).is_empty()
            && let Some((view, _)) = valid
                .iter()
                .find(|(view, fields)| view.is_materialized() && fields.covers(mask))
        {
            // Simultaneous users share the instance holding the data until
            // the application acquires coherence itself.
            debug!(%node, view = %view.did, "simultaneous mapping restricted to the valid instance");
            return Ok(MappingRef {
                view: Arc::clone(view),
                needed_fields: mask,
            });
        }
        for &memory in &decision.memory_ranking {
            let chosen = valid
                .iter()
                .filter(|(view, _)| {
                    view.memory() == Some(memory)
                        && view
                            .manager()
                            .is_some_and(|m| m.layout.matches(mask, bf) && self.holds_current_fields(m, node, mask))
                })
                .max_by_key(|(_, fields)| (*fields & mask).count())
                .map(|(view, _)| Arc::clone(view))
                .or_else(|| {
                    self.find_existing_instance(memory, node, mask, bf)
                        .map(|manager| self.materialized_view(&manager, node))
                });
            if let Some(view) = chosen {
                let war = self.config.war_optimization
                    && view
                        .manager()
                        .is_some_and(|m| self.has_war_dependence(m, &req.usage, mask, node));
                if war && let Some(fresh) = self.create_instance_at(node, mask, memory, bf, ManagerKind::Instance)? {
                    debug!(%node, stale = %view.did, "write-after-read: mapping to a fresh instance");
                    return Ok(MappingRef {
                        view: self.materialized_view(&fresh, node),
                        needed_fields: mask,
                    });
                }
                return Ok(MappingRef {
                    view,
                    needed_fields: mask,
                });
            }
            if let Some(manager) = self.create_instance_at(node, mask, memory, bf, ManagerKind::Instance)? {
                return Ok(MappingRef {
                    view: self.materialized_view(&manager, node),
                    needed_fields: mask,
                });
            }
        }
        warn!(%node, ranking = ?decision.memory_ranking, "no memory can host the mapping");
        Err(MappingError::NoValidMemory {
            ranking: decision.memory_ranking.clone(),
        })
    }

    fn map_reduction(
        &self,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
        redop: ReductionOpId,
        decision: &MappingDecision,
    ) -> Result<MappingRef, MappingError> {
        let existing = self
            .node(node)
            .physical()
            .get(ctx)
            .map(|state| state.reductions_on(mask))
            .unwrap_or_default();
        for &memory in &decision.memory_ranking {
            let reuse = existing.iter().find(|(view, _)| {
                view.memory() == Some(memory)
                    && view
                        .manager()
                        .is_some_and(|m| {
                            m.kind.redop() == Some(redop)
                                && m.mask().covers(mask)
                                && self.holds_current_fields(m, node, mask)
                        })
            });
            if let Some((view, _)) = reuse {
                return Ok(MappingRef {
                    view: Arc::clone(view),
                    needed_fields: mask,
                });
            }
            let kind = if decision.reduction_list {
                ManagerKind::ListReduction(redop)
            } else {
                ManagerKind::FoldReduction(redop)
            };
            if let Some(manager) = self.create_instance_at(node, mask, memory, decision.blocking_factor, kind)? {
                return Ok(MappingRef {
                    view: self.materialized_view(&manager, node),
                    needed_fields: mask,
                });
            }
        }
        warn!(%node, %redop, "no memory can host the reduction instance");
        Err(MappingError::NoValidMemory {
            ranking: decision.memory_ranking.clone(),
        })
    }

    /// Make the mapped instance current for `req`, record the user whose
    /// work ends with `term`, and update the node's valid views.
    ///
    /// # Errors
    /// `StateBusy` if the node is held, `UnmappableView` for composite views.
    pub fn register_physical_region(
        &self,
        ctx: ContextId,
        mapping: &MappingRef,
        req: &RegionRequirement,
        term: Event,
    ) -> Result<InstanceRef, MappingError> {
        let node = mapping.view.node;
        let mask = mapping.needed_fields;
        let usage = req.usage;
        let manager = mapping
            .view
            .manager()
            .cloned()
            .ok_or(MappingError::UnmappableView(mapping.view.did))?;
        let _hold = self.hold_state(ctx, node, true)?;
        self.events.import(term);
        if mapping.view.is_reduction() {
            let ready = self.add_physical_user(&manager, PhysicalUser {
                usage,
                mask,
                term,
                node,
            });
            {
                let target = self.node(node);
                let mut table = target.physical();
                let state = table.get_mut(ctx);
                if state.insert_view(&mapping.view, mask, true) {
                    self.add_valid_reference(&mapping.view);
                }
                state.reduction_mask |= mask;
            }
            self.issue_invalidations(ctx, node, mask);
            return Ok(InstanceRef {
                ready_event: ready,
                view: Arc::clone(&mapping.view),
            });
        }
        let mut preconditions = Vec::new();
        if !usage.is_write_only() {
            let valid = self.find_valid_views(ctx, node, mask);
            preconditions.push(self.issue_update_copies(&mapping.view, node, mask, &valid, Event::NO_EVENT));
        }
        let pending = self
            .node(node)
            .physical()
            .get(ctx)
            .map(|state| state.reductions_on(mask))
            .unwrap_or_default();
        let reduced = pending.iter().fold(FieldMask::EMPTY, |acc, (_, f)| acc | *f);
        if !pending.is_empty() {
            if !usage.is_write_only() {
                preconditions.push(self.flush_reductions(&pending, &mapping.view, node, reduced, Event::NO_EVENT));
            }
            self.drop_reductions(ctx, node, reduced);
        }
        preconditions.push(self.add_physical_user(&manager, PhysicalUser {
            usage,
            mask,
            term,
            node,
        }));
        let ready = self.events.merge_events(preconditions);
        if usage.is_write() {
            self.update_valid_views(ctx, node, mask, &mapping.view, true);
        } else {
            self.update_valid_views(ctx, node, mask - reduced, &mapping.view, false);
            if !reduced.is_empty() {
                self.update_valid_views(ctx, node, reduced, &mapping.view, true);
            }
        }
        if usage.is_write() || !reduced.is_empty() {
            self.issue_invalidations(ctx, node, mask);
        }
        debug!(%node, view = %mapping.view.did, %mask, %ready, "registered physical region");
        Ok(InstanceRef {
            ready_event: ready,
            view: Arc::clone(&mapping.view),
        })
    }

    /// Map `req` onto the instance of an earlier mapping without walking a
    /// path: the requirement's own region is the target.
    ///
    /// # Errors
    /// `NotARegion` for partition requirements, `UnmappableView` if the
    /// instance is composite, lies outside the region's tree or lacks some
    /// of the requirement's fields.
    pub fn remap_physical_region(
        &self,
        ctx: ContextId,
        req: &RegionRequirement,
        instance: &InstanceRef,
    ) -> Result<MappingRef, MappingError> {
        let RequirementTarget::Region(region) = req.target else {
            return Err(MappingError::NotARegion(self.requirement_path(req)?.target()));
        };
        let node = self.region_node(region)?;
        let mask = self.requirement_mask(req)?;
        let manager = instance
            .manager()
            .ok_or(MappingError::UnmappableView(instance.view.did))?;
        if !manager.layout.mask().covers(mask)
            || !self.is_ancestor_or_self(manager.region, node)
            || !self.holds_current_fields(manager, node, mask)
        {
            return Err(MappingError::UnmappableView(instance.view.did));
        }
        let _hold = self.hold_state(ctx, node, false)?;
        let view = if instance.view.node == node {
            Arc::clone(&instance.view)
        } else {
            self.materialized_view(manager, node)
        };
        debug!(%node, view = %view.did, "remapped onto an existing instance");
        Ok(MappingRef {
            view,
            needed_fields: mask,
        })
    }

    /// Copy the fields of `src_req` (as seen in `src_ctx`) into the instance
    /// of `dst`, pairing fields by position. The destination becomes the
    /// only valid instance of its fields in `dst_ctx`.
    ///
    /// # Errors
    /// On mismatched field lists or unknown regions and fields, and
    /// `StateBusy` if the destination's state is held in `dst_ctx`.
    pub fn copy_across(
        &self,
        src_ctx: ContextId,
        dst_ctx: ContextId,
        src_req: &RegionRequirement,
        dst_req: &RegionRequirement,
        dst: &InstanceRef,
        precondition: Event,
    ) -> Result<Event, MappingError> {
        if src_req.fields.len() != dst_req.fields.len() {
            return Err(MappingError::FieldCountMismatch {
                src: src_req.fields.len(),
                dst: dst_req.fields.len(),
            });
        }
        let src_node = self.requirement_path(src_req)?.target();
        let dst_manager = dst
            .view
            .manager()
            .cloned()
            .ok_or(MappingError::UnmappableView(dst.view.did))?;
        let dst_node = dst.view.node;
        let dst_fields = self.shape.get_field_mask(dst_req.field_space(), &dst_req.fields)?;
        let _hold = self.hold_state(dst_ctx, dst_node, true)?;
        let mut completions = Vec::new();
        for (&src_field, &dst_field) in src_req.fields.iter().zip(&dst_req.fields) {
            let src_mask = self.shape.get_field_mask(src_req.field_space(), &[src_field])?;
            let dst_mask = self.shape.get_field_mask(dst_req.field_space(), &[dst_field])?;
            let valid = self.find_valid_views(src_ctx, src_node, src_mask);
            let source = valid
                .iter()
                .filter(|(view, _)| view.is_materialized())
                .min_by_key(|(view, _)| view.memory() != Some(dst_manager.memory));
            if let Some((view, _)) = source
                && let Some(src_manager) = view.manager()
            {
                completions.push(self.issue_across_copy(
                    CopyKind::Copy,
                    (src_manager, src_node, src_mask),
                    (&dst_manager, dst_node, dst_mask),
                    precondition,
                ));
                continue;
            }
            for (view, _) in &valid {
                if let Some(composite) = view.as_composite() {
                    completions.push(self.replay_composite_across(
                        composite.root(),
                        src_mask,
                        (&dst_manager, dst_node, dst_mask),
                        precondition,
                    ));
                }
            }
        }
        let done = self.events.merge_events(completions);
        self.update_valid_views(dst_ctx, dst_node, dst_fields, &dst.view, true);
        self.issue_invalidations(dst_ctx, dst_node, dst_fields);
        debug!(src = %src_node, dst = %dst_node, %dst_fields, %done, "copied across regions");
        Ok(done)
    }

    /// One copy (or reduction) between instances of possibly different
    /// trees.
    pub(crate) fn issue_across_copy(
        &self,
        kind: CopyKind,
        (src, src_node, src_mask): (&Arc<PhysicalManager>, NodeId, FieldMask),
        (dst, dst_node, dst_mask): (&Arc<PhysicalManager>, NodeId, FieldMask),
        precondition: Event,
    ) -> Event {
        let mut preconditions = vec![precondition];
        preconditions.extend(
            self.find_copy_preconditions(src, &read_usage(), src_mask, src_node)
                .into_keys(),
        );
        let dst_usage = match kind {
            CopyKind::Copy => write_usage(),
            CopyKind::Reduce { redop, .. } => reduce_usage(redop),
        };
        preconditions.extend(
            self.find_copy_preconditions(dst, &dst_usage, dst_mask, dst_node)
                .into_keys(),
        );
        let precondition = self.events.merge_events(preconditions);
        let completion = self.events.create_dependent_event([precondition]);
        self.add_copy_user(src, read_usage(), completion, src_mask, src_node);
        self.add_copy_user(dst, dst_usage, completion, dst_mask, dst_node);
        let request = CopyRequest {
            kind,
            src: src.did,
            dst: dst.did,
            src_node,
            dst_node,
            fields: src
                .copy_fields(src_mask)
                .into_iter()
                .zip(dst.copy_fields(dst_mask))
                .collect(),
            precondition,
            completion,
        };
        self.record_copy(request);
        completion
    }

    /// Make `manager` the valid instance of `fields` of `region` in a fresh
    /// context.
    ///
    /// # Errors
    /// On unknown regions or fields.
    pub fn initialize_physical_context(
        &self,
        ctx: ContextId,
        region: LogicalRegion,
        fields: &[FieldId],
        manager: &Arc<PhysicalManager>,
    ) -> Result<Arc<LogicalView>, MappingError> {
        let node = self.region_node(region)?;
        let mask = self.shape.get_field_mask(region.field_space, fields)?;
        self.invalidate_subtree(ctx, node, mask);
        let view = self.materialized_view(manager, node);
        self.update_valid_views(ctx, node, mask, &view, true);
        debug!(%ctx, %region, view = %view.did, "initialized physical context");
        Ok(view)
    }

    /// Drop all physical state of `region`'s subtree in `ctx`.
    ///
    /// # Errors
    /// If the region is unknown.
    pub fn invalidate_physical_context(&self, ctx: ContextId, region: LogicalRegion) -> Result<(), MappingError> {
        let node = self.region_node(region)?;
        self.invalidate_subtree(ctx, node, FieldMask::from_bits(u128::MAX));
        Ok(())
    }

    // ----- state helpers -------------------------------------------------

    /// Views holding current data for `mask` at `node`, walking up through
    /// ancestors for fields that are not dirty below them.
    pub(crate) fn find_valid_views(
        &self,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
    ) -> Vec<(Arc<LogicalView>, FieldMask)> {
        let mut found = IndexMap::<DistributedId, (Arc<LogicalView>, FieldMask)>::default();
        let field_space = self.node(node).handle.field_space();
        let mut remaining = mask;
        let mut current = Some(node);
        while let Some(id) = current
            && !remaining.is_empty()
        {
            let level = self.node(id);
            let (views, dirty) = level
                .physical()
                .get(ctx)
                .map(|state| (state.views_on(remaining), state.dirty_mask & remaining))
                .unwrap_or_default();
            for (view, fields) in views {
                let fields = match view.manager() {
                    Some(manager) => self.shape.current_fields(field_space, &manager.layout, fields),
                    None => fields,
                };
                if fields.is_empty() {
                    continue;
                }
                let view = match view.manager() {
                    Some(manager) if id != node => self.materialized_view(manager, node),
                    _ => view,
                };
                found
                    .entry(view.did)
                    .or_insert_with(|| (Arc::clone(&view), FieldMask::EMPTY))
                    .1 |= fields;
            }
            remaining -= dirty;
            current = level.parent;
        }
        found.into_values().collect()
    }

    /// Make `view` valid for `mask` at `node`; a dirty update invalidates
    /// every other view of those fields first.
    pub(crate) fn update_valid_views(
        &self,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
        view: &Arc<LogicalView>,
        dirty: bool,
    ) {
        if mask.is_empty() {
            return;
        }
        let target = self.node(node);
        let mut table = target.physical();
        let state = table.get_mut(ctx);
        let removed = if dirty {
            state.dirty_mask |= mask;
            state.remove_fields(mask, false)
        } else {
            Vec::new()
        };
        if state.insert_view(view, mask, false) {
            self.add_valid_reference(view);
        }
        for stale in removed {
            self.remove_valid_reference(&stale);
        }
    }

    pub(crate) fn drop_reductions(&self, ctx: ContextId, node: NodeId, mask: FieldMask) {
        let target = self.node(node);
        let mut table = target.physical();
        let state = table.get_mut(ctx);
        state.reduction_mask -= mask;
        for stale in state.remove_fields(mask, true) {
            self.remove_valid_reference(&stale);
        }
    }

    /// Fields of `mask` with data below or at `node` newer than its parent.
    pub(crate) fn subtree_dirty(&self, ctx: ContextId, node: NodeId, mask: FieldMask) -> FieldMask {
        let current = self.node(node);
        let (mut dirty, open) = current
            .physical()
            .get(ctx)
            .map(|state| {
                (
                    (state.dirty_mask | state.reduction_mask) & mask,
                    state.open_children_on(mask),
                )
            })
            .unwrap_or_default();
        for (color, fields) in open {
            if let Some(child) = current.child(color) {
                dirty |= self.subtree_dirty(ctx, child, fields);
            }
        }
        dirty
    }

    /// Forget `mask` everywhere in the subtree rooted at `node`.
    pub(crate) fn invalidate_subtree(&self, ctx: ContextId, node: NodeId, mask: FieldMask) {
        let current = self.node(node);
        let (removed, open) = current.physical().get_mut(ctx).invalidate(mask);
        for stale in removed {
            self.remove_valid_reference(&stale);
        }
        for (color, fields) in open {
            if let Some(child) = current.child(color) {
                self.invalidate_subtree(ctx, child, fields);
            }
        }
    }

    // ----- queries -------------------------------------------------------

    /// Views listed as valid at `node` in `ctx`.
    #[must_use]
    pub fn valid_views(&self, ctx: ContextId, node: NodeId) -> Vec<(Arc<LogicalView>, FieldMask)> {
        self.node(node)
            .physical()
            .get(ctx)
            .map(|state| state.views_on(FieldMask::from_bits(u128::MAX)))
            .unwrap_or_default()
    }

    /// Reduction views pending at `node` in `ctx`.
    #[must_use]
    pub fn reduction_views(&self, ctx: ContextId, node: NodeId) -> Vec<(Arc<LogicalView>, FieldMask)> {
        self.node(node)
            .physical()
            .get(ctx)
            .map(|state| state.reductions_on(FieldMask::from_bits(u128::MAX)))
            .unwrap_or_default()
    }

    /// Fields whose latest data lives at `node` in `ctx`.
    #[must_use]
    pub fn dirty_fields(&self, ctx: ContextId, node: NodeId) -> FieldMask {
        self.node(node)
            .physical()
            .get(ctx)
            .map_or(FieldMask::EMPTY, |state| state.dirty_mask)
    }

    /// Fields of `node` this space may use without asking their owner.
    #[must_use]
    pub fn remote_valid_fields(&self, ctx: ContextId, node: NodeId) -> FieldMask {
        self.node(node)
            .physical()
            .get(ctx)
            .map_or(FieldMask::EMPTY, |state| state.remote_valid)
    }

    /// Children of `node` physically open in `ctx`.
    #[must_use]
    pub fn physical_open_children(&self, ctx: ContextId, node: NodeId) -> Vec<(Color, FieldMask)> {
        self.node(node)
            .physical()
            .get(ctx)
            .map(|state| state.open_children_on(FieldMask::from_bits(u128::MAX)))
            .unwrap_or_default()
    }
}

/// Where a close writes its data back to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CloseTarget<'a> {
    /// Let the forest pick (or create) an instance per the decision.
    Select(&'a MappingDecision),
    /// Use this view.
    Explicit(&'a Arc<LogicalView>),
}

use crate::{
    event::Event,
    forest::RegionTreeForest,
    mask::FieldMask,
    sync::Arc,
    tree::NodeId,
    types::{CoherenceProperty, DistributedId, IndexMap, IndexSet, PrivilegeMode, ReductionOpId, RegionUsage},
    view::{CopyField, LogicalView, ManagerKind, PhysicalManager, ViewKind},
};
use derive_more::Display;
use tracing::trace;

/// What a copy does to its destination.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
    /// Overwrite the destination.
    Copy,
    /// Apply buffered contributions to the destination.
    #[display("Reduce({redop}, fold={fold})")]
    Reduce {
        /// Reduction operator.
        redop: ReductionOpId,
        /// Whether the destination is itself a fold instance.
        fold: bool,
    },
}

/// A copy the forest wants the runtime to perform.
///
/// The copy covers the points shared by `src_node` and `dst_node` and must
/// not start before `precondition`; the runtime triggers `completion` once it
/// is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    /// Copy or reduction.
    pub kind: CopyKind,
    /// Source instance.
    pub src: DistributedId,
    /// Destination instance.
    pub dst: DistributedId,
    /// Node bounding the source points.
    pub src_node: NodeId,
    /// Node bounding the destination points.
    pub dst_node: NodeId,
    /// Pairs of (source, destination) field placements.
    pub fields: Vec<(CopyField, CopyField)>,
    /// Event the copy waits for.
    pub precondition: Event,
    /// Event the runtime triggers when the copy is done.
    pub completion: Event,
}

/// Fields that share exactly one set of preconditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionSet {
    /// Fields of the group.
    pub pre_mask: FieldMask,
    /// Events every field of the group waits for.
    pub preconditions: IndexSet<Event>,
}

/// Split `update_mask` into groups of fields with identical precondition
/// sets, so one copy per group can be issued.
#[must_use]
pub fn compute_precondition_sets(
    update_mask: FieldMask,
    preconditions: &IndexMap<Event, FieldMask>,
) -> Vec<PreconditionSet> {
    let mut sets = vec![PreconditionSet {
        pre_mask: update_mask,
        preconditions: IndexSet::default(),
    }];
    for (&event, &mask) in preconditions {
        let mask = mask & update_mask;
        if mask.is_empty() {
            continue;
        }
        let mut next = Vec::with_capacity(sets.len() + 1);
        for mut set in sets {
            let overlap = set.pre_mask & mask;
            if overlap.is_empty() {
                next.push(set);
            } else if overlap == set.pre_mask {
                set.preconditions.insert(event);
                next.push(set);
            } else {
                let mut split = set.clone();
                split.pre_mask = overlap;
                split.preconditions.insert(event);
                set.pre_mask -= overlap;
                next.push(set);
                next.push(split);
            }
        }
        sets = next;
    }
    sets.retain(|set| !set.pre_mask.is_empty());
    sets
}

pub(crate) fn read_usage() -> RegionUsage {
    RegionUsage::new(PrivilegeMode::ReadOnly, CoherenceProperty::Exclusive)
}

pub(crate) fn write_usage() -> RegionUsage {
    RegionUsage::read_write()
}

pub(crate) fn reduce_usage(redop: ReductionOpId) -> RegionUsage {
    RegionUsage::new(PrivilegeMode::Reduce(redop), CoherenceProperty::Exclusive)
}

impl RegionTreeForest {
    /// Bring `mask` of `dst` (a view at `node`) up to date from `valid`.
    ///
    /// Fields already valid in the destination instance are skipped; fields
    /// with no valid source are left alone. Returns the event after which
    /// the destination holds current data.
    pub(crate) fn issue_update_copies(
        &self,
        dst: &Arc<LogicalView>,
        node: NodeId,
        mask: FieldMask,
        valid: &[(Arc<LogicalView>, FieldMask)],
        after: Event,
    ) -> Event {
        let Some(dst_manager) = dst.manager() else {
            return Event::NO_EVENT;
        };
        let mut needed = mask;
        for (view, fields) in valid {
            if view.manager().is_some_and(|m| m.same_instance(dst_manager)) {
                needed -= *fields;
            }
        }
        if needed.is_empty() {
            return Event::NO_EVENT;
        }
        // Sources in the destination's memory first.
        let mut sources: Vec<&(Arc<LogicalView>, FieldMask)> =
            valid.iter().filter(|(view, _)| view.is_materialized()).collect();
        sources.sort_by_key(|(view, _)| view.memory() != Some(dst_manager.memory));
        let mut remaining = needed;
        let mut assigned = Vec::new();
        for (view, fields) in sources {
            let take = remaining & *fields;
            if !take.is_empty() {
                remaining -= take;
                assigned.push((Arc::clone(view), take));
            }
        }
        let mut events = Vec::new();
        for (view, fields) in valid {
            let take = remaining & *fields;
            if !take.is_empty() && view.as_composite().is_some() {
                remaining -= take;
                events.push(self.issue_composite_copies(view, dst, node, take, after));
            }
        }
        if !assigned.is_empty() {
            events.extend(self.issue_grouped_copies(dst_manager, node, &assigned, after).into_keys());
        }
        if !remaining.is_empty() {
            trace!(dst = %dst.did, fields = %remaining, "no valid source; fields left uninitialized");
        }
        self.events.merge_events(events)
    }

    /// Issue one copy per (source, precondition group) pair into `dst`.
    /// Returns completion events with the fields each one covers.
    pub(crate) fn issue_grouped_copies(
        &self,
        dst: &Arc<PhysicalManager>,
        node: NodeId,
        sources: &[(Arc<LogicalView>, FieldMask)],
        after: Event,
    ) -> IndexMap<Event, FieldMask> {
        let update_mask = sources
            .iter()
            .fold(FieldMask::EMPTY, |acc, (_, fields)| acc | *fields);
        let mut preconditions = self.find_copy_preconditions(dst, &write_usage(), update_mask, node);
        for (view, fields) in sources {
            if let Some(src) = view.manager() {
                for (event, mask) in self.find_copy_preconditions(src, &read_usage(), *fields, node) {
                    *preconditions.entry(event).or_default() |= mask;
                }
            }
        }
        if after.exists() {
            *preconditions.entry(after).or_default() |= update_mask;
        }
        let mut postconditions = IndexMap::<Event, FieldMask>::default();
        for set in compute_precondition_sets(update_mask, &preconditions) {
            let precondition = self.events.merge_events(set.preconditions.iter().copied());
            for (view, fields) in sources {
                let fields = *fields & set.pre_mask;
                let Some(src) = view.manager() else {
                    continue;
                };
                if fields.is_empty() {
                    continue;
                }
                let completion = self.issue_copy(CopyKind::Copy, src, dst, node, fields, precondition);
                *postconditions.entry(completion).or_default() |= fields;
            }
        }
        postconditions
    }

    /// Apply pending reductions to `dst` at `node`.
    pub(crate) fn flush_reductions(
        &self,
        reductions: &[(Arc<LogicalView>, FieldMask)],
        dst: &Arc<LogicalView>,
        node: NodeId,
        mask: FieldMask,
        after: Event,
    ) -> Event {
        let Some(dst_manager) = dst.manager() else {
            return Event::NO_EVENT;
        };
        let mut events = Vec::new();
        for (view, fields) in reductions {
            let fields = *fields & mask;
            let ViewKind::Reduction(src) = &view.kind else {
                continue;
            };
            let Some(redop) = src.kind.redop() else {
                continue;
            };
            if fields.is_empty() {
                continue;
            }
            let mut preconditions = vec![after];
            preconditions.extend(
                self.find_copy_preconditions(src, &read_usage(), fields, node)
                    .into_keys(),
            );
            preconditions.extend(
                self.find_copy_preconditions(dst_manager, &reduce_usage(redop), fields, node)
                    .into_keys(),
            );
            let precondition = self.events.merge_events(preconditions);
            let fold = matches!(dst_manager.kind, ManagerKind::FoldReduction(_));
            events.push(self.issue_copy(CopyKind::Reduce { redop, fold }, src, dst_manager, node, fields, precondition));
        }
        self.events.merge_events(events)
    }

    /// Queue one copy and record it as a user of both instances.
    pub(crate) fn issue_copy(
        &self,
        kind: CopyKind,
        src: &Arc<PhysicalManager>,
        dst: &Arc<PhysicalManager>,
        node: NodeId,
        fields: FieldMask,
        precondition: Event,
    ) -> Event {
        let completion = self.events.create_dependent_event([precondition]);
        let dst_usage = match kind {
            CopyKind::Copy => write_usage(),
            CopyKind::Reduce { redop, .. } => reduce_usage(redop),
        };
        self.add_copy_user(src, read_usage(), completion, fields, node);
        self.add_copy_user(dst, dst_usage, completion, fields, node);
        let request = CopyRequest {
            kind,
            src: src.did,
            dst: dst.did,
            src_node: node,
            dst_node: node,
            fields: src
                .copy_fields(fields)
                .into_iter()
                .zip(dst.copy_fields(fields))
                .collect(),
            precondition,
            completion,
        };
        trace!(%kind, src = %src.did, dst = %dst.did, %fields, %precondition, %completion, "issued copy");
        self.record_copy(request);
        completion
    }
}

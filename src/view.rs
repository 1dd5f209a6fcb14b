//! Views over physical instances and the users recorded on them.
//!
//! A materialized view is a manager seen from one region tree node; users
//! registered through any view land on the manager so that preconditions are
//! found across the whole instance. Views are reference counted by the
//! physical states that list them as valid; when the last state drops the
//! last view of a manager, the manager is queued for deferred collection.

mod manager;

pub use crate::view::manager::{CopyField, ManagerKind, PhysicalManager};
pub(crate) use crate::view::manager::PhysicalUser;
use crate::{
    close::CompositeView,
    event::Event,
    forest::RegionTreeForest,
    mask::FieldMask,
    sync::{Arc, AtomicUsize, Ordering},
    tree::NodeId,
    types::{check_dependence_type, DependenceType, DistributedId, IndexMap, MemoryId, RegionUsage},
};
use tracing::{debug, trace};

/// How a view presents its data.
#[derive(Debug)]
pub enum ViewKind {
    /// A normal instance.
    Materialized(Arc<PhysicalManager>),
    /// A reduction instance holding pending contributions.
    Reduction(Arc<PhysicalManager>),
    /// A snapshot of a closed subtree, materialized lazily.
    Composite(CompositeView),
}

/// A view of data at one region tree node.
#[derive(Debug)]
pub struct LogicalView {
    pub(crate) did: DistributedId,
    pub(crate) node: NodeId,
    pub(crate) kind: ViewKind,
    pub(crate) valid_refs: AtomicUsize,
}

impl LogicalView {
    pub(crate) fn new(did: DistributedId, node: NodeId, kind: ViewKind) -> Self {
        Self {
            did,
            node,
            kind,
            valid_refs: AtomicUsize::new(0),
        }
    }

    /// Distributed id.
    #[must_use]
    pub fn did(&self) -> DistributedId {
        self.did
    }

    /// Node the view is attached to.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Presentation.
    #[must_use]
    pub fn kind(&self) -> &ViewKind {
        &self.kind
    }

    /// Manager backing a materialized or reduction view.
    #[must_use]
    pub fn manager(&self) -> Option<&Arc<PhysicalManager>> {
        match &self.kind {
            ViewKind::Materialized(manager) | ViewKind::Reduction(manager) => Some(manager),
            ViewKind::Composite(_) => None,
        }
    }

    /// Memory of the backing instance.
    #[must_use]
    pub fn memory(&self) -> Option<MemoryId> {
        self.manager().map(|manager| manager.memory)
    }

    /// Whether this is a materialized view.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        matches!(self.kind, ViewKind::Materialized(_))
    }

    /// Whether this is a reduction view.
    #[must_use]
    pub fn is_reduction(&self) -> bool {
        matches!(self.kind, ViewKind::Reduction(_))
    }

    /// The composite snapshot, for composite views.
    #[must_use]
    pub fn as_composite(&self) -> Option<&CompositeView> {
        match &self.kind {
            ViewKind::Composite(composite) => Some(composite),
            _ => None,
        }
    }

    /// Number of physical states listing this view as valid.
    #[must_use]
    pub fn valid_references(&self) -> usize {
        self.valid_refs.load(Ordering::Acquire)
    }
}

impl RegionTreeForest {
    /// View of `manager` at `node`, created on first use.
    pub(crate) fn materialized_view(&self, manager: &Arc<PhysicalManager>, node: NodeId) -> Arc<LogicalView> {
        let key = (manager.did, node);
        if let Some(view) = self.materialized.lock().get(&key) {
            return Arc::clone(view);
        }
        let kind = if manager.kind.redop().is_some() {
            ViewKind::Reduction(Arc::clone(manager))
        } else {
            ViewKind::Materialized(Arc::clone(manager))
        };
        let candidate = Arc::new(LogicalView::new(self.next_did(), node, kind));
        let view = Arc::clone(
            self.materialized
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::clone(&candidate)),
        );
        if Arc::ptr_eq(&view, &candidate) {
            self.register_view(&view);
        }
        view
    }

    pub(crate) fn register_view(&self, view: &Arc<LogicalView>) {
        self.views.write().insert(view.did, Arc::clone(view));
    }

    /// View with the given id, if this forest knows it.
    #[must_use]
    pub fn find_view(&self, did: DistributedId) -> Option<Arc<LogicalView>> {
        self.views.read().get(&did).cloned()
    }

    /// Manager with the given id, if this forest knows it.
    #[must_use]
    pub fn find_manager(&self, did: DistributedId) -> Option<Arc<PhysicalManager>> {
        self.managers.read().get(&did).cloned()
    }

    /// A physical state started listing `view` as valid.
    pub(crate) fn add_valid_reference(&self, view: &LogicalView) {
        if view.valid_refs.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        match &view.kind {
            ViewKind::Materialized(manager) | ViewKind::Reduction(manager) => {
                manager.valid_refs.fetch_add(1, Ordering::AcqRel);
            }
            ViewKind::Composite(composite) => {
                for captured in composite.captured_views() {
                    self.add_valid_reference(&captured);
                }
            }
        }
    }

    /// A physical state stopped listing `view` as valid.
    pub(crate) fn remove_valid_reference(&self, view: &LogicalView) {
        if view.valid_refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        match &view.kind {
            ViewKind::Materialized(manager) | ViewKind::Reduction(manager) => self.release_manager(manager),
            ViewKind::Composite(composite) => {
                for captured in composite.captured_views() {
                    self.remove_valid_reference(&captured);
                }
            }
        }
    }

    fn release_manager(&self, manager: &PhysicalManager) {
        if manager.valid_refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Collection waits for every user still recorded on the instance.
        let ready = self.events.merge_events(manager.user_events());
        debug!(manager = %manager.did, %ready, "instance no longer valid anywhere");
        self.garbage.lock().push((manager.did, ready));
    }

    /// Terminations of `users` that `user` must wait for.
    fn find_user_preconditions(&self, users: &[PhysicalUser], user: &PhysicalUser) -> Vec<Event> {
        users
            .iter()
            .filter(|prev| {
                prev.mask.intersects(user.mask)
                    && check_dependence_type(&prev.usage, &user.usage).orders()
                    && self.nodes_intersect(prev.node, user.node)
            })
            .map(|prev| prev.term)
            .collect()
    }

    /// Whether `user` waits for `prev` and covers all of its fields and
    /// points, so later users never need to see `prev`.
    fn dominates_user(&self, user: &PhysicalUser, prev: &PhysicalUser) -> bool {
        matches!(
            check_dependence_type(&prev.usage, &user.usage),
            DependenceType::TrueDependence | DependenceType::AntiDependence
        ) && user.mask.covers(prev.mask)
            && self.node_dominates(user.node, prev.node)
    }

    /// Record `user` on `manager` and return the event it must wait for.
    ///
    /// Users the new one is ordered after and whose fields and points it
    /// covers are dropped.
    pub(crate) fn add_physical_user(&self, manager: &Arc<PhysicalManager>, user: PhysicalUser) -> Event {
        let term = user.term;
        let preconditions = {
            let mut users = manager.users.lock();
            let mut preconditions = vec![manager.use_event];
            preconditions.extend(self.find_user_preconditions(&users, &user));
            users.retain(|prev| !self.dominates_user(&user, prev));
            users.push(user);
            preconditions
        };
        let weak = Arc::downgrade(manager);
        self.events.on_trigger(term, move || {
            if let Some(manager) = weak.upgrade() {
                manager.filter_users(term);
            }
        });
        let ready = self.events.merge_events(preconditions);
        trace!(manager = %manager.did, %term, %ready, "added physical user");
        ready
    }

    /// Preconditions a copy touching `mask` of `manager` at `node` with
    /// `usage` must wait for, grouped by event.
    pub(crate) fn find_copy_preconditions(
        &self,
        manager: &PhysicalManager,
        usage: &RegionUsage,
        mask: FieldMask,
        node: NodeId,
    ) -> IndexMap<Event, FieldMask> {
        let mut preconditions = IndexMap::<Event, FieldMask>::default();
        if manager.use_event.exists() {
            preconditions.insert(manager.use_event, mask);
        }
        for user in manager.users.lock().iter() {
            let overlap = user.mask & mask;
            if overlap.is_empty() || !check_dependence_type(&user.usage, usage).orders() {
                continue;
            }
            if self.nodes_intersect(user.node, node) {
                *preconditions.entry(user.term).or_default() |= overlap;
            }
        }
        preconditions
    }

    /// Record a copy's use of `manager` so later users order after it.
    pub(crate) fn add_copy_user(
        &self,
        manager: &Arc<PhysicalManager>,
        usage: RegionUsage,
        term: Event,
        mask: FieldMask,
        node: NodeId,
    ) {
        self.add_physical_user(
            manager,
            PhysicalUser {
                usage,
                mask,
                term,
                node,
            },
        );
    }

    /// Whether a writer of `mask` at `node` would have to wait on readers
    /// still in flight on `manager`.
    pub(crate) fn has_war_dependence(
        &self,
        manager: &PhysicalManager,
        usage: &RegionUsage,
        mask: FieldMask,
        node: NodeId,
    ) -> bool {
        if !usage.is_write() {
            return false;
        }
        let readers: Vec<Event> = manager
            .users
            .lock()
            .iter()
            .filter(|user| {
                user.usage.is_read_only() && user.mask.intersects(mask) && self.nodes_intersect(user.node, node)
            })
            .map(|user| user.term)
            .collect();
        readers.into_iter().any(|term| !self.events.has_triggered(term))
    }

    /// Free every queued instance whose users have finished and that no
    /// state or remote space still references. Returns the freed managers.
    pub fn collect_garbage(&self) -> Vec<DistributedId> {
        let pending = core::mem::take(&mut *self.garbage.lock());
        let mut freed = Vec::new();
        let mut deferred = Vec::new();
        for (did, ready) in pending {
            let Some(manager) = self.find_manager(did) else {
                continue;
            };
            if manager.valid_references() > 0 {
                // Revived; the next release queues it again.
                continue;
            }
            if !self.events.has_triggered(ready) || !manager.subscribers().is_empty() {
                deferred.push((did, ready));
                continue;
            }
            self.managers.write().shift_remove(&did);
            let dropped: Vec<DistributedId> = {
                let mut materialized = self.materialized.lock();
                let dropped = materialized
                    .iter()
                    .filter(|((owner, _), _)| *owner == did)
                    .map(|(_, view)| view.did)
                    .collect();
                materialized.retain(|(owner, _), _| *owner != did);
                dropped
            };
            {
                let mut views = self.views.write();
                for view in dropped {
                    views.remove(&view);
                }
            }
            self.release_memory(manager.memory, manager.size);
            debug!(manager = %did, memory = %manager.memory, bytes = manager.size, "collected instance");
            freed.push(did);
        }
        self.garbage.lock().extend(deferred);
        freed
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{domain::Domain, types::MemoryId};

    fn user(usage: RegionUsage, term: Event, node: NodeId) -> PhysicalUser {
        PhysicalUser {
            usage,
            mask: FieldMask::single(0),
            term,
            node,
        }
    }

    #[test]
    fn writers_wait_for_and_replace_covered_readers() {
        let forest = RegionTreeForest::default();
        let shape = forest.shape();
        let space = shape.create_index_space(Domain::rect1(0, 99));
        let halves = [(0, Domain::rect1(0, 49)), (1, Domain::rect1(50, 99))];
        let part = shape.create_index_partition(space, halves, true, None, false).unwrap();
        let fs = shape.create_field_space();
        shape.allocate_field(fs, 0, 8).unwrap();
        let root = shape.create_logical_region(space, fs).unwrap();
        let partition = forest.get_logical_partition(root, part).unwrap();
        let left = forest.region_node(forest.get_logical_subregion_by_color(partition, 0).unwrap()).unwrap();
        let right = forest.region_node(forest.get_logical_subregion_by_color(partition, 1).unwrap()).unwrap();
        let root_node = forest.region_node(root).unwrap();
        forest.register_memory(MemoryId(1), 1 << 16);
        let manager = forest.create_instance(root, &[0], MemoryId(1), None).unwrap();

        let reader = forest.events().create_user_event();
        let ready = forest.add_physical_user(&manager, user(RegionUsage::read_only(), reader, left));
        assert_eq!(ready, Event::NO_EVENT);

        // A writer of the other half does not touch the reader's points.
        let right_writer = forest.events().create_user_event();
        let ready = forest.add_physical_user(&manager, user(RegionUsage::read_write(), right_writer, right));
        assert_eq!(ready, Event::NO_EVENT);

        let writer = forest.events().create_user_event();
        let ready = forest.add_physical_user(&manager, user(RegionUsage::read_write(), writer, root_node));
        assert!(forest.events().depends_on(ready, reader));
        assert!(forest.events().depends_on(ready, right_writer));
        let remaining: Vec<Event> = manager.users.lock().iter().map(|u| u.term).collect();
        assert_eq!(remaining, vec![writer]);

        let later = forest.add_physical_user(
            &manager,
            user(RegionUsage::read_only(), forest.events().create_user_event(), left),
        );
        assert_eq!(later, writer);
    }
}

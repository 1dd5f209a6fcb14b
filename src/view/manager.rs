use crate::{
    event::Event,
    mask::{FieldMask, NodeSet},
    shape::LayoutDescription,
    sync::{Arc, AtomicUsize, Mutex, Ordering},
    tree::NodeId,
    types::{AddressSpaceId, DistributedId, FieldId, MemoryId, ReductionOpId, RegionUsage},
};
use derive_more::Display;

/// What kind of physical instance a manager owns.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerKind {
    /// A normal instance holding field values.
    Instance,
    /// A reduction instance buffering a list of contributions.
    #[display("ListReduction({_0})")]
    ListReduction(ReductionOpId),
    /// A reduction instance folding contributions in place.
    #[display("FoldReduction({_0})")]
    FoldReduction(ReductionOpId),
}

impl ManagerKind {
    /// Reduction operator of a reduction instance.
    #[must_use]
    pub fn redop(self) -> Option<ReductionOpId> {
        match self {
            Self::Instance => None,
            Self::ListReduction(redop) | Self::FoldReduction(redop) => Some(redop),
        }
    }
}

/// A user of an instance, live until `term` triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PhysicalUser {
    pub(crate) usage: RegionUsage,
    pub(crate) mask: FieldMask,
    pub(crate) term: Event,
    pub(crate) node: NodeId,
}

/// One field's placement in a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyField {
    /// Field copied.
    pub field: FieldId,
    /// Byte offset of the field in its instance.
    pub offset: usize,
    /// Element size.
    pub size: usize,
}

/// Owner of one physical instance.
///
/// Views over the instance at different nodes share the manager; the
/// manager tracks every user of the instance so preconditions can be found
/// regardless of which view a user came through.
#[derive(Debug)]
pub struct PhysicalManager {
    pub(crate) did: DistributedId,
    pub(crate) owner: AddressSpaceId,
    pub(crate) memory: MemoryId,
    pub(crate) region: NodeId,
    pub(crate) kind: ManagerKind,
    pub(crate) layout: Arc<LayoutDescription>,
    pub(crate) size: usize,
    pub(crate) use_event: Event,
    pub(crate) users: Mutex<Vec<PhysicalUser>>,
    pub(crate) valid_refs: AtomicUsize,
    pub(crate) subscribers: Mutex<NodeSet>,
}

impl PhysicalManager {
    /// Distributed id.
    #[must_use]
    pub fn did(&self) -> DistributedId {
        self.did
    }

    /// Address space owning the instance.
    #[must_use]
    pub fn owner(&self) -> AddressSpaceId {
        self.owner
    }

    /// Memory holding the instance.
    #[must_use]
    pub fn memory(&self) -> MemoryId {
        self.memory
    }

    /// Region node the instance was created for.
    #[must_use]
    pub fn region(&self) -> NodeId {
        self.region
    }

    /// Instance kind.
    #[must_use]
    pub fn kind(&self) -> ManagerKind {
        self.kind
    }

    /// Field layout.
    #[must_use]
    pub fn layout(&self) -> &Arc<LayoutDescription> {
        &self.layout
    }

    /// Fields held by the instance.
    #[must_use]
    pub fn mask(&self) -> FieldMask {
        self.layout.mask()
    }

    /// Bytes occupied in its memory.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Event after which the instance may be used.
    #[must_use]
    pub fn use_event(&self) -> Event {
        self.use_event
    }

    /// Number of physical states in which a view of the instance is valid.
    #[must_use]
    pub fn valid_references(&self) -> usize {
        self.valid_refs.load(Ordering::Acquire)
    }

    /// Remote address spaces holding a copy of the manager.
    #[must_use]
    pub fn subscribers(&self) -> NodeSet {
        *self.subscribers.lock()
    }

    /// Remember that `space` holds a copy of the manager.
    pub fn add_subscriber(&self, space: AddressSpaceId) {
        self.subscribers.lock().add(space);
    }

    /// `space` dropped its copy of the manager.
    pub fn remove_subscriber(&self, space: AddressSpaceId) {
        self.subscribers.lock().remove(space);
    }

    /// Number of users still recorded.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    pub(crate) fn copy_fields(&self, mask: FieldMask) -> Vec<CopyField> {
        self.layout
            .fields_in(mask)
            .map(|(field, layout)| CopyField {
                field,
                offset: layout.offset,
                size: layout.size,
            })
            .collect()
    }

    pub(crate) fn user_events(&self) -> Vec<Event> {
        self.users.lock().iter().map(|user| user.term).collect()
    }

    /// Drop every user that finished with `term`.
    pub(crate) fn filter_users(&self, term: Event) {
        self.users.lock().retain(|user| user.term != term);
    }

    /// Whether `other` names the same instance.
    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        self.did == other.did
    }
}

use derive_more::{Display, From};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::{HashMap as _HashMap, HashSet as _HashSet};

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
/// `IndexSet` type with fast hasher.
pub type IndexSet<T> = _IndexSet<T, FxBuildHasher>;

/// Color of a child inside its parent (a subspace inside a partition, or a
/// partition inside a space).
pub type Color = u32;
/// User-visible field identifier inside a field space.
pub type FieldId = u32;

/// Identifier of a concurrent operation stream.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("ctx{_0}")]
pub struct ContextId(pub u32);

impl ContextId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a machine node.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("space{_0}")]
pub struct AddressSpaceId(pub u16);

/// Identifier of an operation submitted by the scheduler.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("op{_0}")]
pub struct OperationId(pub u64);

impl OperationId {
    /// Close operations generated by the forest live above this bound.
    pub const CLOSE_BASE: u64 = 1 << 63;

    /// Whether this id was generated for a logical close.
    #[must_use]
    pub fn is_close(self) -> bool {
        self.0 >= Self::CLOSE_BASE
    }
}

/// Identifier of a registered reduction operator.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("redop{_0}")]
pub struct ReductionOpId(pub u32);

/// Identifier of a memory a physical instance can live in.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("mem{_0}")]
pub struct MemoryId(pub u32);

/// Globally unique identifier of a distributed object (manager or view).
///
/// The upper 16 bits carry the address space that allocated it.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("did{_0:#x}")]
pub struct DistributedId(pub u64);

impl DistributedId {
    pub(crate) fn compose(space: AddressSpaceId, counter: u64) -> Self {
        Self((u64::from(space.0) << 48) | (counter & ((1 << 48) - 1)))
    }

    /// Address space that created the object.
    #[must_use]
    pub fn origin(self) -> AddressSpaceId {
        AddressSpaceId((self.0 >> 48) as u16)
    }
}

/// Identifier of one region tree (one root logical region).
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("tree{_0}")]
pub struct RegionTreeId(pub u32);

/// Handle of an index space.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("is{_0}")]
pub struct IndexSpace(pub u32);

/// Handle of an index partition.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("ip{_0}")]
pub struct IndexPartition(pub u32);

/// Handle of a field space.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("fs{_0}")]
pub struct FieldSpace(pub u32);

/// A logical region: an index space crossed with a field space in one tree.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("region({index_space},{field_space},{tree_id})")]
pub struct LogicalRegion {
    /// Index space naming the points.
    pub index_space: IndexSpace,
    /// Field space naming the columns.
    pub field_space: FieldSpace,
    /// Tree the region belongs to.
    pub tree_id: RegionTreeId,
}

/// A logical partition: an index partition crossed with a field space in one
/// tree.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("partition({index_partition},{field_space},{tree_id})")]
pub struct LogicalPartition {
    /// Index partition naming the coloring.
    pub index_partition: IndexPartition,
    /// Field space naming the columns.
    pub field_space: FieldSpace,
    /// Tree the partition belongs to.
    pub tree_id: RegionTreeId,
}

/// Access privilege requested by a region requirement.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivilegeMode {
    /// No access; used for requirements that only name data.
    #[display("no-access")]
    NoAccess,
    /// Read existing data.
    #[display("read-only")]
    ReadOnly,
    /// Read and write existing data.
    #[display("read-write")]
    ReadWrite,
    /// Overwrite without reading; stale contents need not be copied in.
    #[display("write-only")]
    WriteOnly,
    /// Apply a reduction operator.
    #[display("reduce({_0})")]
    Reduce(ReductionOpId),
}

/// Coherence property governing how aliased accesses may interleave.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoherenceProperty {
    /// Program order must be preserved.
    #[display("exclusive")]
    Exclusive,
    /// Serialized, but in any order.
    #[display("atomic")]
    Atomic,
    /// Concurrent access to one shared instance.
    #[display("simultaneous")]
    Simultaneous,
    /// No ordering whatsoever.
    #[display("relaxed")]
    Relaxed,
}

/// Privilege plus coherence of an access.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{privilege}/{prop}")]
pub struct RegionUsage {
    /// Access privilege.
    pub privilege: PrivilegeMode,
    /// Coherence property.
    pub prop: CoherenceProperty,
}

impl RegionUsage {
    /// Construct a usage.
    #[must_use]
    pub const fn new(privilege: PrivilegeMode, prop: CoherenceProperty) -> Self {
        Self { privilege, prop }
    }

    /// Read-write exclusive usage; the usage of close operations and copy
    /// destinations.
    #[must_use]
    pub const fn read_write() -> Self {
        Self::new(PrivilegeMode::ReadWrite, CoherenceProperty::Exclusive)
    }

    /// Read-only exclusive usage; the usage of copy sources.
    #[must_use]
    pub const fn read_only() -> Self {
        Self::new(PrivilegeMode::ReadOnly, CoherenceProperty::Exclusive)
    }

    /// Whether the usage only reads (or does not access at all).
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self.privilege, PrivilegeMode::ReadOnly | PrivilegeMode::NoAccess)
    }

    /// Whether the usage mutates data in place (reductions excluded).
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self.privilege, PrivilegeMode::ReadWrite | PrivilegeMode::WriteOnly)
    }

    /// Whether the usage discards the previous contents.
    #[must_use]
    pub fn is_write_only(&self) -> bool {
        matches!(self.privilege, PrivilegeMode::WriteOnly)
    }

    /// The reduction operator if this usage reduces.
    #[must_use]
    pub fn redop(&self) -> Option<ReductionOpId> {
        match self.privilege {
            PrivilegeMode::Reduce(redop) => Some(redop),
            _ => None,
        }
    }

    /// Whether the usage reduces.
    #[must_use]
    pub fn is_reduce(&self) -> bool {
        self.redop().is_some()
    }
}

/// Ordering relation required between two users of overlapping data.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependenceType {
    /// The accesses commute.
    #[display("none")]
    NoDependence,
    /// Read-after-write or write-after-write.
    #[display("true")]
    TrueDependence,
    /// Write-after-read.
    #[display("anti")]
    AntiDependence,
    /// Both sides are atomic: serialize in any order.
    #[display("atomic")]
    AtomicDependence,
    /// Simultaneous or relaxed coherence: no ordering.
    #[display("simultaneous")]
    SimultaneousDependence,
}

impl DependenceType {
    /// Whether this dependence must be registered as an edge.
    #[must_use]
    pub fn orders(self) -> bool {
        matches!(
            self,
            Self::TrueDependence | Self::AntiDependence | Self::AtomicDependence
        )
    }
}

/// Classify the dependence of `next` on an earlier `prev` access.
#[must_use]
pub fn check_dependence_type(prev: &RegionUsage, next: &RegionUsage) -> DependenceType {
    use CoherenceProperty::{Atomic, Exclusive};
    if prev.is_read_only() && next.is_read_only() {
        return DependenceType::NoDependence;
    }
    if let (Some(lhs), Some(rhs)) = (prev.redop(), next.redop()) {
        return if lhs == rhs {
            DependenceType::NoDependence
        } else {
            DependenceType::TrueDependence
        };
    }
    let ordered = if prev.is_read_only() {
        DependenceType::AntiDependence
    } else {
        DependenceType::TrueDependence
    };
    match (prev.prop, next.prop) {
        (Exclusive, _) | (_, Exclusive) => ordered,
        (Atomic, Atomic) if prev.is_read_only() => DependenceType::AntiDependence,
        (Atomic, Atomic) => DependenceType::AtomicDependence,
        _ => DependenceType::SimultaneousDependence,
    }
}

/// What a region requirement names: a region or a partition.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequirementTarget {
    /// A logical region.
    Region(LogicalRegion),
    /// A logical partition (projection requirements).
    Partition(LogicalPartition),
}

/// A request for access to some fields of a region or partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequirement {
    /// The data being accessed.
    pub target: RequirementTarget,
    /// Region the privileges are derived from; the analysis path starts here.
    pub parent: LogicalRegion,
    /// Fields being accessed.
    pub fields: Vec<FieldId>,
    /// Requested usage.
    pub usage: RegionUsage,
}

impl RegionRequirement {
    /// Requirement on a region whose privileges derive from `parent`.
    #[must_use]
    pub fn region(
        region: LogicalRegion,
        parent: LogicalRegion,
        fields: impl Into<Vec<FieldId>>,
        privilege: PrivilegeMode,
        prop: CoherenceProperty,
    ) -> Self {
        Self {
            target: RequirementTarget::Region(region),
            parent,
            fields: fields.into(),
            usage: RegionUsage::new(privilege, prop),
        }
    }

    /// Requirement on a partition whose privileges derive from `parent`.
    #[must_use]
    pub fn partition(
        partition: LogicalPartition,
        parent: LogicalRegion,
        fields: impl Into<Vec<FieldId>>,
        privilege: PrivilegeMode,
        prop: CoherenceProperty,
    ) -> Self {
        Self {
            target: RequirementTarget::Partition(partition),
            parent,
            fields: fields.into(),
            usage: RegionUsage::new(privilege, prop),
        }
    }

    /// Field space of the accessed data.
    #[must_use]
    pub fn field_space(&self) -> FieldSpace {
        self.parent.field_space
    }
}

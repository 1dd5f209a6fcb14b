#![allow(dead_code)]
//! Shared integration test helpers.

use parking_lot::Mutex;
use rtf::{
    CloseOp, ForestConfig, InstanceRef, MappingDecision, Operation, RegionTreeForest,
    domain::Domain,
    event::Event,
    tree::NodeId,
    types::{
        CoherenceProperty, ContextId, DependenceType, FieldId, LogicalPartition, LogicalRegion, MemoryId,
        OperationId, PrivilegeMode, RegionRequirement,
    },
};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Memory every fixture registers.
pub const MEM: MemoryId = MemoryId(1);
/// Second memory, registered by fixtures that need one.
pub const MEM2: MemoryId = MemoryId(2);
/// Fields allocated in the fixture's field space, ids equal to indexes.
pub const FIELDS: u32 = 8;

/// Install a `RUST_LOG`-driven subscriber once per test binary.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Operation recording everything the forest reports to it.
#[derive(Debug)]
pub struct RecordingOp {
    id: OperationId,
    edges: Mutex<Vec<(OperationId, DependenceType)>>,
    closes: Mutex<Vec<CloseOp>>,
}

impl RecordingOp {
    pub fn new(id: u64) -> Self {
        Self {
            id: OperationId(id),
            edges: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn edges(&self) -> Vec<(OperationId, DependenceType)> {
        self.edges.lock().clone()
    }

    pub fn closes(&self) -> Vec<CloseOp> {
        self.closes.lock().clone()
    }
}

impl Operation for RecordingOp {
    fn unique_id(&self) -> OperationId {
        self.id
    }

    fn register_dependence(&self, target: OperationId, kind: DependenceType) {
        self.edges.lock().push((target, kind));
    }

    fn register_close(&self, close: &CloseOp) {
        self.closes.lock().push(close.clone());
    }
}

/// A forest with one tree: 100 points split into 4 disjoint, complete
/// quarters, and `FIELDS` fields of 8 bytes.
pub struct Fixture {
    pub forest: RegionTreeForest,
    pub root: LogicalRegion,
    pub partition: LogicalPartition,
    pub ctx: ContextId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(ForestConfig::default())
    }

    pub fn with_config(config: ForestConfig) -> Self {
        init_test_logging();
        let forest = RegionTreeForest::new(config);
        let shape = forest.shape();
        let space = shape.create_index_space(Domain::rect1(0, 99));
        let quarters = (0..4u32).map(|c| (c, Domain::rect1(i64::from(c) * 25, i64::from(c) * 25 + 24)));
        shape
            .create_index_partition(space, quarters, true, None, true)
            .unwrap();
        let fs = shape.create_field_space();
        for fid in 0..FIELDS {
            shape.allocate_field(fs, fid, 8).unwrap();
        }
        let root = shape.create_logical_region(space, fs).unwrap();
        let partition = forest.get_logical_partition_by_color(root, 0).unwrap();
        forest.register_memory(MEM, 1 << 20);
        forest.register_memory(MEM2, 1 << 20);
        let ctx = forest.allocate_context();
        Self {
            forest,
            root,
            partition,
            ctx,
        }
    }

    pub fn subregion(&self, color: u32) -> LogicalRegion {
        self.forest
            .get_logical_subregion_by_color(self.partition, color)
            .unwrap()
    }

    pub fn node(&self, region: LogicalRegion) -> NodeId {
        self.forest.region_node(region).unwrap()
    }

    pub fn root_node(&self) -> NodeId {
        self.node(self.root)
    }

    pub fn partition_node(&self) -> NodeId {
        self.forest.partition_node(self.partition).unwrap()
    }

    /// Requirement on `region` derived from the root.
    pub fn req(
        &self,
        region: LogicalRegion,
        fields: &[FieldId],
        privilege: PrivilegeMode,
        prop: CoherenceProperty,
    ) -> RegionRequirement {
        RegionRequirement::region(region, self.root, fields.to_vec(), privilege, prop)
    }

    pub fn analyze(&self, op: &RecordingOp, req: &RegionRequirement) {
        self.forest
            .perform_dependence_analysis(self.ctx, op, 0, req)
            .unwrap();
    }

    /// Premap, map and register `req`; the user's work ends at `term`.
    pub fn map(&self, req: &RegionRequirement, decision: &MappingDecision, term: Event) -> InstanceRef {
        let path = self.forest.requirement_path(req).unwrap();
        self.forest
            .premap_physical_region(self.ctx, &path, req, decision)
            .unwrap();
        let mapping = self
            .forest
            .map_physical_region(self.ctx, &path, req, decision)
            .unwrap();
        self.forest
            .register_physical_region(self.ctx, &mapping, req, term)
            .unwrap()
    }

    pub fn user_event(&self) -> Event {
        self.forest.events().create_user_event()
    }
}

pub fn decision() -> MappingDecision {
    MappingDecision::new([MEM])
}

pub fn rw() -> (PrivilegeMode, CoherenceProperty) {
    (PrivilegeMode::ReadWrite, CoherenceProperty::Exclusive)
}

pub fn ro() -> (PrivilegeMode, CoherenceProperty) {
    (PrivilegeMode::ReadOnly, CoherenceProperty::Exclusive)
}

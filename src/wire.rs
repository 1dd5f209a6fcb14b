//! Messages exchanged between the forests of different address spaces.
//!
//! Every message starts with a fixed header (magic, kind, context, source
//! space). Node references travel as `(tree id, colors from the root)` so
//! the receiver can rebuild them from its replicated shape; field sets
//! travel as raw 128-bit masks. State messages list the managers first,
//! then the views (captured views before the composites holding them), then
//! one record per node in preorder, so every reference points backwards.

use crate::{
    close::{CompositeNode, CompositeView},
    directory::{Access, Invalidation},
    domain::{Domain, MAX_DIM},
    event::Event,
    forest::RegionTreeForest,
    mask::{FieldMask, NodeSet},
    shape::{IndexNode, IndexPartNode, IndexSpaceNode, ShapeError},
    sync::{Arc, AtomicUsize, Mutex},
    tree::{NodeId, TreeHandle},
    types::{
        AddressSpaceId, Color, ContextId, DistributedId, FieldSpace, IndexMap, IndexPartition, IndexSpace,
        LogicalRegion, MemoryId, ReductionOpId, RegionTreeId,
    },
    view::{LogicalView, ManagerKind, PhysicalManager, ViewKind},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_more::Display;
use thiserror::Error;
use tracing::{debug, trace};

const MAGIC: u32 = 0x5254_4631;

const TAG_END: u8 = 0;
const TAG_SPACE: u8 = 1;
const TAG_PARTITION: u8 = 2;

const VIEW_MATERIALIZED: u8 = 1;
const VIEW_REDUCTION: u8 = 2;
const VIEW_COMPOSITE: u8 = 3;

const MANAGER_INSTANCE: u8 = 0;
const MANAGER_LIST: u8 = 1;
const MANAGER_FOLD: u8 = 2;

/// Error kind for decoding messages.
///
/// A decoding failure means the two forests disagree about shared metadata;
/// the runtime treats it as fatal.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum WireError {
    /// The buffer does not start with the message magic.
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    /// The kind byte names no known message.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    /// The message is of another kind than the decoder expects.
    #[error("expected a {expected} message, found {found}")]
    UnexpectedKind {
        /// Kind the decoder handles.
        expected: MessageKind,
        /// Kind in the header.
        found: MessageKind,
    },
    /// The header names another sender than the transport reported.
    #[error("message claims to come from {found}, transport says {expected}")]
    UnexpectedSource {
        /// Sender reported by the transport.
        expected: AddressSpaceId,
        /// Sender in the header.
        found: AddressSpaceId,
    },
    /// The buffer ended early.
    #[error("truncated message: needed {needed} bytes, {remaining} left")]
    Truncated {
        /// Bytes the next read needs.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// A value does not fit this platform's `usize`.
    #[error("value {0} does not fit in usize")]
    Oversized(u64),
    /// A record tag is not known.
    #[error("unknown record tag {0}")]
    UnknownTag(u8),
    /// A node path does not resolve in the local shape.
    #[error("no node at {path:?} in {tree}")]
    MissingNode {
        /// Tree of the path.
        tree: RegionTreeId,
        /// Colors from the tree root.
        path: Vec<Color>,
    },
    /// A view id was referenced before being sent.
    #[error("unknown view {0}")]
    UnknownView(DistributedId),
    /// A manager id was referenced before being sent.
    #[error("unknown manager {0}")]
    UnknownManager(DistributedId),
    /// The replicated shape disagrees with the local one.
    #[error("replicated shape disagrees with local metadata: {0}")]
    ShapeMismatch(String),
    /// The local shape rejected a lookup.
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// What a message carries.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Shape of one region tree.
    Shape = 1,
    /// Physical state sent to a remote space.
    State = 2,
    /// Physical state returned to its owner.
    SendBack = 3,
    /// Remote state is still valid.
    Validate = 4,
    /// Remote state went stale.
    Invalidate = 5,
}

impl MessageKind {
    /// Kind for a wire byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Shape),
            2 => Some(Self::State),
            3 => Some(Self::SendBack),
            4 => Some(Self::Validate),
            5 => Some(Self::Invalidate),
            _ => None,
        }
    }
}

/// Fixed prefix of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message kind.
    pub kind: MessageKind,
    /// Context the message is about.
    pub ctx: ContextId,
    /// Address space that built the message.
    pub source: AddressSpaceId,
}

impl MessageHeader {
    const LEN: usize = 11;

    /// Decode the header of `bytes` without consuming it, so a transport
    /// can dispatch on the kind.
    ///
    /// # Errors
    /// On a bad magic, an unknown kind or a short buffer.
    pub fn peek(bytes: &Bytes) -> Result<Self, WireError> {
        Decoder::new(bytes.clone()).header()
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(MAGIC);
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.ctx.0);
        dst.put_u16(self.source.0);
    }
}

/// What an incoming state message changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteUpdate {
    /// Context updated.
    pub ctx: ContextId,
    /// Sender.
    pub source: AddressSpaceId,
    /// Node at the top of the update.
    pub node: NodeId,
    /// Fields updated.
    pub mask: FieldMask,
}

/// State of one node as it travels.
#[derive(Debug)]
struct StateRecord {
    node: NodeId,
    dirty: FieldMask,
    reduction_mask: FieldMask,
    open: Vec<(Color, FieldMask)>,
    valid: Vec<(Arc<LogicalView>, FieldMask)>,
    reductions: Vec<(Arc<LogicalView>, FieldMask)>,
}

impl StateRecord {
    fn empty(node: NodeId) -> Self {
        Self {
            node,
            dirty: FieldMask::EMPTY,
            reduction_mask: FieldMask::EMPTY,
            open: Vec::new(),
            valid: Vec::new(),
            reductions: Vec::new(),
        }
    }
}

struct Decoder {
    buf: Bytes,
}

impl Decoder {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<(), WireError> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(WireError::Truncated { needed, remaining });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn usize(&mut self) -> Result<usize, WireError> {
        let value = self.u64()?;
        usize::try_from(value).map_err(|_| WireError::Oversized(value))
    }

    fn len(&mut self) -> Result<usize, WireError> {
        Ok(self.u32()? as usize)
    }

    fn bool(&mut self) -> Result<bool, WireError> {
        Ok(self.u8()? != 0)
    }

    fn mask(&mut self) -> Result<FieldMask, WireError> {
        self.need(16)?;
        Ok(FieldMask::from_bits(self.buf.get_u128()))
    }

    fn did(&mut self) -> Result<DistributedId, WireError> {
        Ok(DistributedId(self.u64()?))
    }

    fn header(&mut self) -> Result<MessageHeader, WireError> {
        self.need(MessageHeader::LEN)?;
        let magic = self.buf.get_u32();
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let raw = self.buf.get_u8();
        let kind = MessageKind::from_u8(raw).ok_or(WireError::UnknownKind(raw))?;
        let ctx = ContextId(self.buf.get_u32());
        let source = AddressSpaceId(self.buf.get_u16());
        Ok(MessageHeader { kind, ctx, source })
    }

    fn expect_kind(&mut self, expected: MessageKind) -> Result<MessageHeader, WireError> {
        let header = self.header()?;
        if header.kind != expected {
            return Err(WireError::UnexpectedKind {
                expected,
                found: header.kind,
            });
        }
        Ok(header)
    }

    fn path(&mut self) -> Result<(RegionTreeId, Vec<Color>), WireError> {
        let tree = RegionTreeId(self.u32()?);
        let len = self.len()?;
        let mut colors = Vec::new();
        for _ in 0..len {
            colors.push(self.u32()?);
        }
        Ok((tree, colors))
    }

    fn domain(&mut self) -> Result<Domain, WireError> {
        let dim = self.u8()?;
        let mut lo = [0; MAX_DIM];
        let mut hi = [0; MAX_DIM];
        for axis in &mut lo {
            *axis = self.i64()?;
        }
        for axis in &mut hi {
            *axis = self.i64()?;
        }
        if dim == 0 || usize::from(dim) > MAX_DIM {
            return Err(WireError::ShapeMismatch(format!("domain of dimension {dim}")));
        }
        Ok(Domain::new(dim, lo, hi))
    }
}

fn put_len(dst: &mut BytesMut, len: usize) {
    dst.put_u32(u32::try_from(len).expect("wire::put_len: [1]"));
}

fn put_usize(dst: &mut BytesMut, value: usize) {
    dst.put_u64(value as u64);
}

fn put_domain(dst: &mut BytesMut, domain: &Domain) {
    dst.put_u8(domain.dim());
    for axis in domain.lo() {
        dst.put_i64(axis);
    }
    for axis in domain.hi() {
        dst.put_i64(axis);
    }
}

fn put_views(dst: &mut BytesMut, views: &[(Arc<LogicalView>, FieldMask)]) {
    put_len(dst, views.len());
    for (view, mask) in views {
        dst.put_u64(view.did.0);
        dst.put_u128(mask.bits());
    }
}

/// Add `view` and everything it captures to `out`, captured views first.
fn collect_view(view: &Arc<LogicalView>, out: &mut IndexMap<DistributedId, Arc<LogicalView>>) {
    if out.contains_key(&view.did) {
        return;
    }
    if let Some(composite) = view.as_composite() {
        for captured in composite.captured_views() {
            collect_view(&captured, out);
        }
    }
    out.insert(view.did, Arc::clone(view));
}

impl RegionTreeForest {
    fn message_header(&self, kind: MessageKind, ctx: ContextId) -> MessageHeader {
        MessageHeader {
            kind,
            ctx,
            source: self.config.address_space,
        }
    }

    fn put_path(&self, dst: &mut BytesMut, node: NodeId) {
        let colors = self.node_path(node);
        dst.put_u32(self.node(node).handle.tree_id().0);
        put_len(dst, colors.len());
        for color in colors {
            dst.put_u32(color);
        }
    }

    fn resolve_path(&self, tree: RegionTreeId, colors: &[Color]) -> Result<NodeId, WireError> {
        let missing = || WireError::MissingNode {
            tree,
            path: colors.to_vec(),
        };
        let root = self.shape.tree_root(tree).map_err(|_| missing())?;
        let mut node = self.region_node(root).map_err(|_| missing())?;
        for &color in colors {
            node = self.child_node(node, color).map_err(|_| missing())?;
        }
        Ok(node)
    }

    fn decode_node(&self, src: &mut Decoder) -> Result<NodeId, WireError> {
        let (tree, colors) = src.path()?;
        self.resolve_path(tree, &colors)
    }

    fn decode_views(&self, src: &mut Decoder) -> Result<Vec<(Arc<LogicalView>, FieldMask)>, WireError> {
        let len = src.len()?;
        let mut views = Vec::new();
        for _ in 0..len {
            let did = src.did()?;
            let mask = src.mask()?;
            let view = self.find_view(did).ok_or(WireError::UnknownView(did))?;
            views.push((view, mask));
        }
        Ok(views)
    }

    // ----- shape ---------------------------------------------------------

    /// Encode the shape of `region`'s whole tree: its field space and every
    /// index space and partition below the root.
    ///
    /// # Errors
    /// If the tree is unknown.
    pub fn send_tree_shape(&self, region: LogicalRegion) -> Result<Bytes, WireError> {
        let root = self.shape.tree_root(region.tree_id)?;
        let mut dst = BytesMut::new();
        self.message_header(MessageKind::Shape, ContextId(0)).encode(&mut dst);
        dst.put_u32(root.tree_id.0);
        dst.put_u32(root.index_space.0);
        dst.put_u32(root.field_space.0);
        let fields = self.shape.get_fields(root.field_space)?;
        put_len(&mut dst, fields.len());
        for (fid, size, index) in fields {
            dst.put_u32(fid);
            put_usize(&mut dst, size);
            put_usize(&mut dst, index);
        }
        // Preorder, so parents are installed before their children.
        let mut pending = vec![IndexNode::Space(root.index_space)];
        while let Some(next) = pending.pop() {
            match next {
                IndexNode::Space(handle) => {
                    let node = self.shape.export_space(handle)?;
                    dst.put_u8(TAG_SPACE);
                    dst.put_u32(node.handle.0);
                    match node.parent {
                        Some(parent) => {
                            dst.put_u8(1);
                            dst.put_u32(parent.0);
                        }
                        None => dst.put_u8(0),
                    }
                    dst.put_u32(node.color);
                    dst.put_u32(node.depth);
                    put_len(&mut dst, node.components.len());
                    for domain in &node.components {
                        put_domain(&mut dst, domain);
                    }
                    pending.extend(node.partitions.values().rev().map(|&p| IndexNode::Partition(p)));
                }
                IndexNode::Partition(handle) => {
                    let node = self.shape.export_partition(handle)?;
                    dst.put_u8(TAG_PARTITION);
                    dst.put_u32(node.handle.0);
                    dst.put_u32(node.parent.0);
                    dst.put_u32(node.color);
                    dst.put_u32(node.depth);
                    dst.put_u8(u8::from(node.disjoint));
                    pending.extend(node.subspaces.values().rev().map(|&s| IndexNode::Space(s)));
                }
            }
        }
        dst.put_u8(TAG_END);
        debug!(tree = %root.tree_id, bytes = dst.len(), "packed tree shape");
        Ok(dst.freeze())
    }

    /// Install a tree shape sent by `send_tree_shape`. Parts already known
    /// locally must match. Returns the tree's root region.
    ///
    /// # Errors
    /// `ShapeMismatch` if the message contradicts the local shape.
    pub fn unpack_tree_shape(&self, bytes: Bytes) -> Result<LogicalRegion, WireError> {
        let mut src = Decoder::new(bytes);
        src.expect_kind(MessageKind::Shape)?;
        let tree_id = RegionTreeId(src.u32()?);
        let index_space = IndexSpace(src.u32()?);
        let field_space = FieldSpace(src.u32()?);
        let count = src.len()?;
        let mut fields = Vec::new();
        for _ in 0..count {
            let fid = src.u32()?;
            let size = src.usize()?;
            let index = src.usize()?;
            fields.push((fid, size, index));
        }
        if !self.shape.import_field_space(field_space, &fields) {
            return Err(WireError::ShapeMismatch(format!("fields of {field_space}")));
        }
        loop {
            match src.u8()? {
                TAG_END => break,
                TAG_SPACE => {
                    let handle = IndexSpace(src.u32()?);
                    let parent = if src.bool()? {
                        Some(IndexPartition(src.u32()?))
                    } else {
                        None
                    };
                    let color = src.u32()?;
                    let depth = src.u32()?;
                    let count = src.len()?;
                    let mut components = Vec::new();
                    for _ in 0..count {
                        components.push(src.domain()?);
                    }
                    let node = IndexSpaceNode {
                        handle,
                        components,
                        parent,
                        color,
                        depth,
                        partitions: IndexMap::default(),
                    };
                    if !self.shape.import_space(node) {
                        return Err(WireError::ShapeMismatch(format!("index space {handle}")));
                    }
                }
                TAG_PARTITION => {
                    let node = IndexPartNode {
                        handle: IndexPartition(src.u32()?),
                        parent: IndexSpace(src.u32()?),
                        color: src.u32()?,
                        depth: src.u32()?,
                        disjoint: src.bool()?,
                        subspaces: IndexMap::default(),
                    };
                    let handle = node.handle;
                    if !self.shape.import_partition(node) {
                        return Err(WireError::ShapeMismatch(format!("index partition {handle}")));
                    }
                }
                tag => return Err(WireError::UnknownTag(tag)),
            }
        }
        let region = LogicalRegion {
            index_space,
            field_space,
            tree_id,
        };
        if !self.shape.import_tree(region) {
            return Err(WireError::ShapeMismatch(format!("region tree {tree_id}")));
        }
        debug!(%region, "unpacked tree shape");
        Ok(region)
    }

    // ----- physical state ------------------------------------------------

    /// Encode the physical state of `mask` at `node` and below for `target`,
    /// and record `target` as a holder in the directory.
    pub fn send_physical_state(
        &self,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
        target: AddressSpaceId,
        access: Access,
    ) -> Bytes {
        let (bytes, managers) = self.pack_state(MessageKind::State, ctx, node, mask);
        self.update_remote_state(ctx, target, node, mask, access);
        for manager in managers {
            manager.add_subscriber(target);
        }
        debug!(%ctx, %node, %mask, %target, %access, bytes = bytes.len(), "sent physical state");
        bytes
    }

    /// Encode the physical state of `mask` at `node` and below to return it
    /// to the owning space.
    pub fn send_back_physical_state(&self, ctx: ContextId, node: NodeId, mask: FieldMask) -> Bytes {
        let (bytes, _) = self.pack_state(MessageKind::SendBack, ctx, node, mask);
        debug!(%ctx, %node, %mask, bytes = bytes.len(), "sent physical state back");
        bytes
    }

    /// Replace the local state of the message's fields with the sent one.
    ///
    /// # Errors
    /// If the message references nodes, views or fields this forest does
    /// not know.
    pub fn unpack_physical_state(&self, bytes: Bytes) -> Result<RemoteUpdate, WireError> {
        let mut src = Decoder::new(bytes);
        let header = src.expect_kind(MessageKind::State)?;
        self.unpack_state(header, &mut src)
    }

    /// Take back state a remote space worked on; the sender keeps a
    /// readable copy.
    ///
    /// # Errors
    /// As `unpack_physical_state`.
    pub fn unpack_send_back_state(&self, bytes: Bytes) -> Result<RemoteUpdate, WireError> {
        let mut src = Decoder::new(bytes);
        let header = src.expect_kind(MessageKind::SendBack)?;
        let update = self.unpack_state(header, &mut src)?;
        self.update_remote_state(update.ctx, update.source, update.node, update.mask, Access::Read);
        Ok(update)
    }

    fn pack_state(
        &self,
        kind: MessageKind,
        ctx: ContextId,
        node: NodeId,
        mask: FieldMask,
    ) -> (Bytes, Vec<Arc<PhysicalManager>>) {
        let records = self.collect_state_records(ctx, node, mask);
        let mut views = IndexMap::<DistributedId, Arc<LogicalView>>::default();
        for record in &records {
            for (view, _) in record.valid.iter().chain(&record.reductions) {
                collect_view(view, &mut views);
            }
        }
        let mut managers = IndexMap::<DistributedId, Arc<PhysicalManager>>::default();
        for view in views.values() {
            if let Some(manager) = view.manager() {
                managers
                    .entry(manager.did)
                    .or_insert_with(|| Arc::clone(manager));
            }
        }

        let mut dst = BytesMut::new();
        self.message_header(kind, ctx).encode(&mut dst);
        self.put_path(&mut dst, node);
        dst.put_u128(mask.bits());
        put_len(&mut dst, managers.len());
        for manager in managers.values() {
            self.put_manager(&mut dst, manager);
        }
        put_len(&mut dst, views.len());
        for view in views.values() {
            self.put_view(&mut dst, view);
        }
        put_len(&mut dst, records.len());
        for record in &records {
            self.put_path(&mut dst, record.node);
            dst.put_u128(record.dirty.bits());
            dst.put_u128(record.reduction_mask.bits());
            put_len(&mut dst, record.open.len());
            for &(color, fields) in &record.open {
                dst.put_u32(color);
                dst.put_u128(fields.bits());
            }
            put_views(&mut dst, &record.valid);
            put_views(&mut dst, &record.reductions);
        }
        trace!(%ctx, %node, managers = managers.len(), views = views.len(), records = records.len(), "packed state");
        (dst.freeze(), managers.into_values().collect())
    }

    /// State of `node` and of its open subtree, restricted to `mask`, in
    /// preorder. The top record lists every view valid at `node`, including
    /// those inherited from ancestors.
    fn collect_state_records(&self, ctx: ContextId, node: NodeId, mask: FieldMask) -> Vec<StateRecord> {
        let mut records = Vec::new();
        let mut pending = vec![(node, mask)];
        while let Some((id, fields)) = pending.pop() {
            let current = self.node(id);
            let mut record = current
                .physical()
                .get(ctx)
                .map(|state| StateRecord {
                    node: id,
                    dirty: state.dirty_mask & fields,
                    reduction_mask: state.reduction_mask & fields,
                    open: state.open_children_on(fields),
                    valid: state.views_on(fields),
                    reductions: state.reductions_on(fields),
                })
                .unwrap_or_else(|| StateRecord::empty(id));
            if id == node {
                record.valid = self.find_valid_views(ctx, node, fields);
            }
            for &(color, open) in record.open.iter().rev() {
                if let Some(child) = current.child(color) {
                    pending.push((child, open));
                }
            }
            records.push(record);
        }
        records
    }

    fn put_manager(&self, dst: &mut BytesMut, manager: &PhysicalManager) {
        dst.put_u64(manager.did.0);
        dst.put_u16(manager.owner.0);
        dst.put_u32(manager.memory.0);
        self.put_path(dst, manager.region);
        let (tag, redop) = match manager.kind {
            ManagerKind::Instance => (MANAGER_INSTANCE, 0),
            ManagerKind::ListReduction(redop) => (MANAGER_LIST, redop.0),
            ManagerKind::FoldReduction(redop) => (MANAGER_FOLD, redop.0),
        };
        dst.put_u8(tag);
        dst.put_u32(redop);
        dst.put_u128(manager.layout.mask().bits());
        put_usize(dst, manager.layout.blocking_factor());
        put_usize(dst, manager.size);
        dst.put_u64(manager.use_event.id());
    }

    fn put_view(&self, dst: &mut BytesMut, view: &LogicalView) {
        dst.put_u64(view.did.0);
        self.put_path(dst, view.node);
        match &view.kind {
            ViewKind::Materialized(manager) => {
                dst.put_u8(VIEW_MATERIALIZED);
                dst.put_u64(manager.did.0);
            }
            ViewKind::Reduction(manager) => {
                dst.put_u8(VIEW_REDUCTION);
                dst.put_u64(manager.did.0);
            }
            ViewKind::Composite(composite) => {
                dst.put_u8(VIEW_COMPOSITE);
                dst.put_u128(composite.valid_mask().bits());
                self.put_composite_node(dst, composite.root());
            }
        }
    }

    fn put_composite_node(&self, dst: &mut BytesMut, cnode: &CompositeNode) {
        self.put_path(dst, cnode.node());
        dst.put_u128(cnode.dirty_mask().bits());
        put_views(dst, cnode.valid_views());
        put_views(dst, cnode.reductions());
        let children: Vec<_> = cnode.children().collect();
        put_len(dst, children.len());
        for (child, open_fields) in children {
            dst.put_u128(open_fields.bits());
            self.put_composite_node(dst, child);
        }
    }

    fn unpack_state(&self, header: MessageHeader, src: &mut Decoder) -> Result<RemoteUpdate, WireError> {
        let MessageHeader { ctx, source, .. } = header;
        let node = self.decode_node(src)?;
        let mask = src.mask()?;
        for _ in 0..src.len()? {
            self.unpack_manager(src)?;
        }
        for _ in 0..src.len()? {
            self.unpack_view(src)?;
        }
        // Decode everything before touching local state.
        let count = src.len()?;
        let mut records = Vec::new();
        for _ in 0..count {
            let record_node = self.decode_node(src)?;
            let dirty = src.mask()?;
            let reduction_mask = src.mask()?;
            let open_count = src.len()?;
            let mut open = Vec::new();
            for _ in 0..open_count {
                let color = src.u32()?;
                open.push((color, src.mask()?));
            }
            records.push(StateRecord {
                node: record_node,
                dirty,
                reduction_mask,
                open,
                valid: self.decode_views(src)?,
                reductions: self.decode_views(src)?,
            });
        }

        self.invalidate_subtree(ctx, node, mask);
        for record in records {
            self.install_record(ctx, record);
        }
        self.node(node).physical().get_mut(ctx).remote_valid |= mask;
        debug!(%ctx, %source, %node, %mask, "unpacked physical state");
        Ok(RemoteUpdate {
            ctx,
            source,
            node,
            mask,
        })
    }

    fn install_record(&self, ctx: ContextId, record: StateRecord) {
        let current = self.node(record.node);
        let added = {
            let mut table = current.physical();
            let state = table.get_mut(ctx);
            state.dirty_mask |= record.dirty;
            state.reduction_mask |= record.reduction_mask;
            for (color, fields) in record.open {
                state.open_child(color, fields);
            }
            let mut added = Vec::new();
            for (view, fields) in &record.valid {
                if state.insert_view(view, *fields, false) {
                    added.push(Arc::clone(view));
                }
            }
            for (view, fields) in &record.reductions {
                if state.insert_view(view, *fields, true) {
                    added.push(Arc::clone(view));
                }
            }
            added
        };
        for view in added {
            self.add_valid_reference(&view);
        }
    }

    fn unpack_manager(&self, src: &mut Decoder) -> Result<Arc<PhysicalManager>, WireError> {
        let did = src.did()?;
        let owner = AddressSpaceId(src.u16()?);
        let memory = MemoryId(src.u32()?);
        let region = self.decode_node(src)?;
        let tag = src.u8()?;
        let redop = ReductionOpId(src.u32()?);
        let kind = match tag {
            MANAGER_INSTANCE => ManagerKind::Instance,
            MANAGER_LIST => ManagerKind::ListReduction(redop),
            MANAGER_FOLD => ManagerKind::FoldReduction(redop),
            tag => return Err(WireError::UnknownTag(tag)),
        };
        let mask = src.mask()?;
        let blocking_factor = src.usize()?;
        let size = src.usize()?;
        let use_event = Event::from_id(src.u64()?);
        if let Some(existing) = self.find_manager(did) {
            return Ok(existing);
        }
        let TreeHandle::Region(handle) = self.node(region).handle else {
            return Err(WireError::ShapeMismatch(format!("manager {did} is not on a region")));
        };
        let layout = self.shape.layout(handle.field_space, mask, blocking_factor)?;
        if layout.fields().count() != mask.count() {
            return Err(WireError::ShapeMismatch(format!(
                "manager {did} holds fields {mask} unknown in {}",
                handle.field_space
            )));
        }
        self.events.import(use_event);
        let manager = Arc::clone(self.managers.write().entry(did).or_insert_with(|| {
            Arc::new(PhysicalManager {
                did,
                owner,
                memory,
                region,
                kind,
                layout,
                size,
                use_event,
                users: Mutex::new(Vec::new()),
                valid_refs: AtomicUsize::new(0),
                subscribers: Mutex::new(NodeSet::EMPTY),
            })
        }));
        trace!(manager = %did, %owner, %memory, %kind, "unpacked manager");
        Ok(manager)
    }

    fn unpack_view(&self, src: &mut Decoder) -> Result<Arc<LogicalView>, WireError> {
        let did = src.did()?;
        let node = self.decode_node(src)?;
        let kind = match src.u8()? {
            tag @ (VIEW_MATERIALIZED | VIEW_REDUCTION) => {
                let manager_did = src.did()?;
                let manager = self
                    .find_manager(manager_did)
                    .ok_or(WireError::UnknownManager(manager_did))?;
                if tag == VIEW_MATERIALIZED {
                    ViewKind::Materialized(manager)
                } else {
                    ViewKind::Reduction(manager)
                }
            }
            VIEW_COMPOSITE => {
                let valid_mask = src.mask()?;
                let root = self.decode_composite_node(src)?;
                ViewKind::Composite(CompositeView::new(Arc::new(root), valid_mask))
            }
            tag => return Err(WireError::UnknownTag(tag)),
        };
        if let Some(existing) = self.find_view(did) {
            return Ok(existing);
        }
        let candidate = Arc::new(LogicalView::new(did, node, kind));
        let view = Arc::clone(
            self.views
                .write()
                .entry(did)
                .or_insert_with(|| Arc::clone(&candidate)),
        );
        if Arc::ptr_eq(&view, &candidate)
            && let Some(manager) = view.manager()
        {
            self.materialized
                .lock()
                .entry((manager.did, node))
                .or_insert_with(|| Arc::clone(&view));
        }
        trace!(view = %did, %node, "unpacked view");
        Ok(view)
    }

    fn decode_composite_node(&self, src: &mut Decoder) -> Result<CompositeNode, WireError> {
        let node = self.decode_node(src)?;
        let dirty_mask = src.mask()?;
        let valid_views = self.decode_views(src)?;
        let reductions = self.decode_views(src)?;
        let count = src.len()?;
        let mut children = Vec::new();
        for _ in 0..count {
            let open_fields = src.mask()?;
            let child = self.decode_composite_node(src)?;
            children.push((Arc::new(child), open_fields));
        }
        Ok(CompositeNode::from_parts(node, dirty_mask, valid_views, reductions, children))
    }

    // ----- validation ----------------------------------------------------

    /// Tell a remote holder that its copy of `mask` at `node` is current.
    pub fn send_validation(&self, ctx: ContextId, node: NodeId, mask: FieldMask) -> Bytes {
        let mut dst = BytesMut::new();
        self.message_header(MessageKind::Validate, ctx).encode(&mut dst);
        self.put_path(&mut dst, node);
        dst.put_u128(mask.bits());
        dst.freeze()
    }

    /// Mark the local copy of the message's fields as current.
    ///
    /// # Errors
    /// On malformed messages or unknown nodes.
    pub fn validate_remote_state(&self, bytes: Bytes) -> Result<RemoteUpdate, WireError> {
        let mut src = Decoder::new(bytes);
        let MessageHeader { ctx, source, .. } = src.expect_kind(MessageKind::Validate)?;
        let node = self.decode_node(&mut src)?;
        let mask = src.mask()?;
        self.node(node).physical().get_mut(ctx).remote_valid |= mask;
        trace!(%ctx, %source, %node, %mask, "validated remote state");
        Ok(RemoteUpdate {
            ctx,
            source,
            node,
            mask,
        })
    }

    /// Encode an invalidation the directory produced.
    pub fn send_invalidation(&self, invalidation: &Invalidation) -> Bytes {
        let mut dst = BytesMut::new();
        self.message_header(MessageKind::Invalidate, invalidation.ctx)
            .encode(&mut dst);
        self.put_path(&mut dst, invalidation.node);
        dst.put_u128(invalidation.mask.bits());
        dst.freeze()
    }

    /// Drop the local copy of the message's fields; `source` is the sender
    /// as reported by the transport.
    ///
    /// # Errors
    /// `UnexpectedSource` if the header names another sender, or on
    /// malformed messages.
    pub fn invalidate_remote_state(&self, bytes: Bytes, source: AddressSpaceId) -> Result<RemoteUpdate, WireError> {
        let mut src = Decoder::new(bytes);
        let header = src.expect_kind(MessageKind::Invalidate)?;
        if header.source != source {
            return Err(WireError::UnexpectedSource {
                expected: source,
                found: header.source,
            });
        }
        let node = self.decode_node(&mut src)?;
        let mask = src.mask()?;
        self.invalidate_subtree(header.ctx, node, mask);
        debug!(ctx = %header.ctx, %source, %node, %mask, "invalidated local copy");
        Ok(RemoteUpdate {
            ctx: header.ctx,
            source,
            node,
            mask,
        })
    }
}

//! Application-defined data attached to shape and tree handles.
//!
//! Attachments are opaque byte buffers keyed by handle and tag, for example
//! names given to regions by a front end. The forest only stores them and
//! remembers which address spaces already hold a copy.

use crate::{
    forest::RegionTreeForest,
    mask::NodeSet,
    shape::ShapeError,
    types::{FieldId, FieldSpace, IndexPartition, IndexSpace, LogicalPartition, LogicalRegion},
};
use bytes::Bytes;
use derive_more::{Display, From};
use tracing::debug;

/// Application-chosen key of an attachment.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("tag{_0}")]
pub struct SemanticTag(pub u32);

/// What an attachment describes.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticHandle {
    /// An index space.
    IndexSpace(IndexSpace),
    /// An index partition.
    IndexPartition(IndexPartition),
    /// A field space.
    FieldSpace(FieldSpace),
    /// One field of a field space.
    #[display("{_0}.{_1}")]
    Field(FieldSpace, FieldId),
    /// A logical region.
    LogicalRegion(LogicalRegion),
    /// A logical partition.
    LogicalPartition(LogicalPartition),
}

/// One attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticInfo {
    buffer: Bytes,
    node_mask: NodeSet,
}

impl SemanticInfo {
    /// Attached bytes.
    #[must_use]
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    /// Address spaces known to hold the attachment.
    #[must_use]
    pub fn node_mask(&self) -> NodeSet {
        self.node_mask
    }
}

impl RegionTreeForest {
    /// Attach `buffer` to `handle` under `tag`, replacing an earlier
    /// attachment. `source` lists the spaces that already hold it.
    ///
    /// # Errors
    /// If `handle` names an unknown shape or field.
    pub fn attach_semantic_information(
        &self,
        handle: SemanticHandle,
        tag: SemanticTag,
        source: NodeSet,
        buffer: Bytes,
    ) -> Result<(), ShapeError> {
        self.check_semantic_handle(handle)?;
        let node_mask = source | NodeSet::single(self.config.address_space);
        let size = buffer.len();
        let mut semantic = self.semantic.write();
        let info = semantic.entry((handle, tag)).or_insert_with(|| SemanticInfo {
            buffer: Bytes::new(),
            node_mask: NodeSet::EMPTY,
        });
        info.buffer = buffer;
        info.node_mask |= node_mask;
        debug!(%handle, %tag, size, "attached semantic information");
        Ok(())
    }

    /// Attachment of `handle` under `tag`, if any.
    #[must_use]
    pub fn retrieve_semantic_information(&self, handle: SemanticHandle, tag: SemanticTag) -> Option<SemanticInfo> {
        self.semantic.read().get(&(handle, tag)).cloned()
    }

    fn check_semantic_handle(&self, handle: SemanticHandle) -> Result<(), ShapeError> {
        match handle {
            SemanticHandle::IndexSpace(space) => self.shape.get_domain(space).map(drop),
            SemanticHandle::IndexPartition(partition) => self.shape.is_disjoint(partition).map(drop),
            SemanticHandle::FieldSpace(space) => self.shape.get_fields(space).map(drop),
            SemanticHandle::Field(space, field) => self.shape.get_field_size(space, field).map(drop),
            SemanticHandle::LogicalRegion(region) => self.region_node(region).map(drop),
            SemanticHandle::LogicalPartition(partition) => self.partition_node(partition).map(drop),
        }
    }
}

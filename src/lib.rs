//! Region tree forest: dependence analysis and physical coherence for a
//! task-parallel runtime.
//!
//! Data lives in *logical regions*: the cross product of an index space
//! (points) and a field space (named fields). Index spaces are partitioned
//! recursively, so every region heads a tree of subregions. Operations name
//! the regions they touch with a privilege and a coherence mode, and the
//! forest answers two questions about them:
//! - which earlier operations a new one must wait for (logical analysis,
//!   with closes inserted where open subtrees would interfere), and
//! - which physical instance the operation should use and which copies make
//!   it current (physical mapping, with composite views and reductions).
//!
//! Address spaces replicate shapes and ship physical state through the
//! `wire` codec; a per-context directory tracks remote holders and produces
//! invalidations.
//!
//! Key modules:
//! - `shape`: index spaces, partitions and field spaces.
//! - `tree`: region tree nodes, created lazily in an arena.
//! - `logical`: the dependence analysis and logical closes.
//! - `physical`, `view`, `close`: instances, views, copies and closes.
//! - `directory`, `wire`: remote state tracking and messages.
//! - `semantic`: opaque data applications attach to handles.
//! - `forest`: the `RegionTreeForest` owning all of the above.
//!
//! The forest never blocks. Waits are expressed as `Event`s the embedding
//! runtime triggers, copies are queued in an outbox (`drain_copies`) and
//! messages for other spaces in another (`drain_messages`).

/// Which address space a forest belongs to and its tuning knobs.
pub mod config;
/// Axis-aligned rectangles of up to three dimensions.
pub mod domain;
/// Completion events, merging and continuations.
pub mod event;
/// Fixed-width bitmasks over fields and address spaces.
pub mod mask;
/// Operations as seen by the dependence analysis.
pub mod operation;
/// Index spaces, partitions and field spaces.
pub mod shape;
/// Identifiers, privileges and coherence modes shared by every module.
pub mod types;

/// Physical closes and composite views.
pub mod close;
/// Remote holders of physical state and the invalidations they need.
pub mod directory;
/// The forest owning every table.
pub mod forest;
/// Logical dependence analysis.
pub mod logical;
/// Physical mapping: instance selection, copies and registration.
pub mod physical;
/// Application-defined attachments to handles.
pub mod semantic;
/// Region tree nodes and paths.
pub mod tree;
/// Views over physical instances.
pub mod view;
/// Messages exchanged between address spaces.
pub mod wire;

mod sync;
mod utils;

pub use crate::{
    close::CloseOutcome,
    config::ForestConfig,
    directory::{Access, Invalidation, StateDirectory},
    event::Event,
    forest::RegionTreeForest,
    mask::FieldMask,
    operation::{CloseOp, Operation},
    physical::{CopyRequest, InstanceRef, MappingDecision, MappingError, MappingRef},
    shape::ShapeError,
    tree::NodeId,
    wire::{RemoteUpdate, WireError},
};

#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use common::{Fixture, MEM, MEM2, RecordingOp, decision, ro, rw};
use rtf::{
    ForestConfig, MappingDecision, MappingError, RegionTreeForest,
    event::Event,
    physical::CopyKind,
    types::{CoherenceProperty, PrivilegeMode, RegionRequirement, ReductionOpId},
};

#[test]
fn reader_waits_for_the_writer() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let term_a = fx.user_event();
    let a = fx.map(&fx.req(fx.root, &[0], p, c), &decision(), term_a);

    let (p, c) = ro();
    let term_b = fx.user_event();
    let b = fx.map(&fx.req(fx.subregion(0), &[0], p, c), &decision(), term_b);

    let events = fx.forest.events();
    assert!(events.depends_on(b.ready_event(), term_a));
    assert!(!events.has_triggered(b.ready_event()));
    assert_eq!(
        a.manager().map(|m| m.did()),
        b.manager().map(|m| m.did()),
        "the reader reuses the writer's instance"
    );
    assert!(fx.forest.drain_copies().is_empty());

    events.trigger(term_a);
    assert!(events.has_triggered(b.ready_event()));
}

#[test]
fn readers_run_together() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let term_w = fx.user_event();
    fx.map(&fx.req(fx.root, &[1], p, c), &decision(), term_w);
    fx.forest.events().trigger(term_w);

    let (p, c) = ro();
    let first = fx.map(&fx.req(fx.root, &[1], p, c), &decision(), fx.user_event());
    let second = fx.map(&fx.req(fx.root, &[1], p, c), &decision(), fx.user_event());
    assert!(fx.forest.events().has_triggered(first.ready_event()));
    assert!(fx.forest.events().has_triggered(second.ready_event()));
}

fn war_mapping(config: ForestConfig) -> bool {
    let fx = Fixture::with_config(config);
    let (p, c) = rw();
    let req_w = fx.req(fx.root, &[0], p, c);
    let term_w0 = fx.user_event();
    let w0 = fx.map(&req_w, &decision(), term_w0);
    fx.forest.events().trigger(term_w0);

    let (p, c) = ro();
    fx.map(&fx.req(fx.root, &[0], p, c), &decision(), fx.user_event());

    let w = fx.map(&req_w, &decision(), fx.user_event());
    w.manager().map(|m| m.did()) != w0.manager().map(|m| m.did())
}

#[test]
fn write_after_read_gets_a_fresh_instance() {
    assert!(war_mapping(ForestConfig::default().with_war_optimization(true)));
    assert!(!war_mapping(ForestConfig::default().with_war_optimization(false)));
}

#[test]
fn full_memory_is_reported() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let req = fx.req(fx.root, &[0, 1, 2], p, c);
    let path = fx.forest.requirement_path(&req).unwrap();
    fx.forest.register_memory(rtf::types::MemoryId(9), 16);
    let tiny = MappingDecision::new([rtf::types::MemoryId(9)]);
    let err = fx
        .forest
        .map_physical_region(fx.ctx, &path, &req, &tiny)
        .unwrap_err();
    assert!(matches!(err, MappingError::NoValidMemory { .. }));
}

#[test]
fn busy_state_reports_a_retry_event() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let req = fx.req(fx.root, &[0], p, c);
    let path = fx.forest.requirement_path(&req).unwrap();
    let root = fx.root_node();
    assert!(fx.forest.acquire_physical_state(fx.ctx, root, true).is_none());
    let err = fx
        .forest
        .premap_physical_region(fx.ctx, &path, &req, &decision())
        .unwrap_err();
    assert!(matches!(err, MappingError::StateBusy { node, .. } if node == root));
    fx.forest.release_physical_state(fx.ctx, root);
    fx.forest
        .premap_physical_region(fx.ctx, &path, &req, &decision())
        .unwrap();
}

#[test]
fn logical_close_is_performed_physically() {
    let fx = Fixture::new();
    let (w, parent_writer) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    let sub_req = fx.req(fx.subregion(0), &[0], p, c);
    fx.analyze(&w, &sub_req);
    let sub = fx.map(&sub_req, &decision(), fx.user_event());
    fx.analyze(&parent_writer, &fx.req(fx.root, &[0], p, c));

    let close = parent_writer.closes().pop().expect("the child was open");
    let outcome = fx
        .forest
        .perform_close_operation(fx.ctx, &close, &decision())
        .unwrap();
    assert!(!outcome.composite);
    assert_eq!(outcome.copies_issued, 1);
    let target = outcome.target.expect("dirty data was closed");
    assert!(target.is_materialized());
    assert!(fx.forest.physical_open_children(fx.ctx, fx.root_node()).is_empty());
    assert!(fx.forest.dirty_fields(fx.ctx, fx.root_node()).contains(0));

    let copies = fx.forest.drain_copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].kind, CopyKind::Copy);
    assert_eq!(Some(copies[0].src), sub.manager().map(|m| m.did()));
    assert_eq!(Some(copies[0].dst), target.manager().map(|m| m.did()));
    assert!(fx.forest.events().depends_on(outcome.event, copies[0].completion));
}

#[test]
fn composite_close_can_leave_a_child_open() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let req = fx.req(fx.subregion(0), &[0], p, c);
    fx.map(&req, &decision(), fx.user_event());
    let mask = fx.forest.requirement_mask(&req).unwrap();
    let composite = decision().with_composite(true);

    let first = fx
        .forest
        .close_physical_node(fx.ctx, fx.root_node(), mask, &[0], &composite)
        .unwrap();
    assert!(first.composite);
    assert_eq!(first.left_open, vec![0]);
    assert_eq!(first.copies_issued, 0);
    let view = first.target.expect("subregion was dirty");
    assert!(view.as_composite().is_some());

    // Nothing below is dirty any more, so closing again is a no-op.
    let second = fx
        .forest
        .close_physical_node(fx.ctx, fx.root_node(), mask, &[0], &composite)
        .unwrap();
    assert!(second.target.is_none());
    assert_eq!(second.copies_issued, 0);
    assert_eq!(second.left_open, vec![0]);

    let open = fx.forest.physical_open_children(fx.ctx, fx.root_node());
    assert!(open.iter().any(|&(color, fields)| color == 0 && fields.covers(mask)));
}

#[test]
fn composite_view_replays_into_a_reader() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let req = fx.req(fx.subregion(0), &[0], p, c);
    let sub = fx.map(&req, &decision(), fx.user_event());
    let mask = fx.forest.requirement_mask(&req).unwrap();
    let outcome = fx
        .forest
        .close_physical_node(fx.ctx, fx.root_node(), mask, &[], &decision().with_composite(true))
        .unwrap();
    assert!(outcome.composite);
    assert!(outcome.left_open.is_empty());
    let composite = outcome.target.unwrap();
    let valid = fx.forest.valid_views(fx.ctx, fx.root_node());
    assert_eq!(valid.len(), 1);
    assert_eq!(valid[0].0.did(), composite.did());
    fx.forest.drain_copies();

    let (p, c) = ro();
    let reader = fx.map(&fx.req(fx.root, &[0], p, c), &decision(), fx.user_event());
    let copies = fx.forest.drain_copies();
    assert!(!copies.is_empty());
    let sub_did = sub.manager().map(|m| m.did());
    let reader_did = reader.manager().map(|m| m.did());
    assert!(copies
        .iter()
        .any(|copy| Some(copy.src) == sub_did && Some(copy.dst) == reader_did));
    for copy in &copies {
        assert!(fx.forest.events().depends_on(reader.ready_event(), copy.completion));
    }
}

#[test]
fn reductions_are_flushed_before_reads() {
    let fx = Fixture::new();
    let redop = ReductionOpId(3);
    let reduce = fx.req(fx.root, &[2], PrivilegeMode::Reduce(redop), CoherenceProperty::Exclusive);
    let red = fx.map(&reduce, &decision(), fx.user_event());
    assert!(red.view().is_reduction());
    assert_eq!(fx.forest.reduction_views(fx.ctx, fx.root_node()).len(), 1);

    let (p, c) = ro();
    let reader = fx.map(&fx.req(fx.root, &[2], p, c), &decision(), fx.user_event());
    let copies = fx.forest.drain_copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].kind, CopyKind::Reduce { redop, fold: false });
    assert_eq!(Some(copies[0].src), red.manager().map(|m| m.did()));
    assert_eq!(Some(copies[0].dst), reader.manager().map(|m| m.did()));
    assert!(fx.forest.reduction_views(fx.ctx, fx.root_node()).is_empty());
}

#[test]
fn copy_across_trees_pairs_fields() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let src_req = fx.req(fx.root, &[0, 1], p, c);
    let src = fx.map(&src_req, &decision(), fx.user_event());

    let other = fx
        .forest
        .shape()
        .create_logical_region(fx.root.index_space, fx.root.field_space)
        .unwrap();
    assert_ne!(other.tree_id, fx.root.tree_id);
    let dst_req = RegionRequirement::region(other, other, vec![4, 5], p, c);
    let dst = fx.map(&dst_req, &decision(), fx.user_event());
    fx.forest.drain_copies();

    let done = fx
        .forest
        .copy_across(fx.ctx, fx.ctx, &src_req, &dst_req, &dst, Event::NO_EVENT)
        .unwrap();
    let copies = fx.forest.drain_copies();
    assert_eq!(copies.len(), 2);
    for copy in &copies {
        assert_eq!(Some(copy.src), src.manager().map(|m| m.did()));
        assert_eq!(Some(copy.dst), dst.manager().map(|m| m.did()));
        assert_eq!(copy.fields.len(), 1);
        assert!(fx.forest.events().depends_on(done, copy.completion));
    }

    let mismatched = RegionRequirement::region(other, other, vec![4], p, c);
    let err = fx
        .forest
        .copy_across(fx.ctx, fx.ctx, &src_req, &mismatched, &dst, Event::NO_EVENT)
        .unwrap_err();
    assert_eq!(err, MappingError::FieldCountMismatch { src: 2, dst: 1 });
}

#[test]
fn unused_instances_are_collected() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let term = fx.user_event();
    let mapped = fx.map(&fx.req(fx.root, &[0], p, c), &decision(), term);
    let did = mapped.manager().map(|m| m.did()).unwrap();
    assert!(fx.forest.memory_usage(MEM).unwrap().used > 0);

    fx.forest.invalidate_physical_context(fx.ctx, fx.root).unwrap();
    assert!(fx.forest.collect_garbage().is_empty(), "the user is still running");
    assert!(fx.forest.find_manager(did).is_some());

    fx.forest.events().trigger(term);
    assert_eq!(fx.forest.collect_garbage(), vec![did]);
    assert!(fx.forest.find_manager(did).is_none());
    assert_eq!(fx.forest.memory_usage(MEM).unwrap().used, 0);
}

#[test]
fn initialized_context_serves_mappings() {
    let fx = Fixture::new();
    let manager = fx.forest.create_instance(fx.root, &[0, 1], MEM, None).unwrap();
    let view = fx
        .forest
        .initialize_physical_context(fx.ctx, fx.root, &[0, 1], &manager)
        .unwrap();
    assert_eq!(view.valid_references(), 1);

    let (p, c) = ro();
    let mapped = fx.map(&fx.req(fx.subregion(3), &[1], p, c), &decision(), fx.user_event());
    assert_eq!(mapped.manager().map(|m| m.did()), Some(manager.did()));
    assert!(fx.forest.drain_copies().is_empty());
}

#[test]
fn forests_start_empty() {
    let forest = RegionTreeForest::new(ForestConfig::default());
    assert!(forest.drain_copies().is_empty());
    assert!(forest.drain_messages().is_empty());
    assert_eq!(forest.issued_copy_count(), 0);
    assert!(forest.collect_garbage().is_empty());
}

#[test]
fn copy_across_makes_the_destination_valid_in_its_context() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let src_req = fx.req(fx.root, &[0, 1], p, c);
    fx.map(&src_req, &decision(), fx.user_event());
    let other = fx
        .forest
        .shape()
        .create_logical_region(fx.root.index_space, fx.root.field_space)
        .unwrap();
    let dst_req = RegionRequirement::region(other, other, vec![4, 5], p, c);
    let dst = fx.map(&dst_req, &decision(), fx.user_event());
    let dst_ctx = fx.forest.allocate_context();
    let other_node = fx.node(other);
    assert!(fx.forest.valid_views(dst_ctx, other_node).is_empty());

    fx.forest
        .copy_across(fx.ctx, dst_ctx, &src_req, &dst_req, &dst, Event::NO_EVENT)
        .unwrap();
    assert_eq!(fx.forest.drain_copies().len(), 2);
    let valid = fx.forest.valid_views(dst_ctx, other_node);
    assert_eq!(valid.len(), 1);
    assert_eq!(valid[0].0.did(), dst.view().did());
    let dirty = fx.forest.dirty_fields(dst_ctx, other_node);
    assert!(dirty.contains(4) && dirty.contains(5));

    // The source context has nothing valid to read here.
    let empty_ctx = fx.forest.allocate_context();
    fx.forest
        .copy_across(empty_ctx, dst_ctx, &src_req, &dst_req, &dst, Event::NO_EVENT)
        .unwrap();
    assert!(fx.forest.drain_copies().is_empty());
}

#[test]
fn copy_across_replays_buffered_reductions() {
    let fx = Fixture::new();
    let redop = ReductionOpId(5);
    let reduce = fx.req(fx.subregion(0), &[0], PrivilegeMode::Reduce(redop), CoherenceProperty::Exclusive);
    let red = fx.map(&reduce, &decision(), fx.user_event());
    let mask = fx.forest.requirement_mask(&reduce).unwrap();
    let outcome = fx
        .forest
        .close_physical_node(fx.ctx, fx.root_node(), mask, &[], &decision().with_composite(true))
        .unwrap();
    assert!(outcome.composite);

    let (p, c) = rw();
    let other = fx
        .forest
        .shape()
        .create_logical_region(fx.root.index_space, fx.root.field_space)
        .unwrap();
    let dst_req = RegionRequirement::region(other, other, vec![4], p, c);
    let dst = fx.map(&dst_req, &decision(), fx.user_event());
    fx.forest.drain_copies();

    let src_req = fx.req(fx.root, &[0], p, c);
    let done = fx
        .forest
        .copy_across(fx.ctx, fx.ctx, &src_req, &dst_req, &dst, Event::NO_EVENT)
        .unwrap();
    let copies = fx.forest.drain_copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].kind, CopyKind::Reduce { redop, fold: false });
    assert_eq!(Some(copies[0].src), red.manager().map(|m| m.did()));
    assert_eq!(Some(copies[0].dst), dst.manager().map(|m| m.did()));
    assert!(fx.forest.events().depends_on(done, copies[0].completion));
}

#[test]
fn reallocated_field_index_gets_a_fresh_instance() {
    let fx = Fixture::new();
    let fs = fx.root.field_space;
    let (p, c) = rw();
    let term = fx.user_event();
    let old = fx.map(&fx.req(fx.root, &[3], p, c), &decision(), term);
    let old_did = old.manager().map(|m| m.did());
    fx.forest.events().trigger(term);
    fx.forest.drain_copies();

    let free = RecordingOp::new(1);
    fx.forest
        .analyze_destroy_fields(fx.ctx, fs, &[3], &free, fx.root)
        .unwrap();
    assert!(fx.forest.valid_views(fx.ctx, fx.root_node()).is_empty());
    fx.forest.shape().free_field(fs, 3).unwrap();
    assert_eq!(fx.forest.shape().allocate_field(fs, 20, 8).unwrap(), 3);

    let (p, c) = ro();
    let fresh = fx.map(&fx.req(fx.root, &[20], p, c), &decision(), fx.user_event());
    let manager = fresh.manager().expect("a materialized instance");
    assert_ne!(Some(manager.did()), old_did);
    assert!(manager.layout().field(20).is_some());
    assert!(manager.layout().field(3).is_none());
    assert!(fx.forest.drain_copies().is_empty());
}

#[test]
fn instances_of_a_freed_field_are_not_reused_without_analysis() {
    let fx = Fixture::new();
    let fs = fx.root.field_space;
    let (p, c) = rw();
    let term = fx.user_event();
    let old = fx.map(&fx.req(fx.root, &[3], p, c), &decision(), term);
    let old_did = old.manager().map(|m| m.did());
    fx.forest.events().trigger(term);
    fx.forest.drain_copies();

    fx.forest.shape().free_field(fs, 3).unwrap();
    assert_eq!(fx.forest.shape().allocate_field(fs, 20, 8).unwrap(), 3);
    let (p, c) = ro();
    let fresh = fx.map(&fx.req(fx.root, &[20], p, c), &decision(), fx.user_event());
    let manager = fresh.manager().expect("a materialized instance");
    assert_ne!(Some(manager.did()), old_did);
    assert!(manager.layout().field(20).is_some());
    assert!(fx.forest.drain_copies().is_empty());
}

#[test]
fn remap_reuses_an_earlier_instance() {
    let fx = Fixture::new();
    let (p, c) = rw();
    let term_a = fx.user_event();
    let a = fx.map(&fx.req(fx.root, &[0], p, c), &decision(), term_a);

    let (p, c) = ro();
    let sub = fx.subregion(1);
    let req = fx.req(sub, &[0], p, c);
    let mapping = fx.forest.remap_physical_region(fx.ctx, &req, &a).unwrap();
    assert_eq!(mapping.view().node(), fx.node(sub));
    assert_eq!(
        mapping.view().manager().map(|m| m.did()),
        a.manager().map(|m| m.did())
    );
    let b = fx
        .forest
        .register_physical_region(fx.ctx, &mapping, &req, fx.user_event())
        .unwrap();
    assert!(fx.forest.events().depends_on(b.ready_event(), term_a));

    let other_field = fx.req(sub, &[1], p, c);
    let err = fx
        .forest
        .remap_physical_region(fx.ctx, &other_field, &a)
        .unwrap_err();
    assert!(matches!(err, MappingError::UnmappableView(_)));
}

#[test]
fn simultaneous_mappings_share_until_coherence_is_acquired() {
    let fx = Fixture::new();
    let sim = |fx: &Fixture| fx.req(fx.root, &[6], PrivilegeMode::ReadWrite, CoherenceProperty::Simultaneous);
    let elsewhere = MappingDecision::new([MEM2]);
    let first = fx.map(&sim(&fx), &decision(), fx.user_event());
    assert_eq!(first.view().memory(), Some(MEM));
    let second = fx.map(&sim(&fx), &elsewhere, fx.user_event());
    assert_eq!(
        second.manager().map(|m| m.did()),
        first.manager().map(|m| m.did())
    );

    fx.forest.acquire_user_coherence(fx.ctx, fx.root, &[6]).unwrap();
    assert!(!fx.forest.user_coherence(fx.ctx, &sim(&fx)).unwrap().is_empty());
    let third = fx.map(&sim(&fx), &elsewhere, fx.user_event());
    assert_eq!(third.view().memory(), Some(MEM2));

    fx.forest.release_user_coherence(fx.ctx, fx.root, &[6]).unwrap();
    assert!(fx.forest.user_coherence(fx.ctx, &sim(&fx)).unwrap().is_empty());
    let fourth = fx.map(&sim(&fx), &decision(), fx.user_event());
    assert_eq!(
        fourth.manager().map(|m| m.did()),
        third.manager().map(|m| m.did())
    );
}

#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use common::{Fixture, RecordingOp, FIELDS, ro, rw};
use proptest::prelude::*;
use rtf::{
    logical::{AnalysisRequest, ContextBatch},
    shape::ShapeError,
    types::{CoherenceProperty, DependenceType, OperationId, PrivilegeMode, ReductionOpId, RegionRequirement},
};

#[test]
fn read_after_write_on_a_subregion() {
    let fx = Fixture::new();
    let sub = fx.subregion(0);
    let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    fx.analyze(&a, &fx.req(sub, &[0], p, c));
    let (p, c) = ro();
    fx.analyze(&b, &fx.req(sub, &[0], p, c));

    assert!(a.edges().is_empty());
    assert_eq!(b.edges(), vec![(a.id(), DependenceType::TrueDependence)]);
    assert!(b.closes().is_empty());
}

#[test]
fn write_after_read_is_an_anti_dependence() {
    let fx = Fixture::new();
    let (r, w) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = ro();
    fx.analyze(&r, &fx.req(fx.root, &[3], p, c));
    let (p, c) = rw();
    fx.analyze(&w, &fx.req(fx.root, &[3], p, c));

    assert_eq!(w.edges(), vec![(r.id(), DependenceType::AntiDependence)]);
}

#[test]
fn simultaneous_writers_are_not_ordered() {
    let fx = Fixture::new();
    let ops: Vec<_> = (1..=3).map(RecordingOp::new).collect();
    for op in &ops {
        let req = fx.req(fx.root, &[0, 1], PrivilegeMode::ReadWrite, CoherenceProperty::Simultaneous);
        fx.analyze(op, &req);
    }
    for op in &ops {
        assert!(op.edges().is_empty(), "{:?} got edges", op.id());
        assert!(op.closes().is_empty());
    }
}

#[test]
fn simultaneous_siblings_on_separate_fields() {
    let fx = Fixture::new();
    let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
    let sim = CoherenceProperty::Simultaneous;
    fx.analyze(&a, &fx.req(fx.subregion(0), &[0], PrivilegeMode::ReadWrite, sim));
    fx.analyze(&b, &fx.req(fx.subregion(1), &[1], PrivilegeMode::ReadWrite, sim));
    assert!(b.edges().is_empty());
    assert!(b.closes().is_empty());
}

#[test]
fn atomic_writers_serialize() {
    let fx = Fixture::new();
    let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
    for op in [&a, &b] {
        fx.analyze(op, &fx.req(fx.root, &[0], PrivilegeMode::ReadWrite, CoherenceProperty::Atomic));
    }
    assert_eq!(b.edges(), vec![(a.id(), DependenceType::AtomicDependence)]);
}

#[test]
fn same_reduction_operator_commutes() {
    let fx = Fixture::new();
    let redop = PrivilegeMode::Reduce(ReductionOpId(7));
    let (a, b, r) = (RecordingOp::new(1), RecordingOp::new(2), RecordingOp::new(3));
    fx.analyze(&a, &fx.req(fx.subregion(0), &[0], redop, CoherenceProperty::Exclusive));
    fx.analyze(&b, &fx.req(fx.subregion(1), &[0], redop, CoherenceProperty::Exclusive));
    assert!(b.edges().is_empty());
    assert!(b.closes().is_empty());

    // A reader of the whole region has to close both reducers.
    let (p, c) = ro();
    fx.analyze(&r, &fx.req(fx.root, &[0], p, c));
    let closes = r.closes();
    assert_eq!(closes.len(), 1);
    assert!(closes[0].depends_on(a.id()));
    assert!(closes[0].depends_on(b.id()));
}

#[test]
fn disjoint_subregions_do_not_interfere() {
    let fx = Fixture::new();
    let ops: Vec<_> = (0u32..4).map(|c| RecordingOp::new(u64::from(c) + 1)).collect();
    let (p, c) = rw();
    for (color, op) in (0..4).zip(&ops) {
        fx.analyze(op, &fx.req(fx.subregion(color), &[0], p, c));
    }
    for op in &ops {
        assert!(op.edges().is_empty());
        assert!(op.closes().is_empty());
    }
    let open = fx.forest.logical_open_children(fx.ctx, fx.partition_node());
    assert_eq!(open.len(), 4);
}

#[test]
fn writing_the_parent_closes_open_children() {
    let fx = Fixture::new();
    let (a, c_op) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    fx.analyze(&a, &fx.req(fx.subregion(0), &[0], p, c));
    fx.analyze(&c_op, &fx.req(fx.root, &[0], p, c));

    let closes = c_op.closes();
    assert_eq!(closes.len(), 1);
    let close = &closes[0];
    assert_eq!(close.node, fx.root_node());
    assert!(close.depends_on(a.id()));
    assert!(close.id.is_close());
    assert_eq!(close.closed_children().collect::<Vec<_>>(), vec![0]);
    assert!(close.leave_open.is_empty());

    // The writer orders after the close, not after the closed user.
    assert_eq!(c_op.edges(), vec![(close.id, DependenceType::TrueDependence)]);
    let mask = fx.forest.requirement_mask(&fx.req(fx.root, &[0], p, c)).unwrap();
    let still_open = fx
        .forest
        .logical_open_children(fx.ctx, fx.root_node())
        .into_iter()
        .any(|(_, fields, _)| fields.intersects(mask));
    assert!(!still_open);
}

#[test]
fn readers_leave_written_children_open() {
    let fx = Fixture::new();
    let (w, r) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    fx.analyze(&w, &fx.req(fx.subregion(2), &[4], p, c));
    let (p, c) = ro();
    fx.analyze(&r, &fx.req(fx.root, &[4], p, c));

    let closes = r.closes();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].leave_open, vec![0]);
    assert!(closes[0].depends_on(w.id()));
}

#[test]
fn explicit_close_orders_the_caller() {
    let fx = Fixture::new();
    let (w, closer) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    let req = fx.req(fx.subregion(1), &[0, 1], p, c);
    fx.analyze(&w, &req);
    let mask = fx.forest.requirement_mask(&req).unwrap();

    let close = fx
        .forest
        .close_logical_node(fx.ctx, &closer, fx.root_node(), mask)
        .expect("a child was open");
    assert!(close.depends_on(w.id()));
    assert_eq!(closer.edges(), vec![(close.id, DependenceType::TrueDependence)]);
    assert!(fx
        .forest
        .close_logical_node(fx.ctx, &closer, fx.root_node(), mask)
        .is_none());
}

#[test]
fn committed_operations_are_not_waited_on() {
    let fx = Fixture::new();
    let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    fx.analyze(&a, &fx.req(fx.root, &[0], p, c));
    fx.forest.commit_operation(a.id());
    fx.analyze(&b, &fx.req(fx.root, &[0], p, c));
    assert!(b.edges().is_empty());
}

#[test]
fn contexts_are_independent() {
    let fx = Fixture::new();
    let other = fx.forest.allocate_context();
    let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    let req = fx.req(fx.root, &[0], p, c);
    fx.analyze(&a, &req);
    fx.forest.perform_dependence_analysis(other, &b, 0, &req).unwrap();
    assert!(b.edges().is_empty());
}

#[test]
fn committed_set_forgets_unreferenced_operations() {
    let fx = Fixture::new();
    let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    fx.analyze(&a, &fx.req(fx.subregion(0), &[0], p, c));
    fx.forest.commit_operation(a.id());
    fx.forest.commit_operation(OperationId(100));
    for id in 1_000..3_000 {
        fx.forest.commit_operation(OperationId(id));
    }
    assert!(fx.forest.is_committed(a.id()));
    assert!(!fx.forest.is_committed(OperationId(100)));

    fx.analyze(&b, &fx.req(fx.subregion(0), &[0], p, c));
    assert!(b.edges().is_empty());
}

#[test]
fn fence_orders_after_the_whole_subtree() {
    let fx = Fixture::new();
    let (w, fence, r) = (RecordingOp::new(1), RecordingOp::new(2), RecordingOp::new(3));
    let (p, c) = rw();
    fx.analyze(&w, &fx.req(fx.subregion(0), &[0], p, c));
    fx.forest.perform_fence_analysis(fx.ctx, &fence, fx.root).unwrap();
    assert_eq!(fence.edges(), vec![(w.id(), DependenceType::TrueDependence)]);
    let users = fx.forest.logical_users(fx.ctx, fx.root_node());
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].op, fence.id());

    let (p, c) = ro();
    fx.analyze(&r, &fx.req(fx.root, &[0], p, c));
    let closes = r.closes();
    assert_eq!(closes.len(), 1);
    assert!(closes[0].depends_on(w.id()));
    assert!(closes[0].depends_on(fence.id()));
    assert!(r.edges().contains(&(closes[0].id, DependenceType::TrueDependence)));
}

#[test]
fn deletion_drops_the_subtree_state() {
    let fx = Fixture::new();
    let (w, del) = (RecordingOp::new(1), RecordingOp::new(2));
    let sub = fx.subregion(0);
    let (p, c) = rw();
    fx.analyze(&w, &fx.req(sub, &[0, 1], p, c));
    fx.forest.perform_deletion_analysis(fx.ctx, &del, sub).unwrap();

    assert_eq!(del.edges(), vec![(w.id(), DependenceType::TrueDependence)]);
    assert!(fx.forest.logical_users(fx.ctx, fx.node(sub)).is_empty());
    assert!(fx
        .forest
        .logical_open_children(fx.ctx, fx.partition_node())
        .iter()
        .all(|&(color, _, _)| color != 0));
}

#[test]
fn context_reset_forgets_users() {
    let fx = Fixture::new();
    let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
    let (p, c) = rw();
    let req = fx.req(fx.subregion(3), &[2], p, c);
    fx.analyze(&a, &req);
    fx.forest.initialize_logical_context(fx.ctx, fx.root).unwrap();
    assert!(fx.forest.logical_users(fx.ctx, fx.node(fx.subregion(3))).is_empty());
    assert!(fx.forest.logical_open_children(fx.ctx, fx.root_node()).is_empty());

    fx.analyze(&b, &req);
    assert!(b.edges().is_empty());
    fx.forest.invalidate_logical_context(fx.ctx, fx.root).unwrap();
    assert!(fx.forest.logical_users(fx.ctx, fx.node(fx.subregion(3))).is_empty());
}

#[test]
fn freed_context_keeps_no_state() {
    let fx = Fixture::new();
    let a = RecordingOp::new(1);
    let (p, c) = rw();
    let req = fx.req(fx.root, &[0], p, c);
    fx.analyze(&a, &req);
    let term = fx.user_event();
    fx.map(&req, &common::decision(), term);
    assert!(!fx.forest.valid_views(fx.ctx, fx.root_node()).is_empty());

    fx.forest.free_context(fx.ctx);
    assert!(fx.forest.logical_users(fx.ctx, fx.root_node()).is_empty());
    assert!(fx.forest.valid_views(fx.ctx, fx.root_node()).is_empty());
}

fn requests<'a>(ops: &'a [RecordingOp], reqs: &'a [RegionRequirement]) -> Vec<AnalysisRequest<'a>> {
    ops.iter()
        .zip(reqs)
        .map(|(op, req)| AnalysisRequest { op, idx: 0, req })
        .collect()
}

#[test]
fn parallel_contexts_match_sequential_analysis() {
    let fx = Fixture::new();
    let other = fx.forest.allocate_context();
    let (p, c) = rw();
    let (rp, rc) = ro();
    let reqs = [
        fx.req(fx.subregion(0), &[0], p, c),
        fx.req(fx.subregion(1), &[0], p, c),
        fx.req(fx.root, &[0], rp, rc),
        fx.req(fx.subregion(0), &[0, 1], p, c),
    ];
    let batch_ops = |base: u64| -> Vec<RecordingOp> { (0..4).map(|i| RecordingOp::new(base + i)).collect() };
    let (lhs, rhs) = (batch_ops(10), batch_ops(20));
    let batches = [
        ContextBatch {
            ctx: fx.ctx,
            requests: requests(&lhs, &reqs),
        },
        ContextBatch {
            ctx: other,
            requests: requests(&rhs, &reqs),
        },
    ];
    fx.forest.analyze_contexts(&batches).unwrap();

    let sequential = Fixture::new();
    let expected = batch_ops(10);
    for (op, req) in expected.iter().zip(&reqs) {
        sequential.analyze(op, req);
    }
    let shift = |edges: Vec<(OperationId, DependenceType)>, by: u64| -> Vec<(u64, DependenceType)> {
        edges
            .into_iter()
            .filter(|(target, _)| !target.is_close())
            .map(|(target, kind)| (target.0 - by, kind))
            .collect()
    };
    for i in 0..4 {
        let want = shift(expected[i].edges(), 10);
        assert_eq!(shift(lhs[i].edges(), 10), want);
        assert_eq!(shift(rhs[i].edges(), 20), want);
        assert_eq!(lhs[i].closes().len(), expected[i].closes().len());
        assert_eq!(rhs[i].closes().len(), expected[i].closes().len());
    }
}

#[test]
fn parallel_contexts_report_the_first_error() {
    let fx = Fixture::new();
    let other = fx.forest.allocate_context();
    let (p, c) = rw();
    let good = fx.req(fx.root, &[0], p, c);
    let bad = fx.req(fx.root, &[FIELDS + 5], p, c);
    let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
    let batches = [
        ContextBatch {
            ctx: fx.ctx,
            requests: vec![AnalysisRequest { op: &a, idx: 0, req: &good }],
        },
        ContextBatch {
            ctx: other,
            requests: vec![AnalysisRequest { op: &b, idx: 0, req: &bad }],
        },
    ];
    let field_space = fx.root.field_space;
    assert_eq!(
        fx.forest.analyze_contexts(&batches),
        Err(ShapeError::UnknownField {
            space: field_space,
            field: FIELDS + 5,
        })
    );
    assert_eq!(fx.forest.logical_users(fx.ctx, fx.root_node()).len(), 1);
}

#[test]
fn destroying_fields_orders_after_their_users_only() {
    let fx = Fixture::new();
    let (w0, w1, del) = (RecordingOp::new(1), RecordingOp::new(2), RecordingOp::new(3));
    let (p, c) = rw();
    fx.analyze(&w0, &fx.req(fx.subregion(0), &[3], p, c));
    fx.analyze(&w1, &fx.req(fx.subregion(1), &[4], p, c));
    fx.forest
        .analyze_destroy_fields(fx.ctx, fx.root.field_space, &[3], &del, fx.root)
        .unwrap();

    assert_eq!(del.edges(), vec![(w0.id(), DependenceType::TrueDependence)]);
    assert!(fx.forest.logical_users(fx.ctx, fx.node(fx.subregion(0))).is_empty());
    let kept = fx.forest.logical_users(fx.ctx, fx.node(fx.subregion(1)));
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].op, w1.id());
    assert_eq!(
        fx.forest
            .analyze_destroy_fields(fx.ctx, fx.root.field_space, &[FIELDS + 1], &del, fx.root),
        Err(ShapeError::UnknownField {
            space: fx.root.field_space,
            field: FIELDS + 1,
        })
    );
}

#[test]
fn destroying_a_region_closes_it_at_the_parent() {
    let fx = Fixture::new();
    let (w, del, later) = (RecordingOp::new(1), RecordingOp::new(2), RecordingOp::new(3));
    let sub = fx.subregion(2);
    let (p, c) = rw();
    fx.analyze(&w, &fx.req(sub, &[0], p, c));
    fx.forest.analyze_destroy_logical_region(fx.ctx, sub, &del, fx.root).unwrap();

    assert_eq!(del.edges(), vec![(w.id(), DependenceType::TrueDependence)]);
    assert!(fx.forest.logical_users(fx.ctx, fx.node(sub)).is_empty());
    assert!(fx
        .forest
        .logical_open_children(fx.ctx, fx.partition_node())
        .iter()
        .all(|&(color, _, _)| color != 2));

    // The sibling's writer finds nothing left to wait on.
    fx.analyze(&later, &fx.req(fx.subregion(3), &[0], p, c));
    assert!(later.edges().is_empty());
}

#[test]
fn destroying_a_partition_drops_every_child() {
    let fx = Fixture::new();
    let del = RecordingOp::new(9);
    let writers: Vec<_> = (0u32..4).map(|c| RecordingOp::new(u64::from(c) + 1)).collect();
    let (p, c) = rw();
    for (color, op) in (0u32..).zip(&writers) {
        fx.analyze(op, &fx.req(fx.subregion(color), &[1], p, c));
    }
    fx.forest
        .analyze_destroy_logical_partition(fx.ctx, fx.partition, &del, fx.root)
        .unwrap();
    let mut targets: Vec<_> = del.edges().into_iter().map(|(target, _)| target).collect();
    targets.sort();
    assert_eq!(targets, writers.iter().map(RecordingOp::id).collect::<Vec<_>>());
    assert!(fx.forest.logical_open_children(fx.ctx, fx.root_node()).is_empty());
    for color in 0..4 {
        assert!(fx.forest.logical_users(fx.ctx, fx.node(fx.subregion(color))).is_empty());
    }
}

#[test]
fn destroying_index_and_field_spaces() {
    let fx = Fixture::new();
    let (w, by_space, by_partition, by_fields) =
        (RecordingOp::new(1), RecordingOp::new(2), RecordingOp::new(3), RecordingOp::new(4));
    let sub = fx.subregion(1);
    let (p, c) = rw();
    fx.analyze(&w, &fx.req(sub, &[5], p, c));
    fx.forest
        .analyze_destroy_index_space(fx.ctx, sub.index_space, &by_space, fx.root)
        .unwrap();
    assert_eq!(by_space.edges(), vec![(w.id(), DependenceType::TrueDependence)]);
    assert!(fx.forest.logical_users(fx.ctx, fx.node(sub)).is_empty());

    fx.analyze(&w, &fx.req(sub, &[5], p, c));
    fx.forest
        .analyze_destroy_index_partition(fx.ctx, fx.partition.index_partition, &by_partition, fx.root)
        .unwrap();
    assert_eq!(by_partition.edges(), vec![(w.id(), DependenceType::TrueDependence)]);

    fx.analyze(&w, &fx.req(fx.root, &[6], p, c));
    fx.forest
        .analyze_destroy_field_space(fx.ctx, fx.root.field_space, &by_fields, fx.root)
        .unwrap();
    assert_eq!(by_fields.edges(), vec![(w.id(), DependenceType::TrueDependence)]);
    assert!(fx.forest.logical_users(fx.ctx, fx.root_node()).is_empty());
}

#[test]
fn user_coherence_is_inherited_by_subregions() {
    let fx = Fixture::new();
    let sim = CoherenceProperty::Simultaneous;
    let on_sub = fx.req(fx.subregion(0), &[1, 2], PrivilegeMode::ReadWrite, sim);
    let mask = |fields: &[u32]| {
        fx.forest
            .requirement_mask(&fx.req(fx.root, fields, PrivilegeMode::ReadWrite, sim))
            .unwrap()
    };
    assert!(fx.forest.user_coherence(fx.ctx, &on_sub).unwrap().is_empty());

    fx.forest.acquire_user_coherence(fx.ctx, fx.root, &[2, 3]).unwrap();
    assert_eq!(fx.forest.user_coherence(fx.ctx, &on_sub).unwrap(), mask(&[2]));
    let other = fx.forest.allocate_context();
    assert!(fx.forest.user_coherence(other, &on_sub).unwrap().is_empty());

    fx.forest.release_user_coherence(fx.ctx, fx.root, &[2]).unwrap();
    assert!(fx.forest.user_coherence(fx.ctx, &on_sub).unwrap().is_empty());
    assert_eq!(
        fx.forest
            .user_coherence(fx.ctx, &fx.req(fx.root, &[3], PrivilegeMode::ReadWrite, sim))
            .unwrap(),
        mask(&[3])
    );
}

fn privilege() -> impl Strategy<Value = PrivilegeMode> {
    prop_oneof![
        Just(PrivilegeMode::ReadOnly),
        Just(PrivilegeMode::ReadWrite),
        Just(PrivilegeMode::WriteOnly),
        (1u32..4).prop_map(|r| PrivilegeMode::Reduce(ReductionOpId(r))),
    ]
}

fn target() -> impl Strategy<Value = Option<u32>> {
    prop_oneof![Just(None), (0u32..4).prop_map(Some)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn disjoint_fields_never_order(
        split in 1..FIELDS,
        lhs in privilege(),
        rhs in privilege(),
        lhs_target in target(),
        rhs_target in target(),
    ) {
        let fx = Fixture::new();
        let (a, b) = (RecordingOp::new(1), RecordingOp::new(2));
        let region = |t: Option<u32>| t.map_or(fx.root, |color| fx.subregion(color));
        let low: Vec<u32> = (0..split).collect();
        let high: Vec<u32> = (split..FIELDS).collect();
        fx.analyze(&a, &fx.req(region(lhs_target), &low, lhs, CoherenceProperty::Exclusive));
        fx.analyze(&b, &fx.req(region(rhs_target), &high, rhs, CoherenceProperty::Exclusive));
        prop_assert!(b.edges().is_empty());
        prop_assert!(b.closes().is_empty());
    }
}

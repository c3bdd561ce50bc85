mod common;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use common::{Axpb, BYTES, N};
use cuda_graph::{
    build_dynamic,
    sim::{f32_arg, ptr_arg, u32_arg, SimDriver},
    CaptureMode, GraphError, GraphHandle, GraphState, MempoolId, NodeKind, NodePatch, SentinelMode,
};

fn capture(
    t: &Axpb,
    mode: SentinelMode,
    program: impl FnOnce() -> Result<()>,
) -> Result<GraphHandle<SimDriver>> {
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.capture(MempoolId::default(), CaptureMode::Global, mode, program)?;
    Ok(graph)
}

fn precondition(e: anyhow::Error) -> bool {
    matches!(e.downcast_ref(), Some(GraphError::Precondition(_)))
}

#[test]
fn dynamic_replay_with_fresh_buffers() -> Result<()> {
    let t = Axpb::new();
    let mut graph = capture(&t, SentinelMode::Shared, || t.dynamic_axpb(2., 1.))?;
    let recapture = capture(&t, SentinelMode::Distinct, || t.dynamic_axpb(2., 1.))?;
    assert_eq!(graph.state(), GraphState::Captured);
    assert_eq!(graph.allocation_sizes(), recapture.allocation_sizes());
    assert_eq!(graph.allocation_sizes(), &[BYTES, BYTES, BYTES]);

    graph.compare_with_recapture(&recapture)?;
    assert_eq!(graph.state(), GraphState::DynamicallyReady);
    drop(recapture);
    // Kernel patches go through device nodes; the captured graph is gone.
    assert!(!graph.has_graph());
    assert_eq!(t.driver.live_graphs(), 0);

    let x = t.alloc_with(&[10., 20., 30., 40.])?;
    let y = t.alloc()?;
    graph.replay_dynamic(&[x, y], &[BYTES, BYTES])?;
    assert_eq!(t.read(y)?, vec![21., 41., 61., 81.]);

    t.driver.write_f32s(x, &[0.; N])?;
    graph.replay_dynamic(&[x, y], &[BYTES, BYTES])?;
    assert_eq!(t.read(y)?, vec![1.; N]);

    // Other buffers, same instantiated graph.
    let x2 = t.alloc_with(&[1., 1., 2., 2.])?;
    let y2 = t.alloc()?;
    graph.replay_dynamic(&[x2, y2], &[BYTES, BYTES])?;
    assert_eq!(t.read(y2)?, vec![3., 3., 5., 5.]);
    assert_eq!(t.read(y)?, vec![1.; N]);

    let counters = t.driver.counters();
    assert_eq!(counters.graph_launches, 3);
    assert_eq!(counters.updater_launches, 3);
    assert_eq!(counters.host_callbacks, 3);
    assert_eq!(counters.node_param_sets, 0);
    assert_eq!(t.driver.live_execs(), 1);
    Ok(())
}

#[test]
fn ephemeral_buffers_do_not_outlive_the_replay() -> Result<()> {
    let t = Axpb::new();
    let graph = build_dynamic(&t.ctx, || t.dynamic_axpb(2., 1.))?;
    let x = t.alloc_with(&[1., 2., 3., 4.])?;
    let y = t.alloc()?;
    assert_eq!(t.driver.live_allocations(), 2);

    graph.replay_dynamic(&[x, y], &[BYTES, BYTES])?;
    assert_eq!(t.driver.live_allocations(), 2);

    // The temporary may also be left for the replay to allocate.
    graph.replay_dynamic(&[x], &[BYTES])?;
    assert_eq!(t.driver.live_allocations(), 2);

    t.driver.set_memory_limit(Some(2 * BYTES + BYTES / 2));
    assert!(graph.replay_dynamic(&[x, y], &[BYTES, BYTES]).is_err());
    t.driver.set_memory_limit(None);
    assert_eq!(t.driver.live_allocations(), 2);
    Ok(())
}

#[test]
fn dynamic_replay_matches_a_plain_capture() -> Result<()> {
    let t = Axpb::new();
    let input = [0.25, -3., 7.5, 1e6];

    let x = t.alloc_with(&input)?;
    let y = t.alloc()?;
    let plain = capture(&t, SentinelMode::Off, || t.axpb(y, x, -1.5, 0.75))?;
    plain.replay()?;
    let expected = t.driver.read_bytes(y, BYTES)?;

    let dynamic = build_dynamic(&t.ctx, || t.dynamic_axpb(-1.5, 0.75))?;
    let x2 = t.alloc_with(&input)?;
    let y2 = t.alloc()?;
    dynamic.replay_dynamic(&[x2, y2], &[BYTES, BYTES])?;
    assert_eq!(t.driver.read_bytes(y2, BYTES)?, expected);
    Ok(())
}

#[test]
fn patch_lists_respect_the_allocation_schema() -> Result<()> {
    let t = Axpb::new();
    let graph = build_dynamic(&t.ctx, || t.dynamic_axpb(2., 1.))?;

    let updates = graph.kernel_param_updates();
    // scale(tmp, x) and add_scalar(y, tmp): two pointers per kernel.
    assert_eq!(updates.len(), 4);
    assert!(graph.graph_node_param_updates().is_empty());

    let block_size = 8 + 8 + 4 + 4;
    let mut by_node: HashMap<_, Vec<usize>> = HashMap::new();
    for k in updates {
        assert!(!k.dev_node.is_null());
        assert!(k.alloc_index < graph.allocation_sizes().len());
        assert!(k.offset < graph.allocation_sizes()[k.alloc_index]);
        assert!(k.param_offset + 8 <= block_size);
        by_node.entry(k.dev_node).or_default().push(k.param_offset);
    }
    assert_eq!(by_node.len(), 2);
    for offsets in by_node.values_mut() {
        offsets.sort();
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= 8);
        }
    }

    let mut targets: Vec<_> = updates.iter().map(|k| (k.param_offset, k.alloc_index)).collect();
    targets.sort();
    assert_eq!(targets, vec![(0, 1), (0, 2), (8, 0), (8, 2)]);
    Ok(())
}

#[test]
fn interior_pointers_keep_their_offset() -> Result<()> {
    let t = Axpb::new();
    let program = || {
        let x = t.alloc()?;
        let y = t.alloc()?;
        // Scale only the second half.
        t.driver.launch(
            t.stream,
            t.scale,
            &[ptr_arg(y + 8), ptr_arg(x + 8), f32_arg(10.), u32_arg(2)],
        )
    };
    let graph = build_dynamic(&t.ctx, program)?;
    assert!(graph.kernel_param_updates().iter().all(|k| k.offset == 8));

    let x = t.alloc_with(&[1., 2., 3., 4.])?;
    let y = t.alloc_with(&[-1.; N])?;
    graph.replay_dynamic(&[x, y], &[BYTES, BYTES])?;
    assert_eq!(t.read(y)?, vec![-1., -1., 30., 40.]);
    Ok(())
}

#[test]
fn memcpy_between_allocations_is_patched_on_the_host() -> Result<()> {
    let t = Axpb::new();
    let graph = build_dynamic(&t.ctx, || {
        let x = t.alloc()?;
        let y = t.alloc()?;
        t.driver.memcpy_dtod_async(t.stream, y, x, BYTES)
    })?;
    assert!(graph.kernel_param_updates().is_empty());
    let patches = graph.graph_node_param_updates();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].patch.kind(), NodeKind::Memcpy);
    // Host-side patches address nodes of the captured graph.
    assert!(graph.has_graph());
    assert_eq!(t.driver.live_graphs(), 1);

    let x = t.alloc_with(&[5., 6., 7., 8.])?;
    let y = t.alloc()?;
    graph.replay_dynamic(&[x, y], &[BYTES, BYTES])?;
    assert_eq!(t.read(y)?, vec![5., 6., 7., 8.]);

    let counters = t.driver.counters();
    assert_eq!(counters.node_param_sets, 1);
    // Nothing to rewrite on the device.
    assert_eq!(counters.updater_launches, 0);
    assert_eq!(counters.graph_uploads, 1);

    drop(graph);
    assert_eq!(t.driver.live_graphs(), 0);
    Ok(())
}

#[test]
fn constant_address_copies_are_left_alone() -> Result<()> {
    let t = Axpb::new();
    let weights = t.alloc_with(&[1., 2., 3., 4.])?;
    let staged = t.alloc()?;

    let graph = build_dynamic(&t.ctx, || {
        let y = t.alloc()?;
        t.driver.memcpy_dtod_async(t.stream, staged, weights, BYTES)?;
        t.driver.launch(
            t.stream,
            t.scale,
            &[ptr_arg(y), ptr_arg(staged), f32_arg(2.), u32_arg(N as u32)],
        )
    })?;
    assert!(graph.graph_node_param_updates().is_empty());
    assert_eq!(graph.kernel_param_updates().len(), 1);

    let y = t.alloc()?;
    graph.replay_dynamic(&[y], &[BYTES])?;
    assert_eq!(t.read(staged)?, vec![1., 2., 3., 4.]);
    assert_eq!(t.read(y)?, vec![2., 4., 6., 8.]);
    assert_eq!(t.driver.counters().node_param_sets, 0);
    Ok(())
}

#[test]
fn memset_destinations_are_patched() -> Result<()> {
    let t = Axpb::new();
    let graph = build_dynamic(&t.ctx, || {
        let y = t.alloc()?;
        t.driver.memset_async(t.stream, y, 0, BYTES)?;
        t.driver.launch(
            t.stream,
            t.add_scalar,
            &[ptr_arg(y), ptr_arg(y), f32_arg(5.), u32_arg(N as u32)],
        )
    })?;
    let patches = graph.graph_node_param_updates();
    assert_eq!(patches.len(), 1);
    assert!(matches!(&patches[0].patch, NodePatch::Memset { dst, .. } if dst.alloc_index == 0));

    let y = t.alloc_with(&[9.; N])?;
    graph.replay_dynamic(&[y], &[BYTES])?;
    assert_eq!(t.read(y)?, vec![5.; N]);
    Ok(())
}

#[test]
fn mismatched_schemas_are_rejected() -> Result<()> {
    let t = Axpb::new();
    let mut graph = capture(&t, SentinelMode::Shared, || {
        t.alloc()?;
        Ok(())
    })?;
    let recapture = capture(&t, SentinelMode::Distinct, || {
        t.ctx.allocator().raw_alloc_with_stream(2 * BYTES, t.stream)?;
        Ok(())
    })?;

    let err = graph.compare_with_recapture(&recapture).unwrap_err();
    assert!(precondition(err));
    assert!(graph.kernel_param_updates().is_empty());
    assert!(graph.graph_node_param_updates().is_empty());
    assert_eq!(graph.state(), GraphState::Captured);
    Ok(())
}

#[test]
fn sentinel_modes_must_pair_up() -> Result<()> {
    let t = Axpb::new();
    let mut shared = capture(&t, SentinelMode::Shared, || t.dynamic_axpb(1., 1.))?;
    let other_shared = capture(&t, SentinelMode::Shared, || t.dynamic_axpb(1., 1.))?;
    assert!(precondition(shared.compare_with_recapture(&other_shared).unwrap_err()));

    let mut plain = capture(&t, SentinelMode::Off, || Ok(()))?;
    let distinct = capture(&t, SentinelMode::Distinct, || t.dynamic_axpb(1., 1.))?;
    assert!(precondition(plain.compare_with_recapture(&distinct).unwrap_err()));

    shared.compare_with_recapture(&distinct)?;
    // Diffing twice would instantiate twice.
    assert!(precondition(shared.compare_with_recapture(&distinct).unwrap_err()));
    Ok(())
}

#[test]
fn structural_differences_are_rejected() -> Result<()> {
    let t = Axpb::new();
    let mut graph = capture(&t, SentinelMode::Shared, || t.dynamic_axpb(2., 1.))?;
    let recapture = capture(&t, SentinelMode::Distinct, || {
        t.dynamic_axpb(2., 1.)?;
        t.driver.enqueue_marker(t.stream, NodeKind::Empty)
    })?;
    let err = graph.compare_with_recapture(&recapture).unwrap_err();
    assert!(matches!(
        err.downcast_ref(),
        Some(GraphError::StructuralMismatch(_))
    ));
    Ok(())
}

#[test]
fn child_graph_nodes_are_unsupported() -> Result<()> {
    let t = Axpb::new();
    let program = || {
        t.dynamic_axpb(2., 1.)?;
        t.driver.enqueue_marker(t.stream, NodeKind::Graph)
    };
    let mut graph = capture(&t, SentinelMode::Shared, program)?;
    let recapture = capture(&t, SentinelMode::Distinct, program)?;
    let err = graph.compare_with_recapture(&recapture).unwrap_err();
    assert_eq!(
        err.downcast_ref::<GraphError>(),
        Some(&GraphError::UnsupportedNode(NodeKind::Graph))
    );
    assert!(!graph.has_graph_exec());
    assert!(graph.kernel_param_updates().is_empty());
    Ok(())
}

#[test]
fn replay_dynamic_checks_its_inputs() -> Result<()> {
    let t = Axpb::new();
    let mut graph = capture(&t, SentinelMode::Shared, || t.dynamic_axpb(2., 1.))?;
    let x = t.alloc()?;
    let y = t.alloc()?;

    // Not yet diffed.
    assert!(precondition(graph.replay_dynamic(&[x, y], &[BYTES, BYTES]).unwrap_err()));

    let recapture = capture(&t, SentinelMode::Distinct, || t.dynamic_axpb(2., 1.))?;
    graph.compare_with_recapture(&recapture)?;

    assert!(precondition(graph.replay_dynamic(&[x, y], &[BYTES]).unwrap_err()));
    assert!(precondition(graph.replay_dynamic(&[x, y], &[BYTES, 2 * BYTES]).unwrap_err()));
    assert!(precondition(
        graph
            .replay_dynamic(&[x, y, x, y], &[BYTES; 4])
            .unwrap_err()
    ));

    // Sentinel graphs hold placeholder pointers.
    assert!(matches!(
        graph.replay().unwrap_err().downcast_ref(),
        Some(GraphError::Misuse(_))
    ));
    assert_eq!(t.driver.counters().graph_launches, 0);
    Ok(())
}

#[test]
fn sentinel_captures_allocate_nothing() -> Result<()> {
    let t = Axpb::new();
    let graph = capture(&t, SentinelMode::Shared, || t.dynamic_axpb(2., 1.))?;
    // Sentinel captures are neither instantiated nor launchable.
    assert!(!graph.has_graph_exec());
    assert_eq!(t.driver.live_allocations(), 0);
    Ok(())
}

#[test]
fn slices_of_buffers_feed_replay_dynamic_with() -> Result<()> {
    let t = Axpb::new();
    let graph = build_dynamic(&t.ctx, || t.dynamic_axpb(3., 0.))?;
    let x = t.alloc_with(&[1., 2., 3., 4.])?;
    let y = t.alloc()?;
    graph.replay_dynamic_with(&[(x, BYTES), (y, BYTES)][..])?;
    assert_eq!(t.read(y)?, vec![3., 6., 9., 12.]);
    Ok(())
}

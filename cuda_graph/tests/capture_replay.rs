mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{Axpb, BYTES};
use cuda_graph::{
    sim::FailPoint, CaptureMode, GraphError, GraphHandle, GraphState, GraphSafeGenerator,
    MempoolId, NodeKind, PhiloxGenerator, SentinelMode,
};

#[test]
fn round_trip_replay() -> Result<()> {
    let t = Axpb::new();
    let x = t.alloc_with(&[1., 2., 3., 4.])?;
    let y = t.alloc()?;

    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Off,
        || t.axpb(y, x, 2., 1.),
    )?;
    // Capture records, it does not run.
    assert_eq!(t.driver.counters().graph_launches, 0);
    // Only the exec survives instantiation.
    assert!(!graph.has_graph());
    assert_eq!((t.driver.live_graphs(), t.driver.live_execs()), (0, 1));

    graph.replay()?;
    assert_eq!(t.read(y)?, vec![3., 5., 7., 9.]);
    Ok(())
}

#[test]
fn debug_mode_keeps_the_captured_graph() -> Result<()> {
    let t = Axpb::new();
    t.ctx.enable_debug_mode();
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Off,
        || Ok(()),
    )?;
    assert!(graph.has_graph());
    assert_eq!(t.driver.live_graphs(), 1);
    Ok(())
}

#[test]
fn replays_are_repeatable() -> Result<()> {
    let t = Axpb::new();
    let x = t.alloc_with(&[1., -2., 0.5, 8.])?;
    let y = t.alloc()?;
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Off,
        || t.axpb(y, x, 3., -1.),
    )?;

    graph.replay()?;
    let once = t.driver.read_bytes(y, BYTES)?;
    graph.replay()?;
    assert_eq!(t.driver.read_bytes(y, BYTES)?, once);

    // New input values flow through the same addresses.
    t.driver.write_f32s(x, &[0., 0., 0., 0.])?;
    graph.replay()?;
    assert_eq!(t.read(y)?, vec![-1.; 4]);
    assert_eq!(t.driver.counters().graph_launches, 3);
    Ok(())
}

#[test]
fn empty_graph_replays_without_error() -> Result<()> {
    let t = Axpb::new();
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.capture_begin(MempoolId::default(), CaptureMode::Global, SentinelMode::Off)?;
    graph.capture_end()?;
    assert!(graph.has_graph_exec());
    assert_eq!(graph.state(), GraphState::Instantiated);

    graph.replay()?;
    assert_eq!(t.driver.counters().graph_launches, 1);
    Ok(())
}

#[test]
fn failed_capture_end_is_safe_to_drop() -> Result<()> {
    let t = Axpb::new();
    let x = t.alloc_with(&[1., 2., 3., 4.])?;
    let y = t.alloc()?;
    let live_before = t.driver.live_allocations();
    {
        let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
        graph.capture_begin(MempoolId::default(), CaptureMode::Global, SentinelMode::Off)?;
        t.axpb(y, x, 2., 1.)?;
        t.driver.arm_failure(FailPoint::EndCapture);
        assert!(graph.capture_end().is_err());
        assert!(!graph.has_graph() && !graph.has_graph_exec());
        assert_eq!(t.driver.live_graphs(), 0);
        assert_eq!(graph.state(), GraphState::Uncaptured);
    }
    assert_eq!(t.driver.live_graphs(), 0);
    assert_eq!(t.driver.live_execs(), 0);
    // The temporary parked in the private pool went back to the driver.
    assert_eq!(t.driver.live_allocations(), live_before);

    // The stream is usable for a fresh capture afterwards.
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Off,
        || t.axpb(y, x, 2., 1.),
    )?;
    graph.replay()?;
    assert_eq!(t.read(y)?, vec![3., 5., 7., 9.]);
    Ok(())
}

#[test]
fn failed_instantiate_leaves_a_resettable_handle() -> Result<()> {
    let t = Axpb::new();
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.capture_begin(MempoolId::default(), CaptureMode::Global, SentinelMode::Off)?;
    t.driver.arm_failure(FailPoint::Instantiate);
    assert!(graph.capture_end().is_err());
    assert_eq!(graph.state(), GraphState::Captured);
    assert!(graph.has_graph());
    assert_eq!((t.driver.live_graphs(), t.driver.live_execs()), (1, 0));
    assert!(graph.replay().is_err());

    graph.reset();
    assert_eq!(graph.state(), GraphState::Uncaptured);
    assert_eq!(t.driver.live_graphs(), 0);
    Ok(())
}

#[test]
fn misuse_is_reported() -> Result<()> {
    let t = Axpb::new();
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));

    let is_misuse = |e: anyhow::Error| matches!(e.downcast_ref(), Some(GraphError::Misuse(_)));
    assert!(is_misuse(graph.replay().unwrap_err()));
    assert!(is_misuse(graph.capture_end().unwrap_err()));
    assert!(is_misuse(graph.pool().unwrap_err()));
    assert!(is_misuse(
        graph
            .capture_begin(MempoolId(1, 1), CaptureMode::Global, SentinelMode::Off)
            .unwrap_err()
    ));

    graph.capture_begin(MempoolId::default(), CaptureMode::Global, SentinelMode::Off)?;
    assert!(is_misuse(
        graph
            .capture_begin(MempoolId::default(), CaptureMode::Global, SentinelMode::Off)
            .unwrap_err()
    ));
    graph.capture_end()?;
    Ok(())
}

#[test]
fn graphs_can_share_a_pool() -> Result<()> {
    let t = Axpb::new();
    let x = t.alloc_with(&[1., 2., 3., 4.])?;
    let y = t.alloc()?;
    let z = t.alloc()?;

    let pool = t.ctx.graph_pool_handle();
    assert_eq!(pool.0, 0);
    assert_ne!(pool.1, 0);

    let mut first = GraphHandle::new(Arc::clone(&t.ctx));
    first.capture(pool, CaptureMode::Global, SentinelMode::Off, || {
        t.axpb(y, x, 2., 0.)
    })?;
    let mut second = GraphHandle::new(Arc::clone(&t.ctx));
    second.capture(first.pool()?, CaptureMode::Global, SentinelMode::Off, || {
        t.axpb(z, y, 1., 1.)
    })?;
    assert_eq!(second.pool()?, pool);

    first.replay()?;
    second.replay()?;
    assert_eq!(t.read(z)?, vec![3., 5., 7., 9.]);
    Ok(())
}

#[test]
fn replay_advances_registered_generators() -> Result<()> {
    let t = Axpb::new();
    let generator = Arc::new(PhiloxGenerator::new(42));
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.register_generator_state(Arc::clone(&generator) as Arc<dyn GraphSafeGenerator>);

    graph.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Off,
        || {
            generator.increment(10);
            Ok(())
        },
    )?;
    // Captured consumption is rounded up to whole Philox calls.
    assert_eq!(generator.offset(), 0);

    graph.replay()?;
    assert_eq!(generator.replay_base(), 0);
    graph.replay()?;
    assert_eq!(generator.replay_base(), 12);
    assert_eq!(generator.offset(), 24);
    Ok(())
}

/// Reserve four counter values eagerly and report how far the offset moved.
fn eager_advance(generator: &PhiloxGenerator) -> u64 {
    let before = generator.offset();
    generator.increment(4);
    generator.increment(4);
    generator.offset() - before
}

#[test]
fn generators_leave_capture_mode_on_every_exit() -> Result<()> {
    let t = Axpb::new();
    let tracked = |generator: &Arc<PhiloxGenerator>| {
        let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
        graph.register_generator_state(Arc::clone(generator) as Arc<dyn GraphSafeGenerator>);
        graph
    };

    // Sentinel capture dropped before it was ever diffed.
    let generator = Arc::new(PhiloxGenerator::new(1));
    {
        let mut graph = tracked(&generator);
        graph.capture(
            MempoolId::default(),
            CaptureMode::Global,
            SentinelMode::Shared,
            || Ok(()),
        )?;
    }
    assert_eq!(eager_advance(&generator), 8);

    // Sentinel capture reset instead of dropped.
    let generator = Arc::new(PhiloxGenerator::new(2));
    let mut graph = tracked(&generator);
    graph.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Distinct,
        || Ok(()),
    )?;
    graph.reset();
    assert_eq!(eager_advance(&generator), 8);

    // Ending the capture failed.
    let generator = Arc::new(PhiloxGenerator::new(3));
    let mut graph = tracked(&generator);
    graph.capture_begin(MempoolId::default(), CaptureMode::Global, SentinelMode::Off)?;
    t.driver.arm_failure(FailPoint::EndCapture);
    assert!(graph.capture_end().is_err());
    assert_eq!(eager_advance(&generator), 8);
    graph.reset();
    assert_eq!(eager_advance(&generator), 8);

    // Instantiation failed; the handle still holds the captured graph.
    let generator = Arc::new(PhiloxGenerator::new(4));
    let mut graph = tracked(&generator);
    graph.capture_begin(MempoolId::default(), CaptureMode::Global, SentinelMode::Off)?;
    t.driver.arm_failure(FailPoint::Instantiate);
    assert!(graph.capture_end().is_err());
    assert_eq!(eager_advance(&generator), 8);

    // The captured body failed.
    let generator = Arc::new(PhiloxGenerator::new(5));
    let mut graph = tracked(&generator);
    assert!(graph
        .capture(
            MempoolId::default(),
            CaptureMode::Global,
            SentinelMode::Off,
            || anyhow::bail!("body failed"),
        )
        .is_err());
    assert_eq!(eager_advance(&generator), 8);
    Ok(())
}

#[test]
fn unsupported_nodes_only_matter_for_diffing() -> Result<()> {
    let t = Axpb::new();
    let mut graph = GraphHandle::new(Arc::clone(&t.ctx));
    graph.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Off,
        || t.driver.enqueue_marker(t.stream, NodeKind::EventRecord),
    )?;
    graph.replay()?;
    Ok(())
}

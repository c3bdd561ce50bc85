//! Capture `y = a * x + b` once and replay it with new values in `x`.

use std::sync::Arc;

use cuda_graph::{
    sim::{f32_arg, ptr_arg, u32_arg},
    CachingAllocator, CaptureMode, GraphDumpFormat, GraphDumpVerbosity, GraphHandle, MempoolId,
    SentinelMode,
};
use cuda_graph_examples::Demo;

const N: usize = 4;

fn main() -> anyhow::Result<()> {
    let Demo {
        driver,
        ctx,
        stream,
        scale,
        add_scalar,
    } = Demo::new();

    let allocator = Arc::clone(ctx.allocator());
    let bytes = N * std::mem::size_of::<f32>();
    let x = allocator.raw_alloc_with_stream(bytes, stream)?;
    let y = allocator.raw_alloc_with_stream(bytes, stream)?;
    driver.write_f32s(x, &[1., 2., 3., 4.])?;

    let mut graph = GraphHandle::new(Arc::clone(&ctx));
    graph.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Off,
        || {
            // The temporary comes from the graph's private pool.
            let tmp = allocator.raw_alloc_with_stream(bytes, stream)?;
            driver.launch(
                stream,
                scale,
                &[ptr_arg(tmp), ptr_arg(x), f32_arg(2.), u32_arg(N as u32)],
            )?;
            driver.launch(
                stream,
                add_scalar,
                &[ptr_arg(y), ptr_arg(tmp), f32_arg(1.), u32_arg(N as u32)],
            )?;
            allocator.raw_delete(tmp)
        },
    )?;

    // Only written when CUDA_GRAPH_DEBUG is set.
    graph.debug_dump("axpb.dot", GraphDumpFormat::Dot, GraphDumpVerbosity::Verbose)?;

    graph.replay()?;
    println!("y = {:?}", driver.read_f32s(y, N)?);

    // Replay the graph. This can be done any number of times.
    for i in 1..=3 {
        let v = i as f32 * 10.;
        driver.write_f32s(x, &[v; N])?;
        graph.replay()?;
        println!("x = {v}, y = {:?}", driver.read_f32s(y, N)?);
    }

    Ok(())
}

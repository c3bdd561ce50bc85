//! Capture `y = a * x + b` twice with sentinel pointers, diff the captures,
//! then replay the graph against buffers allocated afterwards.

use std::{sync::Arc, time::Instant};

use cuda_graph::{
    build_dynamic,
    sim::{f32_arg, ptr_arg, u32_arg},
    CachingAllocator, DevicePtr,
};
use cuda_graph_examples::Demo;
use cuda_graph_macro::ReplayBuffers;

const N: usize = 4;
const BYTES: usize = N * std::mem::size_of::<f32>();
const REPLAYS: usize = 1000;

/// Buffers the captured program allocates first, in allocation order.
#[derive(ReplayBuffers)]
struct Inputs {
    x: (DevicePtr, usize),
    y: (DevicePtr, usize),
}

fn main() -> anyhow::Result<()> {
    let Demo {
        driver,
        ctx,
        stream,
        scale,
        add_scalar,
    } = Demo::new();

    let allocator = Arc::clone(ctx.allocator());
    let graph = build_dynamic(&ctx, || {
        let x = allocator.raw_alloc_with_stream(BYTES, stream)?;
        let y = allocator.raw_alloc_with_stream(BYTES, stream)?;
        let tmp = allocator.raw_alloc_with_stream(BYTES, stream)?;
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
    })?;

    tracing::info!(
        sizes = ?graph.allocation_sizes(),
        patches = graph.kernel_param_updates().len(),
        "built dynamic graph"
    );

    let start = Instant::now();
    for i in 1..=REPLAYS {
        // Fresh buffers every iteration; none of them existed at capture time.
        let inputs = Inputs {
            x: (allocator.raw_alloc_with_stream(BYTES, stream)?, BYTES),
            y: (allocator.raw_alloc_with_stream(BYTES, stream)?, BYTES),
        };
        driver.write_f32s(inputs.x.0, &[i as f32; N])?;
        graph.replay_dynamic_with(&inputs)?;

        if i % 250 == 0 {
            println!("x = {i}, y = {:?}", driver.read_f32s(inputs.y.0, N)?);
        }
        allocator.raw_delete(inputs.x.0)?;
        allocator.raw_delete(inputs.y.0)?;
    }
    println!(
        "{REPLAYS} dynamic replays in {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.
    );

    Ok(())
}

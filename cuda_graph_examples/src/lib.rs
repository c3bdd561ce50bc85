//! Shared setup for the demos: a simulated device with the kernels of
//! `y = a * x + b` registered.

use std::sync::Arc;

use cuda_graph::{
    sim::{read_f32, read_ptr, read_u32, SimDriver, SimFunction, SimStream},
    GraphConfig, GraphContext,
};

pub struct Demo {
    pub driver: Arc<SimDriver>,
    pub ctx: Arc<GraphContext<SimDriver>>,
    pub stream: SimStream,
    /// `scale(out, x, a, n)`: `out[i] = a * x[i]`
    pub scale: SimFunction,
    /// `add_scalar(out, x, b, n)`: `out[i] = x[i] + b`
    pub add_scalar: SimFunction,
}

impl Demo {
    pub fn new() -> Self {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();

        let driver = Arc::new(SimDriver::new());
        let ctx = Arc::new(GraphContext::with_driver(
            Arc::clone(&driver),
            GraphConfig::from_env(),
        ));
        // Graphs cannot be captured on the default stream.
        let stream = driver.create_stream();
        driver.set_current_stream(stream);

        let scale = driver.register_kernel(
            "scale",
            &[8, 8, 4, 4],
            Arc::new(|mem, args| {
                let a = read_f32(args[2])?;
                let n = read_u32(args[3])? as usize;
                let x = mem.read_f32s(read_ptr(args[1])?, n)?;
                let out: Vec<f32> = x.iter().map(|x| a * x).collect();
                mem.write_f32s(read_ptr(args[0])?, &out)
            }),
        );
        let add_scalar = driver.register_kernel(
            "add_scalar",
            &[8, 8, 4, 4],
            Arc::new(|mem, args| {
                let b = read_f32(args[2])?;
                let n = read_u32(args[3])? as usize;
                let x = mem.read_f32s(read_ptr(args[1])?, n)?;
                let out: Vec<f32> = x.iter().map(|x| x + b).collect();
                mem.write_f32s(read_ptr(args[0])?, &out)
            }),
        );

        Self {
            driver,
            ctx,
            stream,
            scale,
            add_scalar,
        }
    }
}

impl Default for Demo {
    fn default() -> Self {
        Self::new()
    }
}

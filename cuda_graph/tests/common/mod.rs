#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use cuda_graph::{
    sim::{f32_arg, ptr_arg, read_f32, read_ptr, read_u32, u32_arg, SimDriver, SimFunction, SimStream},
    CachingAllocator, DevicePtr, GraphConfig, GraphContext,
};

pub const N: usize = 4;
pub const BYTES: usize = N * std::mem::size_of::<f32>();

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A simulated device with the two kernels of `y = a * x + b` registered
/// and a non-default stream made current.
pub struct Axpb {
    pub driver: Arc<SimDriver>,
    pub ctx: Arc<GraphContext<SimDriver>>,
    pub stream: SimStream,
    pub scale: SimFunction,
    pub add_scalar: SimFunction,
}

impl Axpb {
    pub fn new() -> Self {
        init_tracing();
        let driver = Arc::new(SimDriver::new());
        let ctx = Arc::new(GraphContext::with_driver(
            Arc::clone(&driver),
            GraphConfig::default(),
        ));
        let stream = driver.create_stream();
        driver.set_current_stream(stream);

        // scale(out, x, a, n): out[i] = a * x[i]
        let scale = driver.register_kernel(
            "scale",
            &[8, 8, 4, 4],
            Arc::new(|mem, args| {
                let n = read_u32(args[3])? as usize;
                let a = read_f32(args[2])?;
                let x = mem.read_f32s(read_ptr(args[1])?, n)?;
                let out: Vec<f32> = x.iter().map(|v| a * v).collect();
                mem.write_f32s(read_ptr(args[0])?, &out)
            }),
        );
        // add_scalar(out, x, b, n): out[i] = x[i] + b
        let add_scalar = driver.register_kernel(
            "add_scalar",
            &[8, 8, 4, 4],
            Arc::new(|mem, args| {
                let n = read_u32(args[3])? as usize;
                let b = read_f32(args[2])?;
                let x = mem.read_f32s(read_ptr(args[1])?, n)?;
                let out: Vec<f32> = x.iter().map(|v| v + b).collect();
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

    pub fn alloc(&self) -> Result<DevicePtr> {
        self.ctx.allocator().raw_alloc_with_stream(BYTES, self.stream)
    }

    pub fn alloc_with(&self, values: &[f32]) -> Result<DevicePtr> {
        let ptr = self.alloc()?;
        self.driver.write_f32s(ptr, values)?;
        Ok(ptr)
    }

    pub fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.ctx.allocator().raw_delete(ptr)
    }

    /// Enqueue `y = a * x + b` through a temporary allocated here.
    pub fn axpb(&self, y: DevicePtr, x: DevicePtr, a: f32, b: f32) -> Result<()> {
        let tmp = self.alloc()?;
        self.driver.launch(
            self.stream,
            self.scale,
            &[ptr_arg(tmp), ptr_arg(x), f32_arg(a), u32_arg(N as u32)],
        )?;
        self.driver.launch(
            self.stream,
            self.add_scalar,
            &[ptr_arg(y), ptr_arg(tmp), f32_arg(b), u32_arg(N as u32)],
        )?;
        self.free(tmp)
    }

    /// The dynamic program: `x` and `y` are allocated inside the capture and
    /// become the prefilled prefix on replay; the temporary is ephemeral.
    pub fn dynamic_axpb(&self, a: f32, b: f32) -> Result<()> {
        let x = self.alloc()?;
        let y = self.alloc()?;
        self.axpb(y, x, a, b)
    }

    pub fn read(&self, ptr: DevicePtr) -> Result<Vec<f32>> {
        self.driver.read_f32s(ptr, N)
    }
}

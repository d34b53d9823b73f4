//! Headless device context for GPU tests.
//!
//! Tests that need a device start with [`HeadlessGpu::try_new`] and return
//! early when it yields `None`, so the suite passes on machines without a
//! Vulkan driver. Frame scheduling tests use [`HeadlessGpu::try_presentable`],
//! which also needs `VK_EXT_headless_surface`.

use glam::Vec3;
use std::mem::ManuallyDrop;
use vkgp_gpu::{
    BufferUsage, ComputeContext, DeviceContext, DeviceContextBuilder, DevicePreference, GpuBuffer,
    Surface,
};
use vkgp_render::{MeshData, Vertex, Wiggle};

use crate::Result;

/// Device context and compute queue without a window.
pub struct HeadlessGpu {
    ctx: DeviceContext,
    compute: ManuallyDrop<ComputeContext>,
}

impl HeadlessGpu {
    /// Create a context on any device with graphics and compute queues.
    pub fn new() -> Result<Self> {
        Self::with_builder(DeviceContextBuilder::headless())
    }

    /// Like [`HeadlessGpu::new`], with the extensions needed to present to
    /// a [`Surface::headless`] surface.
    pub fn presentable() -> Result<Self> {
        Self::with_builder(DeviceContextBuilder::headless().with_headless_surface())
    }

    fn with_builder(builder: DeviceContextBuilder) -> Result<Self> {
        let ctx = builder
            .app_name("vkgp-test")
            .validation(false)
            .prefer(DevicePreference::AnySuitable)
            .build()?;
        let compute = ComputeContext::new(&ctx)?;
        Ok(Self {
            ctx,
            compute: ManuallyDrop::new(compute),
        })
    }

    /// Like [`HeadlessGpu::new`], logging and returning `None` when no
    /// device is available.
    pub fn try_new() -> Option<Self> {
        available(Self::new())
    }

    /// A presentable context and a windowless surface, or `None` when the
    /// driver cannot provide them.
    pub fn try_presentable() -> Option<(Self, Surface)> {
        let gpu = available(Self::presentable())?;
        let surface = available(Surface::headless(&gpu.ctx).map_err(Into::into))?;
        Some((gpu, surface))
    }

    pub fn ctx(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn compute(&self) -> &ComputeContext {
        &self.compute
    }

    /// Displace `mesh` at time `t` with the embedded wiggle kernel and read
    /// the result back.
    pub fn run_wiggle(&self, mesh: &MeshData, t: f32) -> Result<Vec<Vertex>> {
        let ctx = &self.ctx;
        let usage = BufferUsage::STORAGE | BufferUsage::COMPUTE;
        let mut wiggle = Wiggle::new(ctx)?;
        let base = GpuBuffer::allocate_and_fill(ctx, usage, &mesh.vertices())?;
        let mut out = GpuBuffer::<Vertex>::allocate(ctx, usage, mesh.vertex_count())?;

        let result = wiggle
            .run(ctx, self.compute(), &base, &out, t)
            .map_err(Into::into)
            .and_then(|()| out.read(ctx).map_err(Into::into));

        // SAFETY: run waits for the dispatch
        unsafe {
            wiggle.destroy(ctx);
            base.free(ctx);
            out.free(ctx);
        }
        result
    }
}

fn available<T>(result: Result<T>) -> Option<T> {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("warn")
        .try_init();

    match result {
        Ok(value) => Some(value),
        Err(e) => {
            eprintln!("skipping GPU test: {e}");
            None
        }
    }
}

impl Drop for HeadlessGpu {
    fn drop(&mut self) {
        let _ = self.ctx.wait_idle();
        // SAFETY: taken exactly once, and the device is idle
        unsafe { ManuallyDrop::take(&mut self.compute).destroy(&self.ctx) };
    }
}

/// CPU reference of the wiggle kernel.
pub fn wiggle_reference(vertex: &Vertex, t: f32) -> Vertex {
    let position = Vec3::from(vertex.position);
    let normal = Vec3::from(vertex.normal);
    let offset = 0.05 * (8.0 * position.z + 3.0 * t).sin();
    Vertex {
        position: (position + normal * offset).to_array(),
        ..*vertex
    }
}

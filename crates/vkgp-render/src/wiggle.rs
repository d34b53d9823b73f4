//! Per-frame vertex displacement on the GPU.

use crate::error::Result;
use crate::mesh::Vertex;
use std::path::Path;
use vkgp_gpu::{
    group_count, BufferUsage, ComputeContext, ComputeKernel, DeviceContext, GpuBuffer, GpuError,
};

/// Arguments of the wiggle kernel: base vertices, displaced vertices, time.
pub type WiggleArgs = (GpuBuffer<Vertex>, GpuBuffer<Vertex>, GpuBuffer<f32>);

/// Displaces vertices along their normals with a travelling sine wave.
pub struct Wiggle {
    kernel: ComputeKernel<WiggleArgs>,
    time: GpuBuffer<f32>,
}

impl Wiggle {
    /// Use the embedded kernel.
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let kernel = ComputeKernel::create(ctx, vkgp_shaders::wiggle_kernel())?;
        Self::with_kernel(ctx, kernel)
    }

    /// Load the kernel from a SPIR-V file with the same bindings.
    pub fn from_file(ctx: &DeviceContext, path: impl AsRef<Path>) -> Result<Self> {
        let kernel = ComputeKernel::from_file(ctx, path)?;
        Self::with_kernel(ctx, kernel)
    }

    fn with_kernel(ctx: &DeviceContext, kernel: ComputeKernel<WiggleArgs>) -> Result<Self> {
        match GpuBuffer::allocate_and_fill(ctx, BufferUsage::STORAGE | BufferUsage::COMPUTE, &[0.0]) {
            Ok(time) => Ok(Self { kernel, time }),
            Err(e) => {
                // SAFETY: never dispatched
                unsafe { kernel.destroy(ctx) };
                Err(e.into())
            }
        }
    }

    /// Write `base` displaced at time `t` into `out` and wait for it.
    ///
    /// `out` must hold at least as many vertices as `base`.
    pub fn run(
        &mut self,
        ctx: &DeviceContext,
        compute: &ComputeContext,
        base: &GpuBuffer<Vertex>,
        out: &GpuBuffer<Vertex>,
        t: f32,
    ) -> Result<()> {
        if out.len() < base.len() {
            return Err(GpuError::OutOfBounds {
                offset: 0,
                end: base.len(),
                len: out.len(),
            }
            .into());
        }

        self.time.upload(ctx, &[t], 0)?;
        let count = u32::try_from(base.len()).unwrap_or(u32::MAX);
        let groups = group_count(count, vkgp_shaders::WIGGLE_LOCAL_SIZE);
        self.kernel
            .invoke(ctx, compute, (base, out, &self.time), [groups, 1, 1])?;
        Ok(())
    }

    /// Destroy the kernel and the time buffer.
    ///
    /// # Safety
    /// No dispatch may be pending.
    pub unsafe fn destroy(self, ctx: &DeviceContext) {
        // SAFETY: forwarded from the caller
        unsafe {
            self.kernel.destroy(ctx);
            self.time.free(ctx);
        }
    }
}

//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use vkgp_gpu::{ComputeContext, DeviceContext, FrameConfig, FrameScheduler, Surface};
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// Device, queues and memory.
    pub gpu: DeviceContext,
    /// Swapchain and frame pacing.
    pub frames: FrameScheduler,
    /// Command pool and queue for compute dispatches.
    pub compute: ComputeContext,
    /// Total frames rendered.
    pub frame_count: u64,
    pub(crate) start_time: Instant,
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// Create the surface, frame scheduler and compute context for `window`.
    ///
    /// # Safety
    /// The window must outlive the context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: DeviceContext,
        config: FrameConfig,
    ) -> anyhow::Result<Self> {
        // SAFETY: caller guarantees the window outlives the surface
        let surface = unsafe { Surface::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let frames = FrameScheduler::new(&gpu, surface, extent, config)?;

        let compute = match ComputeContext::new(&gpu) {
            Ok(compute) => compute,
            Err(e) => {
                frames.destroy(&gpu);
                return Err(e.into());
            }
        };

        let swapchain = frames.swapchain();
        tracing::info!(
            "Swapchain created: {}x{} ({} images, {:?})",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.image_count(),
            swapchain.present_mode()
        );

        let now = Instant::now();
        Ok(Self {
            window,
            gpu,
            frames,
            compute,
            frame_count: 0,
            start_time: now,
            last_frame_time: now,
        })
    }

    /// Get the current render area.
    pub fn extent(&self) -> vk::Extent2D {
        self.frames.extent()
    }

    /// Get the aspect ratio (width / height), 1 while the window is empty.
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        if extent.height == 0 {
            1.0
        } else {
            extent.width as f32 / extent.height as f32
        }
    }

    /// Render pass frames are recorded in.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.frames.render_pass()
    }

    /// Seconds since the context was created.
    pub fn elapsed(&self) -> f32 {
        self.start_time.elapsed().as_secs_f32()
    }

    /// Tear down in dependency order and drop the device.
    pub(crate) fn destroy(self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }
        // SAFETY: the device is idle
        unsafe { self.compute.destroy(&self.gpu) };
        self.frames.destroy(&self.gpu);

        let memory = self.gpu.memory();
        let live = memory.live_allocations();
        if live > 0 {
            tracing::warn!(
                "{live} device allocations ({} bytes) still live at shutdown",
                memory.live_bytes()
            );
        }
        drop(self.gpu);
        drop(self.window);
    }
}

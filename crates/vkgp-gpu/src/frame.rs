//! Frame pacing.
//!
//! Up to `frames_in_flight` frames may be recorded or executing at once. Each
//! frame uses the slot `frame % frames_in_flight`, whose fence is waited on
//! before the slot is reused. Because the presentation engine hands out
//! images in an arbitrary order, every swapchain image also remembers the
//! frame that last rendered to it; if that frame may still be executing, its
//! slot fence is waited on before the image is rendered to again.

use crate::command::{
    begin_command_buffer, end_command_buffer, submit_command_buffers, CommandPool,
};
use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::surface::Surface;
use crate::swapchain::{Swapchain, SwapchainConfig};
use crate::sync::{reset_fence, timeout_ns, FrameSlot};
use ash::vk;
use std::time::Duration;

/// Default number of frames in flight.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;

/// How often a single `begin_frame` recreates a stale swapchain before
/// giving up.
const MAX_ACQUIRE_ATTEMPTS: u32 = 3;

/// Frame scheduler configuration.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Number of frame slots.
    pub frames_in_flight: usize,
    /// Swapchain options used on every (re)creation.
    pub swapchain: SwapchainConfig,
    /// Colour the colour attachment is cleared to.
    pub clear_color: [f32; 4],
    /// Bound on fence waits. `None` waits forever.
    pub fence_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            swapchain: SwapchainConfig::default(),
            clear_color: [0.1, 0.0, 0.1, 1.0],
            fence_timeout: None,
        }
    }
}

impl FrameConfig {
    /// Prefer FIFO presentation.
    pub fn vsync(mut self, enable: bool) -> Self {
        self.swapchain.vsync = enable;
        self
    }

    /// Set the number of frames in flight (at least one).
    pub fn frames_in_flight(mut self, count: usize) -> Self {
        self.frames_in_flight = count.max(1);
        self
    }

    /// Set the clear colour.
    pub fn clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Bound fence waits; an expired wait is reported as a lost device.
    pub fn fence_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fence_timeout = timeout;
        self
    }
}

/// Frame counter and slot arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePacer {
    frames_in_flight: usize,
    frame: u64,
}

impl FramePacer {
    /// Start at frame 0.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            frame: 0,
        }
    }

    /// Number of slots.
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Index of the current frame.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Slot of the current frame.
    pub fn slot(&self) -> usize {
        self.slot_of(self.frame)
    }

    /// Slot used by `frame`.
    pub fn slot_of(&self, frame: u64) -> usize {
        (frame % self.frames_in_flight as u64) as usize
    }

    /// Move on to the next frame.
    pub fn advance(&mut self) {
        self.frame += 1;
    }

    /// Given the frame that last used an image, return it if its completion
    /// has not been established by the current frame's slot wait.
    ///
    /// Waiting on the current slot proves every frame up to
    /// `frame - frames_in_flight` finished, so only younger frames qualify.
    pub fn outstanding(&self, previous: Option<u64>) -> Option<u64> {
        previous.filter(|&p| p < self.frame && p + self.frames_in_flight as u64 > self.frame)
    }
}

/// A frame being recorded, returned by [`FrameScheduler::begin_frame`].
///
/// The render pass is already begun on `command_buffer` with viewport and
/// scissor set. Hand it back to [`FrameScheduler::end_frame`].
#[derive(Debug)]
#[must_use = "a begun frame must be passed to `FrameScheduler::end_frame`"]
pub struct Frame {
    /// Monotonic frame index.
    pub index: u64,
    /// Slot the frame uses.
    pub slot: usize,
    /// Acquired swapchain image.
    pub image_index: u32,
    /// Command buffer in the recording state.
    pub command_buffer: vk::CommandBuffer,
    /// Render area.
    pub extent: vk::Extent2D,
}

/// Drives acquire, record, submit and present over a fixed set of slots.
pub struct FrameScheduler {
    config: FrameConfig,
    surface: Surface,
    swapchain: Swapchain,
    command_pool: CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    slots: Vec<FrameSlot>,
    pacer: FramePacer,
    window_extent: vk::Extent2D,
    stale: bool,
    /// Frame returned by `begin_frame` and not yet ended.
    recording: Option<u64>,
}

impl FrameScheduler {
    /// Create the swapchain, command buffers and per-slot sync objects.
    ///
    /// The scheduler takes ownership of `surface`.
    pub fn new(
        ctx: &DeviceContext,
        surface: Surface,
        extent: vk::Extent2D,
        config: FrameConfig,
    ) -> Result<Self> {
        let device = ctx.device();
        let frames_in_flight = config.frames_in_flight.max(1);

        let swapchain = match Swapchain::new(ctx, &surface, &config.swapchain, extent, None) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                // SAFETY: no swapchain references the surface
                unsafe { surface.destroy() };
                return Err(e);
            }
        };

        // SAFETY: device is valid and the graphics family exists
        let command_pool = match unsafe {
            CommandPool::new(
                device,
                ctx.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        } {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: nothing was submitted
                unsafe {
                    swapchain.destroy(ctx, &surface);
                    surface.destroy();
                }
                return Err(e);
            }
        };

        let mut scheduler = Self {
            config,
            surface,
            swapchain,
            command_pool,
            command_buffers: Vec::new(),
            slots: Vec::with_capacity(frames_in_flight),
            pacer: FramePacer::new(frames_in_flight),
            window_extent: extent,
            stale: false,
            recording: None,
        };

        // SAFETY: device is valid
        let setup = unsafe { scheduler.allocate_frame_resources(device, frames_in_flight) };

        match setup {
            Ok(()) => {
                tracing::info!("Frame scheduler ready ({frames_in_flight} frames in flight)");
                Ok(scheduler)
            }
            Err(e) => {
                scheduler.destroy(ctx);
                Err(e)
            }
        }
    }

    unsafe fn allocate_frame_resources(
        &mut self,
        device: &ash::Device,
        frames_in_flight: usize,
    ) -> Result<()> {
        // SAFETY: caller guarantees the device is valid
        unsafe {
            self.command_buffers = self
                .command_pool
                .allocate(device, frames_in_flight as u32)?;
            for _ in 0..frames_in_flight {
                self.slots.push(FrameSlot::new(device)?);
            }
        }
        Ok(())
    }

    /// Wait for the current slot, acquire an image and start recording.
    ///
    /// Returns `None` while the window has no area or the swapchain stays
    /// out of date; the next call rebuilds it. Fails with
    /// [`GpuError::InvalidState`] while the previous frame has not been ended.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame(&mut self, ctx: &DeviceContext) -> Result<Option<Frame>> {
        if let Some(open) = self.recording {
            return Err(GpuError::InvalidState(format!(
                "frame {open} has not been ended"
            )));
        }

        if self.stale {
            self.rebuild(ctx)?;
            if self.stale {
                return Ok(None);
            }
        }

        let device = ctx.device();
        let timeout = self.config.fence_timeout;
        let slot = self.pacer.slot();

        // SAFETY: the slot fence belongs to this device
        unsafe { self.slots[slot].wait(device, timeout) }?;

        let image_ready = self.slots[slot].image_ready;
        let acquired = retry_stale(
            self,
            MAX_ACQUIRE_ATTEMPTS,
            |scheduler| {
                // SAFETY: image_ready has no pending signal; the previous use
                // of this slot completed
                unsafe {
                    scheduler.swapchain.acquire_next_image(
                        &scheduler.surface,
                        image_ready,
                        timeout_ns(timeout),
                    )
                }
            },
            |scheduler| {
                tracing::warn!("Swapchain out of date on acquire, recreating");
                scheduler.rebuild(ctx)?;
                Ok(!scheduler.stale)
            },
        )?;
        let Some((image_index, suboptimal)) = acquired else {
            if !self.stale {
                tracing::warn!(
                    "Swapchain still out of date after {MAX_ACQUIRE_ATTEMPTS} rebuilds, skipping frame"
                );
                self.stale = true;
            }
            return Ok(None);
        };

        if suboptimal {
            tracing::debug!("Swapchain suboptimal on acquire");
        }

        let frame = self.pacer.frame();
        let previous = self.swapchain.tags.claim(image_index as usize, frame)?;
        if let Some(previous) = self.pacer.outstanding(previous) {
            tracing::trace!("Image {image_index} still used by frame {previous}");
            let previous_slot = self.pacer.slot_of(previous);
            // SAFETY: the fence belongs to this device
            unsafe { self.slots[previous_slot].wait(device, timeout) }?;
        }

        let cmd = self.command_buffers[slot];
        let extent = self.swapchain.extent();

        // SAFETY: the slot fence was waited on so the command buffer is idle
        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            self.begin_render_pass(device, cmd, image_index as usize, extent);
        }

        self.recording = Some(frame);
        Ok(Some(Frame {
            index: frame,
            slot,
            image_index,
            command_buffer: cmd,
            extent,
        }))
    }

    unsafe fn begin_render_pass(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image_index: usize,
        extent: vk::Extent2D,
    ) {
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.config.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.swapchain.render_pass())
            .framebuffer(self.swapchain.framebuffers()[image_index])
            .render_area(render_area)
            .clear_values(&clear_values);

        // Negative height flips Y so +Y is up in clip space
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };

        // SAFETY: caller guarantees cmd is recording
        unsafe {
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
        }
    }

    /// Finish recording, submit and present `frame`.
    ///
    /// A stale swapchain at present time is only logged; the next acquire
    /// picks it up.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame(&mut self, ctx: &DeviceContext, frame: Frame) -> Result<()> {
        if frame.index != self.pacer.frame() {
            return Err(GpuError::InvalidState(format!(
                "frame {} ended while frame {} is current",
                frame.index,
                self.pacer.frame()
            )));
        }

        self.recording = None;

        let device = ctx.device();
        let slot = &self.slots[frame.slot];
        let cmd = frame.command_buffer;

        // SAFETY: cmd is recording inside the render pass begun by begin_frame
        unsafe {
            device.cmd_end_render_pass(cmd);
            end_command_buffer(device, cmd)?;
            reset_fence(device, slot.frame_done)?;
            submit_command_buffers(
                device,
                ctx.graphics_queue(),
                &[cmd],
                &[slot.image_ready],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[slot.submit_done],
                slot.frame_done,
            )?;
        }

        // SAFETY: image_index was acquired and submit_done is signaled by the submission
        match unsafe {
            self.swapchain.present(
                &self.surface,
                ctx.graphics_queue(),
                frame.image_index,
                &[slot.submit_done],
            )
        } {
            Ok(false) => {}
            Ok(true) => tracing::debug!("Swapchain suboptimal on present"),
            Err(GpuError::SwapchainStale) => {
                tracing::warn!("Swapchain out of date on present");
            }
            Err(e) => return Err(e),
        }

        self.pacer.advance();
        Ok(())
    }

    /// Rebuild the swapchain for a new window size.
    ///
    /// A zero-sized window defers the rebuild until the window has area again.
    pub fn recreate_swapchain(&mut self, ctx: &DeviceContext, extent: vk::Extent2D) -> Result<()> {
        self.window_extent = extent;
        if extent.width == 0 || extent.height == 0 {
            tracing::debug!("Window has no area, deferring swapchain rebuild");
            self.stale = true;
            return Ok(());
        }
        self.rebuild(ctx)
    }

    fn rebuild(&mut self, ctx: &DeviceContext) -> Result<()> {
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            self.stale = true;
            return Ok(());
        }

        if let Err(e) = ctx.wait_idle() {
            self.stale = true;
            return Err(e);
        }

        match Swapchain::new(
            ctx,
            &self.surface,
            &self.config.swapchain,
            self.window_extent,
            Some(&self.swapchain),
        ) {
            Ok(swapchain) => {
                debug_assert!(swapchain.is_consistent());
                let old = std::mem::replace(&mut self.swapchain, swapchain);
                // SAFETY: the device is idle
                unsafe { old.destroy(ctx, &self.surface) };
                self.stale = false;
                Ok(())
            }
            Err(GpuError::SwapchainStale) => {
                tracing::debug!("Surface has no area, deferring swapchain rebuild");
                self.stale = true;
                Ok(())
            }
            Err(e) => {
                // Creation retires the old swapchain even when it fails
                self.stale = true;
                Err(e)
            }
        }
    }

    /// Current swapchain.
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Whether the swapchain must be rebuilt before the next frame.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Render pass every frame records into.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Index of the next frame to begin.
    pub fn frame_index(&self) -> u64 {
        self.pacer.frame()
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Presentation surface.
    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// Wait for outstanding work and destroy everything the scheduler owns,
    /// including the surface.
    pub fn destroy(self, ctx: &DeviceContext) {
        let device = ctx.device();
        if let Err(e) = ctx.wait_idle() {
            tracing::error!("Wait idle before scheduler teardown failed: {e}");
        }

        // SAFETY: the device is idle
        unsafe {
            for slot in &self.slots {
                slot.destroy(device);
            }
            if !self.command_buffers.is_empty() {
                self.command_pool.free(device, &self.command_buffers);
            }
            self.command_pool.destroy(device);
            self.swapchain.destroy(ctx, &self.surface);
            self.surface.destroy();
        }
    }
}

/// Run `op`, calling `recover` after each stale-swapchain error, at most
/// `attempts` times.
///
/// `recover` returns whether there is something to render into again.
/// Returns `None` when it reports there is not, or when the swapchain is
/// still stale after the last attempt.
fn retry_stale<S, T>(
    state: &mut S,
    attempts: u32,
    mut op: impl FnMut(&mut S) -> Result<T>,
    mut recover: impl FnMut(&mut S) -> Result<bool>,
) -> Result<Option<T>> {
    let mut recovered = 0;
    loop {
        match op(state) {
            Ok(value) => return Ok(Some(value)),
            Err(GpuError::SwapchainStale) if recovered < attempts => {
                recovered += 1;
                if !recover(state)? {
                    return Ok(None);
                }
            }
            Err(GpuError::SwapchainStale) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = FrameConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert!(!config.swapchain.vsync);
        assert_eq!(config.swapchain.depth_format, vk::Format::D32_SFLOAT);
        assert_eq!(config.clear_color, [0.1, 0.0, 0.1, 1.0]);
        assert!(config.fence_timeout.is_none());

        let config = config.vsync(true).frames_in_flight(0);
        assert!(config.swapchain.vsync);
        assert_eq!(config.frames_in_flight, 1);
    }

    #[test]
    fn slots_cycle() {
        let mut pacer = FramePacer::new(3);
        let slots: Vec<_> = (0..7)
            .map(|_| {
                let slot = pacer.slot();
                pacer.advance();
                slot
            })
            .collect();
        assert_eq!(slots, [0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(pacer.frame(), 7);
    }

    #[test]
    fn only_recent_frames_are_outstanding() {
        let mut pacer = FramePacer::new(3);
        for _ in 0..10 {
            pacer.advance();
        }
        assert_eq!(pacer.outstanding(None), None);
        assert_eq!(pacer.outstanding(Some(7)), None);
        assert_eq!(pacer.outstanding(Some(8)), Some(8));
        assert_eq!(pacer.outstanding(Some(9)), Some(9));
        assert_eq!(pacer.outstanding(Some(10)), None);
    }

    /// In-order queue model: waiting on a frame completes it and everything
    /// submitted before it.
    struct SimulatedQueue {
        completed: u64,
    }

    impl SimulatedQueue {
        fn wait(&mut self, frame: u64) {
            self.completed = self.completed.max(frame + 1);
        }

        fn is_complete(&self, frame: u64) -> bool {
            frame < self.completed
        }
    }

    /// Deterministic acquire order that is not round-robin.
    fn acquire_order(images: usize, frames: u64) -> Vec<usize> {
        let mut state = 0x2545_f491_u64;
        (0..frames)
            .map(|_| {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                ((state >> 33) % images as u64) as usize
            })
            .collect()
    }

    #[test]
    fn slot_and_image_waits_bound_in_flight_work() {
        for frames_in_flight in 1..=4 {
            for images in 2..=5 {
                let mut pacer = FramePacer::new(frames_in_flight);
                let mut tags = crate::swapchain::ImageTags::new(images);
                let mut queue = SimulatedQueue { completed: 0 };
                let mut slot_frames: Vec<Option<u64>> = vec![None; frames_in_flight];

                for image in acquire_order(images, 200) {
                    let frame = pacer.frame();
                    let slot = pacer.slot();

                    if let Some(last) = slot_frames[slot] {
                        queue.wait(last);
                    }
                    // Slot reuse only after its previous frame finished
                    assert!(slot_frames[slot].map_or(true, |last| queue.is_complete(last)));

                    let previous = tags.claim(image, frame).unwrap();
                    if let Some(previous) = pacer.outstanding(previous) {
                        queue.wait(previous);
                    }
                    // No image is written while an earlier frame may still use it
                    assert!(previous.map_or(true, |p| queue.is_complete(p)));

                    // Never more than frames_in_flight frames outstanding
                    assert!(frame + 1 - queue.completed <= frames_in_flight as u64);

                    slot_frames[slot] = Some(frame);
                    pacer.advance();
                }
            }
        }
    }

    /// Acquire and rebuild results played back in order.
    struct StaleSurface {
        acquires: Vec<Result<u32>>,
        rebuilds: u32,
        has_area: bool,
    }

    fn acquire(surface: &mut StaleSurface) -> Result<u32> {
        surface.acquires.remove(0)
    }

    fn rebuild(surface: &mut StaleSurface) -> Result<bool> {
        surface.rebuilds += 1;
        Ok(surface.has_area)
    }

    fn stale_surface(acquires: Vec<Result<u32>>) -> StaleSurface {
        StaleSurface {
            acquires,
            rebuilds: 0,
            has_area: true,
        }
    }

    #[test]
    fn stale_acquire_recovers_within_attempts() {
        let mut surface = stale_surface(vec![
            Err(GpuError::SwapchainStale),
            Err(GpuError::SwapchainStale),
            Ok(2),
        ]);
        let acquired = retry_stale(&mut surface, 3, acquire, rebuild).unwrap();
        assert_eq!(acquired, Some(2));
        assert_eq!(surface.rebuilds, 2);
    }

    #[test]
    fn persistent_staleness_skips_the_frame() {
        let mut surface = stale_surface((0..4).map(|_| Err(GpuError::SwapchainStale)).collect());
        let acquired = retry_stale(&mut surface, 3, acquire, rebuild).unwrap();
        assert_eq!(acquired, None);
        assert_eq!(surface.rebuilds, 3);
        assert!(surface.acquires.is_empty());
    }

    #[test]
    fn rebuild_without_area_skips_the_frame() {
        let mut surface = stale_surface(vec![Err(GpuError::SwapchainStale), Ok(0)]);
        surface.has_area = false;
        let acquired = retry_stale(&mut surface, 3, acquire, rebuild).unwrap();
        assert_eq!(acquired, None);
        assert_eq!(surface.rebuilds, 1);
        assert_eq!(surface.acquires.len(), 1);
    }

    #[test]
    fn other_acquire_errors_propagate() {
        let mut surface = stale_surface(vec![
            Err(GpuError::SwapchainStale),
            Err(GpuError::DeviceLost),
        ]);
        let result = retry_stale(&mut surface, 3, acquire, rebuild);
        assert!(matches!(result, Err(GpuError::DeviceLost)));
        assert_eq!(surface.rebuilds, 1);
    }
}

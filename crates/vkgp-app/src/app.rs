//! `GpApp` trait definition.

use crate::context::AppContext;
use vkgp_gpu::Frame;
use winit::event::WindowEvent;

/// Trait for vkgp applications.
///
/// The framework owns the window, the device context and the frame
/// scheduler. Implementors own everything they create against the context
/// and release it in [`GpApp::cleanup`].
pub trait GpApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window, device context and frame scheduler
    /// have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before a swapchain image is acquired. Compute
    /// work that feeds the frame belongs here.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &mut AppContext, dt: f32) -> anyhow::Result<()>;

    /// Record draw commands.
    ///
    /// The render pass is already begun on `frame.command_buffer` with the
    /// viewport and scissor set. The framework ends it, submits and presents.
    fn render(&mut self, ctx: &AppContext, frame: &Frame) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// Called after the swapchain was recreated for the new size.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, ctx: &AppContext, event: &WindowEvent) -> bool {
        false
    }

    /// Release resources before shutdown.
    ///
    /// The device is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}

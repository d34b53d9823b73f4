//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use raw_window_handle::HasDisplayHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vkgp_gpu::{DeviceContextBuilder, FrameConfig, GpuError};
use vkgp_render::RenderError;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::GpApp;
use crate::context::AppContext;

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Swapchain, frames in flight and clear color.
    pub frames: FrameConfig,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "vkgp".to_string(),
            width: 800,
            height: 600,
            target_fps: None,
            frames: FrameConfig::default(),
            validation: cfg!(debug_assertions),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.frames = self.frames.vsync(vsync);
        self
    }

    /// Set the number of frames recorded ahead of the GPU.
    pub fn with_frames_in_flight(mut self, count: usize) -> Self {
        self.frames = self.frames.frames_in_flight(count);
        self
    }

    /// Set the color the frame is cleared to.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.frames = self.frames.clear_color(color);
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Install the `tracing` subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Calling it more than once is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Run a [`GpApp`] with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the
/// event loop until the window is closed. Initialization failures are
/// returned after the loop exits.
pub fn run_app<A: GpApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        error: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Whether the loop can keep going after `error`, i.e. the swapchain only
/// needs rebuilding.
fn is_recoverable(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| match cause.downcast_ref::<RenderError>() {
        Some(RenderError::Gpu(gpu)) => gpu.is_recoverable(),
        _ => cause
            .downcast_ref::<GpuError>()
            .is_some_and(GpuError::is_recoverable),
    })
}

struct AppRunner<A: GpApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    error: Option<anyhow::Error>,
}

struct AppState<A: GpApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: GpApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&state.ctx, &event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(()) => {}
                    Err(e) if is_recoverable(&e) => warn!("Skipped frame: {e:#}"),
                    Err(e) => {
                        error!("Render error: {e:#}");
                        self.fail(event_loop, e);
                    }
                }
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.handle_resize(size) {
                    Ok(()) => {}
                    Err(e) if is_recoverable(&e) => warn!("Resize deferred: {e:#}"),
                    Err(e) => {
                        error!("Resize error: {e:#}");
                        self.fail(event_loop, e);
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.take() {
            state.shutdown();
        }
    }
}

impl<A: GpApp + 'static> AppRunner<A> {
    /// Record a fatal error, tear the application down and leave the loop.
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        self.error = Some(error);
        if let Some(state) = self.state.take() {
            state.shutdown();
        }
        event_loop.exit();
    }

    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = DeviceContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .with_display(event_loop.display_handle()?.as_raw())?
            .build()?;

        // SAFETY: the window is stored in the context and dropped after it
        let mut ctx = unsafe { AppContext::new(window, gpu, self.config.frames.clone())? };

        let app = match A::init(&mut ctx) {
            Ok(app) => app,
            Err(e) => {
                ctx.destroy();
                return Err(e);
            }
        };

        Ok(AppState {
            ctx,
            app,
            target_frame_time: self.config.target_frame_time(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

impl<A: GpApp> AppState<A> {
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let dt = frame_start
            .duration_since(self.ctx.last_frame_time)
            .as_secs_f32();
        self.ctx.last_frame_time = frame_start;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&mut self.ctx, dt)?;

        let Some(frame) = self.ctx.frames.begin_frame(&self.ctx.gpu)? else {
            // Nothing to draw into while minimized
            thread::sleep(Duration::from_millis(10));
            return Ok(());
        };

        // The frame is closed even when recording fails so its slot is reusable
        let recorded = self.app.render(&self.ctx, &frame);
        self.ctx.frames.end_frame(&self.ctx.gpu, frame)?;
        recorded?;

        self.ctx.frame_count += 1;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        self.ctx.frames.recreate_swapchain(&self.ctx.gpu, extent)?;

        if size.width > 0 && size.height > 0 {
            self.app.on_resize(&mut self.ctx, size.width, size.height)?;
            info!("Resized to {}x{}", size.width, size.height);
        }
        Ok(())
    }

    fn shutdown(mut self) {
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        self.app.cleanup(&mut self.ctx);
        self.ctx.destroy();

        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders_reach_frame_config() {
        let config = AppConfig::new("test")
            .with_size(640, 480)
            .with_vsync(true)
            .with_frames_in_flight(2)
            .with_clear_color([0.0, 0.0, 0.0, 1.0]);

        assert_eq!(config.title, "test");
        assert_eq!((config.width, config.height), (640, 480));
        assert!(config.frames.swapchain.vsync);
        assert_eq!(config.frames.frames_in_flight, 2);
        assert_eq!(config.frames.clear_color, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn target_fps_sets_frame_time() {
        assert_eq!(AppConfig::default().target_frame_time(), None);
        assert_eq!(
            AppConfig::default().with_target_fps(50).target_frame_time(),
            Some(Duration::from_millis(20))
        );
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
    }

    #[test]
    fn only_stale_swapchains_keep_the_loop_running() {
        assert!(is_recoverable(&GpuError::SwapchainStale.into()));
        assert!(is_recoverable(&RenderError::Gpu(GpuError::SwapchainStale).into()));
        assert!(is_recoverable(
            &anyhow::Error::from(GpuError::SwapchainStale).context("recording frame")
        ));

        assert!(!is_recoverable(&GpuError::DeviceLost.into()));
        assert!(!is_recoverable(&RenderError::Gpu(GpuError::OutOfDeviceMemory).into()));
        assert!(!is_recoverable(&GpuError::MissingCapability("presentation".into()).into()));
        assert!(!is_recoverable(&anyhow::anyhow!("out of date")));
    }
}

//! Application framework for vkgp.
//!
//! This crate provides a trait-based application framework that handles:
//! - Window creation and the winit event loop
//! - Device context, frame scheduler and compute queue setup
//! - Swapchain recreation on resize
//! - Ordered teardown on exit
//!
//! # Example
//!
//! ```no_run
//! use vkgp_app::{run_app, AppConfig, AppContext, Frame, GpApp};
//!
//! struct MyApp;
//!
//! impl GpApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _dt: f32) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn render(&mut self, _ctx: &AppContext, _frame: &Frame) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod runner;

pub use app::GpApp;
pub use context::AppContext;
pub use runner::{init_logging, run_app, AppConfig};

pub use vkgp_gpu::{ComputeContext, DeviceContext, Frame, FrameScheduler};
pub use winit::event::WindowEvent;

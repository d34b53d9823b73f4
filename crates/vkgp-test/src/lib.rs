//! Test harness for vkgp.
//!
//! Provides a headless device context for tests that need a GPU, and CPU
//! references for the shipped kernels.

pub mod harness;

pub use harness::{wiggle_reference, HeadlessGpu};

use thiserror::Error;
use vkgp_gpu::GpuError;
use vkgp_render::RenderError;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TestError>;

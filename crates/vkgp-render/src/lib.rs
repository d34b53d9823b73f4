//! Mesh rendering for vkgp.
//!
//! This crate provides:
//! - Validated mesh data and its upload to GPU buffers
//! - A Z-up camera and an orbit camera
//! - The mesh graphics pipeline and indexed draws inside a frame
//! - The wiggle vertex displacement kernel

pub mod camera;
pub mod error;
pub mod mesh;
pub mod renderer;
pub mod wiggle;

pub use camera::{Camera, OrbitCamera};
pub use error::{MeshError, RenderError, Result};
pub use mesh::{Color, GpuMesh, MeshData, Vertex};
pub use renderer::{MeshRenderer, Model, PushMatrices};
pub use wiggle::{Wiggle, WiggleArgs};

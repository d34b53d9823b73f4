//! Vulkan device and resource layer for vkgp.
//!
//! This crate provides:
//! - Instance and device creation with explicit queue family selection
//! - Explicit memory type selection and per-resource allocations
//! - Typed host-visible buffers and depth images
//! - Swapchain handling and frame pacing over a fixed number of slots
//! - Synchronous compute kernels with layouts derived from their arguments

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod compute;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use ash::vk;
pub use buffer::{BufferMapping, BufferUsage, GpuBuffer};
pub use capabilities::{DeviceCapabilities, GpuVendor};
pub use compute::{
    group_count, ComputeContext, ComputeKernel, KernelArg, KernelArgs, KernelBuilder,
    KernelLayout, KernelPipeline, Uniform,
};
pub use context::{DeviceContext, DeviceContextBuilder, QueueInfo};
pub use descriptors::{BindingCategory, DescriptorPool, DescriptorSetLayoutBuilder};
pub use error::{GpuError, Result};
pub use frame::{Frame, FrameConfig, FramePacer, FrameScheduler};
pub use image::GpuImage;
pub use instance::DevicePreference;
pub use memory::{find_memory_type, MemoryAllocator, MemoryBlock, MemoryTarget};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig};
pub use shader::{load_spirv, parse_spirv};
pub use surface::Surface;
pub use swapchain::{ImageTags, Swapchain, SwapchainConfig};

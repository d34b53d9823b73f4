//! Device-local images.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::memory::{MemoryBlock, MemoryTarget};
use ash::vk;

/// A 2D image with one view and its own device-local memory.
pub struct GpuImage {
    image: vk::Image,
    view: vk::ImageView,
    memory: Option<MemoryBlock>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl GpuImage {
    /// Create a depth attachment covering `extent`.
    pub fn depth(ctx: &DeviceContext, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        Self::new(
            ctx,
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
    }

    /// Create an image, bind device-local memory and create a view.
    pub fn new(
        ctx: &DeviceContext,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let device = ctx.device();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: device is valid and image_info is complete
        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(GpuError::creation("image"))?;

        let name = format!("image {format:?} {}x{}", extent.width, extent.height);
        // SAFETY: the image was just created and is unbound
        let memory = match unsafe {
            ctx.memory().allocate_and_bind(
                MemoryTarget::Image(image),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                &name,
            )
        } {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: the image was never used
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        // SAFETY: the image has memory bound
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                // SAFETY: nothing references the image yet
                unsafe {
                    ctx.memory().free(memory);
                    device.destroy_image(image, None);
                }
                return Err(GpuError::creation("image view")(e));
            }
        };

        Ok(Self {
            image,
            view,
            memory: Some(memory),
            format,
            extent,
        })
    }

    /// Raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Image view covering the whole image.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Image format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Destroy the view, then release the memory, then the image.
    ///
    /// # Safety
    /// No pending GPU work or framebuffer may reference the image.
    pub unsafe fn destroy(mut self, ctx: &DeviceContext) {
        if let Some(memory) = self.memory.take() {
            let device = ctx.device();
            // SAFETY: caller guarantees the image is idle
            unsafe {
                device.destroy_image_view(self.view, None);
                ctx.memory().free(memory);
                device.destroy_image(self.image, None);
            }
        }
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if self.memory.is_some() {
            tracing::warn!(
                "GpuImage {:?} {}x{} dropped without destroy",
                self.format,
                self.extent.width,
                self.extent.height
            );
        }
    }
}

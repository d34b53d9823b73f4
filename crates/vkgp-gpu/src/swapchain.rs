//! Swapchain management.
//!
//! A [`Swapchain`] bundles everything that depends on the surface size: the
//! presentable images and their views, a shared depth image, the render pass
//! and one framebuffer per image. It is never resized in place; recreation
//! builds a new value from the old one and then destroys the old one.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::image::GpuImage;
use crate::surface::Surface;
use ash::vk;

/// Present modes in order of preference.
pub const PRESENT_MODE_PREFERENCE: [vk::PresentModeKHR; 6] = [
    vk::PresentModeKHR::IMMEDIATE,
    vk::PresentModeKHR::FIFO,
    vk::PresentModeKHR::FIFO_RELAXED,
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::SHARED_DEMAND_REFRESH,
    vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH,
];

/// Swapchain creation options.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    /// Prefer FIFO presentation over the default order.
    pub vsync: bool,
    /// Format of the depth attachment.
    pub depth_format: vk::Format,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            vsync: false,
            depth_format: vk::Format::D32_SFLOAT,
        }
    }
}

/// In-flight frame tag of every swapchain image. `None` means free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTags {
    tags: Vec<Option<u64>>,
}

impl ImageTags {
    /// Tags for `count` images, all free.
    pub fn new(count: usize) -> Self {
        Self {
            tags: vec![None; count],
        }
    }

    /// Number of images tracked.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether no images are tracked.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Frame that last used `image`.
    pub fn get(&self, image: usize) -> Option<u64> {
        self.tags.get(image).copied().flatten()
    }

    /// Tag `image` with `frame`, returning the frame that used it before.
    pub fn claim(&mut self, image: usize, frame: u64) -> Result<Option<u64>> {
        let len = self.tags.len();
        let tag = self.tags.get_mut(image).ok_or(GpuError::OutOfBounds {
            offset: image,
            end: image + 1,
            len,
        })?;
        Ok(tag.replace(frame))
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    // Prefer SRGB
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// Select the first preferred present mode the surface supports.
///
/// With `vsync` FIFO is tried before the regular order.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    vsync: bool,
) -> Option<vk::PresentModeKHR> {
    vsync
        .then_some(vk::PresentModeKHR::FIFO)
        .into_iter()
        .chain(PRESENT_MODE_PREFERENCE)
        .find(|mode| available.contains(mode))
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more image than the minimum, within the surface limit.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

fn select_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Create the render pass: a cleared colour attachment handed to the
/// presentation engine and a cleared depth attachment that is discarded.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];

    let color_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref))
        .depth_stencil_attachment(&depth_ref);

    // Attachment writes wait for the acquire semaphore and for the previous
    // user of the shared depth image
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(std::slice::from_ref(&dependency));

    // SAFETY: caller guarantees the device is valid
    unsafe { device.create_render_pass(&create_info, None) }
        .map_err(GpuError::creation("render pass"))
}

/// Presentable images plus everything sized to them.
pub struct Swapchain {
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    depth: Option<GpuImage>,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    pub(crate) tags: ImageTags,
}

impl Swapchain {
    /// Create a swapchain for `surface`.
    ///
    /// Passing `previous` lets the presentation engine reuse its resources;
    /// the previous swapchain still has to be destroyed by the caller.
    /// A zero-sized surface fails with [`GpuError::SwapchainStale`].
    pub fn new(
        ctx: &DeviceContext,
        surface: &Surface,
        config: &SwapchainConfig,
        desired_extent: vk::Extent2D,
        previous: Option<&Self>,
    ) -> Result<Self> {
        let support = surface.support(ctx)?;

        let surface_format = select_surface_format(&support.formats)
            .ok_or_else(|| GpuError::MissingCapability("any surface format".into()))?;
        let present_mode = select_present_mode(&support.present_modes, config.vsync)
            .ok_or_else(|| GpuError::MissingCapability("a preferred present mode".into()))?;
        let extent = calculate_extent(&support.capabilities, desired_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SwapchainStale);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(select_image_count(&support.capabilities))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(select_composite_alpha(
                support.capabilities.supported_composite_alpha,
            ))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(previous.map_or(vk::SwapchainKHR::null(), |old| old.handle));

        // SAFETY: surface and device are valid and create_info is complete
        let handle = unsafe { surface.swapchain_loader().create_swapchain(&create_info, None) }
            .map_err(GpuError::creation("swapchain"))?;

        let mut swapchain = Self {
            handle,
            surface_format,
            present_mode,
            extent,
            render_pass: vk::RenderPass::null(),
            depth: None,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            tags: ImageTags::new(0),
        };

        // SAFETY: handle was just created and nothing uses it yet
        if let Err(e) = unsafe { swapchain.build_attachments(ctx, surface, config) } {
            // SAFETY: the partially built swapchain was never submitted
            unsafe { swapchain.destroy(ctx, surface) };
            return Err(e);
        }

        tracing::info!(
            "Swapchain created: {}x{} ({} images, {:?}, {:?})",
            extent.width,
            extent.height,
            swapchain.images.len(),
            surface_format.format,
            present_mode
        );

        Ok(swapchain)
    }

    unsafe fn build_attachments(
        &mut self,
        ctx: &DeviceContext,
        surface: &Surface,
        config: &SwapchainConfig,
    ) -> Result<()> {
        let device = ctx.device();

        // SAFETY: handle is a live swapchain
        self.images = unsafe { surface.swapchain_loader().get_swapchain_images(self.handle) }?;
        self.depth = Some(GpuImage::depth(ctx, self.extent, config.depth_format)?);
        // SAFETY: device is valid
        self.render_pass =
            unsafe { create_render_pass(device, self.surface_format.format, config.depth_format) }?;

        let depth_view = self.depth.as_ref().map_or(vk::ImageView::null(), GpuImage::view);

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            // SAFETY: image belongs to this swapchain
            let view = unsafe { device.create_image_view(&view_info, None) }
                .map_err(GpuError::creation("swapchain image view"))?;
            self.image_views.push(view);
        }

        for &view in &self.image_views {
            let attachments = [view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            // SAFETY: attachments match the render pass
            let framebuffer = unsafe { device.create_framebuffer(&framebuffer_info, None) }
                .map_err(GpuError::creation("framebuffer"))?;
            self.framebuffers.push(framebuffer);
        }

        self.tags = ImageTags::new(self.images.len());
        Ok(())
    }

    /// Raw swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Colour format and space of the images.
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    /// Present mode in use.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Render pass compatible with every framebuffer.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Shared depth attachment.
    pub fn depth(&self) -> Option<&GpuImage> {
        self.depth.as_ref()
    }

    /// Presentable images.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// One view per image.
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// One framebuffer per image.
    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    /// Per-image in-flight frame tags.
    pub fn tags(&self) -> &ImageTags {
        &self.tags
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Whether every per-image collection has one entry per image.
    pub fn is_consistent(&self) -> bool {
        let count = self.images.len();
        count > 0
            && self.image_views.len() == count
            && self.framebuffers.len() == count
            && self.tags.len() == count
    }

    /// Acquire the next image, signalling `semaphore` when it is ready.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    ///
    /// # Safety
    /// `semaphore` must be unsignaled with no pending signal operation.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        surface: &Surface,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        // SAFETY: caller guarantees the semaphore can be signaled
        let result = unsafe {
            surface.swapchain_loader().acquire_next_image(
                self.handle,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok(acquired) => Ok(acquired),
            Err(vk::Result::TIMEOUT) => Err(GpuError::DeviceLost),
            Err(e) => Err(e.into()),
        }
    }

    /// Present an image once `wait_semaphores` are signaled.
    ///
    /// Returns whether the swapchain is suboptimal.
    ///
    /// # Safety
    /// All handles must be valid and `image_index` must have been acquired.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        surface: &Surface,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: caller guarantees the handles are valid
        unsafe { surface.swapchain_loader().queue_present(queue, &present_info) }
            .map_err(GpuError::from)
    }

    /// Destroy the render pass, framebuffers and views, depth image and the
    /// swapchain itself, in that order.
    ///
    /// # Safety
    /// No pending GPU work may use the swapchain or its attachments.
    pub unsafe fn destroy(mut self, ctx: &DeviceContext, surface: &Surface) {
        let device = ctx.device();
        // SAFETY: caller guarantees nothing is in flight; null handles are ignored
        unsafe {
            device.destroy_render_pass(self.render_pass, None);
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            if let Some(depth) = self.depth.take() {
                depth.destroy(ctx);
            }
            surface
                .swapchain_loader()
                .destroy_swapchain(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn srgb_bgra_format_is_preferred() {
        let available = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            select_surface_format(&available).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
    }

    #[test]
    fn first_format_is_the_fallback() {
        let available = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        assert_eq!(
            select_surface_format(&available).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert_eq!(select_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_follows_preference_order() {
        let available = [
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            select_present_mode(&available, false),
            Some(vk::PresentModeKHR::IMMEDIATE)
        );

        let available = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(
            select_present_mode(&available, false),
            Some(vk::PresentModeKHR::FIFO_RELAXED)
        );
    }

    #[test]
    fn vsync_puts_fifo_first() {
        let available = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&available, true),
            Some(vk::PresentModeKHR::FIFO)
        );

        let available = [vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            select_present_mode(&available, true),
            Some(vk::PresentModeKHR::MAILBOX)
        );
    }

    #[test]
    fn unknown_present_modes_fail() {
        assert_eq!(select_present_mode(&[], false), None);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::from_raw(1_000_361_000)], true),
            None
        );
    }

    #[test]
    fn current_extent_wins() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = calculate_extent(
            &caps,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn undefined_extent_clamps_desired() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = calculate_extent(
            &caps,
            vk::Extent2D {
                width: 1920,
                height: 0,
            },
        );
        assert_eq!((extent.width, extent.height), (1024, 1));
    }

    #[test]
    fn image_count_respects_limits() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(select_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(select_image_count(&caps), 2);
    }

    #[test]
    fn composite_alpha_prefers_opaque() {
        assert_eq!(
            select_composite_alpha(
                vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT
            ),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
        assert_eq!(
            select_composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn image_tags_start_free_and_remember_last_frame() {
        let mut tags = ImageTags::new(3);
        assert_eq!(tags.len(), 3);
        assert!((0..3).all(|i| tags.get(i).is_none()));

        assert_eq!(tags.claim(1, 7).unwrap(), None);
        assert_eq!(tags.claim(1, 9).unwrap(), Some(7));
        assert_eq!(tags.get(1), Some(9));
        assert!(tags.claim(3, 10).is_err());
    }
}

//! Window surfaces.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Surface context for windowed rendering.
///
/// Owns the Vulkan surface together with the surface and swapchain extension
/// loaders.
pub struct Surface {
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// Fails with [`GpuError::MissingCapability`] if the graphics queue family
    /// cannot present to it.
    ///
    /// # Safety
    /// The window must outlive the surface.
    pub unsafe fn from_window<W>(ctx: &DeviceContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        // SAFETY: caller guarantees the window outlives the surface
        let surface = unsafe {
            ash_window::create_surface(
                ctx.entry(),
                ctx.instance(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        // SAFETY: the surface was just created on this instance
        unsafe { Self::from_raw(ctx, surface) }
    }

    /// Create a surface that is not backed by a window.
    ///
    /// The context must be built with
    /// [`DeviceContextBuilder::with_headless_surface`](crate::DeviceContextBuilder::with_headless_surface).
    pub fn headless(ctx: &DeviceContext) -> Result<Self> {
        let loader = ash::ext::headless_surface::Instance::new(ctx.entry(), ctx.instance());
        let create_info = vk::HeadlessSurfaceCreateInfoEXT::default();

        // SAFETY: the instance is valid and has the extension enabled
        let surface = unsafe { loader.create_headless_surface(&create_info, None) }
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        // SAFETY: the surface was just created on this instance
        unsafe { Self::from_raw(ctx, surface) }
    }

    /// Take ownership of `surface` and check that the graphics queue family
    /// can present to it. The surface is destroyed on failure.
    ///
    /// # Safety
    /// `surface` must belong to the context's instance and be unused.
    unsafe fn from_raw(ctx: &DeviceContext, surface: vk::SurfaceKHR) -> Result<Self> {
        let surface_loader = ash::khr::surface::Instance::new(ctx.entry(), ctx.instance());
        let swapchain_loader = ash::khr::swapchain::Device::new(ctx.instance(), ctx.device());

        // SAFETY: surface and physical device are valid
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                ctx.physical_device(),
                ctx.graphics_queue_family(),
                surface,
            )
        };
        if !matches!(supported, Ok(true)) {
            // SAFETY: nothing references the surface yet
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(GpuError::MissingCapability(format!(
                "presentation from queue family {}",
                ctx.graphics_queue_family()
            )));
        }

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
        })
    }

    /// Raw surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Swapchain extension loader.
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Query surface capabilities, formats and present modes.
    pub fn support(&self, ctx: &DeviceContext) -> Result<SurfaceSupport> {
        let physical_device = ctx.physical_device();
        // SAFETY: surface and physical device are valid
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain created from this surface may still exist.
    pub unsafe fn destroy(self) {
        // SAFETY: caller guarantees the surface is unused
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

/// Surface capabilities query result.
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

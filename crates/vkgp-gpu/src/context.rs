//! Device context: instance, physical and logical device, queues and memory.

use crate::capabilities::DeviceCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{
    create_instance, select_physical_device, DebugMessenger, DevicePreference, VALIDATION_LAYER,
};
use crate::memory::MemoryAllocator;
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::sync::Arc;

/// A queue and the family it was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub family: u32,
    pub queue: vk::Queue,
}

/// Owns the Vulkan instance and logical device.
///
/// Every buffer, image, swapchain and kernel created against a context must
/// be destroyed before the context is dropped.
pub struct DeviceContext {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: DeviceCapabilities,
    memory: MemoryAllocator,
    graphics: QueueInfo,
    compute: Option<QueueInfo>,
}

impl DeviceContext {
    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get device capabilities.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Get the memory allocator.
    pub fn memory(&self) -> &MemoryAllocator {
        &self.memory
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics.queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics.family
    }

    /// Get the compute queue, if one was requested.
    pub fn compute(&self) -> Result<QueueInfo> {
        self.compute.ok_or(GpuError::NoComputeQueue)
    }

    /// Whether graphics and compute run on distinct queue families.
    pub fn has_separate_compute_family(&self) -> bool {
        self.compute
            .is_some_and(|compute| compute.family != self.graphics.family)
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: device is valid for the lifetime of self
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // SAFETY: all handles are owned by self and destroyed exactly once,
        // dependants before the device, the device before the instance
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!("Wait idle before device teardown failed: {e}");
            }

            self.memory.release_leaked();

            self.device.destroy_device(None);
            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a device context.
pub struct DeviceContextBuilder {
    app_name: String,
    enable_validation: bool,
    layers: Vec<&'static CStr>,
    instance_extensions: Vec<&'static CStr>,
    device_extensions: Vec<&'static CStr>,
    require_compute: bool,
    preference: DevicePreference,
}

impl Default for DeviceContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "vkgp".to_string(),
            enable_validation: cfg!(debug_assertions),
            layers: Vec::new(),
            instance_extensions: Vec::new(),
            device_extensions: vec![ash::khr::swapchain::NAME, ash::khr::maintenance1::NAME],
            require_compute: true,
            preference: DevicePreference::Discrete,
        }
    }
}

impl DeviceContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder for a context without presentation support.
    pub fn headless() -> Self {
        Self {
            device_extensions: Vec::new(),
            ..Self::default()
        }
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Require the Khronos validation layer and route its output to `tracing`.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Require an additional instance layer.
    pub fn layer(mut self, name: &'static CStr) -> Self {
        self.layers.push(name);
        self
    }

    /// Require an additional instance extension.
    pub fn instance_extension(mut self, name: &'static CStr) -> Self {
        self.instance_extensions.push(name);
        self
    }

    /// Require the extensions for presenting to a surface that has no
    /// window (`VK_EXT_headless_surface`).
    pub fn with_headless_surface(mut self) -> Self {
        self.instance_extensions
            .extend([ash::khr::surface::NAME, ash::ext::headless_surface::NAME]);
        for ext in [ash::khr::swapchain::NAME, ash::khr::maintenance1::NAME] {
            if !self.device_extensions.contains(&ext) {
                self.device_extensions.push(ext);
            }
        }
        self
    }

    /// Require an additional device extension.
    pub fn device_extension(mut self, name: &'static CStr) -> Self {
        self.device_extensions.push(name);
        self
    }

    /// Require the instance extensions needed to present to windows on
    /// `display`.
    pub fn with_display(mut self, display: RawDisplayHandle) -> Result<Self> {
        let extensions = ash_window::enumerate_required_extensions(display)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        for &ext in extensions {
            // SAFETY: ash-window returns pointers to static NUL-terminated names
            self.instance_extensions.push(unsafe { CStr::from_ptr(ext) });
        }
        Ok(self)
    }

    /// Whether a compute queue is required.
    pub fn compute(mut self, require: bool) -> Self {
        self.require_compute = require;
        self
    }

    /// How to pick among suitable devices.
    pub fn prefer(mut self, preference: DevicePreference) -> Self {
        self.preference = preference;
        self
    }

    /// Build the device context.
    pub fn build(self) -> Result<DeviceContext> {
        // SAFETY: loading the library has no preconditions beyond it being a
        // well-behaved Vulkan loader
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let mut layers = self.layers.clone();
        if self.enable_validation {
            layers.push(VALIDATION_LAYER);
        }
        dedup(&mut layers);
        let mut instance_extensions = self.instance_extensions.clone();
        dedup(&mut instance_extensions);
        let mut device_extensions = self.device_extensions.clone();
        dedup(&mut device_extensions);

        // SAFETY: entry was just loaded
        let (instance, debug_messenger) = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                &layers,
                &instance_extensions,
                self.enable_validation,
            )
        }?;

        // From here on the instance must be torn down on failure
        // SAFETY: instance is valid
        match unsafe { self.finish(&instance, &device_extensions) } {
            Ok((physical_device, capabilities, device, graphics, compute)) => {
                let device = Arc::new(device);
                // SAFETY: instance and physical device are valid
                let memory_properties =
                    unsafe { instance.get_physical_device_memory_properties(physical_device) };
                let memory = MemoryAllocator::new(Arc::clone(&device), memory_properties);

                Ok(DeviceContext {
                    entry,
                    instance,
                    debug_messenger,
                    physical_device,
                    device,
                    capabilities,
                    memory,
                    graphics,
                    compute,
                })
            }
            Err(e) => {
                // SAFETY: nothing else was created from the instance
                unsafe {
                    if let Some(messenger) = debug_messenger {
                        messenger.destroy();
                    }
                    instance.destroy_instance(None);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    unsafe fn finish(
        &self,
        instance: &ash::Instance,
        device_extensions: &[&CStr],
    ) -> Result<(
        vk::PhysicalDevice,
        DeviceCapabilities,
        ash::Device,
        QueueInfo,
        Option<QueueInfo>,
    )> {
        // SAFETY: caller guarantees the instance is valid
        let (physical_device, capabilities) =
            unsafe { select_physical_device(instance, device_extensions, self.preference) }?;

        tracing::info!("Selected GPU: {}", capabilities.summary());

        // SAFETY: physical device came from this instance
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let (graphics_family, compute_family) =
            select_queue_families(&families, self.require_compute)?;

        tracing::debug!(
            "Queue families: graphics {graphics_family}, compute {:?}",
            compute_family
        );

        // SAFETY: families were validated against this physical device
        let device = unsafe {
            create_device(
                instance,
                physical_device,
                graphics_family,
                compute_family,
                device_extensions,
            )
        }?;

        // SAFETY: one queue was created for each family
        let (graphics, compute) = unsafe {
            (
                QueueInfo {
                    family: graphics_family,
                    queue: device.get_device_queue(graphics_family, 0),
                },
                compute_family.map(|family| QueueInfo {
                    family,
                    queue: device.get_device_queue(family, 0),
                }),
            )
        };

        Ok((physical_device, capabilities, device, graphics, compute))
    }
}

fn dedup(names: &mut Vec<&'static CStr>) {
    let mut seen = BTreeSet::new();
    names.retain(|name| seen.insert(*name));
}

/// Pick the graphics family and, if requested, a compute family.
///
/// Compute shares the graphics family when that family supports compute, so
/// buffers used by both stay on one family.
fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    require_compute: bool,
) -> Result<(u32, Option<u32>)> {
    let supports = |flags: vk::QueueFlags| {
        families
            .iter()
            .position(|family| family.queue_count > 0 && family.queue_flags.contains(flags))
            .map(|index| index as u32)
    };

    let graphics = supports(vk::QueueFlags::GRAPHICS).ok_or(GpuError::NoGraphicsQueue)?;

    if !require_compute {
        return Ok((graphics, None));
    }

    let compute = if families[graphics as usize]
        .queue_flags
        .contains(vk::QueueFlags::COMPUTE)
    {
        graphics
    } else {
        supports(vk::QueueFlags::COMPUTE).ok_or(GpuError::NoComputeQueue)?
    };

    Ok((graphics, Some(compute)))
}

/// Create the logical device with one queue per distinct family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    compute_family: Option<u32>,
    extensions: &[&CStr],
) -> Result<ash::Device> {
    let unique_families: BTreeSet<u32> =
        std::iter::once(graphics_family).chain(compute_family).collect();

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names: Vec<_> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    // SAFETY: caller guarantees the instance and physical device are valid
    unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(GpuError::creation("logical device"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn compute_shares_graphics_family_when_possible() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(select_queue_families(&families, true).unwrap(), (1, Some(1)));
    }

    #[test]
    fn compute_falls_back_to_dedicated_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_families(&families, true).unwrap(), (0, Some(1)));
        assert_eq!(select_queue_families(&families, false).unwrap(), (0, None));
    }

    #[test]
    fn missing_families_are_reported() {
        let compute_only = [family(vk::QueueFlags::COMPUTE)];
        assert!(matches!(
            select_queue_families(&compute_only, true),
            Err(GpuError::NoGraphicsQueue)
        ));

        let graphics_only = [family(vk::QueueFlags::GRAPHICS)];
        assert!(matches!(
            select_queue_families(&graphics_only, true),
            Err(GpuError::NoComputeQueue)
        ));
    }

    #[test]
    fn empty_families_are_ignored() {
        let families = [
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                queue_count: 0,
                ..Default::default()
            },
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(select_queue_families(&families, true).unwrap(), (1, Some(1)));
    }

    #[test]
    fn builder_deduplicates_names() {
        let mut names = vec![
            ash::khr::swapchain::NAME,
            ash::khr::maintenance1::NAME,
            ash::khr::swapchain::NAME,
        ];
        dedup(&mut names);
        assert_eq!(
            names,
            vec![ash::khr::swapchain::NAME, ash::khr::maintenance1::NAME]
        );
    }

    #[test]
    fn headless_builder_drops_presentation_extensions() {
        let builder = DeviceContextBuilder::headless();
        assert!(builder.device_extensions.is_empty());
        assert!(builder.require_compute);
    }

    #[test]
    fn headless_surface_restores_presentation_extensions() {
        let builder = DeviceContextBuilder::headless().with_headless_surface();
        assert_eq!(
            builder.instance_extensions,
            vec![ash::khr::surface::NAME, ash::ext::headless_surface::NAME]
        );
        assert_eq!(
            builder.device_extensions,
            vec![ash::khr::swapchain::NAME, ash::khr::maintenance1::NAME]
        );

        let windowed = DeviceContextBuilder::new().with_headless_surface();
        assert_eq!(windowed.device_extensions.len(), 2);
    }
}

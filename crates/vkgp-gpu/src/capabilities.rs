//! Physical device capability queries.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Capabilities of one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Device class (discrete, integrated, ...)
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum compute workgroup count per dimension
    pub max_compute_workgroup_count: [u32; 3],
    /// Maximum compute workgroup size
    pub max_compute_workgroup_size: [u32; 3],
    /// Maximum compute workgroup invocations
    pub max_compute_workgroup_invocations: u32,
    /// Available device extensions
    pub available_extensions: HashSet<String>,
}

impl DeviceCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // SAFETY: caller guarantees both handles are valid
        let (properties, memory_properties, extensions) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
                instance
                    .enumerate_device_extension_properties(physical_device)
                    .unwrap_or_default(),
            )
        };

        let available_extensions = extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .filter_map(|name| name.to_str().ok().map(String::from))
            .collect();

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            max_compute_workgroup_count: properties.limits.max_compute_work_group_count,
            max_compute_workgroup_size: properties.limits.max_compute_work_group_size,
            max_compute_workgroup_invocations: properties.limits.max_compute_work_group_invocations,
            available_extensions,
        }
    }

    /// Whether this is a discrete GPU.
    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    /// Names of `required` extensions this device does not expose.
    pub fn missing_extensions(&self, required: &[&CStr]) -> Vec<String> {
        required
            .iter()
            .map(|name| name.to_string_lossy())
            .filter(|name| !self.available_extensions.contains(name.as_ref()))
            .map(|name| name.into_owned())
            .collect()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(extensions: &[&str]) -> DeviceCapabilities {
        DeviceCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_1,
            driver_version: 0,
            device_local_memory_mb: 0,
            max_compute_workgroup_count: [65535; 3],
            max_compute_workgroup_size: [1024, 1024, 64],
            max_compute_workgroup_invocations: 1024,
            available_extensions: extensions.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn missing_extensions_are_named() {
        let caps = capabilities(&["VK_KHR_swapchain"]);
        assert!(caps
            .missing_extensions(&[ash::khr::swapchain::NAME])
            .is_empty());
        assert_eq!(
            caps.missing_extensions(&[ash::khr::swapchain::NAME, ash::khr::maintenance1::NAME]),
            vec!["VK_KHR_maintenance1".to_string()]
        );
    }
}

//! Vulkan instance creation and physical device selection.

use crate::capabilities::DeviceCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_char, c_void, CStr, CString};

/// Khronos validation layer.
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// How a physical device is picked among those exposing every required
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// The first discrete GPU in enumeration order.
    #[default]
    Discrete,
    /// The highest scoring device of any class.
    AnySuitable,
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the loader passes valid callback data for the duration of the call
    let message = unsafe { (*p_callback_data).message_as_c_str() }
        .map_or_else(|| "<no message>".into(), CStr::to_string_lossy);

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "general",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "other",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "vkgp::validation", "[{kind}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(target: "vkgp::validation", "[{kind}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vkgp::validation", "[{kind}] {message}");
        }
        _ => {
            tracing::error!(target: "vkgp::validation", "[{kind}] {message}");
        }
    }

    vk::FALSE
}

/// Debug messenger forwarding validation output to `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Destroy the messenger.
    ///
    /// # Safety
    /// Must be called before the owning instance is destroyed.
    pub unsafe fn destroy(&self) {
        // SAFETY: caller guarantees the instance is still alive
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback))
}

/// Names in `required` that are absent from `available`.
fn missing_names(required: &[&CStr], available: &[String]) -> Vec<String> {
    required
        .iter()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !available.contains(name))
        .collect()
}

/// Names of the instance layers the loader exposes.
///
/// # Safety
/// The entry must be valid.
pub unsafe fn available_layers(entry: &ash::Entry) -> Result<Vec<String>> {
    // SAFETY: caller guarantees the entry is valid
    let layers = unsafe { entry.enumerate_instance_layer_properties() }?;
    Ok(layers
        .iter()
        .filter_map(|layer| layer.layer_name_as_c_str().ok())
        .map(|name| name.to_string_lossy().into_owned())
        .collect())
}

/// Names of the instance extensions the loader exposes.
///
/// # Safety
/// The entry must be valid.
pub unsafe fn available_instance_extensions(entry: &ash::Entry) -> Result<Vec<String>> {
    // SAFETY: caller guarantees the entry is valid
    let extensions = unsafe { entry.enumerate_instance_extension_properties(None) }?;
    Ok(extensions
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .map(|name| name.to_string_lossy().into_owned())
        .collect())
}

/// Create a Vulkan instance after checking that every required layer and
/// extension is available.
///
/// A debug messenger is attached when `debug` is set and the debug utils
/// extension is present.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    layers: &[&CStr],
    extensions: &[&CStr],
    debug: bool,
) -> Result<(ash::Instance, Option<DebugMessenger>)> {
    // SAFETY: caller guarantees the entry is valid
    let (available_layers, available_extensions) =
        unsafe { (available_layers(entry)?, available_instance_extensions(entry)?) };

    let missing = missing_names(layers, &available_layers);
    if !missing.is_empty() {
        return Err(GpuError::MissingCapability(format!(
            "instance layers {}",
            missing.join(", ")
        )));
    }

    let missing = missing_names(extensions, &available_extensions);
    if !missing.is_empty() {
        return Err(GpuError::MissingCapability(format!(
            "instance extensions {}",
            missing.join(", ")
        )));
    }

    let debug = debug
        && available_extensions
            .iter()
            .any(|name| name.as_bytes() == ash::ext::debug_utils::NAME.to_bytes());
    if !debug {
        tracing::debug!("Debug messenger disabled");
    }

    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidState("application name contains a NUL byte".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"vkgp")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let mut extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();
    if debug {
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    let layer_names: Vec<*const c_char> = layers.iter().map(|layer| layer.as_ptr()).collect();

    let mut messenger_info = debug_messenger_info();
    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);
    if debug {
        create_info = create_info.push_next(&mut messenger_info);
    }

    // SAFETY: every pointer in create_info outlives this call
    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(GpuError::creation("instance"))?;

    let messenger = if debug {
        let loader = ash::ext::debug_utils::Instance::new(entry, &instance);
        // SAFETY: the instance was created with the debug utils extension
        match unsafe { loader.create_debug_utils_messenger(&debug_messenger_info(), None) } {
            Ok(messenger) => Some(DebugMessenger { loader, messenger }),
            Err(e) => {
                tracing::warn!("Failed to create debug messenger: {e}");
                None
            }
        }
    } else {
        None
    };

    Ok((instance, messenger))
}

/// Score a physical device for selection.
fn score_device(capabilities: &DeviceCapabilities) -> u64 {
    let class = match capabilities.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 1,
    };

    // +1 per GB of VRAM
    class + capabilities.device_local_memory_mb / 1024
}

/// Pick a device among `candidates`, considering only those that expose every
/// required extension.
fn choose_device(
    candidates: &[DeviceCapabilities],
    required_extensions: &[&CStr],
    preference: DevicePreference,
) -> Option<usize> {
    let mut eligible = candidates
        .iter()
        .enumerate()
        .filter(|(_, caps)| caps.missing_extensions(required_extensions).is_empty());

    match preference {
        DevicePreference::Discrete => eligible
            .find(|(_, caps)| caps.is_discrete())
            .map(|(index, _)| index),
        DevicePreference::AnySuitable => eligible
            .rev()
            .max_by_key(|(_, caps)| score_device(caps))
            .map(|(index, _)| index),
    }
}

/// Select a physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    required_extensions: &[&CStr],
    preference: DevicePreference,
) -> Result<(vk::PhysicalDevice, DeviceCapabilities)> {
    // SAFETY: caller guarantees the instance is valid
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    let candidates: Vec<DeviceCapabilities> = devices
        .iter()
        // SAFETY: handles come straight from enumeration
        .map(|&device| unsafe { DeviceCapabilities::query(instance, device) })
        .collect();

    for caps in &candidates {
        let missing = caps.missing_extensions(required_extensions);
        if missing.is_empty() {
            tracing::debug!("Candidate GPU: {}", caps.summary());
        } else {
            tracing::debug!(
                "Skipping {}: missing {}",
                caps.device_name,
                missing.join(", ")
            );
        }
    }

    let index = choose_device(&candidates, required_extensions, preference)
        .ok_or(GpuError::NoSuitableDevice)?;

    Ok((devices[index], candidates[index].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::GpuVendor;

    fn device(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        vram_mb: u64,
        extensions: &[&str],
    ) -> DeviceCapabilities {
        DeviceCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: name.to_string(),
            device_type,
            api_version: vk::API_VERSION_1_1,
            driver_version: 0,
            device_local_memory_mb: vram_mb,
            max_compute_workgroup_count: [65535; 3],
            max_compute_workgroup_size: [1024, 1024, 64],
            max_compute_workgroup_invocations: 1024,
            available_extensions: extensions.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    const SWAPCHAIN: &str = "VK_KHR_swapchain";

    #[test]
    fn missing_names_lists_absent_entries() {
        let available = vec!["VK_KHR_surface".to_string()];
        assert_eq!(
            missing_names(&[ash::khr::surface::NAME, VALIDATION_LAYER], &available),
            vec!["VK_LAYER_KHRONOS_validation".to_string()]
        );
        assert!(missing_names(&[], &available).is_empty());
    }

    #[test]
    fn first_discrete_device_is_chosen() {
        let devices = [
            device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 512, &[SWAPCHAIN]),
            device("small", vk::PhysicalDeviceType::DISCRETE_GPU, 4096, &[SWAPCHAIN]),
            device("large", vk::PhysicalDeviceType::DISCRETE_GPU, 24576, &[SWAPCHAIN]),
        ];
        assert_eq!(
            choose_device(&devices, &[ash::khr::swapchain::NAME], DevicePreference::Discrete),
            Some(1)
        );
    }

    #[test]
    fn devices_without_extensions_are_skipped() {
        let devices = [
            device("bare", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, &[]),
            device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 512, &[SWAPCHAIN]),
        ];
        assert_eq!(
            choose_device(&devices, &[ash::khr::swapchain::NAME], DevicePreference::Discrete),
            None
        );
        assert_eq!(
            choose_device(
                &devices,
                &[ash::khr::swapchain::NAME],
                DevicePreference::AnySuitable
            ),
            Some(1)
        );
    }

    #[test]
    fn any_suitable_prefers_higher_score() {
        let devices = [
            device("cpu", vk::PhysicalDeviceType::CPU, 0, &[]),
            device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 2048, &[]),
            device("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 8192, &[]),
        ];
        assert_eq!(
            choose_device(&devices, &[], DevicePreference::AnySuitable),
            Some(2)
        );
    }

    #[test]
    fn ties_resolve_to_enumeration_order() {
        let devices = [
            device("a", vk::PhysicalDeviceType::CPU, 0, &[]),
            device("b", vk::PhysicalDeviceType::CPU, 0, &[]),
        ];
        assert_eq!(
            choose_device(&devices, &[], DevicePreference::AnySuitable),
            Some(0)
        );
    }

    #[test]
    fn no_devices_means_none() {
        assert_eq!(choose_device(&[], &[], DevicePreference::Discrete), None);
        assert_eq!(choose_device(&[], &[], DevicePreference::AnySuitable), None);
    }
}

//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// A required layer or extension is not available.
    #[error("Missing capability: {0}")]
    MissingCapability(String),

    /// No physical device satisfies the requirements.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// The selected device has no queue family with graphics support.
    #[error("No queue family supports graphics")]
    NoGraphicsQueue,

    /// The selected device has no queue family with compute support.
    #[error("No queue family supports compute")]
    NoComputeQueue,

    /// The driver rejected the creation of a resource.
    #[error("Failed to create {what}: {result}")]
    ResourceCreation {
        /// Kind of object that failed to be created.
        what: &'static str,
        /// Driver result code.
        result: vk::Result,
    },

    /// No memory type satisfies both the resource and the requested properties.
    #[error("No memory type in {type_bits:#034b} has properties {flags:?}")]
    NoSuitableMemoryType {
        /// Memory types accepted by the resource.
        type_bits: u32,
        /// Property flags that were requested.
        flags: vk::MemoryPropertyFlags,
    },

    /// Device or host memory is exhausted.
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// A kernel or shader binary is malformed.
    #[error("Invalid kernel binary: {0}")]
    InvalidKernelBinary(String),

    /// The swapchain no longer matches the surface.
    #[error("Swapchain is out of date")]
    SwapchainStale,

    /// A queue submission was rejected.
    #[error("Queue submission failed: {0}")]
    SubmitFailed(vk::Result),

    /// The device was lost or stopped responding.
    #[error("Device lost")]
    DeviceLost,

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// An access fell outside a resource.
    #[error("Range {offset}..{end} is out of bounds for {len} elements")]
    OutOfBounds {
        /// First element of the access.
        offset: usize,
        /// One past the last element of the access.
        end: usize,
        /// Number of elements in the resource.
        len: usize,
    },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error while reading an external file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl GpuError {
    /// Classify a driver error raised while creating `what`.
    pub fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| match Self::from(result) {
            Self::Vulkan(result) => Self::ResourceCreation { what, result },
            other => other,
        }
    }

    /// Classify a driver error raised by a queue submission.
    pub fn submit(result: vk::Result) -> Self {
        match Self::from(result) {
            Self::Vulkan(result) => Self::SubmitFailed(result),
            other => other,
        }
    }

    /// Whether rendering can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainStale)
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfDeviceMemory
            }
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainStale,
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_results_are_classified() {
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GpuError::OutOfDeviceMemory
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            GpuError::SwapchainStale
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            GpuError::Vulkan(_)
        ));
    }

    #[test]
    fn creation_keeps_memory_errors() {
        let err = GpuError::creation("buffer")(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(matches!(err, GpuError::OutOfDeviceMemory));

        let err = GpuError::creation("buffer")(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE);
        assert!(matches!(
            err,
            GpuError::ResourceCreation { what: "buffer", .. }
        ));
    }

    #[test]
    fn only_stale_swapchain_is_recoverable() {
        assert!(GpuError::SwapchainStale.is_recoverable());
        assert!(!GpuError::DeviceLost.is_recoverable());
        assert!(!GpuError::submit(vk::Result::ERROR_UNKNOWN).is_recoverable());
    }
}

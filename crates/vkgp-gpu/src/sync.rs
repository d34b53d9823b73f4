//! Synchronization primitives.

use crate::error::{GpuError, Result};
use ash::vk;
use std::time::Duration;

/// Convert an optional bound into a fence timeout in nanoseconds.
///
/// `None` waits forever.
pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    // SAFETY: caller guarantees the device is valid
    unsafe { device.create_semaphore(&create_info, None) }.map_err(GpuError::creation("semaphore"))
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    // SAFETY: caller guarantees the device is valid
    unsafe { device.create_fence(&create_info, None) }.map_err(GpuError::creation("fence"))
}

/// Wait for a fence to be signaled.
///
/// A bounded wait that expires is reported as [`GpuError::DeviceLost`].
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout: Option<Duration>,
) -> Result<()> {
    // SAFETY: caller guarantees the handles are valid
    match unsafe { device.wait_for_fences(&[fence], true, timeout_ns(timeout)) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => {
            tracing::error!("Fence wait exceeded {timeout:?}; treating the device as lost");
            Err(GpuError::DeviceLost)
        }
        Err(e) => Err(e.into()),
    }
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    // SAFETY: caller guarantees the handles are valid
    unsafe { device.reset_fences(&[fence]) }?;
    Ok(())
}

/// Synchronization primitives for one frame in flight.
pub struct FrameSlot {
    /// Signaled when the acquired swapchain image is ready to be rendered to.
    pub image_ready: vk::Semaphore,
    /// Signaled when the frame's submission has finished executing.
    pub submit_done: vk::Semaphore,
    /// Signaled when all GPU work of the frame is complete.
    pub frame_done: vk::Fence,
}

impl FrameSlot {
    /// Create a slot whose fence starts signaled.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        // SAFETY: caller guarantees the device is valid
        unsafe {
            let image_ready = create_semaphore(device)?;
            let submit_done = match create_semaphore(device) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_ready, None);
                    return Err(e);
                }
            };
            let frame_done = match create_fence(device, true) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_ready, None);
                    device.destroy_semaphore(submit_done, None);
                    return Err(e);
                }
            };

            Ok(Self {
                image_ready,
                submit_done,
                frame_done,
            })
        }
    }

    /// Block until the slot's previous frame is complete.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device, timeout: Option<Duration>) -> Result<()> {
        // SAFETY: caller guarantees the device is valid
        unsafe { wait_for_fence(device, self.frame_done, timeout) }
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: caller guarantees the primitives are idle
        unsafe {
            device.destroy_semaphore(self.image_ready, None);
            device.destroy_semaphore(self.submit_done, None);
            device.destroy_fence(self.frame_done, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_wait_is_max() {
        assert_eq!(timeout_ns(None), u64::MAX);
    }

    #[test]
    fn bounded_wait_in_nanoseconds() {
        assert_eq!(timeout_ns(Some(Duration::from_millis(250))), 250_000_000);
        assert_eq!(timeout_ns(Some(Duration::ZERO)), 0);
    }

    #[test]
    fn huge_bounds_saturate() {
        assert_eq!(timeout_ns(Some(Duration::MAX)), u64::MAX);
    }
}
